//! Operators that derive one [`LiveSet`] from others.
//!
//! Every operator is lazy: nothing upstream is subscribed until the derived set gets its first
//! observer, and the upstream subscriptions are released with the last one.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use indexmap::IndexSet;

use super::{
    LiveSet, LiveSetController, ListenHandle, Observer, Scheduler, Subscription, Value,
};
use crate::{
    error::{ParserTreeError, Result},
    event::Change,
};

type ChangeFn<T, U> = Box<dyn FnMut(&LiveSetController<U>, &Change<T>) -> Result<()>>;

/// Forwards upstream events into a downstream controller through `on_change`. Upstream
/// completion ends the downstream set and upstream errors propagate.
pub(crate) struct Relay<T, U> {
    controller: LiveSetController<U>,
    on_change: ChangeFn<T, U>,
}

impl<T: Value, U: Value> Relay<T, U> {
    pub(crate) fn new(
        controller: &LiveSetController<U>,
        on_change: impl FnMut(&LiveSetController<U>, &Change<T>) -> Result<()> + 'static,
    ) -> Self {
        Relay {
            controller: controller.clone(),
            on_change: Box::new(on_change),
        }
    }
}

impl<T: Value, U: Value> Observer<T> for Relay<T, U> {
    fn next(&mut self, changes: &[Change<T>]) {
        for change in changes {
            match (self.on_change)(&self.controller, change) {
                Ok(()) => {}
                Err(ParserTreeError::Ended) => return,
                Err(err) => {
                    self.controller.error(err);
                    return;
                }
            }
        }
    }

    fn error(&mut self, err: &ParserTreeError) {
        self.controller.error(err.clone());
    }

    fn complete(&mut self) {
        self.controller.end();
    }
}

/// Fused filter and map. Values for which `f` returns `None` are dropped.
pub fn transduce<T: Value, U: Value>(
    input: &LiveSet<T>,
    f: impl Fn(&T) -> Option<U> + 'static,
) -> LiveSet<U> {
    let f = Rc::new(f);
    let read = {
        let input = input.clone();
        let f = f.clone();
        move || -> Result<IndexSet<U>> { Ok(input.values()?.iter().filter_map(|v| f(v)).collect()) }
    };
    let input = input.clone();
    let scheduler = input.scheduler().clone();
    LiveSet::with_read(&scheduler, read, move |controller| {
        let f = f.clone();
        let mut outputs: HashMap<T, U> = HashMap::new();
        let sub = input.subscribe(Relay::new(controller, move |controller, change| {
            match change {
                Change::Add(value) => {
                    if let Some(out) = f(value) {
                        outputs.insert(value.clone(), out.clone());
                        controller.add(out)?;
                    }
                }
                Change::Remove(value) => {
                    if let Some(out) = outputs.remove(value) {
                        controller.remove(out)?;
                    }
                }
            }
            Ok(())
        }));
        ListenHandle::from_subscription(sub)
    })
}

/// Value-for-value transform. Output identities are whatever `f` produces on each add.
pub fn map<T: Value, U: Value>(input: &LiveSet<T>, f: impl Fn(&T) -> U + 'static) -> LiveSet<U> {
    transduce(input, move |v| Some(f(v)))
}

pub fn filter<T: Value>(input: &LiveSet<T>, predicate: impl Fn(&T) -> bool + 'static) -> LiveSet<T> {
    transduce(input, move |v| predicate(v).then(|| v.clone()))
}

struct MergeObserver<T> {
    controller: LiveSetController<T>,
    counts: Rc<RefCell<HashMap<T, usize>>>,
    remaining: Rc<Cell<usize>>,
}

impl<T: Value> Observer<T> for MergeObserver<T> {
    fn next(&mut self, changes: &[Change<T>]) {
        for change in changes {
            let result = match change {
                Change::Add(value) => {
                    let first = {
                        let mut counts = self.counts.borrow_mut();
                        let count = counts.entry(value.clone()).or_insert(0);
                        *count += 1;
                        *count == 1
                    };
                    if first {
                        self.controller.add(value.clone())
                    } else {
                        Ok(())
                    }
                }
                Change::Remove(value) => {
                    let last = {
                        let mut counts = self.counts.borrow_mut();
                        match counts.get_mut(value) {
                            Some(count) if *count > 1 => {
                                *count -= 1;
                                false
                            }
                            Some(_) => {
                                counts.remove(value);
                                true
                            }
                            None => false,
                        }
                    };
                    if last {
                        self.controller.remove(value.clone())
                    } else {
                        Ok(())
                    }
                }
            };
            match result {
                Ok(()) => {}
                Err(ParserTreeError::Ended) => return,
                Err(err) => {
                    self.controller.error(err);
                    return;
                }
            }
        }
    }

    fn error(&mut self, err: &ParserTreeError) {
        self.controller.error(err.clone());
    }

    fn complete(&mut self) {
        let left = self.remaining.get().saturating_sub(1);
        self.remaining.set(left);
        if left == 0 {
            self.controller.end();
        }
    }
}

/// Union of `inputs`. A value present in several inputs at once is emitted once and removed
/// when the last input drops it. Ends when every input has ended.
pub fn merge<T: Value>(scheduler: &Scheduler, inputs: Vec<LiveSet<T>>) -> LiveSet<T> {
    if inputs.is_empty() {
        return LiveSet::constant(scheduler, IndexSet::new());
    }
    let inputs = Rc::new(inputs);
    let read = {
        let inputs = inputs.clone();
        move || -> Result<IndexSet<T>> {
            let mut out = IndexSet::new();
            for input in inputs.iter() {
                out.extend(input.values()?);
            }
            Ok(out)
        }
    };
    LiveSet::with_read(scheduler, read, move |controller| {
        let counts = Rc::new(RefCell::new(HashMap::new()));
        let remaining = Rc::new(Cell::new(inputs.len()));
        let subs: Vec<Subscription> = inputs
            .iter()
            .map(|input| {
                input.subscribe(MergeObserver {
                    controller: controller.clone(),
                    counts: counts.clone(),
                    remaining: remaining.clone(),
                })
            })
            .collect();
        ListenHandle::from_subscriptions(subs)
    })
}

struct FlatState<T, U> {
    counts: RefCell<HashMap<U, usize>>,
    inners: RefCell<HashMap<T, (Subscription, Rc<RefCell<IndexSet<U>>>)>>,
}

impl<T: Value, U: Value> FlatState<T, U> {
    fn retain(&self, controller: &LiveSetController<U>, value: U) -> Result<()> {
        let first = {
            let mut counts = self.counts.borrow_mut();
            let count = counts.entry(value.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            controller.add(value)?;
        }
        Ok(())
    }

    fn release(&self, controller: &LiveSetController<U>, value: U) -> Result<()> {
        let last = {
            let mut counts = self.counts.borrow_mut();
            match counts.get_mut(&value) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(&value);
                    true
                }
                None => false,
            }
        };
        if last {
            controller.remove(value)?;
        }
        Ok(())
    }

    fn drop_inner(&self, controller: &LiveSetController<U>, key: &T) -> Result<()> {
        let removed = self.inners.borrow_mut().remove(key);
        if let Some((sub, seen)) = removed {
            sub.unsubscribe();
            let values: Vec<U> = seen.borrow_mut().drain(..).collect();
            for value in values {
                self.release(controller, value)?;
            }
        }
        Ok(())
    }
}

struct InnerObserver<T, U> {
    controller: LiveSetController<U>,
    state: Rc<FlatState<T, U>>,
    seen: Rc<RefCell<IndexSet<U>>>,
}

impl<T: Value, U: Value> Observer<U> for InnerObserver<T, U> {
    fn next(&mut self, changes: &[Change<U>]) {
        for change in changes {
            let result = match change {
                Change::Add(value) => {
                    self.seen.borrow_mut().insert(value.clone());
                    self.state.retain(&self.controller, value.clone())
                }
                Change::Remove(value) => {
                    let present = self.seen.borrow_mut().shift_remove(value);
                    if present {
                        self.state.release(&self.controller, value.clone())
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(err) = result {
                if err != ParserTreeError::Ended {
                    self.controller.error(err);
                }
                return;
            }
        }
    }

    fn error(&mut self, err: &ParserTreeError) {
        self.controller.error(err.clone());
    }
}

fn flat_map_impl<T: Value, U: Value>(
    input: &LiveSet<T>,
    f: Rc<dyn Fn(&T) -> LiveSet<U>>,
    readable: bool,
) -> LiveSet<U> {
    let scheduler = input.scheduler().clone();
    let listen = {
        let input = input.clone();
        let f = f.clone();
        move |controller: &LiveSetController<U>| {
            let state = Rc::new(FlatState {
                counts: RefCell::new(HashMap::new()),
                inners: RefCell::new(HashMap::new()),
            });
            let outer = {
                let state = state.clone();
                let f = f.clone();
                input.subscribe(Relay::new(controller, move |controller, change| {
                    match change {
                        Change::Add(value) => {
                            let seen = Rc::new(RefCell::new(IndexSet::new()));
                            let sub = f(value).subscribe(InnerObserver {
                                controller: controller.clone(),
                                state: state.clone(),
                                seen: seen.clone(),
                            });
                            state
                                .inners
                                .borrow_mut()
                                .insert(value.clone(), (sub, seen));
                            Ok(())
                        }
                        Change::Remove(value) => state.drop_inner(controller, value),
                    }
                }))
            };
            let puller = outer.clone();
            let pull_state = state.clone();
            ListenHandle::new(move || {
                outer.unsubscribe();
                let inners: Vec<Subscription> = state
                    .inners
                    .borrow_mut()
                    .drain()
                    .map(|(_, (sub, _))| sub)
                    .collect();
                inners.iter().for_each(Subscription::unsubscribe);
            })
            .with_pull(move || {
                puller.pull_changes();
                let inners: Vec<Subscription> = pull_state
                    .inners
                    .borrow()
                    .values()
                    .map(|(sub, _)| sub.clone())
                    .collect();
                inners.iter().for_each(Subscription::pull_changes);
            })
        }
    };
    if readable {
        let input = input.clone();
        let read = move || -> Result<IndexSet<U>> {
            let mut out = IndexSet::new();
            for value in input.values()? {
                out.extend(f(&value).values()?);
            }
            Ok(out)
        };
        LiveSet::with_read(&scheduler, read, listen)
    } else {
        LiveSet::new(&scheduler, listen)
    }
}

/// For every input value, merge in the values of the inner set `f(value)`. The inner set is
/// released when its input value is removed. Ends when the input ends.
pub fn flat_map<T: Value, U: Value>(
    input: &LiveSet<T>,
    f: impl Fn(&T) -> LiveSet<U> + 'static,
) -> LiveSet<U> {
    flat_map_impl(input, Rc::new(f), true)
}

/// Like [`flat_map`], but the inner sets are only ever subscribed, never read. Suitable for
/// inner sets without a synchronous representation.
pub fn flat_map_r<T: Value, U: Value>(
    input: &LiveSet<T>,
    f: impl Fn(&T) -> LiveSet<U> + 'static,
) -> LiveSet<U> {
    flat_map_impl(input, Rc::new(f), false)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{sorted, Event, Recorder};
    use super::super::Keepalive;
    use super::*;
    use test_log::test;

    fn set_of(values: &[i32]) -> IndexSet<i32> {
        values.iter().copied().collect()
    }

    #[test]
    fn map_and_filter_follow_their_input() {
        let scheduler = Scheduler::new();
        let (input, controller) = LiveSet::active(&scheduler, set_of(&[1, 2, 3]));
        let doubled = map(&input, |v| v * 2);
        let odd = filter(&input, |v| v % 2 == 1);
        assert_eq!(sorted(&doubled.values().unwrap()), vec![2, 4, 6]);

        let (recorder, events) = Recorder::new();
        let _sub = odd.subscribe(recorder);
        controller.add(5).unwrap();
        controller.add(6).unwrap();
        controller.remove(1).unwrap();
        scheduler.flush();
        assert_eq!(
            *events.borrow(),
            vec![
                Event::Start(vec![1, 3]),
                Event::Next(vec![Change::Add(5), Change::Remove(1)])
            ]
        );
        assert_eq!(sorted(&odd.values().unwrap()), vec![3, 5]);
    }

    #[test]
    fn map_allocates_fresh_identities() {
        let scheduler = Scheduler::new();
        let (input, _controller) = LiveSet::active(&scheduler, set_of(&[1]));
        let boxed = map(&input, |v| Rc::new(*v));
        let a = boxed.values().unwrap();
        let b = boxed.values().unwrap();
        let (a, b) = (a.first().unwrap().clone(), b.first().unwrap().clone());
        assert_eq!(*a, *b);
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn transduce_upstream_end_ends_output() {
        let scheduler = Scheduler::new();
        let (input, controller) = LiveSet::active(&scheduler, set_of(&[1]));
        let out = transduce(&input, |v| (*v > 0).then_some(*v));
        let (recorder, events) = Recorder::new();
        let _sub = out.subscribe(recorder);
        controller.end();
        scheduler.flush();
        scheduler.flush();
        assert!(out.is_ended());
        assert_eq!(events.borrow().last(), Some(&Event::Complete));
    }

    #[test]
    fn merge_counts_shared_values() {
        let scheduler = Scheduler::new();
        let (a, a_ctrl) = LiveSet::active(&scheduler, set_of(&[1, 2]));
        let (b, b_ctrl) = LiveSet::active(&scheduler, set_of(&[2, 3]));
        let merged = merge(&scheduler, vec![a, b]);
        assert_eq!(sorted(&merged.values().unwrap()), vec![1, 2, 3]);

        let (recorder, events) = Recorder::new();
        let _sub = merged.subscribe(recorder);
        a_ctrl.remove(2).unwrap();
        scheduler.flush();
        assert_eq!(sorted(&merged.values().unwrap()), vec![1, 2, 3]);
        b_ctrl.remove(2).unwrap();
        scheduler.flush();
        assert_eq!(sorted(&merged.values().unwrap()), vec![1, 3]);
        assert_eq!(
            events.borrow().last(),
            Some(&Event::Next(vec![Change::Remove(2)]))
        );
    }

    #[test]
    fn merge_ends_after_all_inputs() {
        let scheduler = Scheduler::new();
        let (a, a_ctrl) = LiveSet::<i32>::active(&scheduler, IndexSet::new());
        let (b, b_ctrl) = LiveSet::<i32>::active(&scheduler, IndexSet::new());
        let merged = merge(&scheduler, vec![a, b]);
        let _sub = merged.subscribe(Keepalive);
        a_ctrl.end();
        scheduler.flush();
        assert!(!merged.is_ended());
        b_ctrl.end();
        scheduler.flush();
        assert!(merged.is_ended());
        assert!(merge::<i32>(&scheduler, vec![]).values().unwrap().is_empty());
    }

    #[test]
    fn flat_map_r_releases_inner_sets_with_their_key() {
        let scheduler = Scheduler::new();
        let (x, x_ctrl) = LiveSet::active(&scheduler, set_of(&[1]));
        let (y, _y_ctrl) = LiveSet::active(&scheduler, set_of(&[2, 3]));
        let (sets, sets_ctrl) = LiveSet::active(&scheduler, IndexSet::new());
        let flat = flat_map_r(&sets, |s: &LiveSet<i32>| s.clone());
        assert_eq!(flat.values(), Err(ParserTreeError::NotReadable));

        let (recorder, events) = Recorder::new();
        let _sub = flat.subscribe(recorder);
        sets_ctrl.add(x.clone()).unwrap();
        sets_ctrl.add(y.clone()).unwrap();
        scheduler.flush();
        assert_eq!(sorted(&flat.values().unwrap()), vec![1, 2, 3]);

        x_ctrl.add(4).unwrap();
        scheduler.flush();
        assert_eq!(sorted(&flat.values().unwrap()), vec![1, 2, 3, 4]);

        sets_ctrl.remove(x.clone()).unwrap();
        scheduler.flush();
        assert_eq!(sorted(&flat.values().unwrap()), vec![2, 3]);
        x_ctrl.add(9).unwrap();
        scheduler.flush();
        assert_eq!(sorted(&flat.values().unwrap()), vec![2, 3]);
        assert!(matches!(events.borrow().first(), Some(Event::Start(v)) if v.is_empty()));
    }

    #[test]
    fn flat_map_is_readable_when_inner_sets_are() {
        let scheduler = Scheduler::new();
        let (input, _ctrl) = LiveSet::active(&scheduler, set_of(&[1, 2]));
        let inner_scheduler = scheduler.clone();
        let flat = flat_map(&input, move |v| {
            LiveSet::constant(&inner_scheduler, set_of(&[*v, v * 10]))
        });
        assert_eq!(sorted(&flat.values().unwrap()), vec![1, 2, 10, 20]);
    }
}
