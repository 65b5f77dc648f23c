//! # LiveSet - incrementally maintained sets
//!
//! A [`LiveSet`] is a set of values that can be read synchronously and subscribed to for ordered
//! batches of [`Change`]s. Sets come from three sources:
//!
//! - [`LiveSet::active`]: values are pushed by the returned [`LiveSetController`].
//! - [`LiveSet::constant`]: values never change.
//! - [`LiveSet::new`] / [`LiveSet::with_read`]: derived sets. The `listen` function runs when
//!   the first observer subscribes and its [`ListenHandle`] is released when the last one leaves.
//!
//! Changes are queued per observer and delivered by the shared [`Scheduler`]. Within one
//! undelivered batch, an add undone by a remove of the same value (or the reverse) cancels out,
//! so observers never see churn.
//!
//! Values are identified by `Eq + Hash`. The value types this crate moves through sets
//! ([`crate::context::ElementContext`], [`crate::tagtree::TagTreeNode`] and `LiveSet` itself)
//! compare by reference identity.

use std::{
    cell::{Cell, RefCell},
    fmt,
    hash::{Hash, Hasher},
    rc::{Rc, Weak},
};

use indexmap::{IndexMap, IndexSet};

use crate::{
    error::{ParserTreeError, Result},
    event::Change,
};

pub mod ops;
pub mod scheduler;

pub use ops::{filter, flat_map, flat_map_r, map, merge, transduce};
pub use scheduler::Scheduler;

/// Anything that can live in a [`LiveSet`].
pub trait Value: Clone + Eq + Hash + 'static {}
impl<T: Clone + Eq + Hash + 'static> Value for T {}

/// Receives the events of one subscription.
///
/// `start` is called synchronously by [`LiveSet::subscribe`] with the values present at that
/// moment. Every later call comes from the scheduler.
pub trait Observer<T: Value> {
    fn start(&mut self, values: &IndexSet<T>) {
        if values.is_empty() {
            return;
        }
        let changes: Vec<Change<T>> = values.iter().cloned().map(Change::Add).collect();
        self.next(&changes);
    }

    fn next(&mut self, changes: &[Change<T>]);

    fn error(&mut self, _err: &ParserTreeError) {}

    fn complete(&mut self) {}
}

/// Keeps a set listening without looking at its events.
pub struct Keepalive;

impl<T: Value> Observer<T> for Keepalive {
    fn start(&mut self, _values: &IndexSet<T>) {}
    fn next(&mut self, _changes: &[Change<T>]) {}
}

enum Terminal {
    Complete,
    Error(ParserTreeError),
}

struct ObserverEntry<T> {
    sink: RefCell<Box<dyn Observer<T>>>,
    // true: pending add, false: pending remove
    pending: RefCell<IndexMap<T, bool>>,
    terminal: RefCell<Option<Terminal>>,
    closed: Cell<bool>,
}

impl<T: Value> ObserverEntry<T> {
    fn new(sink: Box<dyn Observer<T>>) -> Self {
        ObserverEntry {
            sink: RefCell::new(sink),
            pending: RefCell::new(IndexMap::new()),
            terminal: RefCell::new(None),
            closed: Cell::new(false),
        }
    }

    fn push(&self, change: Change<T>) {
        let mut pending = self.pending.borrow_mut();
        let (value, is_add) = match change {
            Change::Add(v) => (v, true),
            Change::Remove(v) => (v, false),
        };
        match pending.get(&value) {
            Some(queued) if *queued != is_add => {
                pending.shift_remove(&value);
            }
            _ => {
                pending.insert(value, is_add);
            }
        }
    }

    fn has_work(&self) -> bool {
        !self.pending.borrow().is_empty() || self.terminal.borrow().is_some()
    }

    fn take_pending(&self) -> Vec<Change<T>> {
        self.pending
            .borrow_mut()
            .drain(..)
            .map(|(v, is_add)| if is_add { Change::Add(v) } else { Change::Remove(v) })
            .collect()
    }

    fn deliver(&self) {
        if self.closed.get() {
            return;
        }
        // A busy sink means this entry is already delivering further up the stack; that loop
        // picks up whatever is pending once the callback returns.
        let Ok(mut sink) = self.sink.try_borrow_mut() else {
            return;
        };
        loop {
            let changes = self.take_pending();
            if changes.is_empty() {
                break;
            }
            sink.next(&changes);
            if self.closed.get() {
                return;
            }
        }
        let terminal = self.terminal.borrow_mut().take();
        if let Some(terminal) = terminal {
            self.closed.set(true);
            match terminal {
                Terminal::Complete => sink.complete(),
                Terminal::Error(err) => sink.error(&err),
            }
        }
    }
}

type ReadFn<T> = Box<dyn Fn() -> Result<IndexSet<T>>>;
type ListenFn<T> = Box<dyn Fn(&LiveSetController<T>) -> ListenHandle>;

struct State<T> {
    values: Option<IndexSet<T>>,
    observers: Vec<Rc<ObserverEntry<T>>>,
    handle: Option<ListenHandle>,
    ended: bool,
    flush_scheduled: bool,
    generation: u64,
}

struct Inner<T> {
    scheduler: Scheduler,
    read: Option<ReadFn<T>>,
    listen: Option<ListenFn<T>>,
    state: RefCell<State<T>>,
    // Set while this set's upstream pull runs. Derived sets can feed each other in a cycle.
    pulling: Cell<bool>,
    deliver_settled: Cell<bool>,
}

pub struct LiveSet<T> {
    inner: Rc<Inner<T>>,
}

impl<T> Clone for LiveSet<T> {
    fn clone(&self) -> Self {
        LiveSet {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for LiveSet<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for LiveSet<T> {}

impl<T> Hash for LiveSet<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.inner) as *const ()).hash(state);
    }
}

impl<T> fmt::Debug for LiveSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("LiveSet")
            .field("active", &state.values.is_some())
            .field("len", &state.values.as_ref().map(|v| v.len()))
            .field("observers", &state.observers.len())
            .field("ended", &state.ended)
            .finish()
    }
}

impl<T: Value> LiveSet<T> {
    fn from_parts(
        scheduler: Scheduler,
        read: Option<ReadFn<T>>,
        listen: Option<ListenFn<T>>,
        values: Option<IndexSet<T>>,
    ) -> Self {
        LiveSet {
            inner: Rc::new(Inner {
                scheduler,
                read,
                listen,
                state: RefCell::new(State {
                    values,
                    observers: Vec::new(),
                    handle: None,
                    ended: false,
                    flush_scheduled: false,
                    generation: 0,
                }),
                pulling: Cell::new(false),
                deliver_settled: Cell::new(false),
            }),
        }
    }

    /// A derived set with no synchronous representation while nobody listens.
    pub fn new(
        scheduler: &Scheduler,
        listen: impl Fn(&LiveSetController<T>) -> ListenHandle + 'static,
    ) -> Self {
        Self::from_parts(scheduler.clone(), None, Some(Box::new(listen)), None)
    }

    /// A derived set that can compute its values on demand while inactive.
    pub fn with_read(
        scheduler: &Scheduler,
        read: impl Fn() -> Result<IndexSet<T>> + 'static,
        listen: impl Fn(&LiveSetController<T>) -> ListenHandle + 'static,
    ) -> Self {
        Self::from_parts(
            scheduler.clone(),
            Some(Box::new(read)),
            Some(Box::new(listen)),
            None,
        )
    }

    pub fn active(scheduler: &Scheduler, initial: IndexSet<T>) -> (Self, LiveSetController<T>) {
        let set = Self::from_parts(scheduler.clone(), None, None, Some(initial));
        let controller = LiveSetController {
            inner: Rc::downgrade(&set.inner),
            generation: 0,
        };
        (set, controller)
    }

    pub fn constant(scheduler: &Scheduler, values: IndexSet<T>) -> Self {
        Self::from_parts(scheduler.clone(), None, None, Some(values))
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Deliver batches only once the scheduler has no propagation work left. Observers then see
    /// the net change of a whole flush at once. Meant for sets at the end of a pipeline.
    pub fn deliver_when_settled(self) -> Self {
        self.inner.deliver_settled.set(true);
        self
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.borrow().ended
    }

    /// True while the set holds its own snapshot (listening, active, or constant).
    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().values.is_some()
    }

    pub fn is_readable(&self) -> bool {
        self.is_active() || self.inner.read.is_some()
    }

    pub fn values(&self) -> Result<IndexSet<T>> {
        if let Some(values) = self.inner.state.borrow().values.as_ref() {
            return Ok(values.clone());
        }
        match &self.inner.read {
            Some(read) => read(),
            None => Err(ParserTreeError::NotReadable),
        }
    }

    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        self.activate();
        let entry = Rc::new(ObserverEntry::new(Box::new(observer)));
        let snapshot = {
            let mut state = self.inner.state.borrow_mut();
            state.observers.push(entry.clone());
            if state.ended {
                *entry.terminal.borrow_mut() = Some(Terminal::Complete);
            }
            state.values.clone().unwrap_or_default()
        };
        entry.sink.borrow_mut().start(&snapshot);
        if entry.has_work() {
            schedule_delivery(&self.inner);
        }
        Subscription(Rc::new(SubscriptionState {
            set: self.clone(),
            entry,
            unsubscribed: Cell::new(false),
        }))
    }

    fn activate(&self) {
        let generation = {
            let mut state = self.inner.state.borrow_mut();
            if state.ended || state.values.is_some() || self.inner.listen.is_none() {
                return;
            }
            state.values = Some(IndexSet::new());
            state.generation += 1;
            state.generation
        };
        let controller = LiveSetController {
            inner: Rc::downgrade(&self.inner),
            generation,
        };
        let Some(listen) = self.inner.listen.as_ref() else {
            return;
        };
        let handle = listen(&controller);
        let mut state = self.inner.state.borrow_mut();
        if state.ended || state.generation != generation {
            drop(state);
            handle.release();
        } else {
            state.handle = Some(handle);
        }
    }

    /// Deliver every observer's pending batch now.
    fn deliver_now(&self) {
        deliver(&self.inner);
    }
}

fn schedule_delivery<T: Value>(inner: &Rc<Inner<T>>) {
    {
        let mut state = inner.state.borrow_mut();
        if state.flush_scheduled {
            return;
        }
        state.flush_scheduled = true;
    }
    let weak = Rc::downgrade(inner);
    let job = move || {
        if let Some(inner) = weak.upgrade() {
            deliver(&inner);
        }
    };
    if inner.deliver_settled.get() {
        inner.scheduler.schedule_settled(job);
    } else {
        inner.scheduler.schedule(job);
    }
}

fn deliver<T: Value>(inner: &Rc<Inner<T>>) {
    let entries = {
        let mut state = inner.state.borrow_mut();
        state.flush_scheduled = false;
        state.observers.clone()
    };
    for entry in entries.iter() {
        entry.deliver();
    }
    inner
        .state
        .borrow_mut()
        .observers
        .retain(|entry| !entry.closed.get());
}

/// Pushes values into a [`LiveSet`]. Held weakly: a controller never keeps its set alive.
pub struct LiveSetController<T> {
    inner: Weak<Inner<T>>,
    generation: u64,
}

impl<T> Clone for LiveSetController<T> {
    fn clone(&self) -> Self {
        LiveSetController {
            inner: self.inner.clone(),
            generation: self.generation,
        }
    }
}

impl<T: Value> LiveSetController<T> {
    fn live(&self) -> Option<Rc<Inner<T>>> {
        self.inner.upgrade()
    }

    fn apply(&self, change: Change<T>) -> Result<()> {
        let Some(inner) = self.live() else {
            return Ok(());
        };
        let notify = {
            let mut state = inner.state.borrow_mut();
            if state.ended {
                return Err(ParserTreeError::Ended);
            }
            // A controller from an earlier activation no longer feeds this set.
            if state.generation != self.generation {
                return Ok(());
            }
            let Some(values) = state.values.as_mut() else {
                return Ok(());
            };
            match &change {
                Change::Add(v) => {
                    if !values.insert(v.clone()) {
                        return Err(ParserTreeError::Invariant(
                            "value added to a LiveSet twice".to_string(),
                        ));
                    }
                }
                Change::Remove(v) => {
                    if !values.shift_remove(v) {
                        return Err(ParserTreeError::Invariant(
                            "removed a value that is not in the LiveSet".to_string(),
                        ));
                    }
                }
            }
            let observers = &state.observers;
            match observers.split_last() {
                Some((last, rest)) => {
                    for entry in rest {
                        entry.push(change.clone());
                    }
                    last.push(change);
                    true
                }
                None => false,
            }
        };
        if notify {
            schedule_delivery(&inner);
        }
        Ok(())
    }

    pub fn add(&self, value: T) -> Result<()> {
        self.apply(Change::Add(value))
    }

    pub fn remove(&self, value: T) -> Result<()> {
        self.apply(Change::Remove(value))
    }

    /// Replace the whole snapshot, emitting the difference.
    pub fn set_values(&self, values: IndexSet<T>) -> Result<()> {
        let Some(inner) = self.live() else {
            return Ok(());
        };
        let current = inner.state.borrow().values.clone().unwrap_or_default();
        for value in current.iter().filter(|v| !values.contains(*v)) {
            self.remove(value.clone())?;
        }
        for value in values.into_iter().filter(|v| !current.contains(v)) {
            self.add(value)?;
        }
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.live().map(|i| i.state.borrow().ended).unwrap_or(true)
    }

    /// End the set. Undelivered changes are dropped, from the pending batches and from the
    /// snapshot alike, and observers complete.
    pub fn end(&self) {
        self.terminate(Terminal::Complete);
    }

    /// End the set with an error delivered to every observer.
    pub fn error(&self, err: ParserTreeError) {
        self.terminate(Terminal::Error(err));
    }

    fn terminate(&self, terminal: Terminal) {
        let Some(inner) = self.live() else {
            return;
        };
        let handle = {
            let mut state = inner.state.borrow_mut();
            if state.ended {
                return;
            }
            state.ended = true;
            // The oldest open observer has been pending since the last delivery. Undo what it
            // never saw so late subscribers start from the same snapshot.
            let dropped: Vec<(T, bool)> = state
                .observers
                .iter()
                .find(|entry| !entry.closed.get())
                .map(|entry| {
                    entry
                        .pending
                        .borrow()
                        .iter()
                        .map(|(v, is_add)| (v.clone(), *is_add))
                        .collect()
                })
                .unwrap_or_default();
            if let Some(values) = state.values.as_mut() {
                for (value, is_add) in dropped {
                    if is_add {
                        values.shift_remove(&value);
                    } else {
                        values.insert(value);
                    }
                }
            }
            for entry in state.observers.iter() {
                entry.pending.borrow_mut().clear();
                *entry.terminal.borrow_mut() = Some(match &terminal {
                    Terminal::Complete => Terminal::Complete,
                    Terminal::Error(err) => Terminal::Error(err.clone()),
                });
            }
            state.handle.take()
        };
        schedule_delivery(&inner);
        if let Some(handle) = handle {
            handle.release();
        }
    }
}

/// What a derived set's `listen` function hands back: how to stop listening upstream, and
/// optionally how to pull buffered upstream changes through synchronously.
pub struct ListenHandle {
    unsubscribe: Option<Box<dyn FnOnce()>>,
    pull: Option<Rc<dyn Fn()>>,
}

impl ListenHandle {
    pub fn new(unsubscribe: impl FnOnce() + 'static) -> Self {
        ListenHandle {
            unsubscribe: Some(Box::new(unsubscribe)),
            pull: None,
        }
    }

    pub fn noop() -> Self {
        ListenHandle {
            unsubscribe: None,
            pull: None,
        }
    }

    pub fn with_pull(mut self, pull: impl Fn() + 'static) -> Self {
        self.pull = Some(Rc::new(pull));
        self
    }

    pub fn from_subscription(sub: Subscription) -> Self {
        let puller = sub.clone();
        ListenHandle::new(move || sub.unsubscribe()).with_pull(move || puller.pull_changes())
    }

    pub fn from_subscriptions(subs: Vec<Subscription>) -> Self {
        let pullers = subs.clone();
        ListenHandle::new(move || subs.iter().for_each(Subscription::unsubscribe)).with_pull(
            move || pullers.iter().for_each(Subscription::pull_changes),
        )
    }

    fn release(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

trait Subscribed {
    fn unsubscribe(&self);
    fn pull_changes(&self);
    fn is_closed(&self) -> bool;
}

struct SubscriptionState<T> {
    set: LiveSet<T>,
    entry: Rc<ObserverEntry<T>>,
    unsubscribed: Cell<bool>,
}

impl<T: Value> Subscribed for SubscriptionState<T> {
    fn unsubscribe(&self) {
        if self.unsubscribed.replace(true) {
            return;
        }
        self.entry.closed.set(true);
        self.entry.pending.borrow_mut().clear();
        let inner = &self.set.inner;
        let handle = {
            let mut state = inner.state.borrow_mut();
            state.observers.retain(|e| !Rc::ptr_eq(e, &self.entry));
            if state.observers.is_empty() && inner.listen.is_some() && !state.ended {
                state.values = None;
                state.generation += 1;
                state.handle.take()
            } else {
                None
            }
        };
        if let Some(handle) = handle {
            tracing::trace!("[LiveSet] last observer left, releasing upstream");
            handle.release();
        }
    }

    fn pull_changes(&self) {
        let inner = &self.set.inner;
        if self.unsubscribed.get() || inner.pulling.replace(true) {
            return;
        }
        let pull = inner
            .state
            .borrow()
            .handle
            .as_ref()
            .and_then(|h| h.pull.clone());
        if let Some(pull) = pull {
            pull();
        }
        self.set.deliver_now();
        inner.pulling.set(false);
    }

    fn is_closed(&self) -> bool {
        self.unsubscribed.get() || self.entry.closed.get()
    }
}

/// A live subscription to a [`LiveSet`]. Dropping it does not unsubscribe.
#[derive(Clone)]
pub struct Subscription(Rc<dyn Subscribed>);

impl Subscription {
    /// Stop receiving events. Idempotent.
    pub fn unsubscribe(&self) {
        self.0.unsubscribe()
    }

    /// Apply buffered upstream changes and deliver pending batches immediately.
    pub fn pull_changes(&self) {
        self.0.pull_changes()
    }

    /// True once unsubscribed or after the terminal event was delivered.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}
