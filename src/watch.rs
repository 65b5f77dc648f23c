//! # Watcher/finder reconciliation
//!
//! A tag fed by a finder gets one reconciled set combining two discovery paths:
//!
//! - the watcher pipelines, which follow host change notifications;
//! - the finder, a periodic full scan from the root.
//!
//! Watchers are expected to be complete. The finder is a backstop: elements it finds that the
//! watchers missed are added (and reported once), and elements the watchers hold that the finder
//! cannot see are reported once but kept. Elements that only the finder found leave the set when
//! a later scan stops finding them.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::{Rc, Weak},
    time::Duration,
};

use indexmap::{IndexMap, IndexSet};

use crate::{
    config::{Finder, LogErrorFn},
    context::{resolve_ancestry, ElementContext},
    error::ParserTreeError,
    event::{Change, Origin},
    host::HostTree,
    liveset::{LiveSet, LiveSetController, ListenHandle, Observer, Scheduler, Subscription},
    selector::ContextSet,
    tagtree::TagTree,
    timer::{TimerId, Timers},
};

/// Everything one reconciled tag set needs.
pub struct MergerOptions<H: HostTree> {
    pub host: Rc<H>,
    pub tree: TagTree<H::Node>,
    pub tag: String,
    pub owned_by: Vec<String>,
    /// Combined output of every watcher targeting the tag.
    pub watcher_set: Option<ContextSet<H::Node>>,
    pub finder: Finder<H::Node>,
    pub timers: Rc<dyn Timers>,
    pub log_error: LogErrorFn<H::Node>,
}

struct Shared<H: HostTree> {
    options: MergerOptions<H>,
    scheduler: Scheduler,
    // Survives re-activation: an element is reported as missed by the watcher at most once.
    finder_reported: RefCell<HashSet<H::Node>>,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    Timeout(TimerId),
    Idle(TimerId),
}

struct Engine<N> {
    controller: LiveSetController<ElementContext<N>>,
    current: IndexMap<N, (ElementContext<N>, Origin)>,
    // Every context the watchers currently hold per element. Several watchers, or several
    // branches of one watcher, can match the same element.
    watcher_contexts: HashMap<N, Vec<ElementContext<N>>>,
    missed_by_finder: HashSet<N>,
    watcher_sub: Option<Subscription>,
    pending: Option<Pending>,
    started: Duration,
    disposed: bool,
}

type Report<N> = (ParserTreeError, N);

/// The reconciled set for one tag. Listening subscribes the watchers and starts the finder
/// schedule; releasing the last subscriber cancels both.
pub fn watcher_finder_merger<H: HostTree>(
    scheduler: &Scheduler,
    options: MergerOptions<H>,
) -> ContextSet<H::Node> {
    let shared = Rc::new(Shared {
        options,
        scheduler: scheduler.clone(),
        finder_reported: RefCell::new(HashSet::new()),
    });
    LiveSet::new(scheduler, move |controller| {
        let engine = Rc::new(RefCell::new(Engine {
            controller: controller.clone(),
            current: IndexMap::new(),
            watcher_contexts: HashMap::new(),
            missed_by_finder: HashSet::new(),
            watcher_sub: None,
            pending: None,
            started: shared.options.timers.now(),
            disposed: false,
        }));
        if let Some(watcher_set) = shared.options.watcher_set.as_ref() {
            let sub = watcher_set.subscribe(WatcherObserver {
                shared: shared.clone(),
                engine: Rc::downgrade(&engine),
            });
            engine.borrow_mut().watcher_sub = Some(sub);
        }
        schedule_next(&shared, &engine);

        let puller = Rc::downgrade(&engine);
        let shared = shared.clone();
        ListenHandle::new(move || dispose(&shared, &engine)).with_pull(move || {
            let sub = puller
                .upgrade()
                .and_then(|engine| engine.borrow().watcher_sub.clone());
            if let Some(sub) = sub {
                sub.pull_changes();
            }
        })
    })
}

fn report<H: HostTree>(shared: &Shared<H>, reports: Vec<Report<H::Node>>) {
    for (err, el) in reports {
        (shared.options.log_error)(&err, Some(&el));
    }
}

/// Fail the reconciled set. `Ended` means the set is already closed and nothing is left to do.
fn fail<H: HostTree>(
    shared: &Shared<H>,
    controller: &LiveSetController<ElementContext<H::Node>>,
    err: ParserTreeError,
) {
    if err == ParserTreeError::Ended {
        return;
    }
    (shared.options.log_error)(&err, None);
    controller.error(err);
}

struct WatcherObserver<H: HostTree> {
    shared: Rc<Shared<H>>,
    engine: Weak<RefCell<Engine<H::Node>>>,
}

impl<H: HostTree> Observer<ElementContext<H::Node>> for WatcherObserver<H> {
    fn next(&mut self, changes: &[Change<ElementContext<H::Node>>]) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let tag = &self.shared.options.tag;
        let mut reports = Vec::new();
        let mut failure = None;
        let controller = {
            let mut e = engine.borrow_mut();
            if e.disposed {
                return;
            }
            for change in changes {
                let result = match change {
                    Change::Add(ec) => {
                        let el = ec.el().clone();
                        let first = {
                            let contexts = e.watcher_contexts.entry(el.clone()).or_default();
                            contexts.push(ec.clone());
                            contexts.len() == 1
                        };
                        match e.current.get(&el).map(|(_, origin)| *origin) {
                            None => {
                                e.current.insert(el, (ec.clone(), Origin::Watcher));
                                e.controller.add(ec.clone())
                            }
                            Some(Origin::Finder) => {
                                if first {
                                    reports.push((
                                        ParserTreeError::WatcherFoundElementAlreadyFoundByFinder {
                                            tag: tag.clone(),
                                        },
                                        el,
                                    ));
                                }
                                Ok(())
                            }
                            Some(Origin::Watcher) => {
                                reports.push((
                                    ParserTreeError::DuplicateElement { tag: tag.clone() },
                                    el,
                                ));
                                Ok(())
                            }
                        }
                    }
                    Change::Remove(ec) => {
                        let el = ec.el();
                        let next = match e.watcher_contexts.get_mut(el) {
                            Some(contexts) => {
                                if let Some(at) = contexts.iter().position(|held| held == ec) {
                                    contexts.remove(at);
                                }
                                contexts.first().cloned()
                            }
                            None => None,
                        };
                        if next.is_none() {
                            e.watcher_contexts.remove(el);
                            e.missed_by_finder.remove(el);
                        }
                        // The finder may hold the element under its own context.
                        if e.current.get(el).is_some_and(|(held, _)| held == ec) {
                            match next {
                                Some(next) => {
                                    e.current
                                        .insert(el.clone(), (next.clone(), Origin::Watcher));
                                    e.controller
                                        .remove(ec.clone())
                                        .and_then(|()| e.controller.add(next))
                                }
                                None => {
                                    e.current.shift_remove(el);
                                    e.controller.remove(ec.clone())
                                }
                            }
                        } else {
                            Ok(())
                        }
                    }
                };
                if let Err(err) = result {
                    failure = Some(err);
                    break;
                }
            }
            e.controller.clone()
        };
        report(&self.shared, reports);
        if let Some(err) = failure {
            fail(&self.shared, &controller, err);
        }
    }

    fn error(&mut self, err: &ParserTreeError) {
        if let Some(engine) = self.engine.upgrade() {
            let controller = engine.borrow().controller.clone();
            controller.error(err.clone());
        }
    }

    fn complete(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            let controller = engine.borrow().controller.clone();
            controller.end();
        }
    }
}

fn schedule_next<H: HostTree>(shared: &Rc<Shared<H>>, engine: &Rc<RefCell<Engine<H::Node>>>) {
    let timers = &shared.options.timers;
    let (count, elapsed) = {
        let e = engine.borrow();
        if e.disposed {
            return;
        }
        (e.current.len(), timers.now().saturating_sub(e.started))
    };
    let Some(delay) = shared.options.finder.interval.next_delay(count, elapsed) else {
        tracing::debug!(
            "[Finder] {} has an unbounded interval, no further scans",
            shared.options.tag
        );
        return;
    };
    let weak_shared = Rc::downgrade(shared);
    let weak_engine = Rc::downgrade(engine);
    let id = timers.set_timeout(
        delay,
        Box::new(move || on_timer(weak_shared, weak_engine, delay)),
    );
    engine.borrow_mut().pending = Some(Pending::Timeout(id));
}

fn on_timer<H: HostTree>(
    shared: Weak<Shared<H>>,
    engine: Weak<RefCell<Engine<H::Node>>>,
    delay: Duration,
) {
    let (Some(strong_shared), Some(strong_engine)) = (shared.upgrade(), engine.upgrade()) else {
        return;
    };
    if strong_engine.borrow().disposed {
        return;
    }
    let timers = &strong_shared.options.timers;
    if timers.idle_scheduling() {
        let id = timers.request_idle(delay, Box::new(move || step(shared, engine)));
        strong_engine.borrow_mut().pending = Some(Pending::Idle(id));
    } else {
        step(shared, engine);
    }
}

fn step<H: HostTree>(shared: Weak<Shared<H>>, engine: Weak<RefCell<Engine<H::Node>>>) {
    let (Some(shared), Some(engine)) = (shared.upgrade(), engine.upgrade()) else {
        return;
    };
    engine.borrow_mut().pending = None;
    run_finder(&shared, &engine);
    schedule_next(&shared, &engine);
}

fn deferred_context<H: HostTree>(shared: &Shared<H>, el: &H::Node) -> ElementContext<H::Node> {
    let host = shared.options.host.clone();
    let tree = shared.options.tree.clone();
    let owned_by = shared.options.owned_by.clone();
    let target = el.clone();
    ElementContext::deferred(el.clone(), move || {
        resolve_ancestry(&*host, &tree, &target, &owned_by)
    })
}

fn run_finder<H: HostTree>(shared: &Rc<Shared<H>>, engine: &Rc<RefCell<Engine<H::Node>>>) {
    let tag = &shared.options.tag;
    let sub = {
        let e = engine.borrow();
        if e.disposed {
            return;
        }
        e.watcher_sub.clone()
    };
    // Let the watchers catch up first, so only real misses are reported.
    if let Some(sub) = sub {
        sub.pull_changes();
    }
    let root = shared.options.tree.get_value().clone();
    let found: IndexSet<H::Node> = (shared.options.finder.find)(&root).into_iter().collect();
    tracing::debug!("[Finder] {tag} scan found {} elements", found.len());

    let has_watcher = shared.options.watcher_set.is_some();
    let mut reports = Vec::new();
    let mut failure = None;
    let controller = {
        let mut e = engine.borrow_mut();
        if e.disposed {
            return;
        }
        for el in found.iter() {
            if e.current.contains_key(el) {
                continue;
            }
            let ec = deferred_context(shared, el);
            e.current.insert(el.clone(), (ec.clone(), Origin::Finder));
            if let Err(err) = e.controller.add(ec) {
                failure = Some(err);
                break;
            }
            if has_watcher && shared.finder_reported.borrow_mut().insert(el.clone()) {
                reports.push((
                    ParserTreeError::FinderFoundElementMissedByWatcher { tag: tag.clone() },
                    el.clone(),
                ));
            }
        }
        if failure.is_none() {
            let unseen: Vec<(H::Node, ElementContext<H::Node>, Origin)> = e
                .current
                .iter()
                .filter(|(el, _)| !found.contains(*el))
                .map(|(el, (ec, origin))| (el.clone(), ec.clone(), *origin))
                .collect();
            for (el, ec, origin) in unseen {
                if e.watcher_contexts.contains_key(&el) {
                    if e.missed_by_finder.insert(el.clone()) {
                        reports.push((
                            ParserTreeError::WatcherFoundElementMissedByFinder { tag: tag.clone() },
                            el,
                        ));
                    }
                    continue;
                }
                tracing::trace!("[Finder] {tag} no longer finds {el:?} ({origin})");
                e.current.shift_remove(&el);
                if let Err(err) = e.controller.remove(ec) {
                    failure = Some(err);
                    break;
                }
            }
        }
        e.controller.clone()
    };
    report(shared, reports);
    if let Some(err) = failure {
        fail(shared, &controller, err);
    }
    shared.scheduler.flush();
}

fn dispose<H: HostTree>(shared: &Shared<H>, engine: &Rc<RefCell<Engine<H::Node>>>) {
    let (pending, sub) = {
        let mut e = engine.borrow_mut();
        e.disposed = true;
        (e.pending.take(), e.watcher_sub.take())
    };
    match pending {
        Some(Pending::Timeout(id)) => shared.options.timers.clear_timeout(id),
        Some(Pending::Idle(id)) => shared.options.timers.cancel_idle(id),
        None => {}
    }
    if let Some(sub) = sub {
        sub.unsubscribe();
    }
    tracing::trace!("[Finder] {} stopped", shared.options.tag);
}
