//! # Host tree abstraction
//!
//! The parser never owns the tree it classifies. It reads it through [`HostTree`]: parent and
//! child lookups, selector matching, and a batched change-notification primitive modelled on
//! DOM `MutationObserver`.
//!
//! [`memory::MemoryDocument`] is a complete in-memory host.

use std::{
    cell::{Cell, RefCell},
    fmt,
    hash::Hash,
    rc::Rc,
};

use indexmap::IndexSet;

use crate::{
    error::{ParserTreeError, Result},
    liveset::{LiveSet, LiveSetController, ListenHandle, Scheduler, Value},
};

pub mod memory;

/// What a [`MutationObserver`] reports on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveOptions {
    /// Direct children added to or removed from the target.
    ChildList,
    /// Attribute writes on the target. An empty filter reports every attribute.
    Attributes { filter: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRecord<N> {
    ChildList { added: Vec<N>, removed: Vec<N> },
    Attributes { name: String },
}

/// A registered observation. Records are delivered in batches through the callback given to
/// [`HostTree::observe`] on the host's own cadence.
pub trait MutationObserver<N> {
    /// Drain records queued but not yet delivered.
    fn take_records(&mut self) -> Vec<MutationRecord<N>>;

    /// Stop observing. Undelivered records are discarded.
    fn disconnect(&mut self);
}

pub type MutationCallback<N> = Box<dyn FnMut(Vec<MutationRecord<N>>)>;

pub trait HostTree: 'static {
    type Node: Clone + Eq + Hash + fmt::Debug + 'static;

    fn parent(&self, node: &Self::Node) -> Option<Self::Node>;

    /// Element children in document order.
    fn children(&self, node: &Self::Node) -> Vec<Self::Node>;

    /// Whether `node` matches the CSS-style `selector`. Invalid selectors match nothing.
    fn matches(&self, node: &Self::Node, selector: &str) -> bool;

    /// Reject selectors [`HostTree::matches`] cannot evaluate.
    fn check_selector(&self, _selector: &str) -> Result<()> {
        Ok(())
    }

    fn observe(
        &self,
        node: &Self::Node,
        options: ObserveOptions,
        callback: MutationCallback<Self::Node>,
    ) -> Box<dyn MutationObserver<Self::Node>>;
}

/// The element children of `node`, readable at any time and kept live by a child-list
/// observer while subscribed.
pub fn element_children<H: HostTree>(
    host: &Rc<H>,
    scheduler: &Scheduler,
    node: &H::Node,
) -> LiveSet<H::Node> {
    let read = {
        let host = host.clone();
        let node = node.clone();
        move || Ok(host.children(&node).into_iter().collect::<IndexSet<_>>())
    };
    let host = host.clone();
    let node = node.clone();
    LiveSet::with_read(scheduler, read, move |controller| {
        // A child reported twice by the host is still one member.
        let members: Rc<RefCell<IndexSet<H::Node>>> = Rc::new(RefCell::new(IndexSet::new()));
        for child in host.children(&node) {
            if members.borrow_mut().insert(child.clone()) {
                forward(controller, controller.add(child));
            }
        }
        let controller = controller.clone();
        let apply = move |records: Vec<MutationRecord<H::Node>>| {
            for record in records {
                let MutationRecord::ChildList { added, removed } = record else {
                    continue;
                };
                for child in removed {
                    if members.borrow_mut().shift_remove(&child) {
                        forward(&controller, controller.remove(child));
                    }
                }
                for child in added {
                    if members.borrow_mut().insert(child.clone()) {
                        forward(&controller, controller.add(child));
                    }
                }
            }
        };
        observe_with_pull(&*host, &node, ObserveOptions::ChildList, apply)
    })
}

/// Apply the outcome of a host-driven change. A set that has ended simply stops following the
/// host; any other failure errors the set.
fn forward<T: Value>(controller: &LiveSetController<T>, result: Result<()>) {
    match result {
        Ok(()) | Err(ParserTreeError::Ended) => {}
        Err(err) => {
            tracing::warn!("[HostTree] live set rejected a host change: {err}");
            controller.error(err);
        }
    }
}

/// Register `apply` as the observer callback and hand back a [`ListenHandle`] that disconnects
/// on release and, on pull, drains records the host has not delivered yet.
fn observe_with_pull<H: HostTree>(
    host: &H,
    node: &H::Node,
    options: ObserveOptions,
    apply: impl Fn(Vec<MutationRecord<H::Node>>) + 'static,
) -> ListenHandle {
    let apply = Rc::new(apply);
    let observer = {
        let apply = apply.clone();
        host.observe(
            node,
            options,
            Box::new(move |records: Vec<MutationRecord<H::Node>>| apply(records)),
        )
    };
    let observer = Rc::new(RefCell::new(observer));
    let puller = observer.clone();
    ListenHandle::new(move || observer.borrow_mut().disconnect()).with_pull(move || {
        let records = puller.borrow_mut().take_records();
        if !records.is_empty() {
            apply(records);
        }
    })
}

/// Holds `node` while `cond(node)` is true, re-evaluated on writes to the attributes in
/// `filter`.
pub fn attribute_condition<H: HostTree>(
    host: &Rc<H>,
    scheduler: &Scheduler,
    node: &H::Node,
    filter: Vec<String>,
    cond: Rc<dyn Fn(&H::Node) -> bool>,
) -> LiveSet<H::Node> {
    let read = {
        let node = node.clone();
        let cond = cond.clone();
        move || {
            let mut out = IndexSet::new();
            if cond(&node) {
                out.insert(node.clone());
            }
            Ok(out)
        }
    };
    let host = host.clone();
    let node = node.clone();
    LiveSet::with_read(scheduler, read, move |controller| {
        let passed = Rc::new(Cell::new(cond(&node)));
        if passed.get() {
            forward(controller, controller.add(node.clone()));
        }
        let controller = controller.clone();
        let cond = cond.clone();
        let target = node.clone();
        let apply = move |_records: Vec<MutationRecord<H::Node>>| {
            let now = cond(&target);
            if now != passed.replace(now) {
                let result = if now {
                    controller.add(target.clone())
                } else {
                    controller.remove(target.clone())
                };
                forward(&controller, result);
            }
        };
        observe_with_pull(
            &*host,
            &node,
            ObserveOptions::Attributes {
                filter: filter.clone(),
            },
            apply,
        )
    })
}
