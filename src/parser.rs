//! # PageParserTree
//!
//! Wires the configured watchers and finders into one [`TagTree`]. Every tag gets:
//!
//! - a set of pipeline outputs, one per watcher targeting the tag, flattened into one set;
//! - a reconciled set: the flattened watcher output, or the watcher/finder merger when the tag
//!   has a finder;
//! - a registration step that turns each reconciled context into a tree node and emits the
//!   context decorated with that node. Watchers sourcing from the tag consume this set.
//!
//! Watchers may source from each other in cycles (a comment owns reply sections, which own
//! comments), so every tag's registration set is built before any pipeline is wired.
//!
//! [`PageParserTree::replace_options`] keeps the old nodes in the tree while it rewires. A new
//! registration that finds a node for the same element, tag and owner adopts it, so observers
//! of the tree only see what the new options actually changed.

use std::{cell::RefCell, collections::HashMap, fmt, hash::Hash, rc::Rc};

use indexmap::{IndexMap, IndexSet};

use crate::{
    config::{LogErrorFn, PageParserTreeOptions, Watcher},
    context::{find_owner, ElementContext, NodeTagPair},
    error::{ParserTreeError, Result},
    event::Change,
    host::HostTree,
    liveset::{
        flat_map_r, merge, ops::Relay, Keepalive, LiveSet, LiveSetController, ListenHandle,
        Scheduler, Subscription,
    },
    selector::{compile, ContextSet, Transformer},
    tagtree::{TagTree, TagTreeController, TagTreeNode},
    watch::{watcher_finder_merger, MergerOptions},
};

struct TagEntry<N> {
    pipelines: LiveSetController<ContextSet<N>>,
    registered: ContextSet<N>,
}

/// Everything one set of options wired up. Rebuilt on [`PageParserTree::replace_options`].
struct Wiring<N> {
    entries: IndexMap<String, TagEntry<N>>,
    pipelines: Vec<(String, ContextSet<N>)>,
    subscriptions: Vec<Subscription>,
}

impl<N> Default for Wiring<N> {
    fn default() -> Self {
        Wiring {
            entries: IndexMap::new(),
            pipelines: Vec::new(),
            subscriptions: Vec::new(),
        }
    }
}

/// Nodes passed from one wiring to the next during [`PageParserTree::replace_options`].
enum Handover<N> {
    Idle,
    /// Registrars drop their contexts and leave the nodes in the tree.
    Retiring,
    /// Registrars reuse the retained node for the same tag, element and owner.
    Adopting(HashMap<(String, N), TagTreeNode<N>>),
}

type SharedHandover<N> = Rc<RefCell<Handover<N>>>;

pub struct PageParserTree<H: HostTree> {
    host: Rc<H>,
    scheduler: Scheduler,
    tree: TagTree<H::Node>,
    tree_ctrl: TagTreeController<H::Node>,
    options: PageParserTreeOptions<H::Node>,
    wiring: Wiring<H::Node>,
    handover: SharedHandover<H::Node>,
}

impl<H: HostTree> fmt::Debug for PageParserTree<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageParserTree")
            .field("tree", &self.tree)
            .field("options", &self.options)
            .field("pipelines", &self.wiring.pipelines.len())
            .finish()
    }
}

/// Diagnostics are logged and parsing continues. They are not raised to the caller.
fn default_log_error<N: fmt::Debug>() -> LogErrorFn<N> {
    Rc::new(|err: &ParserTreeError, node: Option<&N>| match node {
        Some(node) => tracing::error!("[PageParserTree] {err}: {node:?}"),
        None => tracing::error!("[PageParserTree] {err}"),
    })
}

fn compile_watchers<H: HostTree>(
    host: &Rc<H>,
    options: &PageParserTreeOptions<H::Node>,
) -> Result<Vec<(Watcher<H::Node>, Transformer<H::Node>)>> {
    options
        .watchers
        .iter()
        .map(|watcher| Ok((watcher.clone(), compile(host, &watcher.selectors)?)))
        .collect()
}

impl<H: HostTree> PageParserTree<H> {
    /// Validate `options`, build the tree under `root` and run the initial classification.
    pub fn new(
        host: Rc<H>,
        root: H::Node,
        options: PageParserTreeOptions<H::Node>,
    ) -> Result<PageParserTree<H>> {
        options.validate()?;
        let transformers = compile_watchers(&host, &options)?;
        let scheduler = Scheduler::new();
        let (tree, tree_ctrl) = TagTree::new(&scheduler, root, options.tags.clone());
        let mut parser = PageParserTree {
            host,
            scheduler,
            tree,
            tree_ctrl,
            options,
            wiring: Wiring::default(),
            handover: Rc::new(RefCell::new(Handover::Idle)),
        };
        parser.wiring = parser.wire(transformers)?;
        parser.scheduler.flush();
        tracing::debug!(
            "[PageParserTree] initialized with {} tags, {} nodes",
            parser.options.tags.len(),
            parser.tree.node_count()
        );
        Ok(parser)
    }

    pub fn tree(&self) -> &TagTree<H::Node> {
        &self.tree
    }

    pub fn get_all_by_tag(&self, tag: &str) -> Result<LiveSet<TagTreeNode<H::Node>>> {
        self.tree.get_all_by_tag(tag)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn host(&self) -> &Rc<H> {
        &self.host
    }

    pub fn options(&self) -> &PageParserTreeOptions<H::Node> {
        &self.options
    }

    /// Push host changes that are still buffered through every pipeline, then flush. Afterwards
    /// the tree reflects the host without waiting for its next notification turn.
    pub fn pull_changes(&self) {
        for sub in self.wiring.subscriptions.iter() {
            sub.pull_changes();
        }
        self.scheduler.flush();
    }

    fn log_error(&self) -> LogErrorFn<H::Node> {
        self.options
            .log_error
            .clone()
            .unwrap_or_else(default_log_error)
    }

    fn wire(
        &self,
        transformers: Vec<(Watcher<H::Node>, Transformer<H::Node>)>,
    ) -> Result<Wiring<H::Node>> {
        let scheduler = &self.scheduler;
        let log_error = self.log_error();
        let mut wiring = Wiring::default();

        // Every registration set exists before any pipeline refers to one.
        for (tag, tag_options) in self.options.tags.iter() {
            let (pipeline_sets, pipelines) = LiveSet::active(scheduler, IndexSet::new());
            let watched = transformers.iter().any(|(w, _)| &w.tag == tag);
            let combined = watched
                .then(|| flat_map_r(&pipeline_sets, |set: &ContextSet<H::Node>| set.clone()));
            let reconciled = match (self.options.finders.get(tag), combined) {
                (Some(finder), watcher_set) => {
                    let timers = self.options.timers.clone().ok_or_else(|| {
                        ParserTreeError::Config(format!("finder for {tag} has no timers"))
                    })?;
                    watcher_finder_merger(
                        scheduler,
                        MergerOptions {
                            host: self.host.clone(),
                            tree: self.tree.clone(),
                            tag: tag.clone(),
                            owned_by: tag_options.owned_by.clone(),
                            watcher_set,
                            finder: finder.clone(),
                            timers,
                            log_error: log_error.clone(),
                        },
                    )
                }
                (None, Some(combined)) => combined,
                (None, None) => LiveSet::constant(scheduler, IndexSet::new()),
            };
            let registered = registration(
                &self.tree_ctrl,
                tag,
                &tag_options.owned_by,
                &reconciled,
                &log_error,
                &self.handover,
            );
            wiring.entries.insert(
                tag.clone(),
                TagEntry {
                    pipelines,
                    registered,
                },
            );
        }

        for entry in wiring.entries.values() {
            wiring
                .subscriptions
                .push(entry.registered.subscribe(Keepalive));
        }

        let root_context = ElementContext::new(
            self.tree.get_value().clone(),
            vec![NodeTagPair {
                tag: None,
                node: self.tree.root().clone(),
            }]
            .into(),
        );
        let root_set = LiveSet::constant(scheduler, IndexSet::from([root_context]));
        for (watcher, transformer) in transformers {
            let mut sources: Vec<ContextSet<H::Node>> = Vec::new();
            for source in watcher.sources.iter() {
                match source {
                    None => sources.push(root_set.clone()),
                    Some(tag) => {
                        let entry = wiring
                            .entries
                            .get(tag)
                            .ok_or_else(|| ParserTreeError::UnknownSource(tag.clone()))?;
                        sources.push(entry.registered.clone());
                    }
                }
            }
            let input = if sources.len() == 1 {
                sources.remove(0)
            } else {
                merge(scheduler, sources)
            };
            let output = transformer(&input);
            let entry = wiring
                .entries
                .get(&watcher.tag)
                .ok_or_else(|| ParserTreeError::UnknownTag(watcher.tag.clone()))?;
            entry.pipelines.add(output.clone())?;
            wiring.pipelines.push((watcher.tag, output));
        }
        Ok(wiring)
    }

    /// Detach every pipeline and drop every subscription. With `retain`, the nodes stay in the
    /// tree for the next wiring to adopt; otherwise every node is removed. Only propagation work
    /// runs here: observers of the tree registries hear about it on the next flush.
    fn unwire(&mut self, retain: bool) -> IndexMap<String, TagEntry<H::Node>> {
        let wiring = std::mem::take(&mut self.wiring);
        if retain {
            *self.handover.borrow_mut() = Handover::Retiring;
        }
        for (tag, output) in wiring.pipelines {
            let Some(entry) = wiring.entries.get(&tag) else {
                continue;
            };
            match entry.pipelines.remove(output) {
                Ok(()) | Err(ParserTreeError::Ended) => {}
                Err(err) => tracing::warn!("[PageParserTree] detaching a {tag} pipeline: {err}"),
            }
        }
        // Pipeline removals flow down through every registration.
        self.scheduler.propagate();
        for sub in wiring.subscriptions {
            sub.unsubscribe();
        }
        if retain {
            let mut retained = HashMap::new();
            for tag in self.options.tags.keys() {
                let nodes = match self.tree.get_all_by_tag(tag) {
                    Ok(set) => set.values().unwrap_or_default(),
                    Err(_) => continue,
                };
                for node in nodes {
                    retained.insert((tag.clone(), node.get_value().clone()), node);
                }
            }
            tracing::debug!("[PageParserTree] retaining {} nodes", retained.len());
            *self.handover.borrow_mut() = Handover::Adopting(retained);
        } else {
            let log_error = self.log_error();
            for (tag, owned) in self.tree.get_owned() {
                for node in owned.values().unwrap_or_default() {
                    if let Err(err) = self
                        .tree_ctrl
                        .remove_tagged_node(self.tree.root(), &tag, &node)
                    {
                        log_error(&err, Some(node.get_value()));
                    }
                }
            }
        }
        self.scheduler.propagate();
        wiring.entries
    }

    /// Remove every retained node the new wiring did not adopt.
    fn release_retained(&self) {
        let retained = std::mem::replace(&mut *self.handover.borrow_mut(), Handover::Idle);
        let Handover::Adopting(retained) = retained else {
            return;
        };
        let log_error = self.log_error();
        for ((tag, value), node) in retained {
            // Removing an owner already took its descendants.
            if !node.is_attached() {
                continue;
            }
            let parent = node.get_parent().unwrap_or_else(|| self.tree.root().clone());
            if let Err(err) = self.tree_ctrl.remove_tagged_node(&parent, &tag, &node) {
                log_error(&err, Some(&value));
            }
        }
    }

    /// Tear everything down. Every set handed out ends and the tree is left empty.
    pub fn dump(&mut self) {
        let entries = self.unwire(false);
        // Registry observers see every removal before the sets end.
        self.scheduler.flush();
        self.tree_ctrl.end();
        for entry in entries.values() {
            entry.pipelines.end();
        }
        self.scheduler.flush();
        tracing::debug!("[PageParserTree] dumped");
    }

    /// Swap watchers and finders in place. The tag schema must stay the same; the sets from
    /// [`PageParserTree::get_all_by_tag`] and [`TagTreeNode::get_owned_by_tag`] on the root
    /// keep their identity.
    ///
    /// The new pipelines are wired before anything reaches the registry observers. Nodes the
    /// new options still produce are kept, so observers receive one batch holding only the
    /// difference. Elements that only a finder reported are dropped and come back on its next
    /// scan.
    pub fn replace_options(&mut self, options: PageParserTreeOptions<H::Node>) -> Result<()> {
        options.validate()?;
        if !self.options.same_schema(&options) {
            return Err(ParserTreeError::TagSchemaChanged);
        }
        if self.tree.is_ended() {
            return Err(ParserTreeError::Ended);
        }
        let transformers = compile_watchers(&self.host, &options)?;
        self.unwire(true);
        self.options = options;
        let wired = self.wire(transformers);
        self.scheduler.propagate();
        self.release_retained();
        self.scheduler.flush();
        self.wiring = wired?;
        tracing::debug!(
            "[PageParserTree] options replaced, {} nodes",
            self.tree.node_count()
        );
        Ok(())
    }
}

struct Registered<N> {
    parent: TagTreeNode<N>,
    node: TagTreeNode<N>,
    output: ElementContext<N>,
}

/// Per-activation state of one tag's registration step.
struct Registrar<N> {
    tag: String,
    owned_by: Vec<String>,
    tree_ctrl: TagTreeController<N>,
    log_error: LogErrorFn<N>,
    handover: SharedHandover<N>,
    registered: HashMap<ElementContext<N>, Registered<N>>,
    by_element: HashMap<N, ElementContext<N>>,
    // Contexts for elements that already have a node, or whose owner was gone on arrival.
    held_back: IndexMap<N, Vec<ElementContext<N>>>,
}

impl<N: Clone + Eq + Hash + fmt::Debug + 'static> Registrar<N> {
    fn add(
        &mut self,
        controller: &LiveSetController<ElementContext<N>>,
        ec: &ElementContext<N>,
    ) -> Result<()> {
        let el = ec.el();
        if self.by_element.contains_key(el) {
            (self.log_error)(
                &ParserTreeError::DuplicateElement {
                    tag: self.tag.clone(),
                },
                Some(el),
            );
            self.held_back
                .entry(el.clone())
                .or_default()
                .push(ec.clone());
            return Ok(());
        }
        self.register(controller, ec)
    }

    fn register(
        &mut self,
        controller: &LiveSetController<ElementContext<N>>,
        ec: &ElementContext<N>,
    ) -> Result<()> {
        let el = ec.el();
        let tree = self.tree_ctrl.tree();
        let parents = ec.parents();
        let parent = find_owner(&parents, &self.owned_by)
            .cloned()
            .unwrap_or_else(|| tree.root().clone());
        if !parent.is_attached() {
            tracing::debug!(
                "[PageParserTree] owner of {} {el:?} is gone, holding it back",
                self.tag
            );
            self.held_back
                .entry(el.clone())
                .or_default()
                .push(ec.clone());
            return Ok(());
        }
        let node = match self.adopt(el, &parent) {
            Some(node) => node,
            None => self
                .tree_ctrl
                .add_tagged_value(&parent, &self.tag, el.clone())?,
        };
        let output = ec.with_parent(&self.tag, node.clone());
        self.by_element.insert(el.clone(), ec.clone());
        self.registered.insert(
            ec.clone(),
            Registered {
                parent,
                node,
                output: output.clone(),
            },
        );
        controller.add(output)
    }

    fn remove(
        &mut self,
        controller: &LiveSetController<ElementContext<N>>,
        ec: &ElementContext<N>,
    ) -> Result<()> {
        let el = ec.el();
        if let Some(registered) = self.registered.remove(ec) {
            self.by_element.remove(el);
            if matches!(*self.handover.borrow(), Handover::Retiring) {
                self.held_back.shift_remove(el);
                return controller.remove(registered.output);
            }
            self.tree_ctrl
                .remove_tagged_node(&registered.parent, &self.tag, &registered.node)?;
            controller.remove(registered.output)?;
            // Another context still reports the element: it takes over.
            if let Some(next) = self.take_held_back(el, None) {
                return self.register(controller, &next);
            }
            return Ok(());
        }
        if self.take_held_back(el, Some(ec)).is_some() {
            return Ok(());
        }
        let err = ParserTreeError::Invariant(format!(
            "PageParserTree({}) received removal of unseen element",
            self.tag
        ));
        (self.log_error)(&err, Some(el));
        Err(err)
    }

    /// The retained node for `el` under `parent`, while a handover is adopting.
    fn adopt(&self, el: &N, parent: &TagTreeNode<N>) -> Option<TagTreeNode<N>> {
        let mut handover = self.handover.borrow_mut();
        let Handover::Adopting(retained) = &mut *handover else {
            return None;
        };
        let key = (self.tag.clone(), el.clone());
        let node = retained.get(&key)?;
        if node.get_parent().as_ref() != Some(parent) || !node.is_attached() {
            return None;
        }
        tracing::trace!("[PageParserTree] {} adopts the node for {el:?}", self.tag);
        retained.remove(&key)
    }

    /// Take `which` (or the oldest held-back context) for `el` out of the held-back list.
    fn take_held_back(
        &mut self,
        el: &N,
        which: Option<&ElementContext<N>>,
    ) -> Option<ElementContext<N>> {
        let list = self.held_back.get_mut(el)?;
        let position = match which {
            Some(ec) => list.iter().position(|held| held == ec)?,
            None => 0,
        };
        let taken = (position < list.len()).then(|| list.remove(position));
        if list.is_empty() {
            self.held_back.shift_remove(el);
        }
        taken
    }
}

/// Register every context of `input` into the tree under `tag`. The output carries the same
/// elements with `(tag, node)` appended to their ancestry.
fn registration<N: Clone + Eq + Hash + fmt::Debug + 'static>(
    tree_ctrl: &TagTreeController<N>,
    tag: &str,
    owned_by: &[String],
    input: &ContextSet<N>,
    log_error: &LogErrorFn<N>,
    handover: &SharedHandover<N>,
) -> ContextSet<N> {
    let tree_ctrl = tree_ctrl.clone();
    let tag = tag.to_string();
    let owned_by = owned_by.to_vec();
    let log_error = log_error.clone();
    let handover = handover.clone();
    let input = input.clone();
    let scheduler = input.scheduler().clone();
    LiveSet::new(&scheduler, move |controller| {
        let mut registrar = Registrar {
            tag: tag.clone(),
            owned_by: owned_by.clone(),
            tree_ctrl: tree_ctrl.clone(),
            log_error: log_error.clone(),
            handover: handover.clone(),
            registered: HashMap::new(),
            by_element: HashMap::new(),
            held_back: IndexMap::new(),
        };
        let sub = input.subscribe(Relay::new(controller, move |controller, change| {
            match change {
                Change::Add(ec) => registrar.add(controller, ec),
                Change::Remove(ec) => registrar.remove(controller, ec),
            }
        }));
        ListenHandle::from_subscription(sub)
    })
}
