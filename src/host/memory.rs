//! An in-memory element tree implementing [`HostTree`].
//!
//! Markup is parsed by html5ever (through `scraper`) into an `ego_tree` arena, and selectors are
//! evaluated by the `selectors` engine `scraper` wraps. Mutations queue [`MutationRecord`]s on
//! matching observers. Nothing is delivered until [`MemoryDocument::deliver_mutations`] runs,
//! the way a browser delivers `MutationObserver` records after the current task.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    rc::Rc,
};

use ego_tree::{NodeRef, Tree};
use html5ever::{tendril::StrTendril, Attribute, LocalName, Namespace, QualName};
use scraper::{node::Element, node::Text, ElementRef, Html, Node, Selector};

use super::{HostTree, MutationCallback, MutationObserver, MutationRecord, ObserveOptions};
use crate::error::{ParserTreeError, Result};

const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(ego_tree::NodeId);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

struct ObserverSlot {
    target: NodeId,
    options: ObserveOptions,
    queue: RefCell<Vec<MutationRecord<NodeId>>>,
    callback: RefCell<MutationCallback<NodeId>>,
    connected: Cell<bool>,
}

impl ObserverSlot {
    fn wants_child_list(&self, target: NodeId) -> bool {
        self.connected.get()
            && self.target == target
            && matches!(self.options, ObserveOptions::ChildList)
    }

    fn wants_attribute(&self, target: NodeId, name: &str) -> bool {
        self.connected.get()
            && self.target == target
            && match &self.options {
                ObserveOptions::Attributes { filter } => {
                    filter.is_empty() || filter.iter().any(|f| f == name)
                }
                ObserveOptions::ChildList => false,
            }
    }
}

struct MemoryObserver {
    slot: Rc<ObserverSlot>,
}

impl MutationObserver<NodeId> for MemoryObserver {
    fn take_records(&mut self) -> Vec<MutationRecord<NodeId>> {
        self.slot.queue.take()
    }

    fn disconnect(&mut self) {
        self.slot.connected.set(false);
        self.slot.queue.borrow_mut().clear();
        // Drop whatever the callback captured.
        if let Ok(mut callback) = self.slot.callback.try_borrow_mut() {
            *callback = Box::new(|_: Vec<MutationRecord<NodeId>>| {});
        }
    }
}

/// Element tree with DOM-like mutation observation.
///
/// A new document holds `<html><head></head><body></body></html>`. Setting the inner HTML of
/// the `html` element parses a whole document; any other target parses a fragment in a `body`
/// context, the same as `innerHTML` on a `div`.
pub struct MemoryDocument {
    html: RefCell<Html>,
    root: NodeId,
    observers: RefCell<Vec<Rc<ObserverSlot>>>,
    selectors: RefCell<HashMap<String, Option<Rc<Selector>>>>,
}

impl fmt::Debug for MemoryDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDocument")
            .field("root", &self.root)
            .field("observers", &self.observers.borrow().len())
            .finish()
    }
}

fn html_name(name: &str) -> QualName {
    QualName::new(
        None,
        Namespace::from(HTML_NAMESPACE),
        LocalName::from(name.to_ascii_lowercase()),
    )
}

fn attribute(name: &str, value: &str) -> Attribute {
    Attribute {
        name: QualName::new(None, Namespace::from(""), LocalName::from(name)),
        value: StrTendril::from(value),
    }
}

/// Copy `source` and its subtree under `parent`. Comments, doctypes and processing
/// instructions are left behind.
fn graft(
    tree: &mut Tree<Node>,
    parent: ego_tree::NodeId,
    source: NodeRef<'_, Node>,
) -> Option<NodeId> {
    match source.value() {
        Node::Element(_) | Node::Text(_) => {}
        _ => return None,
    }
    let id = tree.get_mut(parent)?.append(source.value().clone()).id();
    for child in source.children() {
        graft(tree, id, child);
    }
    Some(NodeId(id))
}

impl MemoryDocument {
    /// An empty document: `html` with an empty `head` and `body`.
    pub fn new() -> Rc<MemoryDocument> {
        let html = Html::parse_document("");
        let root = NodeId(html.root_element().id());
        Rc::new(MemoryDocument {
            html: RefCell::new(html),
            root,
            observers: RefCell::new(Vec::new()),
            selectors: RefCell::new(HashMap::new()),
        })
    }

    /// The `html` element.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The `body` element, if the root currently has one.
    pub fn body(&self) -> Option<NodeId> {
        self.children(&self.root)
            .into_iter()
            .find(|child| self.tag_name(*child) == "body")
    }

    fn orphan(&self, node: Node) -> NodeId {
        NodeId(self.html.borrow_mut().tree.orphan(node).id())
    }

    pub fn create_element(&self, name: &str) -> NodeId {
        self.orphan(Node::Element(Element::new(html_name(name), Vec::new())))
    }

    pub fn create_text(&self, text: &str) -> NodeId {
        self.orphan(Node::Text(Text {
            text: StrTendril::from(text),
        }))
    }

    fn is_element(&self, node: NodeId) -> bool {
        self.html
            .borrow()
            .tree
            .get(node.0)
            .is_some_and(|n| n.value().is_element())
    }

    fn queue_child_list(&self, target: NodeId, added: Vec<NodeId>, removed: Vec<NodeId>) {
        let added: Vec<NodeId> = added.into_iter().filter(|n| self.is_element(*n)).collect();
        let removed: Vec<NodeId> = removed.into_iter().filter(|n| self.is_element(*n)).collect();
        if added.is_empty() && removed.is_empty() {
            return;
        }
        for slot in self.observers.borrow().iter() {
            if slot.wants_child_list(target) {
                slot.queue.borrow_mut().push(MutationRecord::ChildList {
                    added: added.clone(),
                    removed: removed.clone(),
                });
            }
        }
    }

    fn queue_attribute(&self, target: NodeId, name: &str) {
        for slot in self.observers.borrow().iter() {
            if slot.wants_attribute(target, name) {
                slot.queue.borrow_mut().push(MutationRecord::Attributes {
                    name: name.to_string(),
                });
            }
        }
    }

    /// Unlink `node` from its parent without queueing a record.
    fn detach(&self, node: NodeId) -> Option<NodeId> {
        let mut html = self.html.borrow_mut();
        let parent = html.tree.get(node.0)?.parent()?.id();
        html.tree.get_mut(node.0)?.detach();
        Some(NodeId(parent))
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) {
        self.insert_before(parent, child, None);
    }

    /// Insert `child` into `parent` before `reference`, or at the end. A child that already
    /// has a parent is moved.
    pub fn insert_before(&self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        if let Some(old_parent) = self.detach(child) {
            self.queue_child_list(old_parent, Vec::new(), vec![child]);
        }
        {
            let mut html = self.html.borrow_mut();
            let sibling = reference.filter(|r| {
                html.tree
                    .get(r.0)
                    .and_then(|n| n.parent())
                    .is_some_and(|p| p.id() == parent.0)
            });
            let inserted = match sibling {
                Some(sibling) => html
                    .tree
                    .get_mut(sibling.0)
                    .map(|mut s| s.insert_id_before(child.0).id()),
                None => html
                    .tree
                    .get_mut(parent.0)
                    .map(|mut p| p.append_id(child.0).id()),
            };
            if inserted.is_none() {
                return;
            }
        }
        self.queue_child_list(parent, vec![child], Vec::new());
    }

    pub fn remove(&self, node: NodeId) {
        if let Some(parent) = self.detach(node) {
            self.queue_child_list(parent, Vec::new(), vec![node]);
        }
    }

    /// Rebuild the element at `node` with its attributes passed through `edit`. Returns false
    /// when `node` is not an element or `edit` reports no change.
    fn edit_attributes(
        &self,
        node: NodeId,
        edit: impl FnOnce(&mut Vec<(String, String)>) -> bool,
    ) -> bool {
        let mut html = self.html.borrow_mut();
        let Some(mut target) = html.tree.get_mut(node.0) else {
            return false;
        };
        let Node::Element(element) = target.value() else {
            return false;
        };
        let mut attributes: Vec<(String, String)> = element
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if !edit(&mut attributes) {
            return false;
        }
        let name = html_name(element.name());
        let attributes = attributes
            .iter()
            .map(|(k, v)| attribute(k, v))
            .collect();
        *element = Element::new(name, attributes);
        true
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        let written = self.edit_attributes(node, |attributes| {
            match attributes.iter_mut().find(|(k, _)| k == name) {
                Some(existing) => existing.1 = value.to_string(),
                None => attributes.push((name.to_string(), value.to_string())),
            }
            true
        });
        if written {
            self.queue_attribute(node, name);
        }
    }

    pub fn remove_attribute(&self, node: NodeId, name: &str) {
        let removed = self.edit_attributes(node, |attributes| {
            let before = attributes.len();
            attributes.retain(|(k, _)| k != name);
            attributes.len() != before
        });
        if removed {
            self.queue_attribute(node, name);
        }
    }

    pub fn get_attribute(&self, node: NodeId, name: &str) -> Option<String> {
        let html = self.html.borrow();
        let element = html.tree.get(node.0)?.value().as_element()?;
        element.attr(name).map(str::to_string)
    }

    pub fn tag_name(&self, node: NodeId) -> String {
        let html = self.html.borrow();
        match html.tree.get(node.0).map(|n| n.value()) {
            Some(Node::Element(element)) => element.name().to_string(),
            Some(Node::Text(_)) => "#text".to_string(),
            _ => String::new(),
        }
    }

    /// Replace the children of `node` with the parsed `markup`.
    pub fn set_inner_html(&self, node: NodeId, markup: &str) -> Result<()> {
        if !self.is_element(node) {
            return Err(ParserTreeError::Invariant(format!(
                "set_inner_html on {node}, which is not an element"
            )));
        }
        let parsed = if node == self.root {
            Html::parse_document(markup)
        } else {
            Html::parse_fragment(markup)
        };
        for err in parsed.errors.iter() {
            tracing::trace!("[MemoryDocument] recovered from parse error: {err}");
        }
        let old = self.children(&node);
        let fresh = {
            let mut html = self.html.borrow_mut();
            let stale: Vec<ego_tree::NodeId> = html
                .tree
                .get(node.0)
                .map(|n| n.children().map(|c| c.id()).collect())
                .unwrap_or_default();
            for id in stale {
                if let Some(mut child) = html.tree.get_mut(id) {
                    child.detach();
                }
            }
            let mut fresh = Vec::new();
            for child in parsed.root_element().children() {
                if let Some(id) = graft(&mut html.tree, node.0, child) {
                    fresh.push(id);
                }
            }
            fresh
        };
        self.queue_child_list(node, fresh, old);
        Ok(())
    }

    pub fn text_content(&self, node: NodeId) -> String {
        let html = self.html.borrow();
        let Some(start) = html.tree.get(node.0) else {
            return String::new();
        };
        start
            .descendants()
            .filter_map(|n| n.value().as_text())
            .map(|text| &**text)
            .collect()
    }

    /// Serialized markup of `node` and its subtree.
    pub fn outer_html(&self, node: NodeId) -> String {
        let html = self.html.borrow();
        let Some(target) = html.tree.get(node.0) else {
            return String::new();
        };
        match ElementRef::wrap(target) {
            Some(element) => element.html(),
            None => target
                .value()
                .as_text()
                .map(|text| text.to_string())
                .unwrap_or_default(),
        }
    }

    /// Short label such as `div.comment` for logs and test assertions.
    pub fn describe(&self, node: NodeId) -> String {
        let html = self.html.borrow();
        match html.tree.get(node.0).map(|n| n.value()) {
            Some(Node::Element(element)) => {
                let mut out = element.name().to_string();
                if let Some(id) = element.attr("id") {
                    out.push('#');
                    out.push_str(id);
                }
                if let Some(class) = element.attr("class") {
                    for c in class.split_ascii_whitespace() {
                        out.push('.');
                        out.push_str(c);
                    }
                }
                out
            }
            Some(Node::Text(_)) => "#text".to_string(),
            _ => format!("{node}"),
        }
    }

    fn selector(&self, css: &str) -> Option<Rc<Selector>> {
        if let Some(cached) = self.selectors.borrow().get(css) {
            return cached.clone();
        }
        let parsed = match Selector::parse(css) {
            Ok(selector) => Some(Rc::new(selector)),
            Err(err) => {
                tracing::warn!("[MemoryDocument] invalid selector {css:?}: {err}");
                None
            }
        };
        self.selectors
            .borrow_mut()
            .insert(css.to_string(), parsed.clone());
        parsed
    }

    /// Every element below `scope` matching `css`, in document order.
    pub fn query_selector_all(&self, scope: NodeId, css: &str) -> Vec<NodeId> {
        let Some(selector) = self.selector(css) else {
            return Vec::new();
        };
        let html = self.html.borrow();
        let Some(scope) = html.tree.get(scope.0).and_then(ElementRef::wrap) else {
            return Vec::new();
        };
        scope
            .select(&selector)
            .map(|element| NodeId(element.id()))
            .collect()
    }

    pub fn query_selector(&self, scope: NodeId, css: &str) -> Option<NodeId> {
        self.query_selector_all(scope, css).into_iter().next()
    }

    pub fn has_pending_mutations(&self) -> bool {
        self.observers
            .borrow()
            .iter()
            .any(|slot| slot.connected.get() && !slot.queue.borrow().is_empty())
    }

    /// Deliver queued records to their observers. Returns how many callbacks ran. Records
    /// queued by the callbacks themselves wait for the next call.
    pub fn deliver_mutations(&self) -> usize {
        let slots: Vec<Rc<ObserverSlot>> = self.observers.borrow().clone();
        let mut delivered = 0;
        for slot in slots {
            if !slot.connected.get() {
                continue;
            }
            let records = slot.queue.take();
            if records.is_empty() {
                continue;
            }
            match slot.callback.try_borrow_mut() {
                Ok(mut callback) => {
                    let callback: &mut MutationCallback<NodeId> = &mut callback;
                    callback(records);
                    delivered += 1;
                }
                Err(_) => {
                    slot.queue.borrow_mut().splice(0..0, records);
                }
            }
        }
        self.observers.borrow_mut().retain(|s| s.connected.get());
        delivered
    }
}

impl HostTree for MemoryDocument {
    type Node = NodeId;

    fn parent(&self, node: &NodeId) -> Option<NodeId> {
        let html = self.html.borrow();
        html.tree
            .get(node.0)?
            .parent()
            .filter(|p| p.value().is_element())
            .map(|p| NodeId(p.id()))
    }

    fn children(&self, node: &NodeId) -> Vec<NodeId> {
        let html = self.html.borrow();
        let Some(node) = html.tree.get(node.0) else {
            return Vec::new();
        };
        node.children()
            .filter(|c| c.value().is_element())
            .map(|c| NodeId(c.id()))
            .collect()
    }

    fn matches(&self, node: &NodeId, selector: &str) -> bool {
        let Some(selector) = self.selector(selector) else {
            return false;
        };
        let html = self.html.borrow();
        html.tree
            .get(node.0)
            .and_then(ElementRef::wrap)
            .is_some_and(|element| selector.matches(&element))
    }

    fn check_selector(&self, selector: &str) -> Result<()> {
        Selector::parse(selector)
            .map(|_| ())
            .map_err(|err| ParserTreeError::InvalidSelector(format!("{selector:?}: {err}")))
    }

    fn observe(
        &self,
        node: &NodeId,
        options: ObserveOptions,
        callback: MutationCallback<NodeId>,
    ) -> Box<dyn MutationObserver<NodeId>> {
        let slot = Rc::new(ObserverSlot {
            target: *node,
            options,
            queue: RefCell::new(Vec::new()),
            callback: RefCell::new(callback),
            connected: Cell::new(true),
        });
        self.observers.borrow_mut().push(slot.clone());
        Box::new(MemoryObserver { slot })
    }
}
