use std::{
    cell::RefCell,
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
};

use once_cell::unsync::OnceCell;

use crate::{host::HostTree, tagtree::TagTree, tagtree::TagTreeNode};

/// One tagged ancestor of an element. `tag` is `None` for the tree root.
pub struct NodeTagPair<N> {
    pub tag: Option<String>,
    pub node: TagTreeNode<N>,
}

impl<N> Clone for NodeTagPair<N> {
    fn clone(&self) -> Self {
        NodeTagPair {
            tag: self.tag.clone(),
            node: self.node.clone(),
        }
    }
}

impl<N: fmt::Debug> fmt::Debug for NodeTagPair<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTagPair")
            .field("tag", &self.tag)
            .field("node", &self.node)
            .finish()
    }
}

/// Ancestry from the root (first) to the innermost tagged ancestor (last).
pub type Parents<N> = Rc<[NodeTagPair<N>]>;

type Resolver<N> = Box<dyn FnOnce() -> Parents<N>>;

struct ContextInner<N> {
    el: N,
    parents: OnceCell<Parents<N>>,
    resolve: RefCell<Option<Resolver<N>>>,
}

/// A host node paired with its tagged ancestry. Identity-compared: two contexts for the same
/// node are different values.
pub struct ElementContext<N>(Rc<ContextInner<N>>);

impl<N> Clone for ElementContext<N> {
    fn clone(&self) -> Self {
        ElementContext(self.0.clone())
    }
}

impl<N> PartialEq for ElementContext<N> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<N> Eq for ElementContext<N> {}

impl<N> Hash for ElementContext<N> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as *const ()).hash(state);
    }
}

impl<N: fmt::Debug> fmt::Debug for ElementContext<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("ElementContext");
        s.field("el", &self.0.el);
        match self.0.parents.get() {
            Some(parents) => s.field("depth", &parents.len()),
            None => s.field("depth", &"unresolved"),
        };
        s.finish()
    }
}

impl<N: 'static> ElementContext<N> {
    pub fn new(el: N, parents: Parents<N>) -> Self {
        ElementContext(Rc::new(ContextInner {
            el,
            parents: OnceCell::with_value(parents),
            resolve: RefCell::new(None),
        }))
    }

    /// A context whose ancestry is computed on first read and then memoized. Used when the
    /// ancestors may not be registered in the tree yet.
    pub fn deferred(el: N, resolve: impl FnOnce() -> Parents<N> + 'static) -> Self {
        ElementContext(Rc::new(ContextInner {
            el,
            parents: OnceCell::new(),
            resolve: RefCell::new(Some(Box::new(resolve))),
        }))
    }

    pub fn el(&self) -> &N {
        &self.0.el
    }

    pub fn parents(&self) -> Parents<N> {
        self.0
            .parents
            .get_or_init(|| {
                let resolve = self.0.resolve.borrow_mut().take();
                match resolve {
                    Some(resolve) => resolve(),
                    None => Vec::new().into(),
                }
            })
            .clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.0.parents.get().is_some()
    }

    /// A context for `el` sharing this context's ancestry.
    pub fn rewrap(&self, el: N) -> Self {
        ElementContext::new(el, self.parents())
    }

    /// The same element, with `(tag, node)` appended as its innermost ancestor.
    pub fn with_parent(&self, tag: &str, node: TagTreeNode<N>) -> Self
    where
        N: Clone,
    {
        let parents: Vec<NodeTagPair<N>> = self
            .parents()
            .iter()
            .cloned()
            .chain(std::iter::once(NodeTagPair {
                tag: Some(tag.to_string()),
                node,
            }))
            .collect();
        ElementContext::new(self.0.el.clone(), parents.into())
    }
}

/// The innermost ancestor that may own a node whose tag lists `owned_by`: an untagged ancestor
/// (the root) or one whose tag is in `owned_by`.
pub fn find_owner<'a, N>(
    parents: &'a [NodeTagPair<N>],
    owned_by: &[String],
) -> Option<&'a TagTreeNode<N>> {
    parents
        .iter()
        .rev()
        .find(|pair| match &pair.tag {
            None => true,
            Some(tag) => owned_by.iter().any(|t| t == tag),
        })
        .map(|pair| &pair.node)
}

/// Rebuild an element's ancestry from the host tree: walk host parents up to the root, keeping
/// the first registered node at each level that is the root or has a tag in `owned_by`.
pub fn resolve_ancestry<H: HostTree>(
    host: &H,
    tree: &TagTree<H::Node>,
    el: &H::Node,
    owned_by: &[String],
) -> Parents<H::Node> {
    let root = tree.get_value().clone();
    let mut parents = Vec::new();
    let mut current = host.parent(el);
    while let Some(node) = current {
        let candidate = tree
            .get_nodes_for_value(&node)
            .into_iter()
            .find(|n| match n.get_tag() {
                None => true,
                Some(tag) => owned_by.iter().any(|t| t == tag),
            });
        if let Some(candidate) = candidate {
            parents.push(NodeTagPair {
                tag: candidate.get_tag().map(str::to_string),
                node: candidate,
            });
        }
        if node == root {
            break;
        }
        current = host.parent(&node);
    }
    parents.reverse();
    parents.into()
}
