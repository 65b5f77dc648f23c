//! # Selector pipelines
//!
//! A watcher describes how to get from its source contexts to the elements it tags as a list of
//! [`Selector`] stages. [`compile`] turns that list into a [`Transformer`]: a function from a
//! live set of contexts to a live set of contexts, composed left to right. Every stage stays
//! incremental, so host mutations flow through as adds and removes.

use std::{fmt, rc::Rc};

use crate::{
    context::ElementContext,
    error::{ParserTreeError, Result},
    event::Change,
    host::{attribute_condition, element_children, HostTree},
    liveset::{
        filter, flat_map_r, merge, ops::Relay, transduce, ListenHandle, LiveSet, LiveSetController,
    },
};

pub type Predicate<N> = Rc<dyn Fn(&N) -> bool>;

pub enum Cond<N> {
    Css(String),
    Fn(Predicate<N>),
}

impl<N> Clone for Cond<N> {
    fn clone(&self) -> Self {
        match self {
            Cond::Css(css) => Cond::Css(css.clone()),
            Cond::Fn(f) => Cond::Fn(f.clone()),
        }
    }
}

impl<N> fmt::Debug for Cond<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cond::Css(css) => f.debug_tuple("Css").field(css).finish(),
            Cond::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

pub enum Selector<N> {
    /// Direct children of each context's element matching a CSS selector.
    Children(String),
    Filter(Predicate<N>),
    /// Replace each context's element. `None` drops the context.
    Map(Rc<dyn Fn(&N) -> Option<N>>),
    /// Hold each context while `cond` holds, re-checked on writes to `attribute_filter`.
    Watch {
        attribute_filter: Vec<String>,
        cond: Cond<N>,
    },
    /// Run each branch on the same input and merge the outputs.
    Or(Vec<Vec<Selector<N>>>),
    /// Log every change passing through.
    Log(String),
}

impl<N> Clone for Selector<N> {
    fn clone(&self) -> Self {
        match self {
            Selector::Children(css) => Selector::Children(css.clone()),
            Selector::Filter(f) => Selector::Filter(f.clone()),
            Selector::Map(f) => Selector::Map(f.clone()),
            Selector::Watch {
                attribute_filter,
                cond,
            } => Selector::Watch {
                attribute_filter: attribute_filter.clone(),
                cond: cond.clone(),
            },
            Selector::Or(branches) => Selector::Or(branches.clone()),
            Selector::Log(prefix) => Selector::Log(prefix.clone()),
        }
    }
}

impl<N> fmt::Debug for Selector<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Children(css) => f.debug_tuple("Children").field(css).finish(),
            Selector::Filter(_) => f.write_str("Filter(..)"),
            Selector::Map(_) => f.write_str("Map(..)"),
            Selector::Watch {
                attribute_filter,
                cond,
            } => f
                .debug_struct("Watch")
                .field("attribute_filter", attribute_filter)
                .field("cond", cond)
                .finish(),
            Selector::Or(branches) => f.debug_tuple("Or").field(branches).finish(),
            Selector::Log(prefix) => f.debug_tuple("Log").field(prefix).finish(),
        }
    }
}

impl<N> From<&str> for Selector<N> {
    fn from(css: &str) -> Self {
        Selector::Children(css.to_string())
    }
}

impl<N> Selector<N> {
    pub fn filter(f: impl Fn(&N) -> bool + 'static) -> Self {
        Selector::Filter(Rc::new(f))
    }

    pub fn map(f: impl Fn(&N) -> Option<N> + 'static) -> Self {
        Selector::Map(Rc::new(f))
    }

    pub fn watch<S: Into<String>>(
        attribute_filter: impl IntoIterator<Item = S>,
        cond: impl Into<String>,
    ) -> Self {
        Selector::Watch {
            attribute_filter: attribute_filter.into_iter().map(Into::into).collect(),
            cond: Cond::Css(cond.into()),
        }
    }

    pub fn watch_fn<S: Into<String>>(
        attribute_filter: impl IntoIterator<Item = S>,
        cond: impl Fn(&N) -> bool + 'static,
    ) -> Self {
        Selector::Watch {
            attribute_filter: attribute_filter.into_iter().map(Into::into).collect(),
            cond: Cond::Fn(Rc::new(cond)),
        }
    }
}

pub type ContextSet<N> = LiveSet<ElementContext<N>>;
pub type Transformer<N> = Rc<dyn Fn(&ContextSet<N>) -> ContextSet<N>>;

/// Compile `selectors` into one transformer. Fails on an empty CSS string, an `Or` without
/// branches, an empty attribute filter, or CSS the host cannot evaluate.
pub fn compile<H: HostTree>(
    host: &Rc<H>,
    selectors: &[Selector<H::Node>],
) -> Result<Transformer<H::Node>> {
    let stages = selectors
        .iter()
        .map(|selector| compile_stage(host, selector))
        .collect::<Result<Vec<_>>>()?;
    Ok(Rc::new(move |input: &ContextSet<H::Node>| {
        stages
            .iter()
            .fold(input.clone(), |set, stage| stage(&set))
    }))
}

fn check_css<H: HostTree>(host: &H, css: &str) -> Result<()> {
    if css.trim().is_empty() {
        return Err(ParserTreeError::InvalidSelector(
            "empty CSS selector".to_string(),
        ));
    }
    host.check_selector(css)
}

fn compile_stage<H: HostTree>(
    host: &Rc<H>,
    selector: &Selector<H::Node>,
) -> Result<Transformer<H::Node>> {
    let stage: Transformer<H::Node> = match selector {
        Selector::Children(css) => {
            check_css(&**host, css)?;
            let host = host.clone();
            let css = css.clone();
            Rc::new(move |input| watch_filtered_children(&host, input, &css))
        }
        Selector::Filter(predicate) => {
            let predicate = predicate.clone();
            Rc::new(move |input| {
                let predicate = predicate.clone();
                filter(input, move |ec| predicate(ec.el()))
            })
        }
        Selector::Map(f) => {
            let f = f.clone();
            Rc::new(move |input| {
                let f = f.clone();
                transduce(input, move |ec| f(ec.el()).map(|el| ec.rewrap(el)))
            })
        }
        Selector::Watch {
            attribute_filter,
            cond,
        } => {
            if attribute_filter.is_empty() {
                return Err(ParserTreeError::InvalidSelector(
                    "watch needs at least one attribute".to_string(),
                ));
            }
            let cond: Predicate<H::Node> = match cond {
                Cond::Css(css) => {
                    check_css(&**host, css)?;
                    let host = host.clone();
                    let css = css.clone();
                    Rc::new(move |node| host.matches(node, &css))
                }
                Cond::Fn(f) => f.clone(),
            };
            let host = host.clone();
            let attribute_filter = attribute_filter.clone();
            Rc::new(move |input| watch_condition(&host, input, &attribute_filter, &cond))
        }
        Selector::Or(branches) => {
            if branches.is_empty() {
                return Err(ParserTreeError::InvalidSelector(
                    "or needs at least one branch".to_string(),
                ));
            }
            let branches = branches
                .iter()
                .map(|branch| compile(host, branch))
                .collect::<Result<Vec<_>>>()?;
            Rc::new(move |input| {
                let outputs = branches.iter().map(|branch| branch(input)).collect();
                merge(input.scheduler(), outputs)
            })
        }
        Selector::Log(prefix) => {
            let prefix = prefix.clone();
            Rc::new(move |input| log_changes(input, &prefix))
        }
    };
    Ok(stage)
}

/// For every context, its element's children that match `css`, each wrapped in a context that
/// shares the parent context's ancestry. A child keeps its context for as long as it stays.
fn watch_filtered_children<H: HostTree>(
    host: &Rc<H>,
    input: &ContextSet<H::Node>,
    css: &str,
) -> ContextSet<H::Node> {
    let host = host.clone();
    let css = css.to_string();
    let scheduler = input.scheduler().clone();
    flat_map_r(input, move |ec| {
        let children = element_children(&host, &scheduler, ec.el());
        let host = host.clone();
        let css = css.clone();
        let ec = ec.clone();
        transduce(&children, move |child| {
            host.matches(child, &css).then(|| ec.rewrap(child.clone()))
        })
    })
}

fn watch_condition<H: HostTree>(
    host: &Rc<H>,
    input: &ContextSet<H::Node>,
    attribute_filter: &[String],
    cond: &Predicate<H::Node>,
) -> ContextSet<H::Node> {
    let host = host.clone();
    let attribute_filter = attribute_filter.to_vec();
    let cond = cond.clone();
    let scheduler = input.scheduler().clone();
    flat_map_r(input, move |ec| {
        let passing = attribute_condition(
            &host,
            &scheduler,
            ec.el(),
            attribute_filter.clone(),
            cond.clone(),
        );
        let ec = ec.clone();
        transduce(&passing, move |_| Some(ec.clone()))
    })
}

fn log_changes<N: Clone + Eq + std::hash::Hash + fmt::Debug + 'static>(
    input: &ContextSet<N>,
    prefix: &str,
) -> ContextSet<N> {
    let read = {
        let input = input.clone();
        move || input.values()
    };
    let input = input.clone();
    let prefix = prefix.to_string();
    let scheduler = input.scheduler().clone();
    LiveSet::with_read(&scheduler, read, move |controller| {
        let prefix = prefix.clone();
        let sub = input.subscribe(Relay::new(
            controller,
            move |controller: &LiveSetController<ElementContext<N>>,
                  change: &Change<ElementContext<N>>| match change {
                Change::Add(ec) => {
                    tracing::info!("{prefix} added {:?}", ec.el());
                    controller.add(ec.clone())
                }
                Change::Remove(ec) => {
                    tracing::info!("{prefix} removed {:?}", ec.el());
                    controller.remove(ec.clone())
                }
            },
        ));
        ListenHandle::from_subscription(sub)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::NodeTagPair,
        host::memory::{MemoryDocument, NodeId},
        liveset::{test_support::sorted, Keepalive, Scheduler},
        tagtree::TagTree,
    };
    use indexmap::{IndexMap, IndexSet};
    use test_log::test;

    struct Fixture {
        doc: Rc<MemoryDocument>,
        scheduler: Scheduler,
        input: ContextSet<NodeId>,
        _tree: TagTree<NodeId>,
    }

    fn fixture(html: &str) -> Fixture {
        let doc = MemoryDocument::new();
        let root = doc.root();
        doc.set_inner_html(root, html).unwrap();
        let scheduler = Scheduler::new();
        let (tree, _ctrl) = TagTree::new(&scheduler, root, IndexMap::new());
        let parents: Vec<NodeTagPair<NodeId>> = vec![NodeTagPair {
            tag: None,
            node: tree.root().clone(),
        }];
        let root_ec = ElementContext::new(root, parents.into());
        let input = LiveSet::constant(&scheduler, IndexSet::from([root_ec]));
        Fixture {
            doc,
            scheduler,
            input,
            _tree: tree,
        }
    }

    fn settle(f: &Fixture) {
        loop {
            let delivered = f.doc.deliver_mutations();
            f.scheduler.flush();
            if delivered == 0 && f.scheduler.is_idle() {
                break;
            }
        }
    }

    fn elements(set: &ContextSet<NodeId>) -> Vec<NodeId> {
        let els: IndexSet<NodeId> = set.values().unwrap().iter().map(|ec| *ec.el()).collect();
        sorted(&els)
    }

    fn run(f: &Fixture, selectors: Vec<Selector<NodeId>>) -> ContextSet<NodeId> {
        let transformer = compile(&f.doc, &selectors).unwrap();
        let out = transformer(&f.input);
        let _ = out.subscribe(Keepalive);
        settle(f);
        out
    }

    #[test]
    fn children_descend_one_level_per_stage() {
        let f = fixture(r#"<body><div class="a"><p>x</p></div><div class="b"></div></body>"#);
        let out = run(&f, vec!["body".into(), "div".into()]);
        let divs = f.doc.query_selector_all(f.doc.root(), "body > div");
        assert_eq!(elements(&out), divs);

        let p = run(&f, vec!["body".into(), ".a".into(), "p".into()]);
        assert_eq!(elements(&p).len(), 1);
        let ancestry = p.values().unwrap()[0].parents();
        assert_eq!(ancestry.len(), 1);
        assert_eq!(ancestry[0].tag, None);
    }

    #[test]
    fn children_follow_mutations() {
        let f = fixture(r#"<body><div class="x"></div></body>"#);
        let out = run(&f, vec!["body".into(), ".x".into()]);
        assert_eq!(elements(&out).len(), 1);
        let before = out.values().unwrap()[0].clone();

        let body = f.doc.query_selector(f.doc.root(), "body").unwrap();
        let extra = f.doc.create_element("div");
        f.doc.set_attribute(extra, "class", "x");
        f.doc.append_child(body, extra);
        settle(&f);
        assert_eq!(elements(&out).len(), 2);

        // Moving a child within one delivery keeps its context.
        let first = *before.el();
        f.doc.append_child(body, first);
        settle(&f);
        assert!(out.values().unwrap().contains(&before));

        f.doc.remove(extra);
        settle(&f);
        assert_eq!(elements(&out), vec![first]);
    }

    #[test]
    fn filter_map_and_log_stages() {
        let f = fixture(
            r#"<body><div id="one"><a href="blah">four</a></div><div id="two"></div></body>"#,
        );
        let doc = f.doc.clone();
        let out = run(
            &f,
            vec![
                "body".into(),
                "div".into(),
                Selector::filter({
                    let doc = doc.clone();
                    move |n: &NodeId| doc.get_attribute(*n, "id").as_deref() == Some("one")
                }),
                Selector::map(move |n: &NodeId| doc.query_selector(*n, r#"a[href="blah"]"#)),
                Selector::Log("link".to_string()),
            ],
        );
        let links = elements(&out);
        assert_eq!(links.len(), 1);
        assert_eq!(f.doc.outer_html(links[0]), r#"<a href="blah">four</a>"#);
    }

    #[test]
    fn or_merges_branches() {
        let f = fixture(
            r#"<body><div class="comment"></div><div class="comment2"><span class="comment2-inner"></span></div></body>"#,
        );
        let out = run(
            &f,
            vec![
                "body".into(),
                Selector::Or(vec![
                    vec![".comment".into()],
                    vec![".comment2".into(), ".comment2-inner".into()],
                ]),
            ],
        );
        let mut expected = vec![
            f.doc.query_selector(f.doc.root(), ".comment").unwrap(),
            f.doc.query_selector(f.doc.root(), ".comment2-inner").unwrap(),
        ];
        expected.sort();
        assert_eq!(elements(&out), expected);
    }

    #[test]
    fn or_keeps_one_context_per_matching_branch() {
        let f = fixture(r#"<body><div class="a b"></div></body>"#);
        let out = run(
            &f,
            vec![
                "body".into(),
                Selector::Or(vec![vec![".a".into()], vec![".b".into()]]),
            ],
        );
        let div = f.doc.query_selector(f.doc.root(), "div").unwrap();
        let contexts = out.values().unwrap();
        assert_eq!(contexts.len(), 2);
        assert!(contexts.iter().all(|ec| *ec.el() == div));
    }

    #[test]
    fn watch_tracks_attribute_condition() {
        let f = fixture(r#"<body><div class="item"></div></body>"#);
        let out = run(
            &f,
            vec![
                "body".into(),
                "div".into(),
                Selector::watch(["class"], ".open"),
            ],
        );
        assert!(elements(&out).is_empty());
        let div = f.doc.query_selector(f.doc.root(), "div").unwrap();
        f.doc.set_attribute(div, "class", "item open");
        settle(&f);
        assert_eq!(elements(&out), vec![div]);
        let ec = out.values().unwrap()[0].clone();
        f.doc.set_attribute(div, "class", "item");
        f.doc.set_attribute(div, "class", "item open");
        settle(&f);
        assert_eq!(out.values().unwrap()[0], ec);
        f.doc.set_attribute(div, "class", "item");
        settle(&f);
        assert!(elements(&out).is_empty());
    }

    #[test]
    fn invalid_shapes_fail_compilation() {
        let f = fixture("");
        let bad: Vec<Vec<Selector<NodeId>>> = vec![
            vec!["".into()],
            vec!["a[".into()],
            vec![Selector::Or(vec![])],
            vec![Selector::watch(Vec::<String>::new(), ".x")],
            vec![Selector::Or(vec![vec![" ".into()]])],
        ];
        for selectors in bad {
            assert!(matches!(
                compile(&f.doc, &selectors),
                Err(ParserTreeError::InvalidSelector(_))
            ));
        }
    }
}
