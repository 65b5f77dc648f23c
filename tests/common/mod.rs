//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::{cell::RefCell, rc::Rc};

use page_parser_tree::{
    config::{PageParserTreeOptions, TagOptions, Watcher},
    host::memory::{MemoryDocument, NodeId},
    liveset::Scheduler,
    selector::Selector,
    tagtree::TagTreeNode,
    ParserTreeError,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times. Later calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A page with a top nav, a sidebar and a three level comment thread. Comments come in two
/// shapes: `.comment` and `.comment2 > .comment2-inner`.
#[allow(dead_code)]
pub const FIXTURE: &str = r#"
<body>
  <nav>
    <div>
      <a>one</a>
      <a>two</a>
    </div>
    <div>
      <a>three</a>
    </div>
    <div>
      <div>
        <div>
          <a href="blah">four</a>
        </div>
      </div>
    </div>
  </nav>
  <div class="page-outer">
    <div>
      <article>blah</article>
    </div>
    <div class="article-comments">
      <div class="comment">
        <div class="body">foo bar</div>
        <div class="replies">
          <div class="comment">
            <div class="body">FIRST</div>
            <div class="replies"></div>
          </div>
          <div class="comment2">
            <div class="comment2-inner">
              <div class="body">SECOND</div>
              <div class="replies">
                <div class="comment">
                  <div class="body">reply to second</div>
                  <div class="replies">
                    <div class="comment">
                      <div class="body">reply to you</div>
                      <div class="replies"></div>
                    </div>
                  </div>
                </div>
              </div>
            </div>
          </div>
          <div class="comment2">
            <div class="comment2-inner">
              <div class="body">THIRD</div>
              <div class="replies"></div>
            </div>
          </div>
        </div>
      </div>
      <div class="comment">
        <div class="body">bar foo</div>
        <div class="replies"></div>
      </div>
    </div>
  </div>
  <div class="page-sidebar">
    <div>thing</div>
    <div>bar</div>
  </div>
</body>
"#;

/// A fresh document holding [`FIXTURE`] under its root.
#[allow(dead_code)]
pub fn fixture_document() -> (Rc<MemoryDocument>, NodeId) {
    let doc = MemoryDocument::new();
    let root = doc.root();
    doc.set_inner_html(root, FIXTURE).unwrap();
    (doc, root)
}

#[allow(dead_code)]
pub fn page_tags() -> PageParserTreeOptions<NodeId> {
    PageParserTreeOptions::new()
        .tag("topnav", TagOptions::default())
        .tag("navLink", TagOptions::default())
        .tag("navBlahLink", TagOptions::default())
        .tag("sidebarItem", TagOptions::default())
        .tag("commentSection", TagOptions::default())
        .tag("comment", TagOptions::owned_by(["comment"]))
        .tag("replySection", TagOptions::owned_by(["comment"]))
}

#[allow(dead_code)]
pub fn comment_watcher(selectors: Vec<Selector<NodeId>>) -> Watcher<NodeId> {
    Watcher::new("comment", selectors)
        .from_tag("commentSection")
        .from_tag("replySection")
}

/// Both comment shapes.
#[allow(dead_code)]
pub fn either_comment() -> Selector<NodeId> {
    Selector::Or(vec![
        vec![".comment".into()],
        vec![".comment2".into(), ".comment2-inner".into()],
    ])
}

/// Every watcher of the page, with `comment` selected by `comment`.
#[allow(dead_code)]
pub fn page_options(
    doc: &Rc<MemoryDocument>,
    comment: Selector<NodeId>,
) -> PageParserTreeOptions<NodeId> {
    let lookup = doc.clone();
    page_tags()
        .watcher(Watcher::new("topnav", vec!["body".into(), "nav".into()]).from_root())
        .watcher(Watcher::new("navLink", vec!["div".into(), "a".into()]).from_tag("topnav"))
        .watcher(
            Watcher::new(
                "navBlahLink",
                vec![
                    "div".into(),
                    Selector::map(move |el: &NodeId| {
                        lookup.query_selector(*el, r#"a[href="blah"]"#)
                    }),
                ],
            )
            .from_tag("topnav"),
        )
        .watcher(
            Watcher::new(
                "sidebarItem",
                vec!["body".into(), ".page-sidebar".into(), "div".into()],
            )
            .from_root(),
        )
        .watcher(
            Watcher::new(
                "commentSection",
                vec!["body".into(), ".page-outer".into(), ".article-comments".into()],
            )
            .from_root(),
        )
        .watcher(comment_watcher(vec![comment]))
        .watcher(Watcher::new("replySection", vec![".replies".into()]).from_tag("comment"))
}

/// Deliver host mutations and flush until both sides are quiet.
#[allow(dead_code)]
pub fn settle(doc: &MemoryDocument, scheduler: &Scheduler) {
    loop {
        let delivered = doc.deliver_mutations();
        scheduler.flush();
        if delivered == 0 && !doc.has_pending_mutations() && scheduler.is_idle() {
            break;
        }
    }
}

/// Text of the first `.body` under a comment node.
#[allow(dead_code)]
pub fn body_text(doc: &MemoryDocument, node: &TagTreeNode<NodeId>) -> String {
    doc.query_selector(*node.get_value(), ".body")
        .map(|body| doc.text_content(body))
        .unwrap_or_default()
}

#[allow(dead_code)]
pub fn sorted_bodies<'a>(
    doc: &MemoryDocument,
    nodes: impl IntoIterator<Item = &'a TagTreeNode<NodeId>>,
) -> Vec<String> {
    let mut out: Vec<String> = nodes.into_iter().map(|n| body_text(doc, n)).collect();
    out.sort();
    out
}

#[allow(dead_code)]
pub type Reports = Rc<RefCell<Vec<(ParserTreeError, Option<NodeId>)>>>;

/// Route diagnostics into a shared list.
#[allow(dead_code)]
pub fn record_errors(
    options: PageParserTreeOptions<NodeId>,
) -> (PageParserTreeOptions<NodeId>, Reports) {
    let reports: Reports = Rc::new(RefCell::new(Vec::new()));
    let sink = reports.clone();
    let options = options.log_error(move |err: &ParserTreeError, el: Option<&NodeId>| {
        sink.borrow_mut().push((err.clone(), el.copied()))
    });
    (options, reports)
}
