use std::{rc::Rc, time::Duration};

use page_parser_tree::{
    config::{Finder, Interval, PageParserTreeOptions, TagOptions, Watcher},
    host::memory::{MemoryDocument, NodeId},
    selector::Selector,
    timer::{ManualTimers, TokioTimers},
    PageParserTree, ParserTreeError,
};
use test_log::test;

mod common;
use common::*;

const FLAT_THREAD: &str = r#"
<body>
  <div class="article-comments">
    <div class="comment"><div class="body">FIRST</div></div>
    <div class="comment2"><div class="comment2-inner"><div class="body">SECOND</div></div></div>
    <div class="comment2"><div class="comment2-inner"><div class="body">THIRD</div></div></div>
  </div>
</body>
"#;

fn comment_finder(doc: &Rc<MemoryDocument>) -> Finder<NodeId> {
    let doc = doc.clone();
    Finder::new(move |root: &NodeId| doc.query_selector_all(*root, ".comment, .comment2-inner"))
        .interval(Interval::Fixed(Duration::from_millis(5)))
}

fn thread_options(
    doc: &Rc<MemoryDocument>,
    timers: &ManualTimers,
) -> PageParserTreeOptions<NodeId> {
    PageParserTreeOptions::new()
        .tag("commentSection", TagOptions::default())
        .tag("comment", TagOptions::owned_by(["comment"]))
        .watcher(
            Watcher::new("commentSection", vec!["body".into(), ".article-comments".into()])
                .from_root(),
        )
        .watcher(Watcher::new("comment", vec![".comment".into()]).from_tag("commentSection"))
        .finder("comment", comment_finder(doc))
        .timers(Rc::new(timers.clone()))
}

fn missed_by_watcher(reports: &Reports) -> Vec<NodeId> {
    reports
        .borrow()
        .iter()
        .filter(|(err, _)| matches!(err, ParserTreeError::FinderFoundElementMissedByWatcher { .. }))
        .filter_map(|(_, el)| *el)
        .collect()
}

#[test]
fn finder_reports_each_missed_element_once() {
    let doc = MemoryDocument::new();
    let root = doc.root();
    doc.set_inner_html(root, FLAT_THREAD).unwrap();
    let timers = ManualTimers::new();
    let (options, reports) = record_errors(thread_options(&doc, &timers));
    let parser = PageParserTree::new(doc.clone(), root, options).unwrap();
    let comments = parser.get_all_by_tag("comment").unwrap();
    assert_eq!(comments.values().unwrap().len(), 1);

    for _ in 0..4 {
        timers.advance(Duration::from_millis(5));
    }
    let mut missed = missed_by_watcher(&reports);
    missed.sort();
    let mut expected = doc.query_selector_all(root, ".comment2-inner");
    expected.sort();
    assert_eq!(missed, expected);
    assert_eq!(reports.borrow().len(), 2);
    assert_eq!(
        sorted_bodies(&doc, comments.values().unwrap().iter()),
        vec!["FIRST", "SECOND", "THIRD"]
    );
}

#[test]
fn finder_only_elements_leave_when_no_longer_found() {
    let doc = MemoryDocument::new();
    let root = doc.root();
    doc.set_inner_html(root, FLAT_THREAD).unwrap();
    let timers = ManualTimers::new();
    let (options, reports) = record_errors(thread_options(&doc, &timers));
    let parser = PageParserTree::new(doc.clone(), root, options).unwrap();
    let comments = parser.get_all_by_tag("comment").unwrap();
    timers.advance(Duration::from_millis(5));
    assert_eq!(comments.values().unwrap().len(), 3);

    let third = doc.query_selector_all(root, ".comment2").pop().unwrap();
    doc.remove(third);
    settle(&doc, parser.scheduler());
    assert_eq!(comments.values().unwrap().len(), 3);
    timers.advance(Duration::from_millis(5));
    assert_eq!(
        sorted_bodies(&doc, comments.values().unwrap().iter()),
        vec!["FIRST", "SECOND"]
    );
    assert_eq!(reports.borrow().len(), 2);
}

#[test]
fn consistent_finder_stays_quiet_on_the_full_page() {
    let (doc, root) = fixture_document();
    let timers = ManualTimers::new();
    let options = page_options(&doc, either_comment())
        .finder("comment", comment_finder(&doc))
        .timers(Rc::new(timers.clone()));
    let (options, reports) = record_errors(options);
    let mut parser = PageParserTree::new(doc.clone(), root, options).unwrap();
    timers.advance(Duration::from_millis(20));
    assert!(reports.borrow().is_empty());
    assert_eq!(parser.get_all_by_tag("comment").unwrap().values().unwrap().len(), 7);

    // The watcher sees this one before the next scan.
    let section = doc.query_selector(root, ".article-comments").unwrap();
    let extra = doc.create_element("div");
    doc.set_attribute(extra, "class", "comment");
    doc.append_child(section, extra);
    settle(&doc, parser.scheduler());
    timers.advance(Duration::from_millis(5));
    assert!(reports.borrow().is_empty());
    assert_eq!(parser.get_all_by_tag("comment").unwrap().values().unwrap().len(), 8);

    parser.dump();
    assert_eq!(timers.pending(), 0);
}

#[test]
fn elements_the_finder_cannot_see_are_reported_once() {
    let doc = MemoryDocument::new();
    let root = doc.root();
    doc.set_inner_html(root, FLAT_THREAD).unwrap();
    let timers = ManualTimers::new();
    let blind = Finder::new(|_: &NodeId| Vec::new()).interval(Interval::Fixed(Duration::from_millis(5)));
    let options = thread_options(&doc, &timers).finder("comment", blind);
    let (options, reports) = record_errors(options);
    let parser = PageParserTree::new(doc.clone(), root, options).unwrap();
    for _ in 0..3 {
        timers.advance(Duration::from_millis(5));
    }
    let first = doc.query_selector(root, ".comment").unwrap();
    assert_eq!(
        *reports.borrow(),
        vec![(
            ParserTreeError::WatcherFoundElementMissedByFinder {
                tag: "comment".to_string()
            },
            Some(first)
        )]
    );
    assert_eq!(parser.get_all_by_tag("comment").unwrap().values().unwrap().len(), 1);
}

#[test]
fn or_branches_on_one_element_are_duplicates_not_finder_collisions() {
    let doc = MemoryDocument::new();
    let root = doc.root();
    doc.set_inner_html(root, r#"<body><div class="a b"></div></body>"#)
        .unwrap();
    let timers = ManualTimers::new();
    let lookup = doc.clone();
    let options = PageParserTreeOptions::new()
        .tag("thing", TagOptions::default())
        .watcher(
            Watcher::new(
                "thing",
                vec![
                    "body".into(),
                    Selector::Or(vec![
                        vec!["div".into(), Selector::watch(["class"], ".a")],
                        vec!["div".into(), Selector::watch(["class"], ".b")],
                    ]),
                ],
            )
            .from_root(),
        )
        .finder(
            "thing",
            Finder::new(move |root: &NodeId| lookup.query_selector_all(*root, ".a, .b"))
                .interval(Interval::Fixed(Duration::from_millis(5))),
        )
        .timers(Rc::new(timers.clone()));
    let (options, reports) = record_errors(options);
    let parser = PageParserTree::new(doc.clone(), root, options).unwrap();
    let things = parser.get_all_by_tag("thing").unwrap();
    let div = doc.query_selector(root, "div").unwrap();
    let duplicate = (
        ParserTreeError::DuplicateElement {
            tag: "thing".to_string(),
        },
        Some(div),
    );
    assert_eq!(things.values().unwrap().len(), 1);
    assert_eq!(*reports.borrow(), vec![duplicate.clone()]);

    // Branch `.a` retracts; `.b` still holds the element.
    doc.set_attribute(div, "class", "b");
    settle(&doc, parser.scheduler());
    assert_eq!(things.values().unwrap().len(), 1);
    timers.advance(Duration::from_millis(5));
    assert_eq!(things.values().unwrap().len(), 1);
    assert_eq!(*reports.borrow(), vec![duplicate.clone()]);

    doc.set_attribute(div, "class", "");
    settle(&doc, parser.scheduler());
    assert!(things.values().unwrap().is_empty());
    timers.advance(Duration::from_millis(5));
    assert!(things.values().unwrap().is_empty());
    assert_eq!(*reports.borrow(), vec![duplicate]);
}

#[test]
fn finders_need_a_timer_driver() {
    let doc = MemoryDocument::new();
    let root = doc.root();
    doc.set_inner_html(root, FLAT_THREAD).unwrap();
    let options = PageParserTreeOptions::new()
        .tag("comment", TagOptions::default())
        .finder("comment", comment_finder(&doc));
    assert!(matches!(
        PageParserTree::new(doc.clone(), root, options),
        Err(ParserTreeError::Config(_))
    ));
}

#[test(tokio::test(start_paused = true))]
async fn tokio_timers_drive_the_finder() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let doc = MemoryDocument::new();
            let root = doc.root();
            doc.set_inner_html(root, FLAT_THREAD).unwrap();
            let options = PageParserTreeOptions::new()
                .tag("comment", TagOptions::default())
                .finder("comment", comment_finder(&doc))
                .timers(Rc::new(TokioTimers::new()));
            let mut parser = PageParserTree::new(doc.clone(), root, options).unwrap();
            let comments = parser.get_all_by_tag("comment").unwrap();
            assert!(comments.values().unwrap().is_empty());

            tokio::time::sleep(Duration::from_millis(12)).await;
            assert_eq!(comments.values().unwrap().len(), 3);
            parser.dump();
            assert!(comments.is_ended());
        })
        .await;
}
