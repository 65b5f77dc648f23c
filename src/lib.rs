//! # page-parser-tree
//!
//! Incrementally classify the nodes of a live, externally mutated tree (a web page's DOM, or
//! anything implementing [`host::HostTree`]) into an ownership tree of tagged nodes.
//!
//! ## Overview
//!
//! Consumers declare *tags* ("comment", "reply section", ...) and how to find them:
//!
//! - **Watchers** are selector pipelines ([`selector::Selector`]) run from the root or from the
//!   elements of another tag. They follow host change notifications, so the tree updates as the
//!   page changes.
//! - **Finders** are periodic full scans that backstop the watchers. Disagreements between the
//!   two are reported through a diagnostic hook.
//!
//! Every accepted element becomes a [`tagtree::TagTreeNode`] owned by its nearest ancestor whose
//! tag is allowed to own it. All results are exposed as [`liveset::LiveSet`]s: sets that can be
//! read synchronously and subscribed to for batches of changes.
//!
//! ## Architecture
//!
//! - **[`liveset`]**: the reactive set primitive, its [`liveset::Scheduler`] and operators
//! - **[`tagtree`]**: the ownership tree
//! - **[`selector`]**: the selector pipeline compiler
//! - **[`watch`]**: watcher/finder reconciliation
//! - **[`parser`]**: [`parser::PageParserTree`], which wires everything together
//! - **[`host`]**: the host tree abstraction and an in-memory document
//! - **[`config`]**, **[`timer`]**, **[`error`]**, **[`event`]**: supporting types
//!
//! ## Quick Start
//!
//! ```rust
//! use page_parser_tree::{
//!     config::{PageParserTreeOptions, TagOptions, Watcher},
//!     host::memory::MemoryDocument,
//!     parser::PageParserTree,
//! };
//!
//! # fn main() -> Result<(), page_parser_tree::ParserTreeError> {
//! let doc = MemoryDocument::new();
//! let root = doc.body().unwrap();
//! doc.set_inner_html(root, r#"<ul><li>one</li><li>two</li></ul>"#)?;
//!
//! let options = PageParserTreeOptions::new()
//!     .tag("list", TagOptions::default())
//!     .tag("item", TagOptions::owned_by(["list"]))
//!     .watcher(Watcher::new("list", vec!["ul".into()]).from_root())
//!     .watcher(Watcher::new("item", vec!["li".into()]).from_tag("list"));
//! let parser = PageParserTree::new(doc.clone(), root, options)?;
//!
//! let items = parser.get_all_by_tag("item")?;
//! assert_eq!(items.values()?.len(), 2);
//!
//! // Host mutations are picked up once they are delivered.
//! let ul = doc.query_selector(root, "ul").unwrap();
//! let li = doc.create_element("li");
//! doc.append_child(ul, li);
//! doc.deliver_mutations();
//! parser.scheduler().flush();
//! assert_eq!(items.values()?.len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! Everything runs on one thread. Types are `Rc`-based and not `Send`. Finders need a timer
//! driver passed through [`config::PageParserTreeOptions::timers`]: [`timer::ManualTimers`] for a
//! virtual clock, or [`timer::TokioTimers`] from inside a [`tokio::task::LocalSet`].
//!
//! Diagnostics go to `log_error`. Without one they are logged as `tracing::error!` events and
//! parsing carries on; nothing is rethrown.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod host;
pub mod liveset;
pub mod parser;
pub mod selector;
pub mod tagtree;
pub mod timer;
pub mod watch;

pub use error::*;
pub use parser::PageParserTree;
