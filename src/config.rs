//! Parser configuration: the tag schema, watcher pipelines, finders and runtime hooks.
//!
//! Options are built programmatically, or the declarative subset (tags and CSS-only watchers) is
//! loaded from TOML:
//!
//! ```toml
//! [tags.comment]
//! owned_by = ["comment"]
//!
//! [[watchers]]
//! sources = [":root"]
//! tag = "comment"
//! selectors = ["body", { or = [[".comment"], [".comment2", ".comment2-inner"]] }]
//! ```

use std::{fmt, fs::read_to_string, path::Path, rc::Rc, time::Duration};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ParserTreeError, Result},
    selector::{Cond, Selector},
    timer::Timers,
};

/// Source name standing for the document root in TOML watchers.
pub const ROOT_SOURCE: &str = ":root";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOptions {
    /// Tags whose nodes may own nodes of this tag. Nodes with no such ancestor belong to the
    /// root.
    #[serde(default)]
    pub owned_by: Vec<String>,
}

impl TagOptions {
    pub fn owned_by<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TagOptions {
            owned_by: tags.into_iter().map(Into::into).collect(),
        }
    }
}

/// A pipeline that feeds `tag` from the reconciled sets of `sources`. A `None` source is the
/// root.
pub struct Watcher<N> {
    pub sources: Vec<Option<String>>,
    pub tag: String,
    pub selectors: Vec<Selector<N>>,
}

impl<N> Clone for Watcher<N> {
    fn clone(&self) -> Self {
        Watcher {
            sources: self.sources.clone(),
            tag: self.tag.clone(),
            selectors: self.selectors.clone(),
        }
    }
}

impl<N> fmt::Debug for Watcher<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("sources", &self.sources)
            .field("tag", &self.tag)
            .field("selectors", &self.selectors)
            .finish()
    }
}

impl<N> Watcher<N> {
    pub fn new(tag: impl Into<String>, selectors: Vec<Selector<N>>) -> Self {
        Watcher {
            sources: Vec::new(),
            tag: tag.into(),
            selectors,
        }
    }

    pub fn from_root(mut self) -> Self {
        self.sources.push(None);
        self
    }

    pub fn from_tag(mut self, source: impl Into<String>) -> Self {
        self.sources.push(Some(source.into()));
        self
    }
}

pub type IntervalFn = Rc<dyn Fn(usize, Duration) -> Option<Duration>>;

/// How long a finder waits before each scan.
#[derive(Clone, Default)]
pub enum Interval {
    /// 5 to 6 seconds, drawn anew before every scan.
    #[default]
    Randomized,
    Fixed(Duration),
    /// Called with the number of elements currently found and the time since the finder
    /// started. `None` stops scanning.
    Dynamic(IntervalFn),
    Never,
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Randomized => f.write_str("Randomized"),
            Interval::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Interval::Dynamic(_) => f.write_str("Dynamic(..)"),
            Interval::Never => f.write_str("Never"),
        }
    }
}

impl Interval {
    pub fn dynamic(f: impl Fn(usize, Duration) -> Option<Duration> + 'static) -> Self {
        Interval::Dynamic(Rc::new(f))
    }

    pub fn next_delay(&self, element_count: usize, elapsed: Duration) -> Option<Duration> {
        match self {
            Interval::Randomized => Some(Duration::from_millis(5000) + jitter()),
            Interval::Fixed(delay) => Some(*delay),
            Interval::Dynamic(f) => f(element_count, elapsed),
            Interval::Never => None,
        }
    }
}

fn jitter() -> Duration {
    let mut buf = [0u8; 2];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => Duration::from_millis(u64::from(u16::from_le_bytes(buf)) % 1000),
        Err(err) => {
            tracing::warn!("[Finder] no entropy for interval jitter: {err}");
            Duration::from_millis(500)
        }
    }
}

pub type FindFn<N> = Rc<dyn Fn(&N) -> Vec<N>>;

/// A periodic full scan from the root, used as a backstop for watchers.
pub struct Finder<N> {
    pub find: FindFn<N>,
    pub interval: Interval,
}

impl<N> Clone for Finder<N> {
    fn clone(&self) -> Self {
        Finder {
            find: self.find.clone(),
            interval: self.interval.clone(),
        }
    }
}

impl<N> fmt::Debug for Finder<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finder")
            .field("interval", &self.interval)
            .finish()
    }
}

impl<N> Finder<N> {
    pub fn new(find: impl Fn(&N) -> Vec<N> + 'static) -> Self {
        Finder {
            find: Rc::new(find),
            interval: Interval::default(),
        }
    }

    pub fn interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }
}

pub type LogErrorFn<N> = Rc<dyn Fn(&ParserTreeError, Option<&N>)>;

pub struct PageParserTreeOptions<N> {
    pub tags: IndexMap<String, TagOptions>,
    pub watchers: Vec<Watcher<N>>,
    pub finders: IndexMap<String, Finder<N>>,
    pub log_error: Option<LogErrorFn<N>>,
    pub timers: Option<Rc<dyn Timers>>,
}

impl<N> Default for PageParserTreeOptions<N> {
    fn default() -> Self {
        PageParserTreeOptions {
            tags: IndexMap::new(),
            watchers: Vec::new(),
            finders: IndexMap::new(),
            log_error: None,
            timers: None,
        }
    }
}

impl<N> Clone for PageParserTreeOptions<N> {
    fn clone(&self) -> Self {
        PageParserTreeOptions {
            tags: self.tags.clone(),
            watchers: self.watchers.clone(),
            finders: self.finders.clone(),
            log_error: self.log_error.clone(),
            timers: self.timers.clone(),
        }
    }
}

impl<N> fmt::Debug for PageParserTreeOptions<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageParserTreeOptions")
            .field("tags", &self.tags)
            .field("watchers", &self.watchers)
            .field("finders", &self.finders)
            .field("log_error", &self.log_error.is_some())
            .field("timers", &self.timers.is_some())
            .finish()
    }
}

impl<N> PageParserTreeOptions<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, name: impl Into<String>, options: TagOptions) -> Self {
        self.tags.insert(name.into(), options);
        self
    }

    pub fn watcher(mut self, watcher: Watcher<N>) -> Self {
        self.watchers.push(watcher);
        self
    }

    pub fn finder(mut self, tag: impl Into<String>, finder: Finder<N>) -> Self {
        self.finders.insert(tag.into(), finder);
        self
    }

    /// Receive every diagnostic together with the element it concerns. Diagnostics never
    /// interrupt parsing. Without a handler they are logged through `tracing::error!` rather
    /// than raised.
    pub fn log_error(mut self, f: impl Fn(&ParserTreeError, Option<&N>) + 'static) -> Self {
        self.log_error = Some(Rc::new(f));
        self
    }

    pub fn timers(mut self, timers: Rc<dyn Timers>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Every tag named by an `owned_by` list, a watcher or a finder must be declared, and
    /// finders need a timer driver.
    pub fn validate(&self) -> Result<()> {
        for (tag, options) in self.tags.iter() {
            if let Some(owner) = options.owned_by.iter().find(|t| !self.tags.contains_key(*t)) {
                return Err(ParserTreeError::UnknownTag(format!(
                    "{owner} (in owned_by of {tag})"
                )));
            }
        }
        for watcher in self.watchers.iter() {
            if !self.tags.contains_key(&watcher.tag) {
                return Err(ParserTreeError::UnknownTag(watcher.tag.clone()));
            }
            for source in watcher.sources.iter().flatten() {
                if !self.tags.contains_key(source) {
                    return Err(ParserTreeError::UnknownSource(source.clone()));
                }
            }
        }
        if let Some(tag) = self.finders.keys().find(|t| !self.tags.contains_key(*t)) {
            return Err(ParserTreeError::UnknownTag(tag.clone()));
        }
        if let (Some(tag), None) = (self.finders.keys().next(), self.timers.as_ref()) {
            return Err(ParserTreeError::Config(format!(
                "finder for {tag} needs a timer driver: set timers (TokioTimers inside a \
                 LocalSet, ManualTimers, or another Timers)"
            )));
        }
        Ok(())
    }

    /// True when `other` declares the same tags with the same owners, ignoring order.
    pub fn same_schema(&self, other: &PageParserTreeOptions<N>) -> bool {
        self.tags.len() == other.tags.len()
            && self.tags.iter().all(|(tag, options)| {
                other.tags.get(tag).is_some_and(|theirs| {
                    let ours: IndexSet<&String> = options.owned_by.iter().collect();
                    let theirs: IndexSet<&String> = theirs.owned_by.iter().collect();
                    ours == theirs
                })
            })
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let raw: RawOptions = toml::from_str(source)?;
        let options = raw.into_options();
        options.validate()?;
        Ok(options)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        tracing::debug!("[Config] Reading {:?}", path.as_ref());
        let content = read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOptions {
    #[serde(default)]
    tags: IndexMap<String, TagOptions>,
    #[serde(default)]
    watchers: Vec<RawWatcher>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWatcher {
    sources: Vec<String>,
    tag: String,
    #[serde(default)]
    selectors: Vec<RawSelector>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSelector {
    Css(String),
    Or { or: Vec<Vec<RawSelector>> },
    Watch { watch: RawWatch },
    Log { log: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWatch {
    attribute_filter: Vec<String>,
    cond: String,
}

impl RawOptions {
    fn into_options<N>(self) -> PageParserTreeOptions<N> {
        let watchers = self
            .watchers
            .into_iter()
            .map(|w| Watcher {
                sources: w
                    .sources
                    .into_iter()
                    .map(|s| (s != ROOT_SOURCE).then_some(s))
                    .collect(),
                tag: w.tag,
                selectors: w.selectors.into_iter().map(RawSelector::into_selector).collect(),
            })
            .collect();
        PageParserTreeOptions {
            tags: self.tags,
            watchers,
            ..PageParserTreeOptions::default()
        }
    }
}

impl RawSelector {
    fn into_selector<N>(self) -> Selector<N> {
        match self {
            RawSelector::Css(css) => Selector::Children(css),
            RawSelector::Or { or } => Selector::Or(
                or.into_iter()
                    .map(|branch| branch.into_iter().map(RawSelector::into_selector).collect())
                    .collect(),
            ),
            RawSelector::Watch { watch } => Selector::Watch {
                attribute_filter: watch.attribute_filter,
                cond: Cond::Css(watch.cond),
            },
            RawSelector::Log { log } => Selector::Log(log),
        }
    }
}
