use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ParserTreeError {
    /// Configuration could not be loaded or is structurally invalid.
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Unknown tag: {0}")]
    UnknownTag(String),
    #[error("Unknown source: {0}")]
    UnknownSource(String),
    #[error("replaceOptions does not support tag changes")]
    TagSchemaChanged,
    #[error("Invalid selector item: {0}")]
    InvalidSelector(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),

    // Consistency diagnostics. These are routed to the error logger and never abort.
    #[error("PageParserTree({tag}) finder found element missed by watcher")]
    FinderFoundElementMissedByWatcher { tag: String },
    #[error("PageParserTree({tag}) watcher found element missed by finder")]
    WatcherFoundElementMissedByFinder { tag: String },
    #[error("PageParserTree({tag}) watcher found element already found by finder")]
    WatcherFoundElementAlreadyFoundByFinder { tag: String },
    #[error("PageParserTree({tag}) watcher received element twice")]
    DuplicateElement { tag: String },

    /// A contract between components was broken.
    #[error("Invariant violated: {0}")]
    Invariant(String),
    #[error("LiveSet has ended")]
    Ended,
    #[error("LiveSet has no synchronous representation while inactive")]
    NotReadable,
}

impl ParserTreeError {
    /// True for the non-fatal reconciliation and registration reports.
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            ParserTreeError::FinderFoundElementMissedByWatcher { .. }
                | ParserTreeError::WatcherFoundElementMissedByFinder { .. }
                | ParserTreeError::WatcherFoundElementAlreadyFoundByFinder { .. }
                | ParserTreeError::DuplicateElement { .. }
        )
    }

    /// The tag a diagnostic was raised for, if any.
    pub fn tag(&self) -> Option<&str> {
        match self {
            ParserTreeError::FinderFoundElementMissedByWatcher { tag }
            | ParserTreeError::WatcherFoundElementMissedByFinder { tag }
            | ParserTreeError::WatcherFoundElementAlreadyFoundByFinder { tag }
            | ParserTreeError::DuplicateElement { tag } => Some(tag),
            ParserTreeError::UnknownTag(tag) => Some(tag),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for ParserTreeError {
    fn from(src: toml::de::Error) -> ParserTreeError {
        ParserTreeError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<io::Error> for ParserTreeError {
    fn from(x: io::Error) -> Self {
        ParserTreeError::Io(format!("IOError: {}: {x}", x.kind()))
    }
}

pub type Result<T> = std::result::Result<T, ParserTreeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn diagnostic_messages_carry_the_tag() {
        let err = ParserTreeError::FinderFoundElementMissedByWatcher {
            tag: "comment".to_string(),
        };
        assert!(err.is_diagnostic());
        assert_eq!(err.tag(), Some("comment"));
        assert_eq!(
            err.to_string(),
            "PageParserTree(comment) finder found element missed by watcher"
        );
        assert!(!ParserTreeError::Ended.is_diagnostic());
    }

    #[test]
    fn schema_change_message() {
        assert_eq!(
            ParserTreeError::TagSchemaChanged.to_string(),
            "replaceOptions does not support tag changes"
        );
    }
}
