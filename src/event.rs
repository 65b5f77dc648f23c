use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// One entry of a change batch delivered to a [`crate::liveset::Observer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<T> {
    Add(T),
    Remove(T),
}

impl<T> Change<T> {
    pub fn value(&self) -> &T {
        match self {
            Change::Add(v) | Change::Remove(v) => v,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Change::Add(v) | Change::Remove(v) => v,
        }
    }

    pub fn is_add(&self) -> bool {
        matches!(self, Change::Add(_))
    }

    pub fn is_remove(&self) -> bool {
        matches!(self, Change::Remove(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Change<U> {
        match self {
            Change::Add(v) => Change::Add(f(v)),
            Change::Remove(v) => Change::Remove(f(v)),
        }
    }
}

impl<T: Display> Display for Change<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::Add(v) => write!(f, "+{v}"),
            Change::Remove(v) => write!(f, "-{v}"),
        }
    }
}

/// Which discovery path put an element into a reconciled tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Origin {
    /// Reported by a watcher pipeline, driven by host change notifications.
    #[default]
    Watcher,
    /// Reported by a periodic finder scan. The finder keeps ownership of the element until a
    /// later scan stops reporting it.
    Finder,
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Watcher => write!(f, "watcher"),
            Origin::Finder => write!(f, "finder"),
        }
    }
}
