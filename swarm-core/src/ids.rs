//! Tracker-assigned identifiers. Allocated from per-family counters starting at 1; never reused.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! tracker_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

tracker_id!(
    /// Peer identifier, assigned on registration.
    PeerId,
    "peer#"
);
tracker_id!(
    /// Group identifier, assigned when a logged-in peer creates a group.
    GroupId,
    "group#"
);
tracker_id!(
    /// File identifier, shared by every peer that announces the same name and size.
    FileId,
    "file#"
);

/// Monotonic id allocator for one record family.
#[derive(Debug)]
pub(crate) struct IdCounter(u64);

impl IdCounter {
    pub(crate) fn new() -> Self {
        IdCounter(1)
    }

    pub(crate) fn next(&mut self) -> u64 {
        let id = self.0;
        self.0 += 1;
        id
    }
}
