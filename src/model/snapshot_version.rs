use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::model::Timestamp;

/// Logical clock reported by the remote authority. Versions of a document
/// never regress except when an entry is explicitly reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1_000) as i32,
        ))
    }

    pub fn to_micros(&self) -> i64 {
        self.0.seconds * 1_000_000 + i64::from(self.0.nanos / 1_000)
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({}.{:09})", self.0.seconds, self.0.nanos)
    }
}
