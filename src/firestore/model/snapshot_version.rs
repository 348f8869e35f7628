use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or of a global watch snapshot.
///
/// [`SnapshotVersion::min`] stands for "no version known".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn from_micros(micros: i64) -> Self {
        let seconds = micros.div_euclid(1_000_000);
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as i32;
        Self(Timestamp::new(seconds, nanos))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn to_micros(&self) -> i64 {
        self.0.to_micros()
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({},{})", self.0.seconds, self.0.nanos)
    }
}
