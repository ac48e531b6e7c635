//! Pool identifiers.

use std::fmt;

use serde::{Serialize, Serializer};
use ulid::Ulid;

/// Identifier of one pool instance, `pool_{ulid}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(Ulid);

impl PoolId {
    pub const PREFIX: &'static str = "pool";

    /// Creates a new ID with a fresh ULID.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Six lowercase characters from the random part of the ULID.
    ///
    /// Used to keep namespaces of pools started in the same second apart.
    pub fn suffix(&self) -> String {
        let s = self.0.to_string().to_ascii_lowercase();
        s[s.len() - 6..].to_string()
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl Serialize for PoolId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}
