//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identifier of a queued job, assigned by the persistence layer.
///
/// Ids are monotonically increasing, so ordering by id is enqueue order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

/// Identifier of the external object a job operates on (e.g. a media attachment).
///
/// Always positive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct EntityId(i64);

impl JobId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }
}

impl EntityId {
    /// Returns `None` for zero and negative ids.
    pub fn new(raw: i64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }
}

impl TryFrom<i64> for EntityId {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
            .ok_or_else(|| CoreError::invalid_id(format!("EntityId: {value} is not positive")))
    }
}

macro_rules! impl_int_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = i64::from_str(s.trim())
                    .map_err(|e| CoreError::invalid_id(format!("{}: {}", $name, e)))?;
                <$t>::try_from(raw)
            }
        }
    };
}

impl TryFrom<i64> for JobId {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Ok(Self(value))
    }
}

impl_int_newtype!(JobId, "JobId");
impl_int_newtype!(EntityId, "EntityId");
