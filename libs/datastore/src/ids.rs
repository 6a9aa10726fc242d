//! Typed IDs for the three entity kinds.
//!
//! IDs are prefixed ULIDs (`tgt_…`, `job_…`, `rnr_…`): time-ordered, so
//! iterating a keyed collection yields creation order, and unambiguous in
//! logs. A `RunnerId` can be derived from the `JobId` that caused the
//! creation, which keys the one-runner-per-job invariant.

use ulid::Ulid;

/// Errors from parsing a typed ID.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("id is empty")]
    Empty,

    #[error("id is missing the `_` separator")]
    MissingSeparator,

    #[error("invalid id prefix: expected {expected}, got {actual}")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ulid: {0}")]
    InvalidUlid(String),
}

macro_rules! entity_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// Generate a fresh ID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Wrap an existing ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// The underlying ULID.
            #[must_use]
            pub const fn ulid(&self) -> Ulid {
                self.0
            }

            /// Parse from the `{prefix}_{ulid}` string form.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                if s.is_empty() {
                    return Err(IdError::Empty);
                }
                let Some((prefix, ulid_str)) = s.split_once('_') else {
                    return Err(IdError::MissingSeparator);
                };
                if prefix != Self::PREFIX {
                    return Err(IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }
                let ulid = ulid_str
                    .parse::<Ulid>()
                    .map_err(|e| IdError::InvalidUlid(e.to_string()))?;
                Ok(Self(ulid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

entity_id!(TargetId, "tgt");
entity_id!(JobId, "job");
entity_id!(RunnerId, "rnr");

impl RunnerId {
    /// The runner created for a job carries the job's ULID, so at most one
    /// runner can ever exist per job id.
    #[must_use]
    pub const fn from_job(job: JobId) -> Self {
        Self::from_ulid(job.ulid())
    }
}
