//! Identifiers of organizations and projects.
//!
//! Both are wrappers over `u64` and should be considered implementation details, as their
//! representation can change in the future.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised if a project or organization ID cannot be parsed from a string.
#[derive(Debug, Error, Eq, Ord, PartialEq, PartialOrd)]
pub enum ParseIdError {
    /// Raised if the value is not an integer in the supported range.
    #[error("invalid value for id")]
    InvalidValue,
    /// Raised if an empty value is parsed.
    #[error("empty or missing id")]
    EmptyValue,
}

macro_rules! impl_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(
            Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Deserialize, Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from its numeric value.
            #[inline]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the numeric value of this ID.
            #[inline]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.value())
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, ParseIdError> {
                if s.is_empty() {
                    return Err(ParseIdError::EmptyValue);
                }

                match s.parse::<u64>() {
                    Ok(val) => Ok(Self::new(val)),
                    Err(_) => Err(ParseIdError::InvalidValue),
                }
            }
        }
    };
}

impl_id!(ProjectId, "The unique identifier of a Sentry project.");
impl_id!(
    OrganizationId,
    "The unique identifier of a Sentry organization. All metric names and tags are indexed per organization."
);
