//! Basic types shared by all crates of the metrics query planner.
//!
//! - [`metrics`] contains metric resource identifiers, units, use cases and storage entities.
//! - [`project`] contains the organization and project identifiers every query is scoped by.

#![warn(missing_docs)]

pub mod metrics;
pub mod project;
