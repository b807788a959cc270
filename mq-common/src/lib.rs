//! Common functionality shared by the metrics query planner crates.
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod time;
