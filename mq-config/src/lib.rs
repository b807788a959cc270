//! Configuration for the metrics query planner.
//!
//! The configuration is read from a `config.yml` file in a configuration directory. All sections
//! and fields are optional and fall back to their defaults:
//!
//! ```yaml
//! logging:
//!   level: debug
//!   format: json
//! query:
//!   default_limit: 100
//!   max_points: 5000
//! ```
//!
//! Selected values can be overridden from the environment with [`Config::apply_env`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
