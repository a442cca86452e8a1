//! # pmse Testkit
//!
//! Test utilities for pmse.
//!
//! This crate provides:
//! - A crash-injecting storage backend and a harness that sweeps an
//!   operation through every crash point
//! - Scratch engine fixtures and in-memory collection pools
//! - Property-based generators and reference models for maps and trees
//! - Cross-crate integration helpers
//! - Concurrent stress helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pmse_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_engine() {
//!     with_temp_engine(|engine| {
//!         engine.create_collection("db.c", "c", &Default::default()).unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
