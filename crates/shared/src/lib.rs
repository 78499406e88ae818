#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Nutra-Vive Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the
//! Nutra-Vive membership platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
