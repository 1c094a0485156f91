//! Common types and utilities for the match-odds relay.

pub mod error;
pub mod update;

pub use error::{Error, Result};
pub use update::{MatchUpdate, UpdateKind};
