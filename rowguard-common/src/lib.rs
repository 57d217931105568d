//! Rowguard Common Types and Utilities
//!
//! Shared types, configuration, and error handling for the rowguard
//! access-control engine.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

pub use config::RowGuardConfig;
pub use error::{Error, Result};
pub use types::{ConditionMap, JoinType, Operation, PolicyOperation, SqlValue};
