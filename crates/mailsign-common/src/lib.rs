//! mailsign Common - Shared types and utilities
//!
//! This crate provides the configuration snapshot, the error taxonomy and the
//! envelope types shared across all mailsign components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
