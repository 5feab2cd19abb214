//! # mpipe Common Library
//!
//! Shared code for the media pipeline crates:
//! - Common error type
//! - Bootstrap configuration (TOML) and config file resolution
//! - Pipeline event types
//! - Time helpers (microsecond media time)

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
pub use time::Mtime;
