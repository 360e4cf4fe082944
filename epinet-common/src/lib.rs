//! # Epinet Common Library
//!
//! Shared code for the epinet aggregation services:
//! - Error type
//! - Hour-key time bucketing
//! - Bootstrap configuration loading
//! - Load progress events and the event bus
//! - Clock abstraction

pub mod config;
pub mod error;
pub mod events;
pub mod hour_key;
pub mod time;

pub use error::{Error, Result};
pub use hour_key::HourKey;
