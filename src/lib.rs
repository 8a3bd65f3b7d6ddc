//! Focal plane lock for scanning microscopes.
//!
//! A target plane is captured once. Every so often the volumetric scan is
//! interrupted, five planes are acquired around the current position, and the
//! one that best matches the target decides how far to move the piezo.

pub mod alignment;
pub mod bus;
pub mod capture;
pub mod config;
pub mod control;
pub mod error;
pub mod image;
pub mod logging;
pub mod simulator;

pub use config::AlignmentConfig;
pub use error::{AlignmentError, Result};
