//! Schema definitions for Brood
//!
//! This crate contains the data structures shared between the process-handle
//! core and the code that consumes its notifications. All types here are
//! serializable and implement JSON Schema generation for external consumption.

pub mod process;
pub mod signal;


pub use process::*;
pub use signal::*;
