//! Core types, config, and errors for Opal.

pub mod config;
pub mod error;
pub mod types;
