//! CLI command definitions and handlers
//!
//! This module contains all CLI command structures using clap derive
//! macros together with their handler functions.

pub mod jobs;
pub mod workflow;
