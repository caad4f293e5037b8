//! backlog-sync - reconcile a reviewed epic/story document with a remote backlog
//!
//! This crate provides the core functionality for the `backlog` CLI tool.
//!
//! # Architecture
//!
//! - [`schema`] - Declarative record type and field mapping (YAML)
//! - [`model`] - Intermediate document: epics, stories and validation
//! - [`remote`] - Record store trait and the retrying Table API client
//! - [`reconcile`] - Create/update planning and execution, epics before stories
//! - [`report`] - Run summaries
//! - [`cli`] - Command-line interface using clap
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod remote;
pub mod report;
pub mod schema;
pub mod validate;

pub use error::{Error, Result};
