//! Core domain types and traits for the Hearth build server.
//!
//! This crate contains:
//! - Resource identifiers and the shared error type
//! - The result tree (build → recipe → command → artifact → feature)
//! - The command execution contract and its per-command context
//! - Recipe requests and the directories a recipe runs in
//! - The lifecycle event bus
//! - The execution service trait and host requirements

pub mod artifact;
pub mod build;
pub mod command;
pub mod context;
pub mod error;
pub mod event;
pub mod id;
pub mod output;
pub mod recipe;
pub mod result;
pub mod scope;
pub mod service;

pub use error::{Error, Result};
pub use id::ResourceId;
