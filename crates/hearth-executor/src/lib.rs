//! Recipe execution for Hearth.
//!
//! - [`processor`]: runs a recipe's commands and reports lifecycle events
//! - [`local`]: execution service running recipes in this process
//! - [`remote`]: execution service talking to an agent over HTTP

pub mod bootstrap;
pub mod capture;
pub mod commands;
pub mod fs;
pub mod local;
pub mod postprocess;
pub mod processor;
pub mod remote;

pub use bootstrap::{BootstrapperFactory, CheckoutLog, Scm};
pub use commands::{CommandFactory, CustomCommandBuilder};
pub use local::LocalExecutionService;
pub use processor::RecipeProcessor;
pub use remote::RemoteExecutionService;
