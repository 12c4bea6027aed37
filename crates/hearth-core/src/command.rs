//! The command execution contract.
//!
//! A [`Command`] is one step of a recipe. Expected problems (a compile
//! error, a failing test) are recorded on the result with
//! [`CommandResult::failure`]; anything unexpected is returned as an `Err`,
//! recorded as an error by the caller, and aborts the recipe.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::context::CommandContext;
use crate::result::{CommandResult, ResultState};
use crate::{Error, Result};

/// Name given to the command that wraps a bootstrapper.
pub const BOOTSTRAP_COMMAND: &str = "bootstrap";

#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;

    /// Run the command, recording its outcome on `result`.
    ///
    /// Must return promptly if `terminate` has already been called.
    async fn execute(&self, ctx: &mut CommandContext, result: &mut CommandResult) -> Result<()>;

    /// Ask a running command to stop. May be called from any task, before,
    /// during or after `execute`, and more than once.
    fn terminate(&self);
}

/// Prepares the base directory a recipe builds from.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    async fn bootstrap(&self, ctx: &mut CommandContext, result: &mut CommandResult) -> Result<()>;

    fn terminate(&self);
}

/// Runs a bootstrapper as the first command of a recipe.
pub struct BootstrapCommand {
    inner: Box<dyn Bootstrapper>,
}

impl BootstrapCommand {
    pub fn new(inner: Box<dyn Bootstrapper>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Command for BootstrapCommand {
    fn name(&self) -> &str {
        BOOTSTRAP_COMMAND
    }

    async fn execute(&self, ctx: &mut CommandContext, result: &mut CommandResult) -> Result<()> {
        self.inner.bootstrap(ctx, result).await?;
        // Nothing useful can be built from a half-prepared base directory.
        if result.state() == ResultState::Failure {
            result.error("Bootstrap failed");
        }
        Ok(())
    }

    fn terminate(&self) {
        self.inner.terminate();
    }
}

/// Cooperative cancellation flag shared between a command and whoever
/// terminates it.
#[derive(Debug, Clone, Default)]
pub struct TerminateFlag {
    inner: Arc<FlagInner>,
}

#[derive(Debug, Default)]
struct FlagInner {
    raised: AtomicBool,
    notify: Notify,
}

impl TerminateFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// `Err(Terminated)` once raised.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(Error::Terminated)
        } else {
            Ok(())
        }
    }

    /// Resolves once the flag is raised, immediately if it already is.
    pub async fn raised(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}
