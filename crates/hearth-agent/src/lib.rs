//! Agent process for Hearth.
//!
//! Hosts recipes sent by a master over HTTP and streams their events back
//! as newline-delimited JSON.

pub mod cli;
pub mod error;
pub mod feed;
pub mod routes;
pub mod state;

pub use feed::EventFeed;
pub use state::AgentState;
