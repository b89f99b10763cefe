//! Protocol-engine collaborators.
//!
//! The real messaging engine is an external plug-in implementing
//! [`switchboard_core::ClientFactory`]. This crate ships an in-process,
//! scriptable engine used by tests and by the CLI's simulated mode.

pub mod mock;

pub use mock::{MockClient, MockConnect, MockEngine, MockStats};
