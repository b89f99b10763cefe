//! Live-connection management for messaging sessions: the client registry,
//! the engine-callback bridge, single-session use cases and the startup
//! reconnect sweep.

pub mod error;
pub mod event_handler;
pub mod reconnect;
pub mod registry;
pub mod usecases;

pub use error::RuntimeError;
pub use event_handler::SessionEventHandler;
pub use reconnect::{AutoReconnector, ReconnectConfig, ReconnectReport, ReconnectResult};
pub use registry::{
    ClientHealth, ClientRegistry, FanOutReport, RegistryConfig, RegistryStats, ShutdownSummary,
};
pub use usecases::{
    BulkSummary, ConnectResponse, DisconnectResponse, SessionPage, SessionService,
    SessionStatusReport,
};
