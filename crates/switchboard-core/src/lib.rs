//! Domain types shared by every switchboard crate: session identity and
//! lifecycle, proxy configuration, and the capability traits the protocol
//! engine must satisfy.

pub mod client;
pub mod errors;
pub mod events;
pub mod ids;
pub mod proxy;
pub mod session;

pub use client::{ClientFactory, ClientParams, ConnectResult, ConnectionClient, ConnectionStatus};
pub use errors::{ClientError, SessionError};
pub use events::{EventHandler, IncomingMessage};
pub use ids::{ParseSessionIdError, SessionId};
pub use proxy::ProxyConfig;
pub use session::{Session, SessionStatus};
