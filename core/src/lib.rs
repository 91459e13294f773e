//! Session engine for the chatbox gateway.
//!
//! The crate is organized leaves-first: [`config`] and [`error`] have no
//! dependencies on the rest, [`registry`] knows the model table, [`mcp`]
//! speaks to the tool-server child process, [`transport`] owns one live
//! agent conversation, and [`session`] is the per-connection state machine
//! the gateway drives.

pub mod config;
pub mod error;
pub mod mcp;
pub mod registry;
pub mod session;
pub mod transport;

pub use config::{Config, ConfigError};
pub use error::{sanitize_detail, ErrorKind, TransportError};
pub use registry::{ModelEntry, ModelRegistry, AUTO_MODEL_ID};
pub use session::Session;
pub use transport::{AgentTransport, DirectFactory, TransportEvent, TransportFactory};
