//! Non-blocking TCP relay engine for scene-scoped pub/sub fan-out.
//!
//! This crate owns the hard part of the relay: length-prefixed framing,
//! connection and scene bookkeeping, the PING/timeout state machine, and
//! the request dispatcher. The binary crate (`ndrelay-server`) wires this
//! engine to a CLI, logging, signal handling and process bootstrap.

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ids;
pub mod registry;
pub mod scene;
pub mod server;
pub mod stats;

pub use connection::Connection;
pub use dispatch::{DispatchError, Outcome};
pub use error::NetError;
pub use registry::{ConnectionRegistry, SceneRegistry};
pub use scene::Scene;
pub use server::RelayServer;
