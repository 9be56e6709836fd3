//! daq-emulator: a stand-in for a data-acquisition unit's control endpoint.
//!
//! The emulator answers the `GetConfig` gRPC call by reading a configuration
//! file from disk and returning its raw bytes. Client software can exercise
//! its configuration-retrieval path against it instead of real hardware.
//!
//! Components:
//! - `server`: binds the TCP endpoint and owns the listener lifecycle
//! - `responder`: implements `GetConfig` on top of a file path
//! - `endpoint`: `host:port` parsing and resolution
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod endpoint;
pub mod responder;
pub mod server;

/// Generated protobuf types and gRPC stubs for the control service.
pub mod proto {
    tonic::include_proto!("acquisition.api");
}

pub use endpoint::ServiceEndpoint;
pub use responder::{ConfigResponder, FileReadError};
pub use server::{BoundServer, Server, ServerError};
