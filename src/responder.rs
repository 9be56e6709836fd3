//! `GetConfig` implementation backed by a file on disk.
//!
//! Every call re-reads the file, so the reply always reflects the content at
//! the moment of the request. The bytes are passed through untouched.

use crate::proto::control_service_server::ControlService;
use crate::proto::{ConfigurationFile, Void};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tonic::{Request, Response, Status};
use tracing::{debug, error};

/// Serves the configuration file at a fixed path.
///
/// Holds no mutable state, so one instance can be shared by every in-flight
/// call.
#[derive(Debug, Clone)]
pub struct ConfigResponder {
    path: PathBuf,
}

impl ConfigResponder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole file into a fresh payload.
    ///
    /// The read runs on tokio's blocking pool. Dropping the returned future
    /// abandons the call without producing a payload.
    pub async fn read_payload(&self) -> Result<ConfigurationFile, FileReadError> {
        let xml_buffer = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FileReadError {
                path: self.path.clone(),
                source,
            })?;

        Ok(ConfigurationFile { xml_buffer })
    }
}

#[tonic::async_trait]
impl ControlService for ConfigResponder {
    async fn get_config(
        &self,
        request: Request<Void>,
    ) -> Result<Response<ConfigurationFile>, Status> {
        let peer = request.remote_addr();

        match self.read_payload().await {
            Ok(payload) => {
                debug!(?peer, bytes = payload.xml_buffer.len(), "Served configuration");
                Ok(Response::new(payload))
            }
            Err(e) => {
                error!(?peer, error = %e, "Failed to read configuration file");
                Err(e.into())
            }
        }
    }
}

/// The configuration file could not be read for a single call.
#[derive(Debug)]
pub struct FileReadError {
    pub path: PathBuf,
    pub source: io::Error,
}

impl fmt::Display for FileReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Failed to read configuration file '{}': {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for FileReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<FileReadError> for Status {
    fn from(e: FileReadError) -> Self {
        let message = e.to_string();
        match e.source.kind() {
            io::ErrorKind::NotFound => Status::not_found(message),
            io::ErrorKind::PermissionDenied => Status::permission_denied(message),
            _ => Status::internal(message),
        }
    }
}
