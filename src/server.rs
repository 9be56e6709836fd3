//! gRPC listener for the acquisition control service.
//!
//! Binds the TCP endpoint, registers a `ConfigResponder` and serves calls
//! until shut down. Each call runs on its own task, so a slow or failing
//! read never holds up the accept loop or other calls.

use crate::config::Config;
use crate::endpoint::EndpointError;
use crate::proto::control_service_server::ControlServiceServer;
use crate::responder::ConfigResponder;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Accepted connections waiting for the transport to pick them up
const ACCEPT_QUEUE: usize = 128;

/// Pause after a failed accept (e.g. EMFILE) before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance, configured but not yet bound
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind and serve until the process is told to stop.
    pub async fn run(self) -> Result<(), ServerError> {
        self.bind()?.serve().await
    }

    /// Open the listening socket.
    ///
    /// Must be called from within a tokio runtime. Fails if the address does
    /// not resolve or the port is already taken.
    pub fn bind(self) -> Result<BoundServer, ServerError> {
        let addr = self
            .config
            .endpoint
            .resolve()
            .map_err(ServerError::InvalidAddress)?;

        let listener = create_listener(addr, self.config.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            address = %local_addr,
            file = %self.config.path_to_file.display(),
            "Server listening"
        );

        Ok(BoundServer {
            config: self.config,
            listener,
            local_addr,
        })
    }
}

/// A server holding its listening socket, ready to serve
pub struct BoundServer {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundServer {
    /// Address the socket is actually bound to (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn serve(self) -> Result<(), ServerError> {
        self.serve_with_shutdown(shutdown_signal()).await
    }

    /// Serve until `signal` completes, then drain in-flight calls.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let responder = ConfigResponder::new(self.config.path_to_file.clone());

        let mut builder = tonic::transport::Server::builder();
        if let Some(timeout) = self.config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(limit) = self.config.concurrency_limit {
            builder = builder.concurrency_limit_per_connection(limit);
        }

        let incoming = accept_connections(self.listener);

        builder
            .add_service(ControlServiceServer::new(responder))
            .serve_with_incoming_shutdown(incoming, signal)
            .await
            .map_err(ServerError::Transport)?;

        info!(address = %self.local_addr, "Server stopped");
        Ok(())
    }
}

/// Accept loop feeding the transport.
///
/// Accept errors are logged and followed by a short pause so a persistent
/// failure does not spin. The loop ends, closing the listener, once the
/// transport drops the stream.
fn accept_connections(listener: TcpListener) -> ReceiverStream<io::Result<TcpStream>> {
    let (tx, rx) = mpsc::channel::<io::Result<TcpStream>>(ACCEPT_QUEUE);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = tx.closed() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "New connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    if tx.send(Ok(stream)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        debug!("Accept loop finished");
    });

    ReceiverStream::new(rx)
}

/// Create a TCP listener that refuses to share its port with a live listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    // Allows quick restarts over TIME_WAIT; a listening socket still holds the port
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}

/// Server lifecycle errors. All of them are fatal.
#[derive(Debug)]
pub enum ServerError {
    InvalidAddress(EndpointError),
    Bind { addr: SocketAddr, source: io::Error },
    Transport(tonic::transport::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::InvalidAddress(e) => write!(f, "Invalid listen address: {}", e),
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)
            }
            ServerError::Transport(e) => write!(f, "Server transport failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(e) => Some(e),
            ServerError::Bind { source, .. } => Some(source),
            ServerError::Transport(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ServiceEndpoint;
    use crate::proto::control_service_client::ControlServiceClient;
    use crate::proto::Void;
    use std::path::Path;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tonic::transport::Channel;
    use tonic::Code;

    struct Running {
        addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
        handle: JoinHandle<Result<(), ServerError>>,
    }

    fn loopback_config(path: &Path) -> Config {
        Config::new(ServiceEndpoint::new("127.0.0.1", 0), path)
    }

    fn start(path: &Path) -> Running {
        start_with(loopback_config(path))
    }

    fn start_with(config: Config) -> Running {
        let bound = Server::new(config).bind().unwrap();
        let addr = bound.local_addr();
        let (shutdown, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(bound.serve_with_shutdown(async {
            let _ = rx.await;
        }));

        Running {
            addr,
            shutdown,
            handle,
        }
    }

    async fn connect(addr: SocketAddr) -> ControlServiceClient<Channel> {
        ControlServiceClient::connect(format!("http://{}", addr))
            .await
            .unwrap()
    }

    async fn stop(running: Running) {
        running.shutdown.send(()).unwrap();
        running.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serves_current_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.xml");
        std::fs::write(&path, b"<config version=\"1\"/>").unwrap();

        let running = start(&path);
        let mut client = connect(running.addr).await;

        let reply = client.get_config(Void {}).await.unwrap().into_inner();
        assert_eq!(reply.xml_buffer, b"<config version=\"1\"/>");

        std::fs::write(&path, b"<config version=\"2\"/>").unwrap();

        let reply = client.get_config(Void {}).await.unwrap().into_inner();
        assert_eq!(reply.xml_buffer, b"<config version=\"2\"/>");

        stop(running).await;
    }

    #[tokio::test]
    async fn test_missing_file_fails_call_and_server_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("later.xml");

        let running = start(&path);
        let mut client = connect(running.addr).await;

        let status = client.get_config(Void {}).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        std::fs::write(&path, b"<late/>").unwrap();

        let reply = client.get_config(Void {}).await.unwrap().into_inner();
        assert_eq!(reply.xml_buffer, b"<late/>");

        stop(running).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_see_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.xml");
        let content: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let running = start(&path);
        let client = connect(running.addr).await;

        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let mut client = client.clone();
            calls.spawn(async move { client.get_config(Void {}).await });
        }

        let mut completed = 0;
        while let Some(result) = calls.join_next().await {
            let reply = result.unwrap().unwrap().into_inner();
            assert_eq!(reply.xml_buffer, content);
            completed += 1;
        }
        assert_eq!(completed, 16);

        stop(running).await;
    }

    #[tokio::test]
    async fn test_second_bind_on_same_port_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.xml");

        let first = Server::new(loopback_config(&path)).bind().unwrap();
        let port = first.local_addr().port();

        let second = Server::new(Config::new(ServiceEndpoint::new("127.0.0.1", port), &path));
        match second.bind() {
            Err(ServerError::Bind { addr, source }) => {
                assert_eq!(addr.port(), port);
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("second bind on port {} succeeded", port),
        }

        // The first listener is untouched
        assert_eq!(first.local_addr().port(), port);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_server() {
        let dir = tempfile::tempdir().unwrap();
        let running = start(&dir.path().join("cfg.xml"));

        running.shutdown.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), running.handle)
            .await
            .expect("server did not stop");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_invalid_address() {
        let config = Config::new(ServiceEndpoint::new("no-such-host.invalid", 0), "cfg.xml");
        let server = Server::new(config);
        assert_eq!(server.config().endpoint.host, "no-such-host.invalid");

        assert!(matches!(server.bind(), Err(ServerError::InvalidAddress(_))));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_timeout_cancels_blocked_read() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("cfg.fifo");
        let made = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        assert!(made.success());

        // Opening a FIFO with no writer blocks the read
        let mut config = loopback_config(&fifo);
        config.request_timeout = Some(Duration::from_millis(300));
        let running = start_with(config);
        let mut client = connect(running.addr).await;

        let status = client.get_config(Void {}).await.unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);

        // Release the read still parked on the blocking pool
        let writer = fifo.clone();
        tokio::task::spawn_blocking(move || std::fs::write(writer, b"<late/>"))
            .await
            .unwrap()
            .unwrap();

        stop(running).await;
    }

    #[tokio::test]
    async fn test_port_released_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.xml");
        let running = start(&path);
        let port = running.addr.port();

        stop(running).await;

        // The accept loop drops the listener once the transport lets go
        let endpoint = ServiceEndpoint::new("127.0.0.1", port);
        let mut rebound = None;
        for _ in 0..50 {
            match Server::new(Config::new(endpoint.clone(), &path)).bind() {
                Ok(bound) => {
                    rebound = Some(bound);
                    break;
                }
                Err(ServerError::Bind { .. }) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        let rebound = rebound.expect("port still held after shutdown");
        assert_eq!(rebound.local_addr().port(), port);
    }
}
