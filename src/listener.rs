//! TCP listener serving a tower service over HTTP/1.1.
//!
//! The same accept loop fronts both ports of a faces process: the fault
//! injected [`FacesService`] and the admin [`AdminService`].

use crate::admin::AdminService;
use crate::error::{FacesError, Result};
use crate::service::{FacesService, ResponseBody};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, error, info, instrument, warn};

/// A service a [`Listener`] can hand connections to.
pub trait ConnectionService:
    Service<Request<Incoming>, Response = Response<ResponseBody>, Error = Infallible>
    + Clone
    + Send
    + 'static
{
    /// Label used in listener logs.
    fn label(&self) -> &'static str;

    /// Copy of the service for one connection from `peer_addr`.
    fn for_peer(&self, peer_addr: SocketAddr) -> Self;
}

impl ConnectionService for FacesService {
    fn label(&self) -> &'static str {
        self.kind().name()
    }

    fn for_peer(&self, peer_addr: SocketAddr) -> Self {
        self.clone().with_peer_addr(peer_addr)
    }
}

impl ConnectionService for AdminService {
    fn label(&self) -> &'static str {
        "admin"
    }

    fn for_peer(&self, _peer_addr: SocketAddr) -> Self {
        self.clone()
    }
}

/// HTTP listener that accepts connections and spawns a handler task for
/// each one.
///
/// # Example
///
/// ```no_run
/// use faces_mesh::admin::AdminService;
/// use faces_mesh::config::FacesConfig;
/// use faces_mesh::listener::Listener;
/// use faces_mesh::service::FacesService;
/// use tokio::sync::broadcast;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = FacesConfig::from_env_validated()?;
///     let service = FacesService::from_config(&config, None)?;
///     let (shutdown_tx, _) = broadcast::channel(1);
///
///     let faces = Listener::bind("127.0.0.1:8000", service).await?;
///     let admin = Listener::bind("127.0.0.1:9090", AdminService::new()).await?;
///     tokio::spawn(admin.serve(shutdown_tx.subscribe()));
///     faces.serve(shutdown_tx.subscribe()).await?;
///     Ok(())
/// }
/// ```
pub struct Listener<S> {
    tcp_listener: TcpListener,
    service: S,
    addr: SocketAddr,
}

impl<S> Listener<S>
where
    S: ConnectionService,
    <S as Service<Request<Incoming>>>::Future: Send + 'static,
{
    /// Binds to the specified address.
    ///
    /// # Errors
    ///
    /// Returns `FacesError::ListenerBind` if binding fails.
    #[instrument(level = "info", skip(service), fields(service = service.label()))]
    pub async fn bind(addr: &str, service: S) -> Result<Self> {
        let tcp_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| FacesError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        let local_addr = tcp_listener
            .local_addr()
            .map_err(|e| FacesError::ListenerBind {
                addr: addr.to_string(),
                source: e,
            })?;

        info!("bound to {}", local_addr);

        Ok(Self {
            tcp_listener,
            service,
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming connections until a shutdown signal is received.
    ///
    /// Connections already being served finish on their own tasks.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(service = self.service.label(), addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving connections");

        loop {
            tokio::select! {
                accept_result = self.tcp_listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let service = self.service.for_peer(peer_addr);

                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, service).await {
                                    error!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("{}", FacesError::AcceptConnection(e));
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
            }
        }

        Ok(())
    }

    #[instrument(level = "debug", skip_all)]
    async fn handle_connection(stream: TcpStream, service: S) -> Result<()> {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let mut svc = service.clone();
            async move { svc.call(req).await }
        });

        http1::Builder::new()
            .serve_connection(io, service)
            .await
            .map_err(FacesError::Http)
    }
}
