//! Accept loop: one task per connection over an optimized listener

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{debug, info, trace};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::router::RouteTable;

/// Route state shared across connections.
///
/// The table itself is immutable once serving starts; swapping in a
/// new one replaces the `Arc`, so in-flight requests keep the table
/// they started with and the hot path takes no lock across awaits.
pub struct ServerState {
    routes: RwLock<Arc<RouteTable>>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Arc::new(RouteTable::new())),
        }
    }

    pub fn set_routes(&self, table: RouteTable) {
        *self.routes.write() = Arc::new(table);
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.read().clone()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server: configuration plus shared route state.
pub struct Server {
    config: Arc<ServerConfig>,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(ServerState::new()),
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and accept until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.hostname, self.config.port)
            .parse()
            .map_err(|_| Error::Internal("invalid listen address"))?;

        let socket = create_listener_socket(&addr)?;
        let std_listener: std::net::TcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        info!("listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    trace!("accepted connection from {}", peer);
                    let _ = stream.set_nodelay(true);
                    let config = self.config.clone();
                    let table = self.state.routes();
                    tokio::spawn(async move {
                        Connection::new(stream, config).serve(table).await;
                    });
                }
                Err(error) => {
                    debug!("failed to accept client: {}", error);
                }
            }
        }
    }
}

/// Create a TCP listener socket with the usual latency and reuse
/// options applied.
pub fn create_listener_socket(addr: &SocketAddr) -> std::io::Result<Socket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Rebind through TIME_WAIT
    socket.set_reuse_address(true)?;

    // Kernel load balancing across worker processes
    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.set_nodelay(true)?;

    socket.bind(&(*addr).into())?;
    socket.listen(1024)?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{handler_fn, HandlerFuture, UrlMap};
    use crate::Request;
    use crate::Response;

    fn noop(_req: &mut Request) -> HandlerFuture<'_> {
        Box::pin(async { Response::ok() })
    }

    #[test]
    fn test_state_route_swap() {
        let state = ServerState::new();
        assert!(state.routes().lookup_prefix(b"/").is_none());

        let mut table = RouteTable::new();
        table.insert(UrlMap::new("/", handler_fn(noop)));
        state.set_routes(table);

        let snapshot = state.routes();
        assert!(snapshot.lookup_prefix(b"/anything").is_some());
    }

    #[test]
    fn test_listener_socket() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = create_listener_socket(&addr).unwrap();
        let bound = socket.local_addr().unwrap();
        assert!(bound.as_socket().unwrap().port() != 0);
    }
}
