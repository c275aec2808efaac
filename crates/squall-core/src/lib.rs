//! squall-core: HTTP/1.x request-processing core
//!
//! The subsystem between a raw client byte stream and a route handler:
//! zero-copy request parsing into offset spans, PROXY v1/v2 preamble
//! handling, lazy typed header accessors, bounded body ingestion with
//! file-backed spooling, longest-prefix dispatch with URL rewriting,
//! and the WebSocket upgrade handshake, all driven by a cooperative
//! per-connection read loop.
//!
//! ## Quick start
//!
//! ```no_run
//! use squall_core::{handler_fn, HandlerFuture, Request, Response, RouteTable, Server, ServerConfig, UrlMap};
//!
//! fn hello(_req: &mut Request) -> HandlerFuture<'_> {
//!     Box::pin(async { Response::text("hello") })
//! }
//!
//! #[tokio::main]
//! async fn main() -> squall_core::Result<()> {
//!     let server = Server::new(ServerConfig::default());
//!     let mut routes = RouteTable::new();
//!     routes.insert(UrlMap::new("/", handler_fn(hello)));
//!     server.state().set_routes(routes);
//!     server.run().await
//! }
//! ```

pub mod ascii;
pub mod auth;
pub mod body;
pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
pub mod parser;
pub mod proxy;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod urlencoded;
pub mod websocket;

// Re-exports
pub use auth::{BasicAuth, BasicCredentials};
pub use config::ServerConfig;
pub use connection::Connection;
pub use error::{Error, Result};
pub use parser::{Method, Span, DEFAULT_BUFFER_SIZE, MAX_HEADER_LINES};
pub use proxy::{ProxyAddresses, ProxyCommand, ProxyFamily, ProxyPeer};
pub use request::{Request, RequestBuffer};
pub use response::{Response, ResponseBuilder, StatusCode};
pub use router::{handler_fn, Handler, HandlerFuture, RouteFlags, RouteTable, UrlMap};
pub use server::{Server, ServerState};
pub use websocket::upgrade as websocket_upgrade;
