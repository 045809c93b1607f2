//! Loopback gateway speaking the llama.cpp server API.
//!
//! [`ProxyServer`] binds `127.0.0.1`, falling forward to the next free port
//! when the requested one is taken, and serves one request per connection.
//! Completion requests are translated for the active backend and forwarded
//! through the [`llamagate_backends::BackendSelector`], failing over to the
//! next backend on error. Streamed completions are relayed to the caller as
//! chunked `data:` events while the upstream is still producing them.
//!
//! ```ignore
//! let server = ProxyServer::builder(config.backend_configs())
//!     .options(ProxyOptions::from(&config.gateway))
//!     .port_observer(|change| info!(?change, "port changed"))
//!     .build()?;
//! let port = server.start(13333).await?;
//! // ...
//! server.stop().await;
//! ```

pub mod forward;
pub mod handlers;
pub mod router;
pub mod server;

pub use forward::StreamOutcome;
pub use router::Route;
pub use server::{
    bind_with_fallback, PortChange, PortObserver, ProxyOptions, ProxyServer, ProxyServerBuilder,
};
