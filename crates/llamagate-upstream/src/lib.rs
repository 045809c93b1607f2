//! Raw HTTP/1.1 client for upstream chat-completion providers.
//!
//! Every forwarded request gets its own TCP (optionally TLS) connection. The
//! response body is decoded according to its framing (chunked,
//! `Content-Length`, or read-to-EOF), split into SSE events, and handed to a
//! [`FragmentSink`] one [`Fragment`] at a time.
//!
//! ```ignore
//! let client = UpstreamClient::new(Some(Duration::from_secs(120)))?;
//! let request = UpstreamRequest::post(backend.target()?, body)
//!     .authorization(backend.auth_header());
//! let mut sink = CollectSink::new();
//! client.send(&backend.name, &request, &mut sink).await?;
//! ```

pub mod client;
pub mod framing;
pub mod sink;
pub mod sse;
pub mod tls;

pub use client::{exchange, Delivery, UpstreamClient, UpstreamRequest, ERROR_BODY_LIMIT};
pub use framing::{ResponseHead, MAX_HEAD_BYTES};
pub use sink::{CollectSink, FragmentSink, MAX_COLLECTED_BYTES};
pub use sse::{Fragment, SseSplitter, MAX_EVENT_BYTES};
