//! Minimal HTTP/1.1 message codec for the gateway's loopback listener.
//!
//! This crate deliberately knows nothing about routing or backends. It reads
//! one request from a byte stream and writes either a fixed-length or a
//! chunked response back. Header and method types come from the `http` crate.

pub mod error;
pub mod request;
pub mod response;

pub use error::{HttpError, Result};
pub use request::{
    content_length, find_header_end, parse_header_lines, read_request, read_request_with_limit,
    InboundRequest, MAX_REQUEST_BYTES,
};
pub use response::{ChunkedWriter, Response};

pub use http::{HeaderMap, Method, StatusCode};
