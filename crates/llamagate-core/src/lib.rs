//! Core types, errors, and shared functionality for llamagate.
//!
//! This crate provides the foundational types used throughout the gateway:
//!
//! - **Error types**: [`GatewayError`] and [`Result`]
//! - **Backend types**: [`BackendConfig`], [`Provider`] and the resolved [`UpstreamTarget`]
//! - **Host dispatch**: a serialized execution queue for work that must run on the host's context
//!
//! # Examples
//!
//! ## Describing a backend
//!
//! ```rust
//! use llamagate_core::{BackendConfig, Provider};
//!
//! let backend = BackendConfig::new(
//!     "primary",
//!     Provider::OpenAI,
//!     "https://api.openai.com/v1/chat/completions",
//!     "gpt-4o-mini",
//! )
//! .with_api_key("sk-test");
//!
//! let target = backend.target().unwrap();
//! assert_eq!(target.port, 443);
//! assert!(target.tls);
//! ```
//!
//! ## Error handling
//!
//! ```rust
//! use llamagate_core::{Result, GatewayError};
//!
//! fn example_operation() -> Result<String> {
//!     Err(GatewayError::config("invalid configuration"))
//! }
//!
//! match example_operation() {
//!     Ok(val) => println!("Success: {}", val),
//!     Err(e) => println!("Error: {}", e),
//! }
//! ```

pub mod backend;
pub mod dispatch;
pub mod error;

// Re-export commonly used types for convenience
pub use backend::{BackendConfig, Provider, UpstreamTarget};
pub use dispatch::{host_queue, HostDispatcher, HostQueue};
pub use error::{GatewayError, Result};

/// Prelude module for convenient imports.
///
/// ```rust
/// use llamagate_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backend::{BackendConfig, Provider, UpstreamTarget};
    pub use crate::error::{GatewayError, Result};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let _backend = BackendConfig::new("test", Provider::Custom, "http://localhost/v1", "m");
        let _error = GatewayError::config("test");
    }

    #[test]
    fn test_result_type() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
