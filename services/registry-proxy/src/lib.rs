//! # Registry pull-through proxy
//!
//! A transparent proxy in front of a public container image registry
//! (Docker Hub by default) which manages bearer-token authentication on
//! behalf of its clients.
//!
//! ## Features
//!
//! - Scoped pull tokens, acquired from the registry's token service and
//!   cached in a pluggable [`token_store::TokenStore`]
//! - A single token refresh and resend when the registry answers `401`
//! - One unauthenticated redirect hop for blobs served from storage backends
//! - Response bodies are streamed through, never buffered
//! - Builder pattern for configuration
//!
//! ## Example
//!
//! ```no_run
//! use registry_proxy::{ProxyBuilder, ProxyConfig};
//! use token_store::MemoryTokenStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let proxy = ProxyBuilder::new()
//!     .config(ProxyConfig::default())
//!     .store(MemoryTokenStore::new().into())
//!     .build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, proxy).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod config;
mod error;
mod forward;
pub mod route;
mod token;
pub mod upstream;

pub use api::{Proxy, ProxyBuilder};
pub use config::{ProxyConfig, UpstreamConfig};
pub use error::{ProxyError, ProxyResult};
pub use forward::{ForwardError, Forwarder, UpstreamRequest};
pub use route::{RegistryPath, ResourceKind, Scope};
pub use token::{AuthError, Token, TokenManager};
pub use upstream::UpstreamService;
