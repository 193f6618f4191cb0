//! A multiplexing proxy for the Kubernetes Container Runtime Interface.
//!
//! kubelet can be pointed at exactly one CRI socket. This crate provides the
//! [`RuntimeProxy`] type, which serves `RuntimeService` and `ImageService` on
//! a single unix socket and fans the calls out to any number of backend
//! runtimes, each reachable over its own CRI socket. The first backend in the
//! address list is the *primary* runtime; every other backend carries a short
//! id that namespaces its sandbox/container ids (`id__...`) and image names
//! (`id/...`) so that all backends can share the one socket kubelet sees.
//!
//! # Example
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use criproxy::RuntimeProxy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backends = vec![
//!         "/var/run/dockershim.sock".to_string(),
//!         "virtlet:/run/virtlet.sock".to_string(),
//!     ];
//!     let proxy = RuntimeProxy::new(&backends, Duration::from_secs(30), None)?;
//!     proxy.serve("/run/criproxy.sock", None).await
//! }
//! ```

#![warn(missing_docs)]

mod client;
#[allow(missing_docs)]
pub mod criapi;
pub mod grpc_sock;
pub mod proxy;
pub mod wait;

pub use client::{AddressError, TARGET_RUNTIME_ANNOTATION};
pub use proxy::{RequestHook, RuntimeProxy};
