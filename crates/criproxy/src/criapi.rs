//! Bindings generated from the vendored CRI protocol definition. The proxy
//! uses both sides: the server half faces kubelet, the client half talks to
//! the backend runtimes.

/// The CRI API version served and consumed by the proxy.
pub const API_VERSION: &str = "v1alpha2";

tonic::include_proto!("runtime.v1alpha2");
