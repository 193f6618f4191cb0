//! A client/server implementation using UNIX sockets for gRPC, meant for use
//! with tonic. Socket support is not built in to tonic, and the proxy needs
//! both halves: the server half binds the socket kubelet talks to, the client
//! half dials each backend runtime's socket.

pub mod client;
pub mod server;
