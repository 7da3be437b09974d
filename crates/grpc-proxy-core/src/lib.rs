//! Transport-agnostic core of a transparent gRPC forwarding proxy: a
//! passthrough codec, a routing contract (director + backend), and the two
//! forwarder state machines (one-to-one, one-to-many) that drive a call to
//! completion.
//!
//! Nothing in this crate binds to a concrete transport. `grpc-proxy-app`
//! wires these traits to `tonic::transport::Channel` and a real server; tests
//! here drive them against in-memory fakes (see `test_support`).

pub mod backend;
pub mod codec;
pub mod context;
pub mod director;
pub mod error;
pub mod forwarder;
pub mod frame;
pub mod server;
pub mod tonic_channel;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod scenarios;

pub use backend::{Backend, BackendEvent, GrpcChannel};
pub use codec::PassthroughCodec;
pub use context::InboundContext;
pub use director::{Decision, Director, Mode};
pub use error::Error;
pub use forwarder::forward;
pub use server::{ProxyService, Registration};
pub use tonic_channel::TonicChannel;
