//! C4: registration and the transparent catch-all handler.
//!
//! Mirrors how tonic's generated code wires a service's bidi-streaming
//! method to `tonic::server::Grpc::streaming` (see the client-side
//! counterpart this crate's `tonic_channel` module is modeled on), except
//! there is exactly one handler for every path instead of one per RPC: the
//! path *is* the method name the [`Director`] routes on (§4.4).

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio_stream::{Stream, StreamExt};
use tonic::body::Body;
use tonic::metadata::MetadataMap;
use tonic::server::{Grpc, StreamingService};
use tonic::{Request, Response, Status};

use crate::backend::BackendEvent;
use crate::codec::PassthroughCodec;
use crate::context::InboundContext;
use crate::director::Director;
use crate::forwarder::forward;

/// Per-method bookkeeping the director itself does not need: which methods
/// are unary for the purposes of the One2Many merge policy (§4.6). Anything
/// not registered here is treated as streamed, the safe default (a streamed
/// merge never buffers an entire call the way a unary merge does).
///
/// Entries are matched by prefix, not exact equality: §4.4's "explicit
/// registration" path lists individual method names, which match themselves
/// exactly, but a caller registering a whole service's method *prefix* (as
/// `grpc-proxy-app`'s config does — one YAML route per service, not per
/// method) needs every method under it to match too.
#[derive(Clone, Debug, Default)]
pub struct Registration {
	unary_prefixes: HashSet<String>,
}

impl Registration {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_unary(mut self, method_or_prefix: impl Into<String>) -> Self {
		self.unary_prefixes.insert(method_or_prefix.into());
		self
	}

	pub fn is_unary(&self, method: &str) -> bool {
		self.unary_prefixes.iter().any(|p| method.starts_with(p.as_str()))
	}
}

/// The transparent handler: a single `tower::Service` mounted for every
/// path, with no per-RPC codegen. `grpc-proxy-app` binds this directly to
/// `tonic::transport::Server::add_service`-equivalent raw routing, since
/// tonic's built-in router dispatches by exact, statically-known service
/// name and cannot express a catch-all (§4.4, Non-goal: no reflection-based
/// dynamic registration beyond "route by path prefix").
#[derive(Clone)]
pub struct ProxyService {
	director: Arc<dyn Director>,
	registration: Registration,
}

impl ProxyService {
	pub fn new(director: Arc<dyn Director>, registration: Registration) -> Self {
		Self {
			director,
			registration,
		}
	}
}

impl tower::Service<http::Request<Body>> for ProxyService {
	type Response = http::Response<Body>;
	type Error = std::convert::Infallible;
	type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, req: http::Request<Body>) -> Self::Future {
		let method = req.uri().path().to_string();
		let handler = CallHandler {
			director: self.director.clone(),
			method: method.clone(),
			streaming: !self.registration.is_unary(&method),
		};
		let mut grpc = Grpc::new(PassthroughCodec);
		Box::pin(async move { Ok(grpc.streaming(handler, req).await) })
	}
}

#[derive(Clone)]
struct CallHandler {
	director: Arc<dyn Director>,
	method: String,
	streaming: bool,
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;

impl StreamingService<Bytes> for CallHandler {
	type Response = Bytes;
	type ResponseStream = ResponseStream;
	type Future =
		Pin<Box<dyn std::future::Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send>>;

	fn call(&mut self, request: Request<tonic::Streaming<Bytes>>) -> Self::Future {
		let director = self.director.clone();
		let method = self.method.clone();
		let streaming = self.streaming;
		Box::pin(async move {
			let (metadata, body, _extensions) = request.into_parts();
			let ctx = InboundContext::from_metadata(metadata);
			let outbound = Box::pin(body.filter_map(|frame| frame.ok()));

			let mut events = forward(director.as_ref(), ctx, method, streaming, outbound).await?;

			let headers = match events.next().await {
				Some(BackendEvent::Headers(h)) => h,
				_ => MetadataMap::new(),
			};

			let body_stream = async_stream_of(events);
			let mut response = Response::new(Box::pin(body_stream) as ResponseStream);
			*response.metadata_mut() = headers;
			Ok(response)
		})
	}
}

/// Convert the tail of a [`BackendEvent`] stream (after `Headers` has been
/// consumed) into the `Result<Bytes, Status>` shape tonic's server-side
/// `Grpc::streaming` expects: data frames are `Ok`, and the terminal event —
/// whatever its status — is the stream's one and only `Err`/EOF boundary, so
/// that a non-default trailing `MetadataMap` still reaches the client as
/// trailers (§4.6, §4.7).
fn async_stream_of(
	events: Pin<Box<dyn Stream<Item = BackendEvent> + Send>>,
) -> impl Stream<Item = Result<Bytes, Status>> + Send {
	async_stream::stream! {
		let mut events = events;
		while let Some(event) = events.next().await {
			match event {
				BackendEvent::Headers(_) => {
					// Only one Headers event is ever produced per call; a
					// second would indicate a forwarder bug, not a valid
					// trailer boundary, so it is simply ignored here.
				},
				BackendEvent::Message(frame) => yield Ok(frame),
				BackendEvent::End { trailers, status } => {
					let mut status = status;
					*status.metadata_mut() = trailers;
					if status.code() != tonic::Code::Ok {
						yield Err(status);
					} else if !status.metadata().is_empty() {
						yield Err(status);
					}
					return;
				},
			}
		}
	}
}
