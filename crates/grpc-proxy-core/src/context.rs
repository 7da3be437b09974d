use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{MetadataKey, MetadataMap};

/// Metadata keys the host framework owns. These never travel through the
/// bridge: they are regenerated by whatever opens the backend sub-stream
/// (see §4.7). In practice `tonic`'s `MetadataMap` already excludes the
/// HTTP/2 pseudo-headers and the handful of reserved gRPC headers
/// (`content-type`, `te`, `grpc-timeout`, `grpc-encoding`,
/// `grpc-accept-encoding`) from what it hands back through `metadata()`, but
/// the bridge filters defensively so the invariant holds even against a
/// metadata map assembled by hand (as the in-memory test fakes do).
const RESERVED_HEADERS: &[&str] = &[
	"content-type",
	"te",
	"grpc-timeout",
	"grpc-encoding",
	"grpc-accept-encoding",
	"grpc-status",
	"grpc-message",
	":authority",
	":method",
	":path",
	":scheme",
];

fn is_reserved(key: &str) -> bool {
	RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(key))
}

/// Per-call state owned by the inbound side of the proxy: the client's
/// metadata, its deadline (if any), and a cancellation token chained from
/// the inbound call so that client disconnects tear down every sub-stream.
#[derive(Clone)]
pub struct InboundContext {
	metadata: MetadataMap,
	deadline: Option<Instant>,
	cancellation: CancellationToken,
}

impl InboundContext {
	pub fn new(metadata: MetadataMap, deadline: Option<Instant>) -> Self {
		Self {
			metadata,
			deadline,
			cancellation: CancellationToken::new(),
		}
	}

	/// Build a context with no deadline and a fresh cancellation token; mainly
	/// useful for tests and for the transparent handler path where the host
	/// framework does not surface an explicit deadline.
	pub fn from_metadata(metadata: MetadataMap) -> Self {
		Self::new(metadata, None)
	}

	pub fn metadata(&self) -> &MetadataMap {
		&self.metadata
	}

	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	pub fn remaining(&self) -> Option<Duration> {
		self
			.deadline
			.map(|d| d.saturating_duration_since(Instant::now()))
	}

	pub fn cancellation(&self) -> CancellationToken {
		self.cancellation.clone()
	}

	/// Cancel every sub-stream derived from this call. Invoked once a pump
	/// returns a fatal error (§5, "first error wins") — see
	/// `crate::forwarder::with_cancellation` and the per-backend guards in
	/// `crate::forwarder::one_to_many`.
	pub fn cancel(&self) {
		self.cancellation.cancel();
	}

	/// A guard that cancels this call's token when dropped while still
	/// armed. A pump holds one for as long as it is doing useful work and
	/// disarms it just before returning normally; if the pump's future is
	/// instead dropped mid-flight — the concrete case being the client
	/// disconnecting while a backend sub-stream is still open — the guard
	/// fires on the way out and every sibling pump waiting on
	/// `cancellation().cancelled()` unblocks (§5).
	pub fn cancel_guard(&self) -> CancelOnDrop {
		CancelOnDrop {
			token: self.cancellation.clone(),
			armed: true,
		}
	}

	/// Build the outgoing metadata for a backend sub-stream: every inbound
	/// user key, minus the framework-owned pseudo-headers (§4.7, P1).
	pub fn outgoing_metadata(&self) -> MetadataMap {
		bridge_metadata(&self.metadata)
	}
}

/// Copy every non-reserved key from `inbound` into a fresh `MetadataMap`,
/// preserving binary (`-bin`-suffixed) values verbatim. This is the C7
/// bridge in isolation, usable without an `InboundContext` where a director
/// or backend only has the raw inbound metadata (e.g. to make a routing
/// decision).
pub fn bridge_metadata(inbound: &MetadataMap) -> MetadataMap {
	let mut out = MetadataMap::new();
	for key_and_value in inbound.iter() {
		match key_and_value {
			tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
				if is_reserved(key.as_str()) {
					continue;
				}
				out.append(key.clone(), value.clone());
			},
			tonic::metadata::KeyAndValueRef::Binary(key, value) => {
				if is_reserved(key.as_str()) {
					continue;
				}
				out.append_bin(key.clone(), value.clone());
			},
		}
	}
	out
}

/// Apply an `InboundContext`'s deadline and bridged metadata onto a fresh
/// outgoing `tonic::Request`. Centralizes the "inherit inbound deadline"
/// rule (§4.7) so every sub-stream opener (one-to-one, one-to-many) goes
/// through one code path.
pub fn build_outgoing_request<T>(ctx: &InboundContext, message: T) -> tonic::Request<T> {
	let mut req = tonic::Request::new(message);
	*req.metadata_mut() = ctx.outgoing_metadata();
	if let Some(remaining) = ctx.remaining() {
		req.set_timeout(remaining);
	}
	req
}

/// See [`InboundContext::cancel_guard`]. `disarm` is the "this pump reached
/// its own normal return" signal; an armed guard running its `Drop` means
/// the pump's future was cancelled out from under it instead.
pub struct CancelOnDrop {
	token: CancellationToken,
	armed: bool,
}

impl CancelOnDrop {
	pub fn disarm(&mut self) {
		self.armed = false;
	}
}

impl Drop for CancelOnDrop {
	fn drop(&mut self) {
		if self.armed {
			self.token.cancel();
		}
	}
}

pub(crate) fn ascii_key(name: &str) -> Result<MetadataKey<tonic::metadata::Ascii>, tonic::Status> {
	MetadataKey::from_bytes(name.as_bytes())
		.map_err(|e| tonic::Status::internal(format!("invalid metadata key {name}: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bridge_drops_reserved_and_keeps_user_keys() {
		let mut inbound = MetadataMap::new();
		inbound.insert("content-type", "application/grpc".parse().unwrap());
		inbound.insert("te", "trailers".parse().unwrap());
		inbound.insert("test-client-header", "I like turtles.".parse().unwrap());
		inbound.insert_bin(
			"test-bin-bin",
			tonic::metadata::MetadataValue::from_bytes(b"\x01\x02\x03"),
		);

		let out = bridge_metadata(&inbound);
		assert!(out.get("content-type").is_none());
		assert!(out.get("te").is_none());
		assert_eq!(
			out.get("test-client-header").unwrap().to_str().unwrap(),
			"I like turtles."
		);
		assert_eq!(
			out.get_bin("test-bin-bin").unwrap().to_bytes().unwrap(),
			&b"\x01\x02\x03"[..]
		);
	}

	#[test]
	fn cancellation_propagates_from_clone() {
		let ctx = InboundContext::from_metadata(MetadataMap::new());
		let token = ctx.cancellation();
		assert!(!token.is_cancelled());
		ctx.cancel();
		assert!(token.is_cancelled());
	}

	#[test]
	fn dropping_an_armed_guard_cancels_the_token() {
		let ctx = InboundContext::from_metadata(MetadataMap::new());
		let token = ctx.cancellation();
		drop(ctx.cancel_guard());
		assert!(token.is_cancelled());
	}

	#[test]
	fn dropping_a_disarmed_guard_does_not_cancel() {
		let ctx = InboundContext::from_metadata(MetadataMap::new());
		let token = ctx.cancellation();
		let mut guard = ctx.cancel_guard();
		guard.disarm();
		drop(guard);
		assert!(!token.is_cancelled());
	}
}
