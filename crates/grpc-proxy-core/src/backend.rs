use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::Stream;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::context::InboundContext;

/// A frame pulled from (or pushed to) a backend sub-stream: the raw,
/// already-encoded wire payload handed to/from [`crate::codec::PassthroughCodec`].
pub type Frame = Bytes;

/// The client-to-backend half of a sub-stream: whatever the inbound call
/// produces, re-framed for the backend. Closing this stream half-closes the
/// backend sub-stream (§5, "client half-close propagates").
pub type OutboundFrames = Pin<Box<dyn Stream<Item = Frame> + Send + 'static>>;

/// One event read off a backend sub-stream, in the order a real HTTP/2
/// response arrives: headers exactly once, zero or more messages, then
/// exactly one `End` carrying trailers and the final status (§4.2, §4.6).
#[derive(Debug)]
pub enum BackendEvent {
	Headers(MetadataMap),
	Message(Frame),
	End {
		trailers: MetadataMap,
		status: Status,
	},
}

/// The event half of a sub-stream, as read back from a backend.
pub type InboundEvents = Pin<Box<dyn Stream<Item = BackendEvent> + Send + 'static>>;

/// A single open bidirectional sub-stream to one backend for one RPC. Both
/// forwarders (C5, C6) drive these directly; nothing above this trait knows
/// whether the transport underneath is a real `tonic::transport::Channel` or
/// an in-memory fake (see `tonic_channel` and the `forwarder` test fakes).
#[async_trait::async_trait]
pub trait GrpcChannel: Send + Sync + fmt::Debug {
	/// Open a sub-stream for `method` (fully qualified, e.g.
	/// `/pkg.Service/Method`), feeding it `outbound` as the client-to-backend
	/// frame stream, using `ctx` for outgoing metadata and deadline. Returns
	/// the backend's event stream. A connection-level failure (refused,
	/// resolved to nothing, TLS handshake failure, …) is reported here as an
	/// `Err(Status)` rather than a lazily-failing event stream, matching
	/// tonic's own `Grpc::streaming` contract (§4.2).
	async fn open_stream(
		&self,
		method: String,
		ctx: &InboundContext,
		outbound: OutboundFrames,
	) -> Result<InboundEvents, Status>;
}

/// One upstream target plus the message-shaping hooks the director's chosen
/// fan-out mode needs around it (§4.2).
///
/// A `Backend` is the thing a [`crate::director::Decision`] names; the
/// forwarders call `get_connection` once per RPC (one-to-one) or once per
/// selected backend (one-to-many) and then drive the returned channel
/// directly. `append_info`/`build_error` are only ever invoked by the
/// one-to-many forwarder (§4.2, §9): a one-to-one call relays backend frames
/// and the backend's own status completely unmodified.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + fmt::Debug + fmt::Display {
	/// Resolve this backend into an open channel for `method`, given the
	/// inbound call's context. Implementations typically return
	/// `ctx.clone()` unmodified — the default outgoing-metadata bridge in
	/// [`InboundContext::outgoing_metadata`] already does the right thing —
	/// but may return a context carrying backend-specific additions (e.g. an
	/// injected authorization header) instead. A connect failure becomes the
	/// `Status` surfaced to the client for this backend (§7, "connect
	/// failure").
	async fn get_connection(
		&self,
		ctx: &InboundContext,
		method: &str,
	) -> Result<(InboundContext, Arc<dyn GrpcChannel>), Status>;

	/// `AppendInfo(streaming, frame)`: decorate one frame already received
	/// from this backend with whatever per-backend information the deployment
	/// wants attached (§9) — e.g. a `server_id` field identifying which
	/// backend produced it. `streaming` distinguishes the two wire shapes
	/// this has to produce: for a streamed method each frame is one bare
	/// top-level message and extra fields are just concatenated
	/// ([`crate::frame::append_streaming`]); for a unary method the single
	/// frame is the outer embedded-message envelope and must be unwrapped,
	/// extended, and re-wrapped ([`crate::frame::rewrap_unary_envelope`]).
	/// The default implementation passes `frame` through unchanged, which is
	/// correct for a backend with nothing to add.
	fn append_info(&self, _streaming: bool, frame: Frame) -> Result<Frame, Status> {
		Ok(frame)
	}

	/// `BuildError(streaming, err)`: synthesize a frame representing `err` so
	/// one backend's failure can be reported as data alongside other
	/// backends' successful frames instead of failing the whole call (§7,
	/// open question (b); §9). Called for both fan-out shapes, distinguished
	/// by `streaming`: once per failed backend in the unary merge
	/// (`one_to_many::run_unary`), and once per failed backend's terminal
	/// frame in the streamed merge (`one_to_many::run_streamed`'s
	/// `MergeEvent::Failed` handling) — a streamed failure is not reported by
	/// simply ending the sub-stream, since every backend shares one merged
	/// response stream that must otherwise stay open.
	///
	/// Implementations for a unary method must return a complete outer
	/// envelope, not a bare element — use [`crate::frame::wrap_unary_envelope`]
	/// to build one, typically wrapping a single `AppendInfo`-shaped field
	/// that carries the failing backend's identity and message.
	fn build_error(&self, streaming: bool, err: &Status) -> Result<Frame, Status>;
}
