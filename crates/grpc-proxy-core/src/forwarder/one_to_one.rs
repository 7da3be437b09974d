//! C5: relay a single backend's sub-stream verbatim.
//!
//! One-to-one does no frame rewriting and no status translation (§4.2): the
//! backend's headers, messages, trailers and status are the response, byte
//! for byte. The only thing this forwarder adds is wiring the inbound call's
//! cancellation token (via [`crate::forwarder::with_cancellation`]) so a
//! client disconnect, or the backend itself failing, tears the sub-stream
//! down rather than leaving it idle forever (§5).

use std::sync::Arc;

use tonic::Status;

use crate::backend::{Backend, InboundEvents, OutboundFrames};
use crate::context::InboundContext;
use crate::forwarder::with_cancellation;

pub async fn run(
	backend: Arc<dyn Backend>,
	ctx: InboundContext,
	method: String,
	client_frames: OutboundFrames,
) -> Result<InboundEvents, Status> {
	let (out_ctx, channel) = match backend.get_connection(&ctx, &method).await {
		Ok(connected) => connected,
		Err(status) => {
			ctx.cancel();
			return Err(status);
		},
	};
	let events = match channel.open_stream(method, &out_ctx, client_frames).await {
		Ok(events) => events,
		Err(status) => {
			ctx.cancel();
			return Err(status);
		},
	};
	Ok(with_cancellation(events, ctx))
}
