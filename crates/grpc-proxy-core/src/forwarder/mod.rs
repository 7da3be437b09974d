//! C5/C6: drive a director's [`crate::director::Decision`] to completion and
//! produce the single event stream the registration layer (C4) relays back
//! to the original caller.

pub mod one_to_many;
pub mod one_to_one;

use std::sync::Arc;

use tokio_stream::StreamExt;
use tonic::{Code, Status};

use crate::backend::{BackendEvent, InboundEvents, OutboundFrames};
use crate::context::InboundContext;
use crate::director::{Decision, Director, Mode};
use crate::error::Error;

/// Run the director, then dispatch to the matching forwarder. This is the one
/// entry point the registration layer (C4) needs: it never has to know which
/// mode was chosen.
pub async fn forward(
	director: &dyn Director,
	ctx: InboundContext,
	method: String,
	streaming: bool,
	client_frames: OutboundFrames,
) -> Result<InboundEvents, Status> {
	let Decision { mode, backends } = director.direct(&ctx, &method).await?;
	match mode {
		Mode::One2One => {
			let [backend]: [Arc<dyn crate::backend::Backend>; 1] = backends
				.try_into()
				.map_err(|backends: Vec<_>| Error::One2OneBackendCount(backends.len()))?;
			one_to_one::run(backend, ctx, method, client_frames).await
		},
		Mode::One2Many => {
			if backends.is_empty() {
				return Err(Error::One2ManyNoBackends.into());
			}
			one_to_many::run(backends, ctx, method, streaming, client_frames).await
		},
	}
}

/// Wrap a backend event stream with `ctx`'s cancellation token (§5): the
/// registration layer (C4) polls the stream it gets back from `forward`
/// until the client goes away, and dropping that poll drops everything
/// nested inside it, including this wrapper's generator state. That is
/// exactly the signal a long-idle backend pump (e.g. the spawned task in
/// [`crate::tonic_channel`] blocked on the next inbound frame) cannot see on
/// its own, since it is a detached `tokio::spawn`, not a child of this
/// stream. Three things fall out of wiring the token in here:
///
/// - a client disconnect (this stream dropped before EOF) cancels the
///   token, unblocking every sibling pump racing on `cancelled()`;
/// - a pump that itself reaches a non-OK terminal status does the same,
///   rather than only the client-visible stream closing;
/// - once cancelled by any means, this stream stops polling its source
///   instead of waiting on a backend nothing is listening to anymore.
pub(crate) fn with_cancellation(mut events: InboundEvents, ctx: InboundContext) -> InboundEvents {
	Box::pin(async_stream::stream! {
		let mut cancel_guard = ctx.cancel_guard();
		let cancellation = ctx.cancellation();
		loop {
			tokio::select! {
				biased;
				_ = cancellation.cancelled() => return,
				next = events.next() => match next {
					Some(BackendEvent::End { trailers, status }) => {
						if status.code() == Code::Ok {
							cancel_guard.disarm();
						}
						yield BackendEvent::End { trailers, status };
						return;
					},
					Some(event) => yield event,
					None => {
						cancel_guard.disarm();
						return;
					},
				},
			}
		}
	})
}
