//! C6: fan a single RPC out to *N* backends and merge their responses into
//! one reply stream (§4.6). Two sub-policies, chosen by `streaming`:
//!
//! - unary: each backend gets the one client frame, the forwarder waits for
//!   all *N* outcomes, then concatenates `AppendInfo`/`BuildError` frames in
//!   director order into a single response message (§4.6.1).
//! - streamed: the client's frames are broadcast live to all backends; a
//!   merge task interleaves whatever arrives, decorating every frame before
//!   it reaches the client, and isolates per-backend failures (§4.6.2).
//!
//! A per-backend failure never cancels the inbound call's token — it is
//! isolation, not fatal (§5, §4.6.2, P6) — but every pump here still races
//! on that token via `tokio::select!`, and the merged stream this module
//! hands back is wrapped in [`crate::forwarder::with_cancellation`], so a
//! client disconnecting mid-call (unary: mid-`join_all`; streamed: mid-merge)
//! tears down every outstanding backend sub-stream instead of leaving idle
//! pumps running.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tokio_stream::StreamExt;
use tonic::metadata::{KeyAndValueRef, MetadataMap};
use tonic::{Code, Status};

use crate::backend::{Backend, BackendEvent, Frame, InboundEvents, OutboundFrames};
use crate::context::InboundContext;
use crate::forwarder::with_cancellation;

pub async fn run(
	backends: Vec<Arc<dyn Backend>>,
	ctx: InboundContext,
	method: String,
	streaming: bool,
	client_frames: OutboundFrames,
) -> Result<InboundEvents, Status> {
	if streaming {
		run_streamed(backends, ctx, method, client_frames).await
	} else {
		run_unary(backends, ctx, method, client_frames).await
	}
}

/// Union `from` into `into`, keyed last-writer-wins (§4.6.1, open question
/// (a)): callers merge in director order, so a later backend's value for a
/// colliding key replaces an earlier one.
fn merge_metadata(into: &mut MetadataMap, from: &MetadataMap) {
	for kv in from.iter() {
		match kv {
			KeyAndValueRef::Ascii(k, v) => {
				into.insert(k.clone(), v.clone());
			},
			KeyAndValueRef::Binary(k, v) => {
				into.insert_bin(k.clone(), v.clone());
			},
		}
	}
}

enum UnaryOutcome {
	Success {
		headers: MetadataMap,
		message: Frame,
		trailers: MetadataMap,
	},
	Failure(Status),
}

/// One backend's whole unary call, end to end. Per §5 a pump that fails does
/// not cancel the call's token here — a per-backend failure is isolated and
/// reported in-band by the caller (P6) — but `call_one_unary`'s own future
/// still carries a cancellation guard: if the *whole call* is abandoned
/// (client gone) while this backend is still mid-flight, `join_all` in
/// `run_unary` drops this future before it reaches its own return, the guard
/// fires still armed, and every sibling backend's pump — including ones
/// already idling inside `tonic_channel`'s spawned task — unblocks on the
/// same shared token.
async fn call_one_unary(
	backend: Arc<dyn Backend>,
	ctx: InboundContext,
	method: String,
	request: Option<Frame>,
) -> UnaryOutcome {
	let outbound: OutboundFrames = match request {
		Some(frame) => Box::pin(tokio_stream::once(frame)),
		None => Box::pin(tokio_stream::empty()),
	};

	let mut cancel_guard = ctx.cancel_guard();
	let cancellation = ctx.cancellation();

	let result = async {
		let (out_ctx, channel) = backend.get_connection(&ctx, &method).await?;
		let mut events = channel.open_stream(method.clone(), &out_ctx, outbound).await?;

		let mut headers = MetadataMap::new();
		let mut message = None;
		let mut trailers = MetadataMap::new();
		loop {
			tokio::select! {
				biased;
				_ = cancellation.cancelled() => {
					return Err(Status::cancelled("inbound call cancelled"));
				},
				event = events.next() => match event {
					Some(BackendEvent::Headers(h)) => headers = h,
					Some(BackendEvent::Message(m)) => message = Some(m),
					Some(BackendEvent::End { trailers: t, status }) => {
						if status.code() != Code::Ok {
							return Err(status);
						}
						trailers = t;
						break;
					},
					None => break,
				},
			}
		}
		let message =
			message.ok_or_else(|| Status::internal("backend ended without a response message"))?;
		Ok((headers, message, trailers))
	}
	.await;

	// Reached a normal return: this backend's own outcome, good or bad, must
	// never cancel the shared token (§5, isolation).
	cancel_guard.disarm();

	match result {
		Ok((headers, message, trailers)) => UnaryOutcome::Success {
			headers,
			message,
			trailers,
		},
		Err(status) => UnaryOutcome::Failure(status),
	}
}

async fn run_unary(
	backends: Vec<Arc<dyn Backend>>,
	ctx: InboundContext,
	method: String,
	mut client_frames: OutboundFrames,
) -> Result<InboundEvents, Status> {
	// A unary call carries exactly one client-supplied request message; every
	// backend receives the same frame.
	let request = client_frames.next().await;

	let outcomes = join_all(backends.iter().cloned().map(|backend| {
		call_one_unary(backend, ctx.clone(), method.clone(), request.clone())
	}))
	.await;

	let mut union_headers = MetadataMap::new();
	let mut union_trailers = MetadataMap::new();
	let mut body = BytesMut::new();

	for (backend, outcome) in backends.iter().zip(outcomes) {
		match outcome {
			UnaryOutcome::Success {
				headers,
				message,
				trailers,
			} => {
				merge_metadata(&mut union_headers, &headers);
				merge_metadata(&mut union_trailers, &trailers);
				body.put(backend.append_info(false, message)?);
			},
			UnaryOutcome::Failure(status) => {
				body.put(backend.build_error(false, &status)?);
			},
		}
	}

	let events = tokio_stream::once(BackendEvent::Headers(union_headers))
		.chain(tokio_stream::once(BackendEvent::Message(body.freeze())))
		.chain(tokio_stream::once(BackendEvent::End {
			trailers: union_trailers,
			status: Status::ok(""),
		}));
	Ok(with_cancellation(Box::pin(events), ctx))
}

/// What one backend's pump task reports to the merge task.
enum MergeEvent {
	Headers(MetadataMap),
	Message(Frame),
	/// The sub-stream ended in a non-OK status, or never opened at all.
	Failed(Status),
	/// The sub-stream ended `OK`, carrying its trailers.
	Done(MetadataMap),
}

async fn run_streamed(
	backends: Vec<Arc<dyn Backend>>,
	ctx: InboundContext,
	method: String,
	mut client_frames: OutboundFrames,
) -> Result<InboundEvents, Status> {
	let n = backends.len();

	let mut senders = Vec::with_capacity(n);
	let mut outbounds = Vec::with_capacity(n);
	for _ in 0..n {
		let (tx, rx) = mpsc::unbounded_channel::<Frame>();
		senders.push(tx);
		outbounds.push(Box::pin(UnboundedReceiverStream::new(rx)) as OutboundFrames);
	}

	// c2s broadcast: every client frame goes to every backend, in order;
	// dropping `senders` on client EOF half-closes every backend (§4.6.2).
	// Also stops pulling from `client_frames` once the call is cancelled, so
	// a slow or absent client body does not keep this task alive after every
	// backend has already been torn down.
	let broadcast_cancellation = ctx.cancellation();
	tokio::spawn(async move {
		loop {
			tokio::select! {
				biased;
				_ = broadcast_cancellation.cancelled() => return,
				frame = client_frames.next() => match frame {
					Some(frame) => {
						for tx in &senders {
							let _ = tx.send(frame.clone());
						}
					},
					None => return,
				},
			}
		}
	});

	// Bounded to roughly one outstanding frame per backend (§5,
	// "backpressure"), so a slow client throttles every backend rather than
	// letting a fast one buffer without limit.
	let (merge_tx, mut merge_rx) = mpsc::channel::<(usize, MergeEvent)>(n.max(1));

	for (i, (backend, outbound)) in backends.iter().cloned().zip(outbounds).enumerate() {
		let ctx = ctx.clone();
		let method = method.clone();
		let merge_tx = merge_tx.clone();
		let cancellation = ctx.cancellation();
		tokio::spawn(async move {
			let opened = async {
				let (out_ctx, channel) = backend.get_connection(&ctx, &method).await?;
				channel.open_stream(method.clone(), &out_ctx, outbound).await
			}
			.await;

			let mut events = match opened {
				Ok(events) => events,
				Err(status) => {
					// A per-backend connect failure is isolated (§4.6.2): it
					// reaches the client as an in-band error frame, not a
					// cancelled token.
					let _ = merge_tx.send((i, MergeEvent::Failed(status))).await;
					return;
				},
			};

			loop {
				let event = tokio::select! {
					biased;
					_ = cancellation.cancelled() => return,
					event = events.next() => event,
				};
				let forwarded = match event {
					Some(BackendEvent::Headers(h)) => merge_tx.send((i, MergeEvent::Headers(h))).await,
					Some(BackendEvent::Message(m)) => merge_tx.send((i, MergeEvent::Message(m))).await,
					Some(BackendEvent::End { trailers, status }) => {
						let outcome = if status.code() == Code::Ok {
							MergeEvent::Done(trailers)
						} else {
							MergeEvent::Failed(status)
						};
						let _ = merge_tx.send((i, outcome)).await;
						return;
					},
					None => {
						// Stream ended without an explicit `End` — treat as a
						// clean close.
						let _ = merge_tx.send((i, MergeEvent::Done(MetadataMap::new()))).await;
						return;
					},
				};
				if forwarded.is_err() {
					// merge task is gone; nothing more to do.
					return;
				}
			}
		});
	}
	drop(merge_tx);

	let (out_tx, out_rx) = mpsc::channel::<BackendEvent>(8);
	tokio::spawn(async move {
		let mut pending_headers: HashMap<usize, MetadataMap> = HashMap::new();
		let mut union_trailers = MetadataMap::new();
		let mut headers_flushed = false;
		let mut remaining = n;

		let flush_headers = |pending: &HashMap<usize, MetadataMap>| {
			let mut union = MetadataMap::new();
			for idx in 0..n {
				if let Some(h) = pending.get(&idx) {
					merge_metadata(&mut union, h);
				}
			}
			union
		};

		while let Some((i, event)) = merge_rx.recv().await {
			match event {
				MergeEvent::Headers(h) => {
					pending_headers.insert(i, h);
				},
				MergeEvent::Message(frame) => {
					if !headers_flushed {
						headers_flushed = true;
						if out_tx
							.send(BackendEvent::Headers(flush_headers(&pending_headers)))
							.await
							.is_err()
						{
							return;
						}
					}
					match backends[i].append_info(true, frame) {
						Ok(decorated) => {
							if out_tx.send(BackendEvent::Message(decorated)).await.is_err() {
								return;
							}
						},
						Err(status) => {
							tracing::warn!(backend = %backends[i], %status, "append_info failed, dropping frame");
						},
					}
				},
				MergeEvent::Failed(status) => {
					if !headers_flushed {
						headers_flushed = true;
						if out_tx
							.send(BackendEvent::Headers(flush_headers(&pending_headers)))
							.await
							.is_err()
						{
							return;
						}
					}
					match backends[i].build_error(true, &status) {
						Ok(frame) => {
							if out_tx.send(BackendEvent::Message(frame)).await.is_err() {
								return;
							}
						},
						Err(e) => {
							tracing::warn!(backend = %backends[i], status = %e, "build_error failed, dropping frame");
						},
					}
					remaining -= 1;
				},
				MergeEvent::Done(trailers) => {
					merge_metadata(&mut union_trailers, &trailers);
					remaining -= 1;
				},
			}
			if remaining == 0 {
				break;
			}
		}

		if !headers_flushed {
			let _ = out_tx
				.send(BackendEvent::Headers(flush_headers(&pending_headers)))
				.await;
		}
		let _ = out_tx
			.send(BackendEvent::End {
				trailers: union_trailers,
				status: Status::ok(""),
			})
			.await;
	});

	Ok(with_cancellation(Box::pin(ReceiverStream::new(out_rx)), ctx))
}
