//! The one concrete [`GrpcChannel`] shipped by this crate: a thin wrapper
//! around `tonic::client::Grpc<tonic::transport::Channel>` using
//! [`PassthroughCodec`], modeled on tonic's own internal `Grpc::streaming`
//! dispatch and on `GrpcReferenceChannel` (agentgateway's equivalent
//! production adapter around a pooled `tower::Service`).

use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::Status;

use crate::backend::{BackendEvent, GrpcChannel, InboundEvents, OutboundFrames};
use crate::codec::PassthroughCodec;
use crate::context::{build_outgoing_request, InboundContext};

#[derive(Clone, Debug)]
pub struct TonicChannel {
	inner: Channel,
}

impl TonicChannel {
	pub fn new(inner: Channel) -> Self {
		Self { inner }
	}
}

#[async_trait::async_trait]
impl GrpcChannel for TonicChannel {
	async fn open_stream(
		&self,
		method: String,
		ctx: &InboundContext,
		outbound: OutboundFrames,
	) -> Result<InboundEvents, Status> {
		let path = PathAndQuery::try_from(method.as_str())
			.map_err(|e| Status::invalid_argument(format!("invalid method path {method}: {e}")))?;

		let mut grpc = tonic::client::Grpc::new(self.inner.clone());
		grpc
			.ready()
			.await
			.map_err(|e| Status::unavailable(format!("backend channel not ready: {e}")))?;

		let request = build_outgoing_request(ctx, outbound);
		let response = grpc.streaming(request, path, PassthroughCodec).await?;
		let (metadata, mut body, _extensions) = response.into_parts();

		// `Streaming<Bytes>` only exposes trailers after the message loop
		// drains to EOF, so a task is needed to turn its pull-based API into
		// the push-based BackendEvent stream the forwarders drive. This task
		// is detached from the call that spawned it, so it also races every
		// `body.message()` poll against `ctx`'s cancellation token — without
		// that, a client disconnect while this backend stays idle would
		// leave the task (and the sub-stream underneath it) running forever,
		// since nothing else would ever wake it (§5).
		let cancellation = ctx.cancellation();
		let (tx, rx) = mpsc::channel::<BackendEvent>(8);
		tokio::spawn(async move {
			if tx.send(BackendEvent::Headers(metadata)).await.is_err() {
				return;
			}
			loop {
				let message = tokio::select! {
					biased;
					_ = cancellation.cancelled() => return,
					message = body.message() => message,
				};
				match message {
					Ok(Some(frame)) => {
						if tx.send(BackendEvent::Message(frame)).await.is_err() {
							return;
						}
					},
					Ok(None) => break,
					Err(status) => {
						let _ = tx
							.send(BackendEvent::End {
								trailers: MetadataMap::new(),
								status,
							})
							.await;
						return;
					},
				}
			}
			let trailers = body.trailers().await.ok().flatten().unwrap_or_default();
			let _ = tx
				.send(BackendEvent::End {
					trailers,
					status: Status::ok(""),
				})
				.await;
		});

		Ok(Box::pin(ReceiverStream::new(rx)))
	}
}
