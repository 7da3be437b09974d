//! In-memory [`crate::backend::Backend`]/[`crate::backend::GrpcChannel`] fakes
//! used by forwarder tests. No networking, no tonic transport — just enough
//! to drive the C5/C6 state machines deterministically.

#![cfg(test)]

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use tokio_stream::StreamExt;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::backend::{Backend, BackendEvent, Frame, GrpcChannel, InboundEvents, OutboundFrames};
use crate::context::InboundContext;
use crate::frame;

pub fn empty_outbound() -> OutboundFrames {
	Box::pin(tokio_stream::empty())
}

pub fn outbound_from(frames: Vec<Bytes>) -> OutboundFrames {
	Box::pin(tokio_stream::iter(frames))
}

/// A scripted backend sub-stream: replays a fixed headers/messages/trailers
/// script regardless of what it is asked for, and (optionally) records every
/// frame the caller sent it.
#[derive(Clone)]
pub struct FakeChannel {
	headers: MetadataMap,
	messages: Vec<Bytes>,
	trailers: MetadataMap,
	status: Status,
	received: Arc<Mutex<Vec<Bytes>>>,
}

impl fmt::Debug for FakeChannel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FakeChannel").finish_non_exhaustive()
	}
}

impl FakeChannel {
	pub fn scripted(
		headers: MetadataMap,
		messages: Vec<Bytes>,
		trailers: MetadataMap,
		status: Status,
	) -> Self {
		Self {
			headers,
			messages,
			trailers,
			status,
			received: Arc::new(Mutex::new(Vec::new())),
		}
	}

	/// What the caller sent down the `OutboundFrames` half, in arrival order.
	/// Only meaningful after the returned event stream has been fully drained,
	/// since draining the outbound side happens concurrently with that.
	pub fn received(&self) -> Vec<Bytes> {
		self.received.lock().unwrap().clone()
	}
}

#[async_trait::async_trait]
impl GrpcChannel for FakeChannel {
	async fn open_stream(
		&self,
		_method: String,
		_ctx: &InboundContext,
		mut outbound: OutboundFrames,
	) -> Result<InboundEvents, Status> {
		let received = self.received.clone();
		tokio::spawn(async move {
			while let Some(frame) = outbound.next().await {
				received.lock().unwrap().push(frame);
			}
		});

		let headers = self.headers.clone();
		let messages = self.messages.clone();
		let trailers = self.trailers.clone();
		let status = self.status.clone();

		let events = tokio_stream::once(BackendEvent::Headers(headers))
			.chain(tokio_stream::iter(
				messages.into_iter().map(BackendEvent::Message),
			))
			.chain(tokio_stream::once(BackendEvent::End { trailers, status }));
		Ok(Box::pin(events))
	}
}

/// A backend identified by `id`, backed either by a [`FakeChannel`] or a
/// fixed connect failure. `append_info`/`build_error` tag frames with `id` in
/// field 15/16 so one-to-many merge tests can assert ordering by backend.
#[derive(Debug)]
pub struct FakeBackend {
	id: String,
	channel: Result<FakeChannel, Status>,
}

impl FakeBackend {
	pub fn new(id: impl Into<String>, channel: FakeChannel) -> Self {
		Self {
			id: id.into(),
			channel: Ok(channel),
		}
	}

	pub fn failing(id: impl Into<String>, status: Status) -> Self {
		Self {
			id: id.into(),
			channel: Err(status),
		}
	}
}

impl fmt::Display for FakeBackend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "fake-backend:{}", self.id)
	}
}

#[async_trait::async_trait]
impl Backend for FakeBackend {
	async fn get_connection(
		&self,
		ctx: &InboundContext,
		_method: &str,
	) -> Result<(InboundContext, Arc<dyn GrpcChannel>), Status> {
		match &self.channel {
			Ok(channel) => Ok((ctx.clone(), Arc::new(channel.clone()) as Arc<dyn GrpcChannel>)),
			Err(status) => Err(status.clone()),
		}
	}

	fn append_info(&self, streaming: bool, frame: Frame) -> Result<Frame, Status> {
		let extra = frame::encode_string_field(15, &self.id);
		if streaming {
			Ok(frame::append_streaming(&frame, &extra))
		} else {
			frame::rewrap_unary_envelope(&frame, &extra).map_err(Into::into)
		}
	}

	fn build_error(&self, streaming: bool, err: &Status) -> Result<Frame, Status> {
		let id_field = frame::encode_string_field(15, &self.id);
		let msg_field = frame::encode_string_field(16, err.message());
		let mut payload = BytesMut::with_capacity(id_field.len() + msg_field.len());
		payload.put(id_field);
		payload.put(msg_field);
		if streaming {
			Ok(payload.freeze())
		} else {
			Ok(frame::wrap_unary_envelope(&payload))
		}
	}
}
