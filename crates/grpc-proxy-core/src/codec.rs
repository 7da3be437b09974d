use bytes::{Buf, BufMut};
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// Name advertised by [`PassthroughCodec`] on the wire's `grpc-encoding`-adjacent
/// negotiation. Deliberately not `"proto"`: a host framework that keys codec
/// selection off the registered name must never accidentally hand a real,
/// schema-aware endpoint our raw-byte codec, and vice versa. See §4.1.
pub const CODEC_NAME: &str = "grpc-proxy-passthrough";

/// A codec that does not know, or care, what message type it is carrying.
///
/// `Marshal` of an already-encoded frame returns it unchanged; `Unmarshal`
/// copies the wire payload verbatim into a [`bytes::Bytes`]. This is what
/// lets the proxy relay frames for services it has no `.proto` for: every
/// backend call and every inbound call handler in this crate is opened with
/// this codec, never the schema-aware default.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughCodec;

impl Codec for PassthroughCodec {
	type Encode = bytes::Bytes;
	type Decode = bytes::Bytes;
	type Encoder = PassthroughEncoder;
	type Decoder = PassthroughDecoder;

	fn encoder(&mut self) -> Self::Encoder {
		PassthroughEncoder
	}

	fn decoder(&mut self) -> Self::Decoder {
		PassthroughDecoder
	}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughEncoder;

impl Encoder for PassthroughEncoder {
	type Item = bytes::Bytes;
	type Error = Status;

	fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
		dst.reserve(item.len());
		dst.put(item);
		Ok(())
	}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughDecoder;

impl Decoder for PassthroughDecoder {
	type Item = bytes::Bytes;
	type Error = Status;

	fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
		if !src.has_remaining() {
			return Ok(None);
		}
		let len = src.remaining();
		Ok(Some(src.copy_to_bytes(len)))
	}
}
