//! Schema-agnostic frame rewriting primitives.
//!
//! The core never parses a message body. The one narrow exception (§3, §9)
//! is decorating a unary one-to-many response: the outer embedded-message
//! envelope (protobuf wire tag field=1, length-delimited) has to be
//! re-wrapped so its length covers appended fields. This module supplies the
//! varint/tag primitives a [`crate::backend::Backend`] implementation needs
//! to do that; it does not itself know what the appended fields mean — that
//! contract belongs to the backend (§9, "user-provided hook per backend, not
//! generic reflection").

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

const FIELD_ONE_LENGTH_DELIMITED_TAG: u8 = 0x0A; // (field_number=1 << 3) | wire_type=2

/// Decode a protobuf-style base-128 varint from the front of `buf`. Returns
/// the value and the number of bytes consumed, or `None` if `buf` ends
/// before a terminating byte (MSB clear) is found.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
	let mut value: u64 = 0;
	for (i, &byte) in buf.iter().enumerate().take(10) {
		value |= u64::from(byte & 0x7F) << (7 * i);
		if byte & 0x80 == 0 {
			return Some((value, i + 1));
		}
	}
	None
}

/// Encode `value` as a protobuf-style base-128 varint, appending it to `out`.
pub fn write_varint(mut value: u64, out: &mut impl BufMut) {
	loop {
		let byte = (value & 0x7F) as u8;
		value >>= 7;
		if value == 0 {
			out.put_u8(byte);
			break;
		}
		out.put_u8(byte | 0x80);
	}
}

/// Wrap `value` as a length-delimited protobuf field with the given field
/// number, suitable for use as one of the `extra_fields` passed to
/// [`append_streaming`] or [`rewrap_unary_envelope`].
pub fn encode_bytes_field(field_number: u32, value: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(value.len() + 6);
	write_varint((u64::from(field_number) << 3) | 2, &mut out);
	write_varint(value.len() as u64, &mut out);
	out.put_slice(value);
	out.freeze()
}

/// Wrap `value` as a length-delimited (UTF-8) protobuf string field.
pub fn encode_string_field(field_number: u32, value: &str) -> Bytes {
	encode_bytes_field(field_number, value.as_bytes())
}

/// `AppendInfo(streaming=true, frame)`: bare messages are just concatenated
/// with whatever additional encoded fields the backend wants to append.
/// Order matters for repeated-field semantics but concatenation at the byte
/// level is exactly what protobuf's self-delimiting wire format allows.
pub fn append_streaming(frame: &[u8], extra_fields: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(frame.len() + extra_fields.len());
	out.put_slice(frame);
	out.put_slice(extra_fields);
	out.freeze()
}

/// `AppendInfo(streaming=false, frame)`: strip the outer embedded-message
/// envelope (tag field=1, length-delimited), append `extra_fields` to the
/// inner payload, and re-wrap with a recomputed length.
///
/// This assumes `frame` is exactly one top-level field: tag byte `0x0A`,
/// a varint length, then that many payload bytes. That is the contract
/// §9 places on the director/backend pair, not a generic protobuf decode.
pub fn rewrap_unary_envelope(frame: &[u8], extra_fields: &[u8]) -> Result<Bytes, Error> {
	let Some(&tag) = frame.first() else {
		return Err(Error::MalformedEnvelope("empty frame"));
	};
	if tag != FIELD_ONE_LENGTH_DELIMITED_TAG {
		return Err(Error::MalformedEnvelope(
			"expected outer field 1, length-delimited",
		));
	}
	let (len, len_bytes) = read_varint(&frame[1..])
		.ok_or(Error::MalformedEnvelope("truncated envelope length"))?;
	let payload_start = 1 + len_bytes;
	let payload_end = payload_start
		.checked_add(len as usize)
		.ok_or(Error::MalformedEnvelope("envelope length overflow"))?;
	if payload_end > frame.len() {
		return Err(Error::MalformedEnvelope("envelope length exceeds frame"));
	}
	let payload = &frame[payload_start..payload_end];
	let new_len = payload.len() + extra_fields.len();

	let mut out = BytesMut::with_capacity(new_len + 6);
	out.put_u8(FIELD_ONE_LENGTH_DELIMITED_TAG);
	write_varint(new_len as u64, &mut out);
	out.put_slice(payload);
	out.put_slice(extra_fields);
	Ok(out.freeze())
}

/// Build a complete unary envelope frame from scratch: used by
/// `BuildError(streaming=false, …)` implementations, which must emit a full
/// envelope and not a bare element (§9, open question (b)).
pub fn wrap_unary_envelope(payload: &[u8]) -> Bytes {
	let mut out = BytesMut::with_capacity(payload.len() + 6);
	out.put_u8(FIELD_ONE_LENGTH_DELIMITED_TAG);
	write_varint(payload.len() as u64, &mut out);
	out.put_slice(payload);
	out.freeze()
}
