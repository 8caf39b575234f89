#![forbid(unsafe_code)]

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::wire;

/// Default maximum declared frame length accepted by the decoder.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Smallest legal declared length: id + type + two NUL terminators.
pub const MIN_FRAME_LEN: usize = 10;

/// Sequence id the server answers with when the password is wrong.
pub const AUTH_FAILED_ID: i32 = -1;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("malformed frame: {0}")]
	MalformedFrame(&'static str),

	#[error("unknown frame type code {code} for {direction} frame")]
	UnknownFrameType {
		code: i32,
		direction: Direction,
	},

	#[error("frame body must not contain NUL bytes")]
	BodyContainsNul,
}

/// Which side produced a frame.
///
/// `AuthResponse` and `Command` share wire code 2, so the decoder needs to
/// know which way the bytes travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
	ClientToServer,
	ServerToClient,
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Direction::ClientToServer => f.write_str("client->server"),
			Direction::ServerToClient => f.write_str("server->client"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
	Auth,
	AuthResponse,
	Command,
	CommandResponse,
}

impl FrameType {
	pub const fn code(self) -> i32 {
		match self {
			FrameType::Auth => wire::SERVERDATA_AUTH,
			FrameType::AuthResponse => wire::SERVERDATA_AUTH_RESPONSE,
			FrameType::Command => wire::SERVERDATA_EXECCOMMAND,
			FrameType::CommandResponse => wire::SERVERDATA_RESPONSE_VALUE,
		}
	}

	pub const fn direction(self) -> Direction {
		match self {
			FrameType::Auth | FrameType::Command => Direction::ClientToServer,
			FrameType::AuthResponse | FrameType::CommandResponse => Direction::ServerToClient,
		}
	}

	pub fn from_code(code: i32, direction: Direction) -> Result<Self, FramingError> {
		match (direction, code) {
			(Direction::ClientToServer, wire::SERVERDATA_AUTH) => Ok(FrameType::Auth),
			(Direction::ClientToServer, wire::SERVERDATA_EXECCOMMAND) => Ok(FrameType::Command),
			(Direction::ServerToClient, wire::SERVERDATA_AUTH_RESPONSE) => Ok(FrameType::AuthResponse),
			(Direction::ServerToClient, wire::SERVERDATA_RESPONSE_VALUE) => Ok(FrameType::CommandResponse),
			(direction, code) => Err(FramingError::UnknownFrameType { code, direction }),
		}
	}
}

/// One RCON request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub id: i32,
	pub frame_type: FrameType,
	pub body: String,
}

impl Frame {
	pub fn new(id: i32, frame_type: FrameType, body: impl Into<String>) -> Self {
		Self {
			id,
			frame_type,
			body: body.into(),
		}
	}

	pub fn auth(id: i32, password: impl Into<String>) -> Self {
		Self::new(id, FrameType::Auth, password)
	}

	pub fn command(id: i32, command: impl Into<String>) -> Self {
		Self::new(id, FrameType::Command, command)
	}

	pub fn command_response(id: i32, body: impl Into<String>) -> Self {
		Self::new(id, FrameType::CommandResponse, body)
	}

	pub fn auth_response(id: i32) -> Self {
		Self::new(id, FrameType::AuthResponse, String::new())
	}

	/// True for an `AuthResponse` carrying the failure sentinel.
	pub fn is_auth_failure(&self) -> bool {
		self.frame_type == FrameType::AuthResponse && self.id == AUTH_FAILED_ID
	}

	/// Value written into the length prefix for this frame.
	pub fn declared_len(&self) -> usize {
		MIN_FRAME_LEN + self.body.len()
	}
}

/// Encode a frame into a new buffer.
pub fn encode_frame(frame: &Frame, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut out = BytesMut::new();
	encode_frame_into(&mut out, frame, max_frame_size)?;
	Ok(out.to_vec())
}

/// Append an encoded frame into the provided buffer.
pub fn encode_frame_into(buf: &mut BytesMut, frame: &Frame, max_frame_size: usize) -> Result<(), FramingError> {
	let body = frame.body.as_bytes();
	if body.contains(&0) {
		return Err(FramingError::BodyContainsNul);
	}

	let declared = frame.declared_len();
	if declared > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: declared,
			max: max_frame_size,
		});
	}

	buf.reserve(4 + declared);
	buf.put_i32_le(declared as i32);
	buf.put_i32_le(frame.id);
	buf.put_i32_le(frame.frame_type.code());
	buf.put_slice(body);
	buf.put_u8(0);
	buf.put_u8(0);
	Ok(())
}

/// Compute total frame length (prefix + declared length) for a body.
#[inline]
pub fn frame_len_from_body_len(body_len: usize) -> usize {
	4 + MIN_FRAME_LEN + body_len
}

/// Decode exactly one frame occupying all of `src`.
pub fn decode_frame(src: &[u8], direction: Direction, max_frame_size: usize) -> Result<Frame, FramingError> {
	let declared = read_declared_len(src, max_frame_size)?;

	if src.len() != 4 + declared {
		return Err(FramingError::MalformedFrame(
			"declared length does not match received byte count",
		));
	}

	parse_payload(&src[4..], direction)
}

/// Try to decode a single frame from a growable buffer.
///
/// Returns `Ok(None)` until a whole frame is buffered; consumed bytes are
/// split off the front of `buf`.
pub fn try_decode_frame_from_buffer(
	buf: &mut BytesMut,
	direction: Direction,
	max_frame_size: usize,
) -> Result<Option<Frame>, FramingError> {
	if buf.len() < 4 {
		return Ok(None);
	}

	let declared = read_declared_len(buf, max_frame_size)?;
	let need = 4 + declared;
	if buf.len() < need {
		return Ok(None);
	}

	let mut frame = buf.split_to(need);
	frame.advance(4);
	parse_payload(&frame, direction).map(Some)
}

fn read_declared_len(src: &[u8], max_frame_size: usize) -> Result<usize, FramingError> {
	if src.len() < 4 {
		return Err(FramingError::InsufficientData {
			need: 4,
			have: src.len(),
		});
	}

	let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
	if declared < MIN_FRAME_LEN as i32 {
		return Err(FramingError::MalformedFrame("declared length below minimum"));
	}

	let declared = declared as usize;
	if declared > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: declared,
			max: max_frame_size,
		});
	}

	Ok(declared)
}

fn parse_payload(payload: &[u8], direction: Direction) -> Result<Frame, FramingError> {
	if payload.len() < MIN_FRAME_LEN {
		return Err(FramingError::MalformedFrame("frame shorter than header and terminators"));
	}

	let id = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
	let code = i32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);

	let rest = &payload[8..];
	let Some(body) = rest.strip_suffix(&[0, 0]) else {
		return Err(FramingError::MalformedFrame("missing terminating NUL pair"));
	};

	let frame_type = FrameType::from_code(code, direction)?;

	Ok(Frame {
		id,
		frame_type,
		body: String::from_utf8_lossy(body).into_owned(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encodes_known_layout() {
		let frame = Frame::command(7, "status");
		let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		assert_eq!(&bytes[0..4], &16i32.to_le_bytes());
		assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
		assert_eq!(&bytes[8..12], &2i32.to_le_bytes());
		assert_eq!(&bytes[12..18], b"status");
		assert_eq!(&bytes[18..], &[0, 0]);
		assert_eq!(bytes.len(), frame_len_from_body_len(6));
	}

	#[test]
	fn shared_code_resolves_by_direction() {
		assert_eq!(
			FrameType::from_code(2, Direction::ClientToServer).unwrap(),
			FrameType::Command
		);
		assert_eq!(
			FrameType::from_code(2, Direction::ServerToClient).unwrap(),
			FrameType::AuthResponse
		);
		assert!(matches!(
			FrameType::from_code(3, Direction::ServerToClient),
			Err(FramingError::UnknownFrameType { code: 3, .. })
		));
	}

	#[test]
	fn auth_failure_sentinel_roundtrips() {
		let frame = Frame::auth_response(AUTH_FAILED_ID);
		let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let decoded = decode_frame(&bytes, Direction::ServerToClient, DEFAULT_MAX_FRAME_SIZE).expect("decode");
		assert!(decoded.is_auth_failure());
		assert_eq!(decoded, frame);
	}

	#[test]
	fn decode_rejects_length_mismatch() {
		let mut bytes = encode_frame(&Frame::command_response(1, "hi"), DEFAULT_MAX_FRAME_SIZE).expect("encode");
		bytes.push(0);

		let err = decode_frame(&bytes, Direction::ServerToClient, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::MalformedFrame(_)), "unexpected error: {err:?}");
	}

	#[test]
	fn decode_rejects_missing_terminators() {
		let mut bytes = encode_frame(&Frame::command_response(1, "hi"), DEFAULT_MAX_FRAME_SIZE).expect("encode");
		let last = bytes.len() - 1;
		bytes[last] = b'!';

		let err = decode_frame(&bytes, Direction::ServerToClient, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::MalformedFrame(reason) => assert!(reason.contains("NUL")),
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn encode_rejects_embedded_nul() {
		let err = encode_frame(&Frame::command(1, "say a\0b"), DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::BodyContainsNul));
	}

	#[test]
	fn buffer_decode_is_incremental() {
		let frame = Frame::command_response(42, "hostname: test");
		let bytes = encode_frame(&frame, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let mut buf = BytesMut::new();
		buf.extend_from_slice(&bytes[..3]);
		assert!(
			try_decode_frame_from_buffer(&mut buf, Direction::ServerToClient, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&bytes[3..12]);
		assert!(
			try_decode_frame_from_buffer(&mut buf, Direction::ServerToClient, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&bytes[12..]);
		let decoded = try_decode_frame_from_buffer(&mut buf, Direction::ServerToClient, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("some");
		assert_eq!(decoded, frame);
		assert!(buf.is_empty());
	}

	#[test]
	fn buffer_decode_rejects_undersized_prefix() {
		let mut buf = BytesMut::new();
		buf.extend_from_slice(&4i32.to_le_bytes());
		let err = try_decode_frame_from_buffer(&mut buf, Direction::ServerToClient, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		assert!(matches!(err, FramingError::MalformedFrame(_)));
	}
}
