#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{
	AUTH_FAILED_ID, DEFAULT_MAX_FRAME_SIZE, Direction, Frame, FrameType, FramingError, MIN_FRAME_LEN, decode_frame,
	encode_frame, encode_frame_into, frame_len_from_body_len, try_decode_frame_from_buffer,
};

/// Source RCON wire constants.
pub mod wire {
	/// `SERVERDATA_AUTH`
	pub const SERVERDATA_AUTH: i32 = 3;
	/// `SERVERDATA_AUTH_RESPONSE`
	pub const SERVERDATA_AUTH_RESPONSE: i32 = 2;
	/// `SERVERDATA_EXECCOMMAND`
	pub const SERVERDATA_EXECCOMMAND: i32 = 2;
	/// `SERVERDATA_RESPONSE_VALUE`
	pub const SERVERDATA_RESPONSE_VALUE: i32 = 0;
}
