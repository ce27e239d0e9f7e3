#![forbid(unsafe_code)]

pub mod attachments;
pub mod events;
pub mod framing;

pub use attachments::normalize_attachments;
pub use events::{
	ClientEnvelope, ClientEvent, ClientMsg, ErrorFrame, Hello, OutgoingMessage, ServerEnvelope, ServerEvent, ServerMsg,
	Welcome,
};
pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// ALPN identifier for the v1 control stream.
pub const ALPN: &[u8] = b"parley-v1";

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
