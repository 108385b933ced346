#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, try_decode_frame_from_buffer};

/// Wire message types (`cartero.v1`).
///
/// Maintained by hand with prost derives so builds do not need `protoc`;
/// field tags are frozen once released.
pub mod pb;

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
