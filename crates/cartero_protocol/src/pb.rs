#![forbid(unsafe_code)]

use cartero_domain::ChatError;

/// Top-level frame payload. Exactly one message per frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
	/// Protocol version; v1 peers reject anything else.
	#[prost(uint32, tag = "1")]
	pub version: u32,

	/// Opaque client-chosen correlation id, echoed on direct replies.
	#[prost(string, tag = "2")]
	pub request_id: String,

	#[prost(
		oneof = "envelope::Msg",
		tags = "10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21"
	)]
	pub msg: Option<envelope::Msg>,
}

pub mod envelope {
	/// Envelope payload variants.
	#[derive(Clone, PartialEq, ::prost::Oneof)]
	pub enum Msg {
		#[prost(message, tag = "10")]
		Hello(super::Hello),
		#[prost(message, tag = "11")]
		Welcome(super::Welcome),
		#[prost(message, tag = "12")]
		Join(super::Join),
		#[prost(message, tag = "13")]
		Joined(super::Joined),
		#[prost(message, tag = "14")]
		Leave(super::Leave),
		#[prost(message, tag = "15")]
		Left(super::Left),
		#[prost(message, tag = "16")]
		Send(super::SendMessage),
		#[prost(message, tag = "17")]
		Message(super::MessageEvent),
		#[prost(message, tag = "18")]
		Error(super::Error),
		#[prost(message, tag = "19")]
		Ping(super::Ping),
		#[prost(message, tag = "20")]
		Pong(super::Pong),
		#[prost(message, tag = "21")]
		Lagged(super::Lagged),
	}
}

/// First client message on the control stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
	/// Free-form client name/version for logs.
	#[prost(string, tag = "1")]
	pub client_name: String,
}

/// Server reply to `Hello`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Welcome {
	#[prost(string, tag = "1")]
	pub server_name: String,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
	#[prost(uint32, tag = "3")]
	pub max_frame_bytes: u32,
}

/// Join (or create) the conversation with `counterpart_handle`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
	#[prost(string, tag = "1")]
	pub self_handle: String,
	#[prost(string, tag = "2")]
	pub counterpart_handle: String,
}

/// Sent to the caller only, after a successful join.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Joined {
	#[prost(int64, tag = "1")]
	pub conversation_id: i64,
}

/// Leave the current conversation room.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Leave {
	#[prost(int64, tag = "1")]
	pub conversation_id: i64,
}

/// Leave acknowledgment, to the caller only.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Left {
	#[prost(int64, tag = "1")]
	pub conversation_id: i64,
}

/// Persist a message and fan it out to the other room members.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessage {
	#[prost(int64, tag = "1")]
	pub conversation_id: i64,
	#[prost(string, tag = "2")]
	pub sender_handle: String,
	#[prost(string, tag = "3")]
	pub text: String,
}

/// A committed message, delivered to every room member except the sender.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageEvent {
	#[prost(int64, tag = "1")]
	pub conversation_id: i64,
	#[prost(string, tag = "2")]
	pub sender_handle: String,
	#[prost(string, tag = "3")]
	pub text: String,
	/// Server-assigned commit time.
	#[prost(int64, tag = "4")]
	pub timestamp_unix_ms: i64,
}

/// Delivered only to the session whose event failed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Error {
	/// Stable machine-readable code (`cartero_domain::ChatError::code`).
	#[prost(string, tag = "1")]
	pub code: String,
	#[prost(string, tag = "2")]
	pub message: String,
}

impl Error {
	/// Build a wire error from a core error.
	pub fn from_chat(err: &ChatError) -> Self {
		Self {
			code: err.code().to_string(),
			message: err.to_string(),
		}
	}
}

/// Keep-alive probe.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
	#[prost(int64, tag = "1")]
	pub client_time_unix_ms: i64,
	#[prost(int64, tag = "2")]
	pub server_time_unix_ms: i64,
}

/// Marks that fan-out events were dropped because this session read too slowly.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Lagged {
	#[prost(uint64, tag = "1")]
	pub dropped: u64,
	#[prost(string, tag = "2")]
	pub detail: String,
}
