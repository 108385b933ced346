#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Durable user identity assigned by the identity subsystem.
///
/// Opaque to the messaging core; never reused once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// User-facing handle, distinct from the durable [`UserId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(String);

impl Handle {
	/// Create a non-empty `Handle`; surrounding whitespace is trimmed.
	pub fn new(handle: impl Into<String>) -> Result<Self, ParseIdError> {
		let handle = handle.into();
		let trimmed = handle.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(trimmed.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Handle {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Handle::new(s)
	}
}

/// Store-assigned conversation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Store-assigned message identifier, monotonic per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Transient handle for one live connection. Process-local, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Canonical unordered pair of two distinct users.
///
/// The pair is normalized so `low < high`; the conversation store keys its
/// uniqueness constraint on this ordering, which is what makes concurrent
/// first-time creation from both sides collapse to a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
	low: UserId,
	high: UserId,
}

impl ConversationKey {
	/// Build a key from two user identities in either order.
	///
	/// Rejects `a == b`: a user has no conversation with themselves.
	pub fn new(a: UserId, b: UserId) -> Result<Self, ParseIdError> {
		if a == b {
			return Err(ParseIdError::InvalidFormat("conversation requires two distinct users".into()));
		}

		let (low, high) = if a < b { (a, b) } else { (b, a) };
		Ok(Self { low, high })
	}

	pub fn low(&self) -> UserId {
		self.low
	}

	pub fn high(&self) -> UserId {
		self.high
	}

	/// Whether `user` is one of the two participants.
	pub fn contains(&self, user: UserId) -> bool {
		self.low == user || self.high == user
	}
}

impl fmt::Display for ConversationKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{{},{}}}", self.low, self.high)
	}
}

/// Error taxonomy for the messaging core.
///
/// Every kind except `Conflict` is surfaced to the originating session as an
/// `Error` event; `Conflict` is resolved internally by re-querying after a
/// failed unique insert.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
	/// Unknown user handle or conversation.
	#[error("not found: {0}")]
	NotFound(String),

	/// Duplicate conversation creation race; retried internally.
	#[error("conflict: {0}")]
	Conflict(String),

	/// Backing store timed out or refused the connection.
	#[error("storage unavailable: {0}")]
	StorageUnavailable(String),

	/// Operation attempted against a room the session never joined.
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	/// Malformed inbound event, rejected before dispatch.
	#[error("invalid payload: {0}")]
	InvalidPayload(String),
}

impl ChatError {
	/// Stable wire code written into `Error` events.
	pub const fn code(&self) -> &'static str {
		match self {
			ChatError::NotFound(_) => "NOT_FOUND",
			ChatError::Conflict(_) => "CONFLICT",
			ChatError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
			ChatError::Unauthorized(_) => "UNAUTHORIZED",
			ChatError::InvalidPayload(_) => "INVALID_PAYLOAD",
		}
	}
}
