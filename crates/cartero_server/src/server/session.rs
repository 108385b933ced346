#![forbid(unsafe_code)]

use cartero_domain::{ChatError, ConversationId, Handle, SessionId, UserId};

/// Where a session sits in the gateway state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	/// Handshake done, not in any room.
	Connected,
	/// Joined exactly one conversation room.
	InRoom(ConversationId),
}

/// Per-connection session bookkeeping.
///
/// A session holds at most one room at a time; joining another room
/// implicitly leaves the current one.
#[derive(Debug)]
pub struct Session {
	id: SessionId,
	identity: Option<(UserId, Handle)>,
	state: SessionState,
}

impl Session {
	pub fn new(id: SessionId) -> Self {
		Self {
			id,
			identity: None,
			state: SessionState::Connected,
		}
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn current_room(&self) -> Option<ConversationId> {
		match self.state {
			SessionState::Connected => None,
			SessionState::InRoom(conversation) => Some(conversation),
		}
	}

	/// The handle this session last joined with, if any.
	pub fn handle(&self) -> Option<&Handle> {
		self.identity.as_ref().map(|(_, handle)| handle)
	}

	/// Move the session into `conversation`, recording the resolved identity
	/// it joined as. Returns the room implicitly left, if any.
	pub fn enter_room(&mut self, user: UserId, handle: Handle, conversation: ConversationId) -> Option<ConversationId> {
		let previous = match self.state {
			SessionState::InRoom(prev) if prev != conversation => Some(prev),
			_ => None,
		};

		self.identity = Some((user, handle));
		self.state = SessionState::InRoom(conversation);
		previous
	}

	/// Leave `conversation` if the session is actually in it.
	///
	/// Returns `true` when a transition happened; leaving a room the session
	/// is not in is a no-op, not an error.
	pub fn leave_room(&mut self, conversation: ConversationId) -> bool {
		match self.state {
			SessionState::InRoom(current) if current == conversation => {
				self.state = SessionState::Connected;
				true
			}
			_ => false,
		}
	}

	/// Authorize a send against `conversation`.
	///
	/// Only the room the session currently occupies is sendable; everything
	/// else is `Unauthorized`, including rooms it left moments ago.
	pub fn authorize_send(&self, conversation: ConversationId) -> Result<(UserId, &Handle), ChatError> {
		match (&self.state, self.identity.as_ref()) {
			(SessionState::InRoom(current), Some((user, handle))) if *current == conversation => Ok((*user, handle)),
			_ => Err(ChatError::Unauthorized(format!(
				"session {} is not in conversation {}",
				self.id, conversation
			))),
		}
	}
}
