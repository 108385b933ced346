#![forbid(unsafe_code)]

use std::sync::Arc;

use cartero_domain::{ChatError, ConversationId, ConversationKey, Handle};
use cartero_protocol::pb;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::server::conversations::ConversationStore;
use crate::server::identity::IdentityResolver;
use crate::server::messages::MessageStore;
use crate::server::registry::{RoomItem, RoomRegistry};
use crate::server::session::Session;

/// Tunables applied to every session.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
	/// Longest accepted message body, in characters.
	pub max_message_chars: usize,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self { max_message_chars: 4096 }
	}
}

/// Outcome of a successful join.
#[derive(Debug)]
pub struct JoinOutcome {
	pub conversation: ConversationId,
	/// Live event stream for the joined room.
	pub events: mpsc::Receiver<RoomItem>,
	/// Room implicitly left to honor the one-room-per-session rule.
	pub left: Option<ConversationId>,
}

/// The realtime gateway: every conversation event a session can trigger
/// passes through here, regardless of which transport carried it.
pub struct Gateway {
	identity: Arc<dyn IdentityResolver>,
	conversations: Arc<dyn ConversationStore>,
	messages: Arc<dyn MessageStore>,
	registry: RoomRegistry,
	settings: GatewaySettings,
}

impl Gateway {
	pub fn new(
		identity: Arc<dyn IdentityResolver>,
		conversations: Arc<dyn ConversationStore>,
		messages: Arc<dyn MessageStore>,
		registry: RoomRegistry,
		settings: GatewaySettings,
	) -> Self {
		Self {
			identity,
			conversations,
			messages,
			registry,
			settings,
		}
	}

	pub fn registry(&self) -> &RoomRegistry {
		&self.registry
	}

	/// Join (or create) the conversation between the two named users.
	///
	/// On failure the session keeps its previous state; the implicit leave
	/// only happens once the new room is fully resolved.
	pub async fn join(&self, session: &mut Session, join: pb::Join) -> Result<JoinOutcome, ChatError> {
		let self_handle = Handle::new(join.self_handle.as_str())
			.map_err(|e| ChatError::InvalidPayload(format!("self_handle: {e}")))?;
		let counterpart_handle = Handle::new(join.counterpart_handle.as_str())
			.map_err(|e| ChatError::InvalidPayload(format!("counterpart_handle: {e}")))?;

		let self_user = self.identity.resolve(&self_handle).await?;
		let counterpart_user = self.identity.resolve(&counterpart_handle).await?;

		let key = ConversationKey::new(self_user, counterpart_user)
			.map_err(|e| ChatError::InvalidPayload(e.to_string()))?;
		let conversation = self.conversations.get_or_create(key).await?;

		let events = self.registry.subscribe(conversation, session.id()).await;
		let left = session.enter_room(self_user, self_handle.clone(), conversation);
		if let Some(previous) = left {
			self.registry.unsubscribe(previous, session.id()).await;
			debug!(session = %session.id(), %previous, "implicitly left previous room");
		}

		info!(
			session = %session.id(),
			%conversation,
			handle = self_handle.as_str(),
			counterpart = counterpart_handle.as_str(),
			"joined conversation"
		);
		metrics::counter!("cartero_server_joins_total").increment(1);

		Ok(JoinOutcome {
			conversation,
			events,
			left,
		})
	}

	/// Leave a conversation room. Acknowledged even when the session is not
	/// in that room.
	pub async fn leave(&self, session: &mut Session, leave: pb::Leave) -> pb::Left {
		let conversation = ConversationId(leave.conversation_id);
		if session.leave_room(conversation) {
			self.registry.unsubscribe(conversation, session.id()).await;
			info!(session = %session.id(), %conversation, "left conversation");
			metrics::counter!("cartero_server_leaves_total").increment(1);
		} else {
			debug!(session = %session.id(), %conversation, "leave for room the session is not in");
		}

		pb::Left {
			conversation_id: leave.conversation_id,
		}
	}

	/// Persist a message, then fan it out to the other room members.
	///
	/// Fan-out happens only after the store commit; a storage failure means
	/// nobody sees the message.
	pub async fn send(&self, session: &Session, send: pb::SendMessage) -> Result<pb::MessageEvent, ChatError> {
		let conversation = ConversationId(send.conversation_id);
		let (sender, sender_handle) = session.authorize_send(conversation)?;

		let text = send.text.as_str();
		if text.trim().is_empty() {
			return Err(ChatError::InvalidPayload("empty message text".to_string()));
		}
		if text.chars().count() > self.settings.max_message_chars {
			return Err(ChatError::InvalidPayload(format!(
				"message exceeds {} characters",
				self.settings.max_message_chars
			)));
		}

		let stored = self.messages.append(conversation, sender, text).await?;

		let event = pb::MessageEvent {
			conversation_id: stored.conversation.0,
			sender_handle: sender_handle.as_str().to_string(),
			text: stored.text.clone(),
			timestamp_unix_ms: stored.timestamp_unix_ms,
		};
		self.registry.publish(conversation, session.id(), event.clone()).await;

		debug!(
			session = %session.id(),
			%conversation,
			message = %stored.id,
			"message committed and fanned out"
		);
		metrics::counter!("cartero_server_messages_sent_total").increment(1);

		Ok(event)
	}

	/// Drop every room membership for a closing session. Safe to call more
	/// than once.
	pub async fn disconnect(&self, session: &Session) {
		self.registry.unsubscribe_all(session.id()).await;
		debug!(session = %session.id(), "session disconnected, memberships dropped");
	}
}
