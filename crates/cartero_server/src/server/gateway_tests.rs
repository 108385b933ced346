#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cartero_domain::{ChatError, ConversationId, Handle, SessionId, UserId};
use cartero_protocol::pb;
use tokio::time::timeout;

use crate::server::conversations::MemoryConversationStore;
use crate::server::gateway::{Gateway, GatewaySettings};
use crate::server::identity::MemoryIdentityResolver;
use crate::server::messages::{MemoryMessageStore, MessageStore, StoredMessage};
use crate::server::registry::{RegistryConfig, RoomItem, RoomRegistry};
use crate::server::session::{Session, SessionState};

struct Fixture {
	gateway: Gateway,
	messages: Arc<MemoryMessageStore>,
}

async fn fixture_with_users(handles: &[&str]) -> Fixture {
	let identity = Arc::new(MemoryIdentityResolver::new());
	for h in handles {
		identity.register(&Handle::new(*h).expect("valid handle")).await;
	}

	let messages = Arc::new(MemoryMessageStore::new());
	let gateway = Gateway::new(
		identity,
		Arc::new(MemoryConversationStore::new()),
		Arc::clone(&messages) as Arc<dyn MessageStore>,
		RoomRegistry::new(RegistryConfig {
			member_queue_capacity: 16,
			debug_logs: false,
		}),
		GatewaySettings { max_message_chars: 64 },
	);

	Fixture { gateway, messages }
}

fn join(self_handle: &str, counterpart: &str) -> pb::Join {
	pb::Join {
		self_handle: self_handle.to_string(),
		counterpart_handle: counterpart.to_string(),
	}
}

fn send(conversation: ConversationId, sender: &str, text: &str) -> pb::SendMessage {
	pb::SendMessage {
		conversation_id: conversation.0,
		sender_handle: sender.to_string(),
		text: text.to_string(),
	}
}

async fn expect_message(rx: &mut tokio::sync::mpsc::Receiver<RoomItem>) -> pb::MessageEvent {
	let item = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	match item {
		RoomItem::Message(m) => m,
		other => panic!("expected Message item, got: {other:?}"),
	}
}

async fn expect_silence(rx: &mut tokio::sync::mpsc::Receiver<RoomItem>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "expected no delivery, got: {got:?}");
}

#[tokio::test]
async fn join_is_idempotent_across_participant_order() {
	let fx = fixture_with_users(&["ana", "bob"]).await;

	let mut ana = Session::new(SessionId(1));
	let mut bob = Session::new(SessionId(2));

	let a = fx.gateway.join(&mut ana, join("ana", "bob")).await.expect("ana joins");
	let b = fx.gateway.join(&mut bob, join("bob", "ana")).await.expect("bob joins");

	assert_eq!(a.conversation, b.conversation);
	assert_eq!(ana.state(), SessionState::InRoom(a.conversation));
	assert_eq!(bob.state(), SessionState::InRoom(a.conversation));
}

#[tokio::test]
async fn join_unknown_handle_fails_and_leaves_session_untouched() {
	let fx = fixture_with_users(&["ana"]).await;
	let mut ana = Session::new(SessionId(1));

	match fx.gateway.join(&mut ana, join("ana", "zoe")).await {
		Err(ChatError::NotFound(msg)) => assert!(msg.contains("zoe")),
		other => panic!("expected NotFound, got: {other:?}"),
	}
	assert_eq!(ana.state(), SessionState::Connected);
}

#[tokio::test]
async fn join_with_self_is_invalid() {
	let fx = fixture_with_users(&["ana"]).await;
	let mut ana = Session::new(SessionId(1));

	match fx.gateway.join(&mut ana, join("ana", "ana")).await {
		Err(ChatError::InvalidPayload(_)) => {}
		other => panic!("expected InvalidPayload, got: {other:?}"),
	}
}

#[tokio::test]
async fn send_persists_then_fans_out_without_echo() {
	let fx = fixture_with_users(&["ana", "bob"]).await;

	let mut ana = Session::new(SessionId(1));
	let mut bob = Session::new(SessionId(2));

	let mut ana_out = fx.gateway.join(&mut ana, join("ana", "bob")).await.expect("ana joins");
	let mut bob_out = fx.gateway.join(&mut bob, join("bob", "ana")).await.expect("bob joins");

	let event = fx
		.gateway
		.send(&ana, send(ana_out.conversation, "ana", "hola bob"))
		.await
		.expect("send accepted");
	assert_eq!(event.sender_handle, "ana");

	let got = expect_message(&mut bob_out.events).await;
	assert_eq!(got.text, "hola bob");
	assert_eq!(got.conversation_id, ana_out.conversation.0);

	expect_silence(&mut ana_out.events).await;

	let stored = fx.messages.list(ana_out.conversation).await.expect("list");
	assert_eq!(stored.len(), 1);
	assert_eq!(stored[0].text, "hola bob");
	assert_eq!(stored[0].timestamp_unix_ms, got.timestamp_unix_ms);
}

#[tokio::test]
async fn send_without_membership_is_unauthorized_and_not_persisted() {
	let fx = fixture_with_users(&["ana", "bob", "eva"]).await;

	let mut ana = Session::new(SessionId(1));
	let ana_out = fx.gateway.join(&mut ana, join("ana", "bob")).await.expect("ana joins");

	// Eva never joined this conversation's room.
	let eva = Session::new(SessionId(3));
	match fx.gateway.send(&eva, send(ana_out.conversation, "eva", "intrusa")).await {
		Err(ChatError::Unauthorized(_)) => {}
		other => panic!("expected Unauthorized, got: {other:?}"),
	}

	assert!(fx.messages.list(ana_out.conversation).await.expect("list").is_empty());
}

#[tokio::test]
async fn send_rejects_empty_and_oversized_text() {
	let fx = fixture_with_users(&["ana", "bob"]).await;

	let mut ana = Session::new(SessionId(1));
	let out = fx.gateway.join(&mut ana, join("ana", "bob")).await.expect("ana joins");

	let oversized = "x".repeat(65);
	for text in ["", "   ", oversized.as_str()] {
		match fx.gateway.send(&ana, send(out.conversation, "ana", text)).await {
			Err(ChatError::InvalidPayload(_)) => {}
			other => panic!("expected InvalidPayload for {text:?}, got: {other:?}"),
		}
	}

	assert!(fx.messages.list(out.conversation).await.expect("list").is_empty());
}

#[tokio::test]
async fn leave_stops_delivery_for_that_member() {
	let fx = fixture_with_users(&["ana", "bob"]).await;

	let mut ana = Session::new(SessionId(1));
	let mut bob = Session::new(SessionId(2));

	let ana_out = fx.gateway.join(&mut ana, join("ana", "bob")).await.expect("ana joins");
	let mut bob_out = fx.gateway.join(&mut bob, join("bob", "ana")).await.expect("bob joins");

	let left = fx
		.gateway
		.leave(
			&mut bob,
			pb::Leave {
				conversation_id: ana_out.conversation.0,
			},
		)
		.await;
	assert_eq!(left.conversation_id, ana_out.conversation.0);
	assert_eq!(bob.state(), SessionState::Connected);

	fx.gateway
		.send(&ana, send(ana_out.conversation, "ana", "anyone?"))
		.await
		.expect("send still succeeds into the room");

	// Bob's receiver was dropped from the room on leave.
	let got = timeout(Duration::from_millis(50), bob_out.events.recv()).await;
	assert!(matches!(got, Ok(None)), "expected closed stream, got: {got:?}");

	// The message is still persisted for later readers.
	assert_eq!(fx.messages.list(ana_out.conversation).await.expect("list").len(), 1);
}

#[tokio::test]
async fn second_join_implicitly_leaves_previous_room() {
	let fx = fixture_with_users(&["ana", "bob", "eva"]).await;

	let mut ana = Session::new(SessionId(1));

	let first = fx.gateway.join(&mut ana, join("ana", "bob")).await.expect("first join");
	let second = fx.gateway.join(&mut ana, join("ana", "eva")).await.expect("second join");

	assert_ne!(first.conversation, second.conversation);
	assert_eq!(second.left, Some(first.conversation));
	assert_eq!(ana.state(), SessionState::InRoom(second.conversation));

	assert!(fx.gateway.registry().members(first.conversation).await.is_empty());
	assert_eq!(
		fx.gateway.registry().members(second.conversation).await,
		vec![SessionId(1)]
	);

	// Sends against the abandoned room are no longer authorized.
	match fx.gateway.send(&ana, send(first.conversation, "ana", "tarde")).await {
		Err(ChatError::Unauthorized(_)) => {}
		other => panic!("expected Unauthorized, got: {other:?}"),
	}
}

#[tokio::test]
async fn disconnect_drops_all_memberships() {
	let fx = fixture_with_users(&["ana", "bob"]).await;

	let mut ana = Session::new(SessionId(1));
	let out = fx.gateway.join(&mut ana, join("ana", "bob")).await.expect("ana joins");

	fx.gateway.disconnect(&ana).await;
	fx.gateway.disconnect(&ana).await;

	assert!(fx.gateway.registry().members(out.conversation).await.is_empty());
}

#[tokio::test]
async fn concurrent_first_joins_converge_on_one_conversation() {
	let fx = Arc::new(fixture_with_users(&["ana", "bob"]).await);

	let fx_a = Arc::clone(&fx);
	let a = tokio::spawn(async move {
		let mut session = Session::new(SessionId(1));
		fx_a.gateway
			.join(&mut session, join("ana", "bob"))
			.await
			.expect("ana joins")
			.conversation
	});

	let fx_b = Arc::clone(&fx);
	let b = tokio::spawn(async move {
		let mut session = Session::new(SessionId(2));
		fx_b.gateway
			.join(&mut session, join("bob", "ana"))
			.await
			.expect("bob joins")
			.conversation
	});

	let (a, b) = (a.await.expect("task a"), b.await.expect("task b"));
	assert_eq!(a, b);
}

struct FailingMessageStore;

#[async_trait]
impl MessageStore for FailingMessageStore {
	async fn append(&self, _: ConversationId, _: UserId, _: &str) -> Result<StoredMessage, ChatError> {
		Err(ChatError::StorageUnavailable("messages table offline".to_string()))
	}

	async fn list(&self, _: ConversationId) -> Result<Vec<StoredMessage>, ChatError> {
		Ok(Vec::new())
	}
}

#[tokio::test]
async fn storage_failure_on_send_reaches_only_the_sender() {
	let identity = Arc::new(MemoryIdentityResolver::new());
	identity.register(&Handle::new("ana").expect("handle")).await;
	identity.register(&Handle::new("bob").expect("handle")).await;

	let gateway = Gateway::new(
		identity,
		Arc::new(MemoryConversationStore::new()),
		Arc::new(FailingMessageStore),
		RoomRegistry::new(RegistryConfig::default()),
		GatewaySettings::default(),
	);

	let mut ana = Session::new(SessionId(1));
	let mut bob = Session::new(SessionId(2));

	let ana_out = gateway.join(&mut ana, join("ana", "bob")).await.expect("ana joins");
	let mut bob_out = gateway.join(&mut bob, join("bob", "ana")).await.expect("bob joins");

	match gateway.send(&ana, send(ana_out.conversation, "ana", "hola")).await {
		Err(ChatError::StorageUnavailable(_)) => {}
		other => panic!("expected StorageUnavailable, got: {other:?}"),
	}

	expect_silence(&mut bob_out.events).await;
}
