#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use cartero_domain::{ConversationId, SessionId};
use cartero_protocol::pb;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Process-local registry of live conversation rooms.
///
/// A room exists only while at least one session is subscribed to it; the
/// entry is removed as soon as the last member leaves or disconnects.
#[derive(Debug, Clone)]
pub struct RoomRegistry {
	inner: Arc<Mutex<Inner>>,
	cfg: RegistryConfig,
}

/// Configuration for `RoomRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	/// Maximum number of queued events per room member.
	pub member_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self {
			member_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a member's event stream.
#[derive(Debug, Clone)]
pub enum RoomItem {
	Message(pb::MessageEvent),

	/// Indicates the member is lagging and events were dropped.
	Lagged {
		dropped: u64,
	},
}

impl RoomRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe a session to a conversation room.
	///
	/// A second subscribe for the same session replaces the previous stream,
	/// so a session never holds two receivers for one room.
	pub async fn subscribe(&self, conversation: ConversationId, session: SessionId) -> mpsc::Receiver<RoomItem> {
		let (tx, rx) = mpsc::channel(self.cfg.member_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(conversation).or_default();

		prune_closed_members(entry);
		entry.members.retain(|m| m.session != session);
		entry.members.push(Member {
			session,
			tx,
			pending_lag: 0,
		});

		if self.cfg.debug_logs {
			debug!(%conversation, %session, members = entry.members.len(), "room registry: subscribed");
		}

		rx
	}

	/// Remove a session from one room; the room itself is dropped once empty.
	pub async fn unsubscribe(&self, conversation: ConversationId, session: SessionId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(&conversation) {
			entry.members.retain(|m| m.session != session && !m.tx.is_closed());

			if entry.members.is_empty() {
				inner.rooms.remove(&conversation);
			}
		}

		if self.cfg.debug_logs {
			debug!(%conversation, %session, "room registry: unsubscribed");
		}
	}

	/// Remove a session from every room it is in. Idempotent; used on
	/// disconnect where the session's room may already be gone.
	pub async fn unsubscribe_all(&self, session: SessionId) {
		let mut inner = self.inner.lock().await;
		inner.rooms.retain(|_, entry| {
			entry.members.retain(|m| m.session != session && !m.tx.is_closed());
			!entry.members.is_empty()
		});
	}

	/// Sessions currently subscribed to a conversation.
	pub async fn members(&self, conversation: ConversationId) -> Vec<SessionId> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.get(&conversation)
			.map(|entry| {
				entry
					.members
					.iter()
					.filter(|m| !m.tx.is_closed())
					.map(|m| m.session)
					.collect()
			})
			.unwrap_or_default()
	}

	/// Fan a committed message out to every room member except `origin`.
	///
	/// Delivery is best-effort: a member with a full queue gets a pending
	/// lag marker instead of blocking the publisher.
	pub async fn publish(&self, conversation: ConversationId, origin: SessionId, event: pb::MessageEvent) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(&conversation) else {
			return;
		};

		prune_closed_members(entry);
		if entry.members.is_empty() {
			inner.rooms.remove(&conversation);
			return;
		}

		let mut dropped_total: u64 = 0;

		for member in entry.members.iter_mut() {
			if member.session == origin {
				continue;
			}

			match member.tx.try_send(RoomItem::Message(event.clone())) {
				Ok(()) => {
					if member.pending_lag > 0
						&& member
							.tx
							.try_send(RoomItem::Lagged {
								dropped: member.pending_lag,
							})
							.is_ok()
					{
						member.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					member.pending_lag = member.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_members(entry);
		if entry.members.is_empty() {
			inner.rooms.remove(&conversation);
		}

		if dropped_total > 0 {
			metrics::counter!("cartero_server_fanout_dropped_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(
					%conversation,
					dropped = dropped_total,
					"room registry: dropped due to full member queues"
				);
			}
		}
	}

	/// Snapshot of live rooms and their member counts.
	pub async fn room_member_counts(&self) -> HashMap<ConversationId, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (*k, v.members.iter().filter(|m| !m.tx.is_closed()).count()))
			.collect()
	}
}

#[derive(Debug, Default)]
struct Inner {
	rooms: HashMap<ConversationId, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	members: Vec<Member>,
}

#[derive(Debug)]
struct Member {
	session: SessionId,
	tx: mpsc::Sender<RoomItem>,

	/// Events dropped for this member since the last delivered lag marker.
	pending_lag: u64,
}

fn prune_closed_members(entry: &mut RoomEntry) {
	entry.members.retain(|m| !m.tx.is_closed());
}
