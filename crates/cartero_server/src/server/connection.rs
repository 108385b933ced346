#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use cartero_domain::{ChatError, ConversationId, SessionId};
use cartero_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use cartero_protocol::pb;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::gateway::Gateway;
use crate::server::registry::RoomItem;
use crate::server::session::Session;
use crate::util::time::unix_ms_now;

/// v1 protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = cartero_protocol::version::PROTOCOL_MAJOR;

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: u32,

	/// Outbound envelope queue between the dispatch loop (plus room forward
	/// task) and the stream writer.
	pub outbound_queue_capacity: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			outbound_queue_capacity: 256,
		}
	}
}

pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	gateway: Arc<Gateway>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("cartero_server_active_connections").decrement(1.0);
		}
	}

	metrics::counter!("cartero_server_connections_total").increment(1);
	metrics::gauge!("cartero_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (control_send, mut control_recv) = connection.accept_bi().await.context("accept control bidirectional stream")?;

	// The limit advertised in Welcome is the one enforced on both directions.
	let max_frame_bytes = settings.max_frame_bytes as usize;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<pb::Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};

			metrics::counter!("cartero_server_control_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match cartero_protocol::decode_frame::<pb::Envelope>(&buf, max_frame_bytes) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("cartero_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(cartero_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("cartero_server_control_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				}
			}
		}
	});

	// All outbound traffic funnels through one writer task; the dispatch
	// loop and the room forward task both hold senders.
	let (outbound_tx, mut outbound_rx) = mpsc::channel::<pb::Envelope>(settings.outbound_queue_capacity);
	let writer_task = tokio::spawn(async move {
		let mut control_send = control_send;
		while let Some(env) = outbound_rx.recv().await {
			let frame = encode_frame(&env, max_frame_bytes).map_err(|e| anyhow!(e))?;
			metrics::counter!("cartero_server_envelopes_out_total").increment(1);
			metrics::counter!("cartero_server_control_bytes_out_total").increment(frame.len() as u64);

			control_send.write_all(&frame).await.context("control stream write")?;
		}
		Ok::<(), anyhow::Error>(())
	});

	let hello = wait_for_hello(&mut ctrl_rx, &outbound_tx).await?;
	info!(conn_id, client_name = %hello.client_name, "received Hello");
	metrics::counter!("cartero_server_hello_total").increment(1);

	let welcome = pb::Welcome {
		server_name: format!("cartero-server/{}", env!("CARGO_PKG_VERSION")),
		server_time_unix_ms: unix_ms_now(),
		max_frame_bytes: settings.max_frame_bytes,
	};

	outbound_tx
		.send(pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id: String::new(),
			msg: Some(pb::envelope::Msg::Welcome(welcome)),
		})
		.await
		.context("send Welcome")?;

	let mut session = Session::new(SessionId(conn_id));
	let mut forward_task: Option<JoinHandle<()>> = None;

	let loop_result = async {
		while let Some(env) = ctrl_rx.recv().await {
			if env.version != PROTOCOL_VERSION {
				warn!(conn_id, version = env.version, "rejecting envelope with unsupported version");
				send_error(
					&outbound_tx,
					env.request_id,
					&ChatError::InvalidPayload(format!("unsupported protocol version {}", env.version)),
				)
				.await?;
				continue;
			}

			let Some(msg) = env.msg else {
				send_error(
					&outbound_tx,
					env.request_id,
					&ChatError::InvalidPayload("envelope without payload".to_string()),
				)
				.await?;
				continue;
			};

			match msg {
				pb::envelope::Msg::Ping(ping) => {
					let pong = pb::Pong {
						client_time_unix_ms: ping.client_time_unix_ms,
						server_time_unix_ms: unix_ms_now(),
					};

					outbound_tx
						.send(pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::Pong(pong)),
						})
						.await
						.context("send Pong")?;
				}

				pb::envelope::Msg::Join(join) => match gateway.join(&mut session, join).await {
					Ok(outcome) => {
						if let Some(task) = forward_task.take() {
							task.abort();
						}
						forward_task = Some(spawn_room_forward(
							conn_id,
							outcome.conversation,
							outcome.events,
							outbound_tx.clone(),
						));

						outbound_tx
							.send(pb::Envelope {
								version: PROTOCOL_VERSION,
								request_id: env.request_id,
								msg: Some(pb::envelope::Msg::Joined(pb::Joined {
									conversation_id: outcome.conversation.0,
								})),
							})
							.await
							.context("send Joined")?;
					}
					Err(e) => {
						debug!(conn_id, error = %e, "join rejected");
						send_error(&outbound_tx, env.request_id, &e).await?;
					}
				},

				pb::envelope::Msg::Leave(leave) => {
					// Stop forwarding before the membership goes away so the
					// client sees no event after its own Left ack.
					if session.current_room() == Some(ConversationId(leave.conversation_id))
						&& let Some(task) = forward_task.take()
					{
						task.abort();
					}

					let left = gateway.leave(&mut session, leave).await;
					outbound_tx
						.send(pb::Envelope {
							version: PROTOCOL_VERSION,
							request_id: env.request_id,
							msg: Some(pb::envelope::Msg::Left(left)),
						})
						.await
						.context("send Left")?;
				}

				pb::envelope::Msg::Send(send) => match gateway.send(&session, send).await {
					Ok(event) => {
						debug!(
							conn_id,
							conversation_id = event.conversation_id,
							"message accepted"
						);
					}
					Err(e) => {
						debug!(conn_id, error = %e, "send rejected");
						metrics::counter!("cartero_server_sends_rejected_total").increment(1);
						send_error(&outbound_tx, env.request_id, &e).await?;
					}
				},

				pb::envelope::Msg::Hello(_) => {
					debug!(conn_id, "ignoring duplicate Hello");
				}

				other => {
					warn!(conn_id, "unhandled control message: {:?}", other);
					send_error(
						&outbound_tx,
						env.request_id,
						&ChatError::InvalidPayload("unexpected message for server".to_string()),
					)
					.await?;
				}
			}
		}
		Ok::<(), anyhow::Error>(())
	}
	.await;

	gateway.disconnect(&session).await;
	if let Some(task) = forward_task.take() {
		task.abort();
	}
	drop(outbound_tx);

	let _ = reader_task.await;
	let _ = writer_task.await;

	loop_result
}

/// Pump room events into the connection's outbound queue until the room
/// stream or the connection goes away.
fn spawn_room_forward(
	conn_id: u64,
	conversation: ConversationId,
	mut events: mpsc::Receiver<RoomItem>,
	outbound_tx: mpsc::Sender<pb::Envelope>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(item) = events.recv().await {
			let msg = match item {
				RoomItem::Message(event) => pb::envelope::Msg::Message(event),
				RoomItem::Lagged { dropped } => {
					warn!(conn_id, %conversation, dropped, "room member lagged; events were dropped");
					pb::envelope::Msg::Lagged(pb::Lagged {
						dropped,
						detail: "room member queue full".to_string(),
					})
				}
			};

			let env = pb::Envelope {
				version: PROTOCOL_VERSION,
				request_id: String::new(),
				msg: Some(msg),
			};

			if outbound_tx.send(env).await.is_err() {
				return;
			}
		}
	})
}

async fn send_error(outbound_tx: &mpsc::Sender<pb::Envelope>, request_id: String, err: &ChatError) -> anyhow::Result<()> {
	outbound_tx
		.send(pb::Envelope {
			version: PROTOCOL_VERSION,
			request_id,
			msg: Some(pb::envelope::Msg::Error(pb::Error::from_chat(err))),
		})
		.await
		.context("send Error")
}

async fn wait_for_hello(
	ctrl_rx: &mut mpsc::UnboundedReceiver<pb::Envelope>,
	outbound_tx: &mpsc::Sender<pb::Envelope>,
) -> anyhow::Result<pb::Hello> {
	while let Some(env) = ctrl_rx.recv().await {
		match env.msg {
			Some(pb::envelope::Msg::Hello(h)) => return Ok(h),
			_ => {
				send_error(
					outbound_tx,
					env.request_id,
					&ChatError::InvalidPayload("expected Hello before any other message".to_string()),
				)
				.await?;
			}
		}
	}
	Err(anyhow!("connection closed before Hello"))
}
