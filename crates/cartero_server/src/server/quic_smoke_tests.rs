#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use cartero_domain::Handle;
use cartero_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use cartero_protocol::pb;
use tokio::time::timeout;

use crate::quic::config::QuicServerConfig;
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::conversations::MemoryConversationStore;
use crate::server::gateway::{Gateway, GatewaySettings};
use crate::server::identity::MemoryIdentityResolver;
use crate::server::messages::MemoryMessageStore;
use crate::server::registry::{RegistryConfig, RoomRegistry};

fn install_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Bind a dev server on a loopback port and run its accept loop.
async fn start_server(handles: &[&str]) -> (SocketAddr, Vec<u8>) {
	start_server_with(handles, ConnectionSettings::default()).await
}

async fn start_server_with(handles: &[&str], settings: ConnectionSettings) -> (SocketAddr, Vec<u8>) {
	let identity = Arc::new(MemoryIdentityResolver::new());
	for h in handles {
		identity.register(&Handle::new(*h).expect("valid handle")).await;
	}

	let gateway = Arc::new(Gateway::new(
		identity,
		Arc::new(MemoryConversationStore::new()),
		Arc::new(MemoryMessageStore::new()),
		RoomRegistry::new(RegistryConfig::default()),
		GatewaySettings::default(),
	));

	let quic_cfg = QuicServerConfig::dev("127.0.0.1:0".parse().expect("addr"));
	let (endpoint, cert_der) = quic_cfg.bind_dev_endpoint().expect("bind dev endpoint");
	let addr = endpoint.local_addr().expect("local addr");

	tokio::spawn(async move {
		let mut conn_id: u64 = 1;
		while let Some(connecting) = endpoint.accept().await {
			let id = conn_id;
			conn_id += 1;
			let gateway = Arc::clone(&gateway);
			let settings = settings.clone();
			tokio::spawn(async move {
				if let Ok(connection) = connecting.await {
					let _ = handle_connection(id, connection, gateway, settings).await;
				}
			});
		}
	});

	(addr, cert_der)
}

fn client_endpoint(server_cert_der: &[u8]) -> quinn::Endpoint {
	let mut roots = rustls::RootCertStore::empty();
	roots
		.add(rustls::pki_types::CertificateDer::from(server_cert_der.to_vec()))
		.expect("add dev root cert");

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	tls.alpn_protocols = vec![b"cartero-v1".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls).expect("client quic tls");
	let client_cfg = quinn::ClientConfig::new(Arc::new(quic_tls));

	let mut endpoint = quinn::Endpoint::client("127.0.0.1:0".parse().expect("addr")).expect("client endpoint");
	endpoint.set_default_client_config(client_cfg);
	endpoint
}

struct TestClient {
	_conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	welcome_max_frame: u32,
}

impl TestClient {
	/// Connect and open the control stream without saying Hello.
	async fn open(endpoint: &quinn::Endpoint, addr: SocketAddr) -> Self {
		let conn = endpoint
			.connect(addr, "localhost")
			.expect("start connect")
			.await
			.expect("quic handshake");
		let (send, recv) = conn.open_bi().await.expect("open control stream");

		Self {
			_conn: conn,
			send,
			recv,
			buf: BytesMut::new(),
			welcome_max_frame: 0,
		}
	}

	/// Complete the Hello/Welcome handshake.
	async fn hello(&mut self, name: &str) {
		self.send_msg(
			"",
			pb::envelope::Msg::Hello(pb::Hello {
				client_name: name.to_string(),
			}),
		)
		.await;

		match self.recv_envelope().await.msg {
			Some(pb::envelope::Msg::Welcome(w)) => {
				assert!(w.max_frame_bytes > 0);
				self.welcome_max_frame = w.max_frame_bytes;
			}
			other => panic!("expected Welcome, got: {other:?}"),
		}
	}

	async fn connect(endpoint: &quinn::Endpoint, addr: SocketAddr, name: &str) -> Self {
		let mut client = Self::open(endpoint, addr).await;
		client.hello(name).await;
		client
	}

	async fn send_msg(&mut self, request_id: &str, msg: pb::envelope::Msg) {
		let env = pb::Envelope {
			version: 1,
			request_id: request_id.to_string(),
			msg: Some(msg),
		};
		let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode frame");
		self.send.write_all(&frame).await.expect("stream write");
	}

	async fn recv_envelope(&mut self) -> pb::Envelope {
		timeout(Duration::from_secs(2), async {
			loop {
				if let Some(env) =
					try_decode_frame_from_buffer::<pb::Envelope>(&mut self.buf, DEFAULT_MAX_FRAME_SIZE).expect("decode frame")
				{
					return env;
				}

				let mut tmp = [0u8; 4096];
				let n = self
					.recv
					.read(&mut tmp)
					.await
					.expect("stream read")
					.expect("stream still open");
				self.buf.extend_from_slice(&tmp[..n]);
			}
		})
		.await
		.expect("expected an envelope within timeout")
	}

	async fn expect_silence(&mut self) {
		assert!(self.buf.is_empty(), "undecoded traffic already buffered: {:?}", self.buf);

		let mut tmp = [0u8; 64];
		match timeout(Duration::from_millis(100), self.recv.read(&mut tmp)).await {
			Err(_) => {}
			Ok(Ok(None)) => {}
			Ok(Ok(Some(n))) => panic!("expected no traffic, read {n} bytes"),
			Ok(Err(e)) => panic!("stream error while expecting silence: {e}"),
		}
	}

	async fn expect_closed(&mut self) {
		let mut tmp = [0u8; 64];
		match timeout(Duration::from_secs(2), self.recv.read(&mut tmp)).await {
			Ok(Ok(None)) => {}
			Ok(Err(_)) => {}
			Ok(Ok(Some(n))) => panic!("expected a closed stream, read {n} bytes"),
			Err(_) => panic!("stream still open"),
		}
	}

	async fn join(&mut self, request_id: &str, self_handle: &str, counterpart: &str) -> pb::Envelope {
		self.send_msg(
			request_id,
			pb::envelope::Msg::Join(pb::Join {
				self_handle: self_handle.to_string(),
				counterpart_handle: counterpart.to_string(),
			}),
		)
		.await;
		self.recv_envelope().await
	}
}

#[tokio::test]
async fn two_clients_exchange_messages_without_sender_echo() {
	install_crypto_provider();

	let (addr, cert_der) = start_server(&["ana", "bob"]).await;
	let endpoint = client_endpoint(&cert_der);

	let mut ana = TestClient::connect(&endpoint, addr, "ana-client").await;
	let mut bob = TestClient::connect(&endpoint, addr, "bob-client").await;

	let joined = ana.join("j-1", "ana", "bob").await;
	assert_eq!(joined.request_id, "j-1");
	let conversation_id = match joined.msg {
		Some(pb::envelope::Msg::Joined(j)) => j.conversation_id,
		other => panic!("expected Joined, got: {other:?}"),
	};

	let joined_bob = bob.join("j-2", "bob", "ana").await;
	match joined_bob.msg {
		Some(pb::envelope::Msg::Joined(j)) => assert_eq!(j.conversation_id, conversation_id),
		other => panic!("expected Joined, got: {other:?}"),
	}

	ana.send_msg(
		"s-1",
		pb::envelope::Msg::Send(pb::SendMessage {
			conversation_id,
			sender_handle: "ana".to_string(),
			text: "hola bob".to_string(),
		}),
	)
	.await;

	match bob.recv_envelope().await.msg {
		Some(pb::envelope::Msg::Message(m)) => {
			assert_eq!(m.conversation_id, conversation_id);
			assert_eq!(m.sender_handle, "ana");
			assert_eq!(m.text, "hola bob");
			assert!(m.timestamp_unix_ms > 0);
		}
		other => panic!("expected Message, got: {other:?}"),
	}

	// Committed messages never echo back to the sender.
	ana.expect_silence().await;

	bob.send_msg("l-1", pb::envelope::Msg::Leave(pb::Leave { conversation_id })).await;
	match bob.recv_envelope().await.msg {
		Some(pb::envelope::Msg::Left(l)) => assert_eq!(l.conversation_id, conversation_id),
		other => panic!("expected Left, got: {other:?}"),
	}

	ana.send_msg(
		"s-2",
		pb::envelope::Msg::Send(pb::SendMessage {
			conversation_id,
			sender_handle: "ana".to_string(),
			text: "still there?".to_string(),
		}),
	)
	.await;

	bob.expect_silence().await;
}

#[tokio::test]
async fn join_with_unknown_counterpart_returns_not_found() {
	install_crypto_provider();

	let (addr, cert_der) = start_server(&["ana"]).await;
	let endpoint = client_endpoint(&cert_der);

	let mut ana = TestClient::connect(&endpoint, addr, "ana-client").await;

	let reply = ana.join("j-1", "ana", "zoe").await;
	assert_eq!(reply.request_id, "j-1");
	match reply.msg {
		Some(pb::envelope::Msg::Error(e)) => {
			assert_eq!(e.code, "NOT_FOUND");
			assert!(e.message.contains("zoe"));
		}
		other => panic!("expected Error, got: {other:?}"),
	}
}

#[tokio::test]
async fn send_before_join_is_rejected_per_session() {
	install_crypto_provider();

	let (addr, cert_der) = start_server(&["ana", "bob"]).await;
	let endpoint = client_endpoint(&cert_der);

	let mut intruder = TestClient::connect(&endpoint, addr, "intruder").await;

	intruder
		.send_msg(
			"s-1",
			pb::envelope::Msg::Send(pb::SendMessage {
				conversation_id: 1,
				sender_handle: "ana".to_string(),
				text: "intrusa".to_string(),
			}),
		)
		.await;

	match intruder.recv_envelope().await.msg {
		Some(pb::envelope::Msg::Error(e)) => assert_eq!(e.code, "UNAUTHORIZED"),
		other => panic!("expected Error, got: {other:?}"),
	}
}

#[tokio::test]
async fn frames_beyond_the_advertised_limit_close_the_connection() {
	install_crypto_provider();

	let settings = ConnectionSettings {
		max_frame_bytes: 512,
		..ConnectionSettings::default()
	};
	let (addr, cert_der) = start_server_with(&["ana", "bob"], settings).await;
	let endpoint = client_endpoint(&cert_der);

	let mut ana = TestClient::connect(&endpoint, addr, "ana-client").await;
	assert_eq!(ana.welcome_max_frame, 512);

	ana.send_msg(
		"s-1",
		pb::envelope::Msg::Send(pb::SendMessage {
			conversation_id: 1,
			sender_handle: "ana".to_string(),
			text: "x".repeat(600),
		}),
	)
	.await;

	ana.expect_closed().await;
}

#[tokio::test]
async fn messages_before_hello_are_rejected() {
	install_crypto_provider();

	let (addr, cert_der) = start_server(&["ana", "bob"]).await;
	let endpoint = client_endpoint(&cert_der);

	let mut client = TestClient::open(&endpoint, addr).await;

	client
		.send_msg(
			"j-0",
			pb::envelope::Msg::Join(pb::Join {
				self_handle: "ana".to_string(),
				counterpart_handle: "bob".to_string(),
			}),
		)
		.await;

	let reply = client.recv_envelope().await;
	assert_eq!(reply.request_id, "j-0");
	match reply.msg {
		Some(pb::envelope::Msg::Error(e)) => {
			assert_eq!(e.code, "INVALID_PAYLOAD");
			assert!(e.message.contains("Hello"));
		}
		other => panic!("expected Error, got: {other:?}"),
	}

	// The handshake still completes once the client says Hello.
	client.hello("late-client").await;
	match client.join("j-1", "ana", "bob").await.msg {
		Some(pb::envelope::Msg::Joined(j)) => assert!(j.conversation_id > 0),
		other => panic!("expected Joined, got: {other:?}"),
	}
}

#[tokio::test]
async fn ping_pong_and_malformed_envelope() {
	install_crypto_provider();

	let (addr, cert_der) = start_server(&["ana"]).await;
	let endpoint = client_endpoint(&cert_der);

	let mut client = TestClient::connect(&endpoint, addr, "pinger").await;

	client
		.send_msg("p-1", pb::envelope::Msg::Ping(pb::Ping { client_time_unix_ms: 42 }))
		.await;
	match client.recv_envelope().await.msg {
		Some(pb::envelope::Msg::Pong(p)) => {
			assert_eq!(p.client_time_unix_ms, 42);
			assert!(p.server_time_unix_ms > 0);
		}
		other => panic!("expected Pong, got: {other:?}"),
	}

	// An envelope without a payload is rejected, not ignored.
	let empty = pb::Envelope {
		version: 1,
		request_id: "m-1".to_string(),
		msg: None,
	};
	let frame = encode_frame(&empty, DEFAULT_MAX_FRAME_SIZE).expect("encode frame");
	client.send.write_all(&frame).await.expect("stream write");

	let reply = client.recv_envelope().await;
	assert_eq!(reply.request_id, "m-1");
	match reply.msg {
		Some(pb::envelope::Msg::Error(e)) => assert_eq!(e.code, "INVALID_PAYLOAD"),
		other => panic!("expected Error, got: {other:?}"),
	}
}
