use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::crypto::{self, KEY_LENGTH, AES_METADATA_SIZE};
use crate::messages::ControlMessage;
use crate::udp::{PeerRole, PING_INTERVAL, PING_MAX_WAIT};

/// Upper bound on one framed TCP payload. A declared size outside
/// `0..=MAX_TCP_PAYLOAD_SIZE` means the stream is corrupt or tampered with;
/// the connection is poisoned and must not be silently re-established.
pub const MAX_TCP_PAYLOAD_SIZE: usize = 1_000_000_000;

/// Outbound messages beyond this many queue entries apply backpressure.
const SEND_QUEUE_SIZE: usize = 16;

const READ_CHUNK_SIZE: usize = 4096;

/// Framed size prefix that follows the AES metadata on the wire.
const SIZE_PREFIX_LENGTH: usize = 4;

struct TcpInner {
	key: [u8; KEY_LENGTH],
	next_message_id: AtomicU32,
	last_ping_id: AtomicU32,
	last_pong_id: AtomicU32,
	last_remote_activity: Mutex<Instant>,
	poisoned: AtomicBool,
	connection_lost: AtomicBool,
}

/// Reliable, bounded-latency delivery of occasional large control payloads.
/// All sends funnel through one writer task so large messages are never
/// interleaved; receives reassemble framed messages from the byte stream.
#[derive(Clone)]
pub struct TcpSocketContext {
	inner: Arc<TcpInner>,
	queue_tx: mpsc::Sender<Vec<u8>>,
}

impl TcpSocketContext {
	/// Returns the context and the channel on which parsed inbound messages
	/// are delivered.
	pub fn new(
		stream: TcpStream,
		key: [u8; KEY_LENGTH],
		role: PeerRole,
		shutdown: ShutdownManager<()>,
	) -> (Self, mpsc::UnboundedReceiver<(u32, ControlMessage)>) {
		let (queue_tx, queue_rx) = mpsc::channel(SEND_QUEUE_SIZE);
		let (message_tx, message_rx) = mpsc::unbounded_channel();

		let inner = Arc::new(TcpInner {
			key,
			next_message_id: AtomicU32::new(1),
			last_ping_id: AtomicU32::new(0),
			last_pong_id: AtomicU32::new(0),
			last_remote_activity: Mutex::new(Instant::now()),
			poisoned: AtomicBool::new(false),
			connection_lost: AtomicBool::new(false),
		});

		let context = Self {
			inner: inner.clone(),
			queue_tx,
		};

		let (read_half, write_half) = stream.into_split();
		tokio::spawn(run_sender(write_half, queue_rx, shutdown.clone()));
		tokio::spawn(run_receiver(read_half, context.clone(), message_tx, shutdown.clone()));
		if role == PeerRole::Client {
			context.spawn_keepalive(shutdown);
		}

		(context, message_rx)
	}

	pub fn is_poisoned(&self) -> bool {
		self.inner.poisoned.load(Ordering::Relaxed)
	}

	pub fn is_connection_lost(&self) -> bool {
		self.inner.connection_lost.load(Ordering::Relaxed)
			|| self.inner.last_remote_activity.lock().unwrap().elapsed() > PING_MAX_WAIT
	}

	/// Frame, encrypt and enqueue one message for the writer task.
	pub async fn send_message(&self, message: &ControlMessage) -> Result<(), ()> {
		if self.is_poisoned() {
			tracing::warn!("Refusing to send on a poisoned TCP connection.");
			return Err(());
		}

		let message_id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
		let plaintext = message.serialize(message_id);

		// seal() produces metadata || ciphertext; splice the declared size
		// between them as the TCP framing requires.
		let sealed = crypto::seal(&plaintext, &self.inner.key)?;
		let ciphertext_size = (sealed.len() - AES_METADATA_SIZE) as i32;

		let mut framed = Vec::with_capacity(sealed.len() + SIZE_PREFIX_LENGTH);
		framed.extend(&sealed[..AES_METADATA_SIZE]);
		framed.extend(ciphertext_size.to_le_bytes());
		framed.extend(&sealed[AES_METADATA_SIZE..]);

		self.queue_tx
			.send(framed)
			.await
			.map_err(|_| tracing::warn!("TCP sender task is gone, dropping message."))
	}

	fn spawn_keepalive(&self, shutdown: ShutdownManager<()>) {
		let context = self.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();
			let max_outstanding = (PING_MAX_WAIT.as_secs() / PING_INTERVAL.as_secs()) as u32;

			loop {
				if shutdown.wrap_cancel(tokio::time::sleep(PING_INTERVAL)).await.is_err() {
					break;
				}

				let ping_id = context.inner.last_ping_id.load(Ordering::Relaxed) + 1;
				context.inner.last_ping_id.store(ping_id, Ordering::Relaxed);
				let _ = context.send_message(&ControlMessage::TcpPing { id: ping_id }).await;

				if context.inner.last_pong_id.load(Ordering::Relaxed) + max_outstanding < ping_id {
					tracing::warn!("TCP keepalive timed out, marking the connection as lost.");
					context.inner.connection_lost.store(true, Ordering::Relaxed);
				}
			}
		});
	}
}

async fn run_sender(
	mut write_half: tokio::net::tcp::OwnedWriteHalf,
	mut queue_rx: mpsc::Receiver<Vec<u8>>,
	shutdown: ShutdownManager<()>,
) {
	let _delay_stop = shutdown.delay_shutdown_token();

	while let Ok(Some(framed)) = shutdown.wrap_cancel(queue_rx.recv()).await {
		if let Err(e) = write_half.write_all(&framed).await {
			tracing::warn!("Failed to write TCP message: {e}");
			break;
		}
	}

	tracing::debug!("TCP sender stopped.");
}

async fn run_receiver(
	mut read_half: tokio::net::tcp::OwnedReadHalf,
	context: TcpSocketContext,
	message_tx: mpsc::UnboundedSender<(u32, ControlMessage)>,
	shutdown: ShutdownManager<()>,
) {
	let _delay_stop = shutdown.delay_shutdown_token();
	let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE * 4);
	let mut chunk = vec![0u8; READ_CHUNK_SIZE];

	'outer: loop {
		let read = match shutdown.wrap_cancel(read_half.read(&mut chunk)).await {
			Ok(read) => read,
			Err(_) => break,
		};

		match read {
			Ok(0) => {
				tracing::debug!("TCP connection closed by peer.");
				context.inner.connection_lost.store(true, Ordering::Relaxed);
				break;
			},
			Ok(len) => buffer.extend_from_slice(&chunk[..len]),
			Err(e) => {
				tracing::warn!("Failed to read from TCP connection: {e}");
				context.inner.connection_lost.store(true, Ordering::Relaxed);
				break;
			},
		}

		// Extract every complete framed message in the buffer.
		while buffer.len() >= AES_METADATA_SIZE + SIZE_PREFIX_LENGTH {
			let declared_size = i32::from_le_bytes(
				buffer[AES_METADATA_SIZE..AES_METADATA_SIZE + SIZE_PREFIX_LENGTH]
					.try_into()
					.unwrap(),
			);

			// An implausible size means a MITM or bit-flip got past TCP's
			// checksum; this connection can never be trusted again.
			if declared_size < 0 || declared_size as usize > MAX_TCP_PAYLOAD_SIZE {
				tracing::error!("TCP message declares {declared_size} bytes; poisoning the connection.");
				context.inner.poisoned.store(true, Ordering::Relaxed);
				context.inner.connection_lost.store(true, Ordering::Relaxed);
				break 'outer;
			}

			let total = AES_METADATA_SIZE + SIZE_PREFIX_LENGTH + declared_size as usize;
			if buffer.len() < total {
				break;
			}

			// Re-join metadata and ciphertext for the shared open() path.
			let mut sealed = Vec::with_capacity(total - SIZE_PREFIX_LENGTH);
			sealed.extend(&buffer[..AES_METADATA_SIZE]);
			sealed.extend(&buffer[AES_METADATA_SIZE + SIZE_PREFIX_LENGTH..total]);
			buffer.advance(total);

			let Ok(plaintext) = crypto::open(&sealed, &context.inner.key) else {
				tracing::error!("TCP message failed authentication; poisoning the connection.");
				context.inner.poisoned.store(true, Ordering::Relaxed);
				context.inner.connection_lost.store(true, Ordering::Relaxed);
				break 'outer;
			};

			*context.inner.last_remote_activity.lock().unwrap() = Instant::now();

			let Ok((message_id, message)) = ControlMessage::from_bytes(&plaintext) else {
				continue;
			};

			match message {
				ControlMessage::TcpPing { id } => {
					let _ = context.send_message(&ControlMessage::TcpPong { id }).await;
				},
				ControlMessage::TcpPong { id } => {
					let last = context.inner.last_pong_id.load(Ordering::Relaxed);
					context.inner.last_pong_id.store(last.max(id), Ordering::Relaxed);
				},
				message => {
					let _ = message_tx.send((message_id, message));
				},
			}
		}
	}

	tracing::debug!("TCP receiver stopped.");
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;

	const KEY: [u8; KEY_LENGTH] = *b"0123456789abcdef";

	async fn pair(
		shutdown: &ShutdownManager<()>,
	) -> (
		TcpSocketContext,
		mpsc::UnboundedReceiver<(u32, ControlMessage)>,
		TcpSocketContext,
		mpsc::UnboundedReceiver<(u32, ControlMessage)>,
	) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();

		let client_stream = TcpStream::connect(address);
		let (server_stream, client_stream) = tokio::join!(listener.accept(), client_stream);
		let (server_stream, _) = server_stream.unwrap();
		let client_stream = client_stream.unwrap();

		let (server, server_rx) = TcpSocketContext::new(server_stream, KEY, PeerRole::Server, shutdown.clone());
		let (client, client_rx) = TcpSocketContext::new(client_stream, KEY, PeerRole::Client, shutdown.clone());
		(server, server_rx, client, client_rx)
	}

	async fn recv(rx: &mut mpsc::UnboundedReceiver<(u32, ControlMessage)>) -> ControlMessage {
		tokio::time::timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("timed out waiting for TCP message")
			.expect("channel closed")
			.1
	}

	#[tokio::test]
	async fn messages_round_trip() {
		let shutdown = ShutdownManager::new();
		let (_server, mut server_rx, client, _client_rx) = pair(&shutdown).await;

		client
			.send_message(&ControlMessage::Dimensions {
				width: 1920,
				height: 1080,
				dpi: 96,
				codec: crate::frame::CodecKind::H264,
			})
			.await
			.unwrap();

		assert!(matches!(
			recv(&mut server_rx).await,
			ControlMessage::Dimensions { width: 1920, height: 1080, .. }
		));
		let _ = shutdown.trigger_shutdown(());
	}

	#[tokio::test]
	async fn large_payload_crosses_read_chunks() {
		let shutdown = ShutdownManager::new();
		let (server, _server_rx, _client, mut client_rx) = pair(&shutdown).await;

		// Much larger than the 4 KiB read chunk.
		let blob = vec![0xC3u8; 40_000];
		server.send_message(&ControlMessage::ClipboardChunk(blob.clone())).await.unwrap();

		match recv(&mut client_rx).await {
			ControlMessage::ClipboardChunk(received) => assert_eq!(received, blob),
			other => panic!("unexpected message: {other:?}"),
		}
		let _ = shutdown.trigger_shutdown(());
	}

	#[tokio::test]
	async fn ping_is_answered_with_pong() {
		let shutdown = ShutdownManager::new();
		let (_server, _server_rx, client, _client_rx) = pair(&shutdown).await;

		client.send_message(&ControlMessage::TcpPing { id: 3 }).await.unwrap();

		let deadline = Instant::now() + Duration::from_secs(2);
		while client.inner.last_pong_id.load(Ordering::Relaxed) != 3 {
			assert!(Instant::now() < deadline, "pong never arrived");
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		let _ = shutdown.trigger_shutdown(());
	}

	#[tokio::test]
	async fn out_of_range_size_poisons_the_connection() {
		let shutdown = ShutdownManager::new();
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();

		let client_stream = TcpStream::connect(address);
		let (server_stream, client_stream) = tokio::join!(listener.accept(), client_stream);
		let (mut server_stream, _) = server_stream.unwrap();
		let (client, _client_rx) = TcpSocketContext::new(client_stream.unwrap(), KEY, PeerRole::Client, shutdown.clone());

		// Hand-craft a frame whose declared size is far out of range.
		let mut frame = vec![0u8; AES_METADATA_SIZE];
		frame.extend((-5i32).to_le_bytes());
		server_stream.write_all(&frame).await.unwrap();

		let deadline = Instant::now() + Duration::from_secs(2);
		while !client.is_poisoned() {
			assert!(Instant::now() < deadline, "connection never poisoned");
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		assert!(client.send_message(&ControlMessage::Quit).await.is_err());
		let _ = shutdown.trigger_shutdown(());
	}
}
