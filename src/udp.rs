use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::congestion::NetworkSettings;
use crate::crypto::{self, KEY_LENGTH};
use crate::messages::ControlMessage;
use crate::packet::{Packet, StreamKind, MAX_PAYLOAD_SIZE};
use crate::ringbuffer::FecEncoder;
use crate::throttle::NetworkThrottler;

/// Keepalive ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

/// How long the remote may stay silent before the connection counts as lost.
pub const PING_MAX_WAIT: Duration = Duration::from_secs(5);

/// How long reconnection may be attempted before the session tears down.
pub const MAX_RECONNECTION_TIME: Duration = Duration::from_secs(3);

/// How many recent frames per stream are kept around to answer NACKs and to
/// saturate bandwidth with re-sent indices.
const RESEND_HISTORY_FRAMES: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerRole {
	Server,
	Client,
}

/// Destinations for demultiplexed inbound traffic.
#[derive(Clone)]
pub struct UdpHandlers {
	pub video_tx: mpsc::UnboundedSender<Packet>,
	pub audio_tx: mpsc::UnboundedSender<Packet>,
	pub message_tx: mpsc::UnboundedSender<(u32, ControlMessage)>,
}

struct SentFrame {
	frame_id: u32,
	packets: Vec<Packet>,
}

struct UdpInner {
	socket: UdpSocket,
	key: [u8; KEY_LENGTH],
	role: PeerRole,
	peer: Mutex<Option<SocketAddr>>,

	throttler: tokio::sync::Mutex<NetworkThrottler>,
	settings: Mutex<NetworkSettings>,
	fec_encoder: Mutex<FecEncoder>,
	history: Mutex<HashMap<StreamKind, VecDeque<SentFrame>>>,

	next_message_id: AtomicU32,
	last_ping_id: AtomicU32,
	last_pong_id: AtomicU32,
	ping_sent_at: Mutex<HashMap<u32, Instant>>,
	rtt: Mutex<Duration>,
	last_remote_activity: Mutex<Instant>,
	connection_lost: AtomicBool,

	packets_sent: AtomicU64,
	packets_received: AtomicU64,
	packets_dropped: AtomicU64,
	bytes_received: AtomicU64,
}

/// Best-effort, authenticated, rate-paced transport for one UDP association.
#[derive(Clone)]
pub struct UdpSocketContext {
	inner: Arc<UdpInner>,
}

impl UdpSocketContext {
	pub fn new(socket: UdpSocket, key: [u8; KEY_LENGTH], role: PeerRole) -> Self {
		let settings = NetworkSettings::default();

		Self {
			inner: Arc::new(UdpInner {
				socket,
				key,
				role,
				peer: Mutex::new(None),
				throttler: tokio::sync::Mutex::new(NetworkThrottler::new(
					settings.bitrate_bps as u64,
					settings.burst_bitrate_bps as u64,
				)),
				settings: Mutex::new(settings),
				fec_encoder: Mutex::new(FecEncoder::new()),
				history: Mutex::new(HashMap::new()),
				next_message_id: AtomicU32::new(1),
				last_ping_id: AtomicU32::new(0),
				last_pong_id: AtomicU32::new(0),
				ping_sent_at: Mutex::new(HashMap::new()),
				rtt: Mutex::new(Duration::from_millis(50)),
				last_remote_activity: Mutex::new(Instant::now()),
				connection_lost: AtomicBool::new(false),
				packets_sent: AtomicU64::new(0),
				packets_received: AtomicU64::new(0),
				packets_dropped: AtomicU64::new(0),
				bytes_received: AtomicU64::new(0),
			}),
		}
	}

	pub fn set_peer(&self, peer: SocketAddr) {
		*self.inner.peer.lock().unwrap() = Some(peer);
	}

	pub fn peer(&self) -> Option<SocketAddr> {
		*self.inner.peer.lock().unwrap()
	}

	pub fn settings(&self) -> NetworkSettings {
		*self.inner.settings.lock().unwrap()
	}

	/// Install a settings snapshot from the congestion controller; the pacing
	/// rates take effect immediately, without losing in-flight tokens.
	pub async fn handle_network_settings(&self, settings: NetworkSettings) {
		*self.inner.settings.lock().unwrap() = settings;
		self.inner
			.throttler
			.lock()
			.await
			.update_rates(settings.bitrate_bps as u64, settings.burst_bitrate_bps as u64);
	}

	pub fn is_connection_lost(&self) -> bool {
		self.inner.connection_lost.load(Ordering::Relaxed)
			|| self.inner.last_remote_activity.lock().unwrap().elapsed() > PING_MAX_WAIT
	}

	pub fn packets_received(&self) -> u64 {
		self.inner.packets_received.load(Ordering::Relaxed)
	}

	pub fn packets_dropped(&self) -> u64 {
		self.inner.packets_dropped.load(Ordering::Relaxed)
	}

	/// Bytes received since the last call; the congestion controller turns
	/// this into an incoming bitrate.
	pub fn take_incoming_bytes(&self) -> u64 {
		self.inner.bytes_received.swap(0, Ordering::Relaxed)
	}

	/// Fragment `payload` into original + FEC indices, encrypt each under a
	/// fresh nonce and emit them against the pacing budget.
	pub async fn send_packet(
		&self,
		stream: StreamKind,
		payload: &[u8],
		frame_id: u32,
		is_stream_start: bool,
	) -> Result<(), ()> {
		let settings = self.settings();
		let fec_ratio = match stream {
			StreamKind::Video => settings.video_fec_ratio,
			StreamKind::Audio => settings.audio_fec_ratio,
			StreamKind::Message => 0.0,
		};

		let shards = self
			.inner
			.fec_encoder
			.lock()
			.unwrap()
			.encode(payload, fec_ratio, MAX_PAYLOAD_SIZE)?;

		let num_indices = (shards.num_original + shards.num_fec) as u16;
		let num_fec_indices = shards.num_fec as u16;
		let packets: Vec<Packet> = shards
			.shards
			.into_iter()
			.enumerate()
			.map(|(index, payload)| Packet {
				stream,
				is_nack_response: false,
				is_stream_start,
				frame_id,
				index: index as u16,
				num_indices,
				num_fec_indices,
				payload,
			})
			.collect();

		for packet in &packets {
			self.emit(packet).await?;
		}

		// Remember the fragments so NACKs and bandwidth saturation can
		// re-send them later.
		let mut history = self.inner.history.lock().unwrap();
		let frames = history.entry(stream).or_default();
		if frames.len() >= RESEND_HISTORY_FRAMES {
			frames.pop_front();
		}
		frames.push_back(SentFrame { frame_id, packets });

		Ok(())
	}

	/// Send a control message on the Message stream. Control messages always
	/// fit a single packet; bulk payloads belong on the TCP association.
	pub async fn send_message(&self, message: &ControlMessage) -> Result<(), ()> {
		let message_id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
		let payload = message.serialize(message_id);
		assert!(payload.len() <= MAX_PAYLOAD_SIZE);

		let packet = Packet {
			stream: StreamKind::Message,
			is_nack_response: false,
			is_stream_start: false,
			frame_id: message_id,
			index: 0,
			num_indices: 1,
			num_fec_indices: 0,
			payload,
		};
		self.emit(&packet).await
	}

	/// Re-send one stored index, marked as a NACK response.
	pub async fn resend_packet(&self, stream: StreamKind, frame_id: u32, index: u16) -> Result<(), ()> {
		let packet = {
			let history = self.inner.history.lock().unwrap();
			let Some(frames) = history.get(&stream) else {
				return Ok(());
			};
			let Some(frame) = frames.iter().find(|f| f.frame_id == frame_id) else {
				tracing::debug!("Asked to resend frame ID {frame_id}, but it has left the resend history.");
				return Ok(());
			};
			let Some(packet) = frame.packets.get(index as usize) else {
				tracing::debug!("Asked to resend index {index} of frame ID {frame_id}, which does not exist.");
				return Ok(());
			};

			let mut packet = packet.clone();
			packet.is_nack_response = true;
			packet
		};

		self.emit(&packet).await
	}

	/// Number of stored indices of a frame, for the saturation round-robin.
	pub fn num_indices(&self, stream: StreamKind, frame_id: u32) -> Option<usize> {
		let history = self.inner.history.lock().unwrap();
		history
			.get(&stream)?
			.iter()
			.find(|f| f.frame_id == frame_id)
			.map(|f| f.packets.len())
	}

	async fn emit(&self, packet: &Packet) -> Result<(), ()> {
		let Some(peer) = self.peer() else {
			tracing::trace!("Dropping outbound packet, no peer address is known yet.");
			return Ok(());
		};

		let sealed = crypto::seal(&packet.serialize(), &self.inner.key)?;

		self.inner.throttler.lock().await.wait_bytes(sealed.len()).await;

		match self.inner.socket.send_to(&sealed, peer).await {
			Ok(_) => {
				self.inner.packets_sent.fetch_add(1, Ordering::Relaxed);
				Ok(())
			},
			Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
				tracing::warn!("UDP connection reset by peer.");
				self.inner.connection_lost.store(true, Ordering::Relaxed);
				Err(())
			},
			Err(e) => {
				tracing::warn!("Failed to send UDP packet: {e}");
				Err(())
			},
		}
	}

	/// Run the receive worker: decrypt, validate and demultiplex every
	/// inbound packet to its stream. NACKs addressed to us are answered from
	/// the resend history without surfacing to the session.
	pub fn spawn_receiver(&self, handlers: UdpHandlers, shutdown: ShutdownManager<()>) {
		let context = self.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();
			let mut buffer = vec![0u8; 2048];

			loop {
				let received = match shutdown.wrap_cancel(context.inner.socket.recv_from(&mut buffer)).await {
					Ok(received) => received,
					Err(_) => break,
				};

				let (len, address) = match received {
					Ok(received) => received,
					Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
						tracing::warn!("UDP connection reset by peer.");
						context.inner.connection_lost.store(true, Ordering::Relaxed);
						break;
					},
					Err(e) => {
						tracing::warn!("Failed to receive UDP packet: {e}");
						continue;
					},
				};

				if context.handle_datagram(&buffer[..len], address, &handlers).await.is_err() {
					context.inner.packets_dropped.fetch_add(1, Ordering::Relaxed);
				}
			}

			tracing::debug!("UDP receive worker stopped.");
		});
	}

	async fn handle_datagram(&self, datagram: &[u8], address: SocketAddr, handlers: &UdpHandlers) -> Result<(), ()> {
		// Anything that fails authentication is dropped silently.
		let plaintext = crypto::open(datagram, &self.inner.key)?;
		let packet = Packet::from_bytes(&plaintext)?;

		// The first authenticated packet pins the peer address.
		{
			let mut peer = self.inner.peer.lock().unwrap();
			match *peer {
				Some(peer) if peer == address => {},
				Some(_) => {
					tracing::warn!("Dropping authenticated packet from unexpected address {address}.");
					return Err(());
				},
				None => *peer = Some(address),
			}
		}

		self.inner.packets_received.fetch_add(1, Ordering::Relaxed);
		self.inner.bytes_received.fetch_add(datagram.len() as u64, Ordering::Relaxed);
		*self.inner.last_remote_activity.lock().unwrap() = Instant::now();

		match packet.stream {
			StreamKind::Video => {
				let _ = handlers.video_tx.send(packet);
			},
			StreamKind::Audio => {
				let _ = handlers.audio_tx.send(packet);
			},
			StreamKind::Message => {
				let (message_id, message) = ControlMessage::from_bytes(&packet.payload)?;
				self.handle_message(message_id, message, handlers).await?;
			},
		}

		Ok(())
	}

	async fn handle_message(&self, message_id: u32, message: ControlMessage, handlers: &UdpHandlers) -> Result<(), ()> {
		match message {
			// Keepalive and retransmission are transport concerns, handled
			// here rather than by the session.
			ControlMessage::Ping { id } => {
				self.send_message(&ControlMessage::Pong { id }).await?;
			},
			ControlMessage::Pong { id } => {
				let last = self.inner.last_pong_id.load(Ordering::Relaxed);
				self.inner.last_pong_id.store(last.max(id), Ordering::Relaxed);

				if let Some(sent_at) = self.inner.ping_sent_at.lock().unwrap().remove(&id) {
					// Smooth the estimate; single pongs can be jittery.
					let sample = sent_at.elapsed();
					let mut rtt = self.inner.rtt.lock().unwrap();
					*rtt = rtt.mul_f64(0.8) + sample.mul_f64(0.2);
				}
			},
			ControlMessage::Nack { stream, frame_id, index } => {
				self.resend_packet(stream, frame_id, index).await?;
			},
			ControlMessage::BitarrayNack { stream, frame_id, start_index, bits } => {
				for (offset, requested) in bits.iter().enumerate() {
					if *requested {
						self.resend_packet(stream, frame_id, start_index + offset as u16).await?;
					}
				}
			},
			message => {
				let _ = handlers.message_tx.send((message_id, message));
			},
		}

		Ok(())
	}

	/// Client-side keepalive: ping every two seconds and declare the
	/// connection lost when pongs stop coming back.
	pub fn spawn_keepalive(&self, shutdown: ShutdownManager<()>) {
		assert_eq!(self.inner.role, PeerRole::Client);

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

				{
					let mut ping_sent_at = context.inner.ping_sent_at.lock().unwrap();
					ping_sent_at.retain(|_, sent_at| sent_at.elapsed() < PING_MAX_WAIT);
					ping_sent_at.insert(ping_id, Instant::now());
				}

				if context.send_message(&ControlMessage::Ping { id: ping_id }).await.is_err() {
					tracing::warn!("Failed to send keepalive ping.");
				}

				let last_pong = context.inner.last_pong_id.load(Ordering::Relaxed);
				if last_pong + max_outstanding < ping_id {
					tracing::warn!("No pong for the last {max_outstanding} pings, marking the connection as lost.");
					context.inner.connection_lost.store(true, Ordering::Relaxed);
				}
			}

			tracing::debug!("UDP keepalive worker stopped.");
		});
	}

	pub fn last_pong_id(&self) -> u32 {
		self.inner.last_pong_id.load(Ordering::Relaxed)
	}

	/// Smoothed round-trip estimate from the keepalive exchange.
	pub fn rtt(&self) -> Duration {
		*self.inner.rtt.lock().unwrap()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const KEY: [u8; KEY_LENGTH] = *b"0123456789abcdef";

	async fn pair() -> (UdpSocketContext, UdpSocketContext) {
		let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_address = server_socket.local_addr().unwrap();
		let client_address = client_socket.local_addr().unwrap();

		let server = UdpSocketContext::new(server_socket, KEY, PeerRole::Server);
		let client = UdpSocketContext::new(client_socket, KEY, PeerRole::Client);
		server.set_peer(client_address);
		client.set_peer(server_address);

		(server, client)
	}

	fn handlers() -> (
		UdpHandlers,
		mpsc::UnboundedReceiver<Packet>,
		mpsc::UnboundedReceiver<Packet>,
		mpsc::UnboundedReceiver<(u32, ControlMessage)>,
	) {
		let (video_tx, video_rx) = mpsc::unbounded_channel();
		let (audio_tx, audio_rx) = mpsc::unbounded_channel();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		(
			UdpHandlers {
				video_tx,
				audio_tx,
				message_tx,
			},
			video_rx,
			audio_rx,
			message_rx,
		)
	}

	async fn recv_packet(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
		tokio::time::timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("timed out waiting for packet")
			.expect("channel closed")
	}

	#[tokio::test]
	async fn frame_survives_fragmentation_and_encryption() {
		let (server, client) = pair().await;
		let (client_handlers, mut video_rx, _audio_rx, _message_rx) = handlers();
		let shutdown = ShutdownManager::new();
		client.spawn_receiver(client_handlers, shutdown.clone());

		let payload: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();
		server.send_packet(StreamKind::Video, &payload, 42, true).await.unwrap();

		let mut ring = crate::ringbuffer::RingBuffer::new(StreamKind::Video, 8, None);
		let mut became_ready = false;
		while !became_ready {
			let packet = recv_packet(&mut video_rx).await;
			assert_eq!(packet.frame_id, 42);
			assert!(packet.is_stream_start);
			became_ready = ring.receive_packet(&packet).unwrap().became_ready;
		}

		assert_eq!(ring.set_rendering(42), payload.as_slice());
		let _ = shutdown.trigger_shutdown(());
	}

	#[tokio::test]
	async fn ping_is_answered_with_pong() {
		let (server, client) = pair().await;
		let (server_handlers, _v1, _a1, _m1) = handlers();
		let (client_handlers, _v2, _a2, _m2) = handlers();
		let shutdown = ShutdownManager::new();
		server.spawn_receiver(server_handlers, shutdown.clone());
		client.spawn_receiver(client_handlers, shutdown.clone());

		client.send_message(&ControlMessage::Ping { id: 5 }).await.unwrap();

		let deadline = Instant::now() + Duration::from_secs(2);
		while client.last_pong_id() != 5 {
			assert!(Instant::now() < deadline, "pong never arrived");
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		let _ = shutdown.trigger_shutdown(());
	}

	#[tokio::test]
	async fn nack_is_answered_from_resend_history() {
		let (server, client) = pair().await;
		let (server_handlers, _v1, _a1, _m1) = handlers();
		let (client_handlers, mut video_rx, _a2, _m2) = handlers();
		let shutdown = ShutdownManager::new();
		server.spawn_receiver(server_handlers, shutdown.clone());
		client.spawn_receiver(client_handlers, shutdown.clone());

		let payload = vec![9u8; 3000];
		server.send_packet(StreamKind::Video, &payload, 7, false).await.unwrap();

		// Drain the original transmission.
		let num_indices = recv_packet(&mut video_rx).await.num_indices;
		for _ in 1..num_indices {
			recv_packet(&mut video_rx).await;
		}

		client
			.send_message(&ControlMessage::Nack {
				stream: StreamKind::Video,
				frame_id: 7,
				index: 1,
			})
			.await
			.unwrap();

		let resent = recv_packet(&mut video_rx).await;
		assert!(resent.is_nack_response);
		assert_eq!(resent.frame_id, 7);
		assert_eq!(resent.index, 1);
		let _ = shutdown.trigger_shutdown(());
	}

	#[tokio::test]
	async fn tampered_datagrams_are_dropped() {
		let (server, client) = pair().await;
		let (client_handlers, mut video_rx, _a, _m) = handlers();
		let shutdown = ShutdownManager::new();
		client.spawn_receiver(client_handlers, shutdown.clone());

		// A datagram sealed under the wrong key never surfaces.
		let rogue = UdpSocketContext::new(
			UdpSocket::bind("127.0.0.1:0").await.unwrap(),
			*b"fedcba9876543210",
			PeerRole::Server,
		);
		rogue.set_peer(client.inner.socket.local_addr().unwrap());
		rogue.send_packet(StreamKind::Video, b"bogus", 1, false).await.unwrap();

		server.send_packet(StreamKind::Video, b"legit", 2, false).await.unwrap();
		let packet = recv_packet(&mut video_rx).await;
		assert_eq!(packet.frame_id, 2);
		let _ = shutdown.trigger_shutdown(());
	}
}
