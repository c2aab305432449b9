use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::sync::mpsc;

use crate::analyzer::ProtocolAnalyzer;
use crate::congestion::{CongestionController, CongestionSample};
use crate::frame::CodecKind;
use crate::messages::ControlMessage;
use crate::packet::StreamKind;
use crate::ringbuffer::{NackRequest, RingBuffer};
use crate::udp::{UdpHandlers, UdpSocketContext};

pub mod audio;
pub mod video;

use audio::{AudioPlayer, AudioRendererDriver};
use video::{VideoRenderer, VideoRendererDriver};

/// How often the NACK engine scans for missing packets.
const NACK_TICK: Duration = Duration::from_millis(5);

/// How long the UI thread may neglect rendering before the helper task takes
/// over, so the decoder keeps draining even when the UI stalls.
const RENDER_HELPER_DEADLINE: Duration = Duration::from_millis(2);

/// Everything the client runs on top of one UDP association: ring buffers,
/// NACKing, congestion feedback, and the render drivers.
pub struct ClientSession {
	udp: UdpSocketContext,
	video_ring: Arc<Mutex<RingBuffer>>,
	audio_ring: Arc<Mutex<RingBuffer>>,
	video_driver: Arc<Mutex<VideoRendererDriver>>,
	audio_driver: Arc<Mutex<AudioRendererDriver>>,
	analyzer: Arc<ProtocolAnalyzer>,
	last_try_render: Arc<Mutex<Instant>>,
	message_tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ClientSession {
	pub fn new(
		udp: UdpSocketContext,
		video_renderer: Box<dyn VideoRenderer>,
		audio_player: Box<dyn AudioPlayer>,
		video_ring_size: usize,
		audio_ring_size: usize,
		send_frame_acks: bool,
		shutdown: ShutdownManager<()>,
	) -> Arc<Self> {
		let analyzer = Arc::new(ProtocolAnalyzer::new());
		let (nack_tx, nack_rx) = mpsc::unbounded_channel();
		let (message_tx, message_rx) = mpsc::unbounded_channel();

		let mut video_ring = RingBuffer::new(StreamKind::Video, video_ring_size, Some(nack_tx.clone()));
		video_ring.set_analyzer(analyzer.clone());
		let video_ring = Arc::new(Mutex::new(video_ring));

		let mut audio_ring = RingBuffer::new(StreamKind::Audio, audio_ring_size, Some(nack_tx));
		audio_ring.set_analyzer(analyzer.clone());
		let audio_ring = Arc::new(Mutex::new(audio_ring));

		let mut video_driver =
			VideoRendererDriver::new(video_ring.clone(), video_renderer, message_tx.clone(), send_frame_acks);
		video_driver.set_analyzer(analyzer.clone());
		let video_driver = Arc::new(Mutex::new(video_driver));

		let audio_driver = Arc::new(Mutex::new(AudioRendererDriver::new(audio_ring.clone(), audio_player)));

		let session = Arc::new(Self {
			udp: udp.clone(),
			video_ring,
			audio_ring,
			video_driver,
			audio_driver,
			analyzer,
			last_try_render: Arc::new(Mutex::new(Instant::now())),
			message_tx,
		});

		let (video_tx, video_rx) = mpsc::unbounded_channel();
		let (audio_tx, audio_rx) = mpsc::unbounded_channel();
		let (inbound_message_tx, inbound_message_rx) = mpsc::unbounded_channel();
		udp.spawn_receiver(
			UdpHandlers {
				video_tx,
				audio_tx,
				message_tx: inbound_message_tx,
			},
			shutdown.clone(),
		);
		udp.spawn_keepalive(shutdown.clone());

		session.spawn_admission(video_rx, StreamKind::Video, shutdown.clone());
		session.spawn_admission(audio_rx, StreamKind::Audio, shutdown.clone());
		session.spawn_nack_forwarder(nack_rx, shutdown.clone());
		session.spawn_outbox(message_rx, shutdown.clone());
		session.spawn_inbound_messages(inbound_message_rx, shutdown.clone());
		session.spawn_nack_tick(shutdown.clone());
		session.spawn_congestion_control(shutdown.clone());
		session.spawn_render_helper(shutdown);

		session
	}

	pub fn analyzer(&self) -> Arc<ProtocolAnalyzer> {
		self.analyzer.clone()
	}

	pub fn is_connection_lost(&self) -> bool {
		self.udp.is_connection_lost()
	}

	/// Announce the render surface to the server; nothing streams until this
	/// first arrives.
	pub async fn announce_dimensions(&self, width: i32, height: i32, dpi: i32, codec: CodecKind) -> Result<(), ()> {
		self.udp
			.send_message(&ControlMessage::Dimensions {
				width,
				height,
				dpi,
				codec,
			})
			.await
	}

	/// Render pending video and audio. The UI thread should call this at
	/// least every display refresh; the helper task covers the gaps.
	pub fn try_render(&self) {
		*self.last_try_render.lock().unwrap() = Instant::now();

		self.video_driver.lock().unwrap().try_render();
		self.audio_driver.lock().unwrap().try_render();
	}

	fn spawn_admission(
		self: &Arc<Self>,
		mut packet_rx: mpsc::UnboundedReceiver<crate::packet::Packet>,
		stream: StreamKind,
		shutdown: ShutdownManager<()>,
	) {
		let session = self.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();

			while let Ok(Some(packet)) = shutdown.wrap_cancel(packet_rx.recv()).await {
				let ring = match stream {
					StreamKind::Audio => &session.audio_ring,
					_ => &session.video_ring,
				};

				let outcome = { ring.lock().unwrap().receive_packet(&packet) };
				match outcome {
					Ok(outcome) if outcome.ring_reset && stream == StreamKind::Video => {
						// The ring was wiped because rendering stalled; ask
						// the server for a recovery point right away.
						let greatest_failed_id = packet.frame_id.saturating_sub(1);
						session
							.video_driver
							.lock()
							.unwrap()
							.request_recovery(greatest_failed_id as i64);
					},
					Ok(_) => {},
					Err(()) => tracing::trace!("Dropped an inbound {stream:?} packet."),
				}
			}
		});
	}

	fn spawn_nack_forwarder(self: &Arc<Self>, mut nack_rx: mpsc::UnboundedReceiver<NackRequest>, shutdown: ShutdownManager<()>) {
		let udp = self.udp.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();

			while let Ok(Some(request)) = shutdown.wrap_cancel(nack_rx.recv()).await {
				let message = match request {
					NackRequest::Single { stream, frame_id, index } => ControlMessage::Nack {
						stream,
						frame_id,
						index,
					},
					NackRequest::Bitarray {
						stream,
						frame_id,
						start_index,
						bits,
					} => ControlMessage::BitarrayNack {
						stream,
						frame_id,
						start_index,
						bits,
					},
				};
				let _ = udp.send_message(&message).await;
			}
		});
	}

	fn spawn_outbox(self: &Arc<Self>, mut message_rx: mpsc::UnboundedReceiver<ControlMessage>, shutdown: ShutdownManager<()>) {
		let udp = self.udp.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();

			while let Ok(Some(message)) = shutdown.wrap_cancel(message_rx.recv()).await {
				let _ = udp.send_message(&message).await;
			}
		});
	}

	fn spawn_inbound_messages(
		self: &Arc<Self>,
		mut message_rx: mpsc::UnboundedReceiver<(u32, ControlMessage)>,
		shutdown: ShutdownManager<()>,
	) {
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();

			while let Ok(Some((_, message))) = shutdown.wrap_cancel(message_rx.recv()).await {
				match message {
					ControlMessage::AudioFrequency { hz } => {
						tracing::info!("Server audio sample rate is {hz} Hz.");
					},
					ControlMessage::Quit => {
						tracing::info!("Server ended the session.");
						let _ = shutdown.trigger_shutdown(());
					},
					message => {
						tracing::trace!("Skipped server message: {message:?}");
					},
				}
			}
		});
	}

	fn spawn_nack_tick(self: &Arc<Self>, shutdown: ShutdownManager<()>) {
		let session = self.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();
			let mut interval = tokio::time::interval(NACK_TICK);

			loop {
				if shutdown.wrap_cancel(interval.tick()).await.is_err() {
					break;
				}

				let latency = session.udp.rtt();
				session.video_ring.lock().unwrap().try_nacking(latency);
				session.audio_ring.lock().unwrap().try_nacking(latency);
			}
		});
	}

	fn spawn_congestion_control(self: &Arc<Self>, shutdown: ShutdownManager<()>) {
		let session = self.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();
			let mut controller = CongestionController::new();
			let mut interval = tokio::time::interval(crate::congestion::CONTROL_INTERVAL);

			loop {
				if shutdown.wrap_cancel(interval.tick()).await.is_err() {
					break;
				}

				let video_stats = session.video_ring.lock().unwrap().take_stats();
				let audio_stats = session.audio_ring.lock().unwrap().take_stats();

				let incoming_bytes = session.udp.take_incoming_bytes();
				let sample = CongestionSample {
					packets_received: video_stats.packets_received + audio_stats.packets_received,
					packets_nacked: video_stats.packets_nacked + audio_stats.packets_nacked,
					total_delay_gradient_us: video_stats.total_delay_gradient_us,
					total_delay_gradient_squared: video_stats.total_delay_gradient_squared,
					num_gradient_frames: video_stats.num_gradient_frames_tracked,
					rtt: session.udp.rtt(),
					incoming_bitrate_bps: incoming_bytes as f64 * 8.0
						/ crate::congestion::CONTROL_INTERVAL.as_secs_f64(),
				};

				if let Some(settings) = controller.update(&sample) {
					// The server's encoder and pacer follow this snapshot;
					// our own pacing follows it for symmetric budgets.
					session.udp.handle_network_settings(settings).await;
					let _ = session.udp.send_message(&ControlMessage::NetworkFeedback(settings)).await;
				}
			}
		});
	}

	fn spawn_render_helper(self: &Arc<Self>, shutdown: ShutdownManager<()>) {
		let session = self.clone();
		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();
			let mut interval = tokio::time::interval(Duration::from_millis(1));

			loop {
				if shutdown.wrap_cancel(interval.tick()).await.is_err() {
					break;
				}

				let stalled = { session.last_try_render.lock().unwrap().elapsed() > RENDER_HELPER_DEADLINE };
				if stalled {
					session.try_render();
				}
			}
		});
	}

	/// Queue a control message for the server without blocking.
	pub fn post_message(&self, message: ControlMessage) {
		let _ = self.message_tx.send(message);
	}
}
