use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::congestion::MIN_FPS;
use crate::frame::{CursorImage, RgbColor, VideoFrame, LARGEST_VIDEO_FRAME_SIZE};
use crate::packet::StreamKind;
use crate::session::SessionState;
use crate::udp::UdpSocketContext;

pub mod encoder;
pub mod ltr;

use encoder::{destroy_in_background, EncoderConfig, EncoderFactory, PendingEncoder, VideoEncoder, VBV_SEC};
use ltr::{LtrAction, LtrContext};

/// Bitrate reserved for the audio stream, including its resend headroom.
pub const AUDIO_BITRATE: u32 = 128_000;
pub const NUM_PREV_AUDIO_FRAMES_RESEND: u32 = 2;

/// After this many identical captures in a row the encoder is disabled and
/// only heartbeat frames go out, to save client CPU.
pub const CONSECUTIVE_IDENTICAL_FRAMES: u32 = 60;

/// Heartbeat rate while the encoder is disabled.
pub const DISABLED_ENCODER_FPS: u32 = 10;

pub const MIN_SCREEN: u32 = 64;
pub const MAX_SCREEN: u32 = 8192;

/// How often the FPS pacing window restarts, so a past slow stretch does not
/// cause a burst of catch-up frames.
const FPS_WINDOW: Duration = Duration::from_secs(1);

/// One captured screen image on its way to the encoder. The pixel data is
/// opaque to the core; capture and encoder backends agree on its format.
pub struct CapturedFrame {
	pub width: u32,
	pub height: u32,
	pub data: Vec<u8>,
	pub corner_color: RgbColor,
	pub cursor: Option<CursorImage>,
	pub cursor_hash: u32,
}

/// Contract with the screen capture backend.
pub trait CaptureDevice: Send {
	fn reconfigure(&mut self, width: u32, height: u32, dpi: i32) -> Result<(), ()>;

	fn dimensions(&self) -> (u32, u32);

	/// Returns how many frames have passed since the previous call; zero
	/// means the screen is unchanged.
	fn capture(&mut self) -> Result<u32, ()>;

	/// Hand the most recent capture to the caller for encoding.
	fn transfer(&mut self) -> Result<CapturedFrame, ()>;
}

/// Round capture dimensions the way encoders expect: width to a multiple of
/// eight, height to a multiple of two, both clamped to the supported range.
pub fn round_dimensions(width: u32, height: u32) -> (u32, u32) {
	let width = (width + 7) - ((width + 7) % 8);
	let height = (height + 1) - ((height + 1) % 2);
	(width.clamp(MIN_SCREEN, MAX_SCREEN), height.clamp(MIN_SCREEN, MAX_SCREEN))
}

struct OutboundFrame {
	frame_id: u32,
	payload: Vec<u8>,
	is_recovery: bool,
}

/// The server's capture -> encode -> send pipeline. The drive loop runs on a
/// dedicated thread; encoded frames move to an async send task through a
/// single-slot channel so the next frame can be prepared while the previous
/// one is on the wire.
pub struct VideoPipeline {
	thread: Option<std::thread::JoinHandle<()>>,
}

impl VideoPipeline {
	pub fn launch(
		udp: UdpSocketContext,
		state: Arc<SessionState>,
		capture: Box<dyn CaptureDevice>,
		factory: Arc<dyn EncoderFactory>,
		ltr_enabled: bool,
		shutdown: ShutdownManager<()>,
	) -> Self {
		let (frame_tx, frame_rx) = mpsc::channel(1);

		tokio::spawn(run_sender(udp.clone(), frame_rx, shutdown.clone()));

		let thread = std::thread::spawn({
			let state = state.clone();
			move || {
				let _delay_stop = shutdown.delay_shutdown_token();
				drive(udp, state, capture, factory, ltr_enabled, frame_tx, shutdown);
			}
		});

		Self { thread: Some(thread) }
	}

	pub fn join(&mut self) {
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

#[allow(clippy::too_many_arguments)]
fn drive(
	udp: UdpSocketContext,
	state: Arc<SessionState>,
	mut capture: Box<dyn CaptureDevice>,
	factory: Arc<dyn EncoderFactory>,
	ltr_enabled: bool,
	frame_tx: mpsc::Sender<OutboundFrame>,
	shutdown: ShutdownManager<()>,
) {
	let mut encoder: Option<Box<dyn VideoEncoder>> = None;
	let mut pending_encoder: Option<PendingEncoder> = None;
	let mut ltr = ltr_enabled.then(LtrContext::new);

	let mut id: i64 = 0;
	let mut consecutive_identical_frames: u32 = 0;
	let mut last_settings = None;
	let mut last_cursor_hash: u32 = 0;

	let mut fps_window_start = Instant::now();
	let mut fps_window_start_id: i64 = 0;

	state.update_device.store(true, Ordering::Relaxed);

	while !state.exiting.load(Ordering::Relaxed) && !shutdown.is_shutdown_triggered() {
		// Capturing before the renderer announces its dimensions is wasted.
		let Some(dimensions) = state.dimensions() else {
			std::thread::sleep(Duration::from_millis(1));
			continue;
		};

		if state.update_device.swap(false, Ordering::Relaxed) {
			let (width, height) = round_dimensions(dimensions.width, dimensions.height);
			tracing::info!("Reconfiguring the capture device to {width}x{height} at {} DPI.", dimensions.dpi);
			if capture.reconfigure(width, height, dimensions.dpi).is_err() {
				tracing::warn!("Failed to reconfigure the capture device, retrying.");
				state.update_device.store(true, Ordering::Relaxed);
				std::thread::sleep(Duration::from_millis(100));
				continue;
			}
			state.update_encoder.store(true, Ordering::Relaxed);
			state.stream_needs_restart.store(true, Ordering::Relaxed);
		}

		let settings = udp.settings();
		let video_bitrate = (settings.bitrate_bps as i64
			- ((NUM_PREV_AUDIO_FRAMES_RESEND + 1) * AUDIO_BITRATE) as i64) as f64
			* (1.0 - settings.video_fec_ratio);
		assert!(video_bitrate > 0.0, "No bitrate left for video after the audio reservation.");

		if last_settings != Some(settings) {
			state.update_encoder.store(true, Ordering::Relaxed);
			last_settings = Some(settings);
		}

		if state.update_encoder.load(Ordering::Relaxed) {
			let (width, height) = capture.dimensions();
			let burst_ratio = settings.burst_bitrate_bps as f64 / settings.bitrate_bps as f64;
			let config = EncoderConfig {
				width,
				height,
				bitrate_bps: video_bitrate as u32,
				vbv_size: (VBV_SEC * video_bitrate * burst_ratio) as u32,
				codec: settings.desired_codec,
				fps: settings.fps,
			};

			let mut replacement = None;
			match encoder.as_mut() {
				None => {
					// Nothing to encode with yet; build synchronously.
					match factory.create(&config) {
						Ok(new_encoder) => {
							encoder = Some(new_encoder);
							state.update_encoder.store(false, Ordering::Relaxed);
							state.stream_needs_restart.store(true, Ordering::Relaxed);
						},
						Err(()) => {
							tracing::error!("Could not create a video encoder, giving up.");
							state.exiting.store(true, Ordering::Relaxed);
							break;
						},
					}
				},
				Some(current) => {
					if current.reconfigure(&config).is_ok() {
						state.update_encoder.store(false, Ordering::Relaxed);
						pending_encoder = None;
					} else if let Some(pending) = &pending_encoder {
						// Keep encoding with the old encoder until the
						// replacement is ready, then swap atomically.
						match pending.try_take() {
							Some(Ok(new_encoder)) => replacement = Some(new_encoder),
							Some(Err(())) => {
								tracing::error!("Encoder replacement failed, giving up.");
								state.exiting.store(true, Ordering::Relaxed);
								break;
							},
							None => {},
						}
					} else {
						tracing::info!("In-place reconfigure failed, building a replacement encoder.");
						pending_encoder = Some(PendingEncoder::build(factory.clone(), config));
					}
				},
			}
			if let Some(new_encoder) = replacement {
				let old = encoder.replace(new_encoder).unwrap();
				destroy_in_background(old);
				pending_encoder = None;
				state.update_encoder.store(false, Ordering::Relaxed);
			}
		}

		let Some(active_encoder) = encoder.as_mut() else {
			std::thread::sleep(Duration::from_millis(1));
			continue;
		};

		if let Some(ltr) = ltr.as_mut() {
			if let Some(ack) = state.take_frame_ack() {
				ltr.mark_frame_received(ack);
			}
		}

		// Timestamp before capturing, so the measurement spans the full
		// pre-capture to post-render path.
		let server_timestamp = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.unwrap_or_default()
			.as_micros() as i64;
		let client_input_timestamp = state.client_input_timestamp_us();

		let stream_needs_restart = state.stream_needs_restart.load(Ordering::Relaxed);

		let mut accumulated_frames = 0;
		if !state.stop_streaming.load(Ordering::Relaxed) || stream_needs_restart {
			accumulated_frames = match capture.capture() {
				Ok(accumulated) => accumulated,
				Err(()) => {
					tracing::warn!("Failed to capture the screen, recreating the capture device.");
					state.update_device.store(true, Ordering::Relaxed);
					std::thread::sleep(Duration::from_millis(100));
					continue;
				},
			};
			if accumulated_frames > 0 {
				consecutive_identical_frames = 0;
			}
			if accumulated_frames > 1 {
				tracing::debug!("{accumulated_frames} frames passed since the last capture.");
			}
		}

		let disable_encoder = consecutive_identical_frames > CONSECUTIVE_IDENTICAL_FRAMES && !stream_needs_restart;
		let min_fps = if disable_encoder { DISABLED_ENCODER_FPS } else { MIN_FPS };

		if fps_window_start.elapsed() > FPS_WINDOW {
			fps_window_start = Instant::now();
			fps_window_start_id = id;
		}

		let due_for_heartbeat =
			fps_window_start.elapsed().as_secs_f64() > (id - fps_window_start_id) as f64 / min_fps as f64;
		if accumulated_frames == 0 && !stream_needs_restart && !due_for_heartbeat {
			std::thread::sleep(Duration::from_micros(100));
			continue;
		}

		if accumulated_frames == 0 {
			consecutive_identical_frames += 1;
		}

		id += 1;

		if disable_encoder {
			// Heartbeat only: the stream is alive, the screen unchanged.
			let frame = VideoFrame::empty(!state.stop_streaming.load(Ordering::Relaxed));
			if frame_tx
				.blocking_send(OutboundFrame {
					frame_id: id as u32,
					payload: frame.serialize(),
					is_recovery: false,
				})
				.is_err()
			{
				break;
			}
			continue;
		}

		let captured = match capture.transfer() {
			Ok(captured) => captured,
			Err(()) => {
				tracing::warn!("Failed to transfer the capture, recreating the capture device.");
				state.update_device.store(true, Ordering::Relaxed);
				continue;
			},
		};

		let stream_needs_recovery = state.stream_needs_recovery.load(Ordering::Relaxed);
		let action = match ltr.as_mut() {
			Some(ltr) => {
				if stream_needs_restart {
					ltr.force_intra();
				} else if stream_needs_recovery {
					ltr.mark_stream_broken();
				}
				let action = ltr.next_action(id);
				tracing::debug!("Frame type for frame ID {id}: {action:?}");
				active_encoder.set_ltr_action(action);
				action
			},
			None => {
				if stream_needs_restart || stream_needs_recovery {
					active_encoder.request_intra();
					LtrAction::Intra
				} else {
					LtrAction::Normal
				}
			},
		};
		state.stream_needs_restart.store(false, Ordering::Relaxed);
		state.stream_needs_recovery.store(false, Ordering::Relaxed);

		let encoded = match active_encoder.encode(&captured) {
			Ok(encoded) => encoded,
			Err(()) => {
				tracing::error!("Error encoding a video frame, exiting.");
				state.exiting.store(true, Ordering::Relaxed);
				break;
			},
		};
		if ltr.is_some() {
			assert_eq!(encoded.kind, action.frame_kind(), "Encoder produced an unexpected frame type.");
		}
		if encoded.data.is_empty() {
			continue;
		}

		// Embed the cursor on recovery points and whenever it changed.
		let cursor = if captured.cursor.is_some()
			&& (encoded.kind.is_recovery_point() || captured.cursor_hash != last_cursor_hash)
		{
			last_cursor_hash = captured.cursor_hash;
			captured.cursor
		} else {
			None
		};

		let frame = VideoFrame {
			width: captured.width as i32,
			height: captured.height as i32,
			codec: settings.desired_codec,
			kind: encoded.kind,
			long_term_index: encoded.long_term_index,
			is_empty: false,
			is_window_visible: true,
			corner_color: captured.corner_color,
			cursor,
			server_timestamp,
			client_input_timestamp,
			data: encoded.data,
		};

		let payload = frame.serialize();
		if payload.len() > LARGEST_VIDEO_FRAME_SIZE {
			tracing::error!("Frame of {} bytes is too large, dropping it.", payload.len());
			continue;
		}

		if encoded.kind.is_recovery_point() {
			tracing::info!("Sent video frame {id} ({} bytes, {:?}).", payload.len(), encoded.kind);
		}

		if frame_tx
			.blocking_send(OutboundFrame {
				frame_id: id as u32,
				payload,
				is_recovery: encoded.kind.is_recovery_point(),
			})
			.is_err()
		{
			break;
		}
	}

	tracing::debug!("Video drive loop stopped.");
}

/// Pulls encoded frames from the drive loop and paces them onto the wire.
/// While no new frame is queued and the client asked to saturate bandwidth,
/// indices of the latest frame are re-sent round-robin.
async fn run_sender(
	udp: UdpSocketContext,
	mut frame_rx: mpsc::Receiver<OutboundFrame>,
	shutdown: ShutdownManager<()>,
) {
	let _delay_stop = shutdown.delay_shutdown_token();
	let mut pending: Option<OutboundFrame> = None;

	'outer: loop {
		let frame = match pending.take() {
			Some(frame) => frame,
			None => match shutdown.wrap_cancel(frame_rx.recv()).await {
				Ok(Some(frame)) => frame,
				_ => break,
			},
		};

		if udp
			.send_packet(StreamKind::Video, &frame.payload, frame.frame_id, frame.is_recovery)
			.await
			.is_err()
		{
			tracing::warn!("Failed to send video frame {}.", frame.frame_id);
		}

		let mut resend_index: u16 = 0;
		while udp.settings().saturate_bandwidth && !shutdown.is_shutdown_triggered() {
			match frame_rx.try_recv() {
				Ok(next) => {
					pending = Some(next);
					continue 'outer;
				},
				Err(TryRecvError::Empty) => {
					let Some(num_indices) = udp.num_indices(StreamKind::Video, frame.frame_id) else {
						break;
					};
					let _ = udp.resend_packet(StreamKind::Video, frame.frame_id, resend_index).await;
					resend_index = (resend_index + 1) % num_indices as u16;
				},
				Err(TryRecvError::Disconnected) => break 'outer,
			}
		}
	}

	tracing::debug!("Video send task stopped.");
}

/// The virtual capture variant: synthesizes a deterministic test pattern at a
/// fixed cadence. Real deployments inject an OS capture backend instead.
pub struct VirtualCaptureDevice {
	width: u32,
	height: u32,
	frame_interval: Duration,
	last_capture: Instant,
	frame_counter: u64,
	static_screen: bool,
}

impl VirtualCaptureDevice {
	pub fn new(fps: u32) -> Self {
		Self {
			width: 1280,
			height: 720,
			frame_interval: Duration::from_secs(1) / fps.max(1),
			last_capture: Instant::now(),
			frame_counter: 0,
			static_screen: false,
		}
	}

	/// Freeze the pattern; capture() will report no new frames.
	pub fn set_static_screen(&mut self, static_screen: bool) {
		self.static_screen = static_screen;
	}
}

impl CaptureDevice for VirtualCaptureDevice {
	fn reconfigure(&mut self, width: u32, height: u32, _dpi: i32) -> Result<(), ()> {
		self.width = width;
		self.height = height;
		Ok(())
	}

	fn dimensions(&self) -> (u32, u32) {
		(self.width, self.height)
	}

	fn capture(&mut self) -> Result<u32, ()> {
		if self.static_screen {
			return Ok(0);
		}

		let elapsed = self.last_capture.elapsed();
		let accumulated = (elapsed.as_secs_f64() / self.frame_interval.as_secs_f64()) as u32;
		if accumulated > 0 {
			self.last_capture += self.frame_interval * accumulated;
			self.frame_counter += accumulated as u64;
		} else {
			// Stay gentle on the CPU between frames.
			std::thread::sleep(Duration::from_millis(1));
		}

		Ok(accumulated)
	}

	fn transfer(&mut self) -> Result<CapturedFrame, ()> {
		let mut data = vec![0u8; 16 * 1024];
		data[..8].copy_from_slice(&self.frame_counter.to_le_bytes());
		for (i, byte) in data.iter_mut().enumerate().skip(8) {
			*byte = (i as u64 ^ self.frame_counter) as u8;
		}

		Ok(CapturedFrame {
			width: self.width,
			height: self.height,
			data,
			corner_color: RgbColor {
				r: (self.frame_counter % 255) as u8,
				g: 0x20,
				b: 0x40,
			},
			cursor: None,
			cursor_hash: 0,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::ClientDimensions;
	use crate::udp::{PeerRole, UdpHandlers};
	use super::encoder::PassthroughEncoderFactory;

	#[test]
	fn dimensions_are_rounded_for_the_encoder() {
		assert_eq!(round_dimensions(1279, 719), (1280, 720));
		assert_eq!(round_dimensions(1280, 720), (1280, 720));
		assert_eq!(round_dimensions(1919, 1079), (1920, 1080));
		assert_eq!(round_dimensions(1, 1), (MIN_SCREEN, MIN_SCREEN));
		assert_eq!(round_dimensions(100_000, 100_000), (MAX_SCREEN, MAX_SCREEN));
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn pipeline_streams_an_intra_frame_first() {
		let server_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let client_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_address = server_socket.local_addr().unwrap();
		let client_address = client_socket.local_addr().unwrap();

		let key = *b"0123456789abcdef";
		let server = UdpSocketContext::new(server_socket, key, PeerRole::Server);
		let client = UdpSocketContext::new(client_socket, key, PeerRole::Client);
		server.set_peer(client_address);
		client.set_peer(server_address);

		let (video_tx, mut video_rx) = mpsc::unbounded_channel();
		let (audio_tx, _audio_rx) = mpsc::unbounded_channel();
		let (message_tx, _message_rx) = mpsc::unbounded_channel();
		let shutdown = ShutdownManager::new();
		client.spawn_receiver(
			UdpHandlers {
				video_tx,
				audio_tx,
				message_tx,
			},
			shutdown.clone(),
		);

		let state = SessionState::new();
		state.set_dimensions(ClientDimensions {
			width: 1280,
			height: 720,
			dpi: 96,
		});

		let mut pipeline = VideoPipeline::launch(
			server,
			state.clone(),
			Box::new(VirtualCaptureDevice::new(120)),
			Arc::new(PassthroughEncoderFactory),
			true,
			shutdown.clone(),
		);

		// Reassemble inbound packets until the first whole frame arrives.
		let mut ring = crate::ringbuffer::RingBuffer::new(StreamKind::Video, 16, None);
		let frame = tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				let packet = video_rx.recv().await.expect("packet channel closed");
				let outcome = ring.receive_packet(&packet).unwrap();
				if outcome.became_ready {
					let id = packet.frame_id as i64;
					return VideoFrame::from_bytes(ring.set_rendering(id)).unwrap();
				}
			}
		})
		.await
		.expect("no frame arrived");

		assert_eq!(frame.kind, crate::frame::VideoFrameKind::Intra);
		assert_eq!(frame.width, 1280);
		assert!(!frame.data.is_empty());

		state.exiting.store(true, Ordering::Relaxed);
		let _ = shutdown.trigger_shutdown(());
		pipeline.join();
	}
}
