use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::sync::mpsc;

use crate::frame::AudioFrame;
use crate::packet::StreamKind;
use crate::session::SessionState;
use crate::udp::UdpSocketContext;

/// While no audio flows, an empty sentinel frame goes out at this cadence so
/// the client knows the stream is alive rather than broken.
const SILENCE_HEARTBEAT: Duration = Duration::from_millis(100);

/// Contract with the audio capture backend. Blocks arrive at the backend's
/// own cadence; `None` means silence.
pub trait AudioCapture: Send {
	fn sample_rate(&self) -> u32;

	fn next_block(&mut self) -> Result<Option<Vec<u8>>, ()>;
}

/// Opaque audio codec backend.
pub trait AudioEncoder: Send {
	fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>, ()>;
}

struct OutboundAudio {
	frame_id: u32,
	payload: Vec<u8>,
}

/// The server's audio capture -> encode -> send pipeline, mirroring the video
/// pipeline's thread + send-task split.
pub struct AudioPipeline {
	thread: Option<std::thread::JoinHandle<()>>,
}

impl AudioPipeline {
	pub fn launch(
		udp: UdpSocketContext,
		state: Arc<SessionState>,
		capture: Box<dyn AudioCapture>,
		encoder: Box<dyn AudioEncoder>,
		shutdown: ShutdownManager<()>,
	) -> Self {
		let (frame_tx, frame_rx) = mpsc::channel(1);

		tokio::spawn(run_sender(udp, frame_rx, shutdown.clone()));

		let thread = std::thread::spawn(move || {
			let _delay_stop = shutdown.delay_shutdown_token();
			drive(state, capture, encoder, frame_tx, shutdown);
		});

		Self { thread: Some(thread) }
	}

	pub fn join(&mut self) {
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

fn drive(
	state: Arc<SessionState>,
	mut capture: Box<dyn AudioCapture>,
	mut encoder: Box<dyn AudioEncoder>,
	frame_tx: mpsc::Sender<OutboundAudio>,
	shutdown: ShutdownManager<()>,
) {
	let mut id: u32 = 0;
	let mut last_audio = Instant::now();

	while !state.exiting.load(Ordering::Relaxed) && !shutdown.is_shutdown_triggered() {
		let block = match capture.next_block() {
			Ok(block) => block,
			Err(()) => {
				tracing::warn!("Audio capture failed, retrying.");
				std::thread::sleep(Duration::from_millis(100));
				continue;
			},
		};

		let frame = match block {
			Some(pcm) => {
				last_audio = Instant::now();
				let Ok(data) = encoder.encode(&pcm) else {
					tracing::warn!("Failed to encode an audio block, dropping it.");
					continue;
				};
				AudioFrame { data }
			},
			None => {
				if last_audio.elapsed() < SILENCE_HEARTBEAT {
					std::thread::sleep(Duration::from_millis(1));
					continue;
				}
				last_audio = Instant::now();
				AudioFrame::default()
			},
		};

		id += 1;
		if frame_tx
			.blocking_send(OutboundAudio {
				frame_id: id,
				payload: frame.serialize(),
			})
			.is_err()
		{
			break;
		}
	}

	tracing::debug!("Audio drive loop stopped.");
}

async fn run_sender(udp: UdpSocketContext, mut frame_rx: mpsc::Receiver<OutboundAudio>, shutdown: ShutdownManager<()>) {
	let _delay_stop = shutdown.delay_shutdown_token();

	while let Ok(Some(frame)) = shutdown.wrap_cancel(frame_rx.recv()).await {
		if udp
			.send_packet(StreamKind::Audio, &frame.payload, frame.frame_id, frame.frame_id == 1)
			.await
			.is_err()
		{
			tracing::warn!("Failed to send audio frame {}.", frame.frame_id);
		}
	}

	tracing::debug!("Audio send task stopped.");
}

/// Virtual audio source: 10 ms blocks of silence at the configured sample
/// rate, or nothing at all when muted.
pub struct VirtualAudioCapture {
	sample_rate: u32,
	block_interval: Duration,
	last_block: Instant,
	muted: bool,
}

impl VirtualAudioCapture {
	pub fn new(sample_rate: u32) -> Self {
		Self {
			sample_rate,
			block_interval: Duration::from_millis(10),
			last_block: Instant::now(),
			muted: false,
		}
	}

	pub fn set_muted(&mut self, muted: bool) {
		self.muted = muted;
	}
}

impl AudioCapture for VirtualAudioCapture {
	fn sample_rate(&self) -> u32 {
		self.sample_rate
	}

	fn next_block(&mut self) -> Result<Option<Vec<u8>>, ()> {
		if self.muted {
			std::thread::sleep(Duration::from_millis(1));
			return Ok(None);
		}

		if self.last_block.elapsed() < self.block_interval {
			std::thread::sleep(Duration::from_millis(1));
			return Ok(None);
		}
		self.last_block += self.block_interval;

		// 10 ms of 16-bit stereo silence.
		let samples = self.sample_rate as usize / 100;
		Ok(Some(vec![0u8; samples * 4]))
	}
}

/// Virtual audio codec: passes PCM through untouched.
pub struct PassthroughAudioEncoder;

impl AudioEncoder for PassthroughAudioEncoder {
	fn encode(&mut self, pcm: &[u8]) -> Result<Vec<u8>, ()> {
		Ok(pcm.to_vec())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ringbuffer::RingBuffer;
	use crate::udp::{PeerRole, UdpHandlers};

	#[tokio::test(flavor = "multi_thread")]
	async fn pipeline_delivers_audio_frames() {
		let server_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let client_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_address = server_socket.local_addr().unwrap();
		let client_address = client_socket.local_addr().unwrap();

		let key = *b"0123456789abcdef";
		let server = UdpSocketContext::new(server_socket, key, PeerRole::Server);
		let client = UdpSocketContext::new(client_socket, key, PeerRole::Client);
		server.set_peer(client_address);
		client.set_peer(server_address);

		let (video_tx, _video_rx) = mpsc::unbounded_channel();
		let (audio_tx, mut audio_rx) = mpsc::unbounded_channel();
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
		let mut pipeline = AudioPipeline::launch(
			server,
			state.clone(),
			Box::new(VirtualAudioCapture::new(48_000)),
			Box::new(PassthroughAudioEncoder),
			shutdown.clone(),
		);

		let mut ring = RingBuffer::new(StreamKind::Audio, 16, None);
		let frame = tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				let packet = audio_rx.recv().await.expect("packet channel closed");
				let outcome = ring.receive_packet(&packet).unwrap();
				if outcome.became_ready {
					let id = packet.frame_id as i64;
					return AudioFrame::from_bytes(ring.set_rendering(id)).unwrap();
				}
			}
		})
		.await
		.expect("no audio frame arrived");

		// 10 ms of 48 kHz 16-bit stereo.
		assert_eq!(frame.data.len(), 480 * 4);

		state.exiting.store(true, Ordering::Relaxed);
		let _ = shutdown.trigger_shutdown(());
		pipeline.join();
	}

	#[test]
	fn muted_capture_produces_no_blocks() {
		let mut capture = VirtualAudioCapture::new(48_000);
		capture.set_muted(true);
		assert_eq!(capture.next_block().unwrap(), None);
	}
}
