use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::analyzer::ProtocolAnalyzer;
use crate::frame::VideoFrame;
use crate::messages::ControlMessage;
use crate::packet::StreamKind;
use crate::ringbuffer::RingBuffer;

/// How long a missing frame may block the stream before the renderer skips
/// ahead to the next ready frame. Grows with consecutive skips so a flapping
/// link does not turn into a skip storm.
const SKIP_THRESHOLD_BASE: Duration = Duration::from_millis(8);

/// With no renderable progress at all for this long, the server is asked for
/// a recovery-class frame.
const STALL_TIMEOUT: Duration = Duration::from_millis(250);

/// Contract with the decode/display backend.
pub trait VideoRenderer: Send {
	fn render_frame(&mut self, frame: &VideoFrame) -> Result<(), ()>;
}

/// Client-side video pacing: picks which ready frame to render next, skips
/// irrecoverable gaps, and asks the server for recovery when the stream
/// stops making progress.
pub struct VideoRendererDriver {
	ring: Arc<Mutex<RingBuffer>>,
	renderer: Box<dyn VideoRenderer>,
	message_tx: mpsc::UnboundedSender<ControlMessage>,
	analyzer: Option<Arc<ProtocolAnalyzer>>,
	send_frame_acks: bool,

	last_progress: Instant,
	consecutive_skips: u32,
	last_reset_requested_for: i64,
}

impl VideoRendererDriver {
	pub fn new(
		ring: Arc<Mutex<RingBuffer>>,
		renderer: Box<dyn VideoRenderer>,
		message_tx: mpsc::UnboundedSender<ControlMessage>,
		send_frame_acks: bool,
	) -> Self {
		Self {
			ring,
			renderer,
			message_tx,
			analyzer: None,
			send_frame_acks,
			last_progress: Instant::now(),
			consecutive_skips: 0,
			last_reset_requested_for: -1,
		}
	}

	pub fn set_analyzer(&mut self, analyzer: Arc<ProtocolAnalyzer>) {
		self.analyzer = Some(analyzer);
	}

	/// Render at most one frame. Returns whether anything was rendered.
	pub fn try_render(&mut self) -> bool {
		let ring = self.ring.clone();
		let frame = {
			let mut ring = ring.lock().unwrap();
			if ring.max_id() == -1 {
				return false;
			}

			let next_id = ring.last_rendered_id() + 1;
			let ready_id = (next_id..=ring.max_id()).find(|&id| ring.is_ready_to_render(id));

			let Some(id) = ready_id else {
				drop(ring);
				self.check_stalled();
				return false;
			};

			if id != next_id && ring.last_rendered_id() != -1 {
				// A gap: wait for the missing frames until the adaptive
				// threshold expires, then cut our losses and skip.
				let threshold = SKIP_THRESHOLD_BASE * (self.consecutive_skips + 1);
				if self.last_progress.elapsed() < threshold {
					drop(ring);
					self.check_stalled();
					return false;
				}

				tracing::warn!("Skipping frames {next_id}..{} to resume rendering at frame {id}.", id - 1);
				if let Some(analyzer) = &self.analyzer {
					for skipped in next_id..id {
						analyzer.record_skip(StreamKind::Video, skipped);
					}
				}
				self.consecutive_skips += 1;
				self.request_recovery(id - 1);
			} else {
				self.consecutive_skips = 0;
			}

			match VideoFrame::from_bytes(ring.set_rendering(id)) {
				Ok(frame) => frame,
				Err(()) => {
					tracing::error!("Reassembled video frame {id} failed to parse, dropping it.");
					self.last_progress = Instant::now();
					return false;
				},
			}
		};

		self.last_progress = Instant::now();

		if self.send_frame_acks && !frame.is_empty {
			let frame_id = { self.ring.lock().unwrap().last_rendered_id() };
			let _ = self.message_tx.send(ControlMessage::FrameAck {
				frame_id: frame_id as u32,
			});
		}

		// Empty frames are heartbeats; nothing to hand to the decoder.
		if frame.is_empty {
			return true;
		}

		if self.renderer.render_frame(&frame).is_err() {
			tracing::warn!("Renderer rejected a frame.");
		}

		true
	}

	/// A fully reset ring (overrun) or a persistent stall both end with a
	/// stream-reset request toward the server.
	pub fn request_recovery(&mut self, greatest_failed_id: i64) {
		if greatest_failed_id <= self.last_reset_requested_for {
			return;
		}
		self.last_reset_requested_for = greatest_failed_id;

		tracing::info!("Requesting a video stream reset, greatest failed frame ID {greatest_failed_id}.");
		if let Some(analyzer) = &self.analyzer {
			analyzer.record_stream_reset(StreamKind::Video, greatest_failed_id);
		}
		let _ = self.message_tx.send(ControlMessage::StreamReset {
			stream: StreamKind::Video,
			greatest_failed_id: greatest_failed_id as u32,
		});
	}

	fn check_stalled(&mut self) {
		if self.last_progress.elapsed() < STALL_TIMEOUT {
			return;
		}

		let greatest_failed_id = { self.ring.lock().unwrap().max_id() };
		if greatest_failed_id >= 0 {
			self.request_recovery(greatest_failed_id);
			// Restart the stall clock so the request is not spammed.
			self.last_progress = Instant::now();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet::{Packet, MAX_PAYLOAD_SIZE};
	use crate::ringbuffer::FecEncoder;

	struct CollectingRenderer {
		frames: Arc<Mutex<Vec<VideoFrame>>>,
	}

	impl VideoRenderer for CollectingRenderer {
		fn render_frame(&mut self, frame: &VideoFrame) -> Result<(), ()> {
			self.frames.lock().unwrap().push(frame.clone());
			Ok(())
		}
	}

	fn frame_packets(id: u32, frame: &VideoFrame) -> Vec<Packet> {
		let payload = frame.serialize();
		let mut encoder = FecEncoder::new();
		let shards = encoder.encode(&payload, 0.0, MAX_PAYLOAD_SIZE).unwrap();
		let num_indices = shards.num_original as u16;

		shards
			.shards
			.into_iter()
			.enumerate()
			.map(|(index, payload)| Packet {
				stream: StreamKind::Video,
				is_nack_response: false,
				is_stream_start: false,
				frame_id: id,
				index: index as u16,
				num_indices,
				num_fec_indices: 0,
				payload,
			})
			.collect()
	}

	fn test_frame() -> VideoFrame {
		let mut frame = VideoFrame::empty(true);
		frame.is_empty = false;
		frame.width = 640;
		frame.height = 480;
		frame.data = vec![0xAB; 2000];
		frame
	}

	fn driver() -> (
		VideoRendererDriver,
		Arc<Mutex<RingBuffer>>,
		Arc<Mutex<Vec<VideoFrame>>>,
		mpsc::UnboundedReceiver<ControlMessage>,
	) {
		let ring = Arc::new(Mutex::new(RingBuffer::new(StreamKind::Video, 16, None)));
		let frames = Arc::new(Mutex::new(Vec::new()));
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let driver = VideoRendererDriver::new(
			ring.clone(),
			Box::new(CollectingRenderer { frames: frames.clone() }),
			message_tx,
			true,
		);
		(driver, ring, frames, message_rx)
	}

	#[test]
	fn renders_ready_frames_in_order() {
		let (mut driver, ring, frames, mut message_rx) = driver();

		for id in 1..=3u32 {
			for packet in frame_packets(id, &test_frame()) {
				ring.lock().unwrap().receive_packet(&packet).unwrap();
			}
		}

		assert!(driver.try_render());
		assert!(driver.try_render());
		assert!(driver.try_render());
		assert!(!driver.try_render());

		assert_eq!(frames.lock().unwrap().len(), 3);
		assert_eq!(ring.lock().unwrap().last_rendered_id(), 3);

		// With acks enabled, every rendered frame is acknowledged.
		let mut acks = 0;
		while let Ok(message) = message_rx.try_recv() {
			if matches!(message, ControlMessage::FrameAck { .. }) {
				acks += 1;
			}
		}
		assert_eq!(acks, 3);
	}

	#[test]
	fn empty_frames_advance_without_rendering() {
		let (mut driver, ring, frames, _message_rx) = driver();

		for packet in frame_packets(1, &VideoFrame::empty(true)) {
			ring.lock().unwrap().receive_packet(&packet).unwrap();
		}

		assert!(driver.try_render());
		assert!(frames.lock().unwrap().is_empty());
		assert_eq!(ring.lock().unwrap().last_rendered_id(), 1);
	}

	#[test]
	fn gap_is_skipped_only_after_threshold() {
		let (mut driver, ring, frames, mut message_rx) = driver();

		// Frame 1 rendered; frame 2 lost; frame 3 ready.
		for packet in frame_packets(1, &test_frame()) {
			ring.lock().unwrap().receive_packet(&packet).unwrap();
		}
		assert!(driver.try_render());

		for packet in frame_packets(3, &test_frame()) {
			ring.lock().unwrap().receive_packet(&packet).unwrap();
		}

		// Immediately after progress, the gap is not yet skipped.
		assert!(!driver.try_render());

		// After the skip threshold the driver jumps to frame 3 and asks for
		// recovery of the lost range.
		std::thread::sleep(SKIP_THRESHOLD_BASE + Duration::from_millis(2));
		assert!(driver.try_render());
		assert_eq!(ring.lock().unwrap().last_rendered_id(), 3);
		assert_eq!(frames.lock().unwrap().len(), 2);

		let reset = std::iter::from_fn(|| message_rx.try_recv().ok())
			.find(|m| matches!(m, ControlMessage::StreamReset { .. }));
		assert!(matches!(
			reset,
			Some(ControlMessage::StreamReset { stream: StreamKind::Video, greatest_failed_id: 2 })
		));
	}

	#[test]
	fn stall_requests_recovery_once() {
		let (mut driver, ring, _frames, mut message_rx) = driver();

		// Only an unfinishable frame exists: packet 1 of 3.
		let packets = frame_packets(1, &test_frame());
		assert!(packets.len() >= 2);
		ring.lock().unwrap().receive_packet(&packets[0]).unwrap();

		driver.last_progress = Instant::now() - STALL_TIMEOUT - Duration::from_millis(1);
		assert!(!driver.try_render());

		let reset = std::iter::from_fn(|| message_rx.try_recv().ok())
			.find(|m| matches!(m, ControlMessage::StreamReset { .. }));
		assert!(reset.is_some());

		// The same failed id is not re-requested.
		driver.last_progress = Instant::now() - STALL_TIMEOUT - Duration::from_millis(1);
		assert!(!driver.try_render());
		assert!(message_rx.try_recv().is_err());
	}
}
