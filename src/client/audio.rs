use std::sync::{Arc, Mutex};

use crate::frame::AudioFrame;
use crate::packet::StreamKind;
use crate::ringbuffer::RingBuffer;

/// Contract with the audio output backend.
pub trait AudioPlayer: Send {
	/// Whether the device-side queue has room for another frame.
	fn queue_full(&self) -> bool;

	fn queue_frame(&mut self, data: &[u8]) -> Result<(), ()>;
}

/// Client-side audio pacing: drains ready frames into the playback queue,
/// dropping rather than stalling when the device can't keep up.
pub struct AudioRendererDriver {
	ring: Arc<Mutex<RingBuffer>>,
	player: Box<dyn AudioPlayer>,
	queue_full_drops: u64,
}

impl AudioRendererDriver {
	pub fn new(ring: Arc<Mutex<RingBuffer>>, player: Box<dyn AudioPlayer>) -> Self {
		Self {
			ring,
			player,
			queue_full_drops: 0,
		}
	}

	pub fn queue_full_drops(&self) -> u64 {
		self.queue_full_drops
	}

	/// Queue every consecutive ready frame. Returns how many were queued.
	pub fn try_render(&mut self) -> usize {
		let ring = self.ring.clone();
		let mut ring = ring.lock().unwrap();
		if ring.max_id() == -1 {
			return 0;
		}

		let mut rendered = 0;
		loop {
			let next_id = ring.last_rendered_id() + 1;
			let ready_id = (next_id..=ring.max_id()).find(|&id| ring.is_ready_to_render(id));
			let Some(id) = ready_id else {
				break;
			};

			let Ok(frame) = AudioFrame::from_bytes(ring.set_rendering(id)) else {
				tracing::error!("Reassembled audio frame {id} failed to parse, dropping it.");
				continue;
			};

			// Sentinels only tell us the stream is alive.
			if frame.is_empty_sentinel() {
				continue;
			}

			if self.player.queue_full() {
				// Better to drop a frame than to stall the whole pipeline
				// behind a saturated device queue.
				self.queue_full_drops += 1;
				tracing::debug!("Audio device queue is full, dropping frame {id}.");
				continue;
			}

			if self.player.queue_frame(&frame.data).is_ok() {
				rendered += 1;
			}
		}

		rendered
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet::{Packet, MAX_PAYLOAD_SIZE};
	use crate::ringbuffer::FecEncoder;

	struct CollectingPlayer {
		queued: Arc<Mutex<Vec<Vec<u8>>>>,
		full: Arc<Mutex<bool>>,
	}

	impl AudioPlayer for CollectingPlayer {
		fn queue_full(&self) -> bool {
			*self.full.lock().unwrap()
		}

		fn queue_frame(&mut self, data: &[u8]) -> Result<(), ()> {
			self.queued.lock().unwrap().push(data.to_vec());
			Ok(())
		}
	}

	fn frame_packets(id: u32, frame: &AudioFrame) -> Vec<Packet> {
		let payload = frame.serialize();
		let mut encoder = FecEncoder::new();
		let shards = encoder.encode(&payload, 0.0, MAX_PAYLOAD_SIZE).unwrap();
		let num_indices = shards.num_original as u16;

		shards
			.shards
			.into_iter()
			.enumerate()
			.map(|(index, payload)| Packet {
				stream: StreamKind::Audio,
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

	fn driver() -> (AudioRendererDriver, Arc<Mutex<RingBuffer>>, Arc<Mutex<Vec<Vec<u8>>>>, Arc<Mutex<bool>>) {
		let ring = Arc::new(Mutex::new(RingBuffer::new(StreamKind::Audio, 16, None)));
		let queued = Arc::new(Mutex::new(Vec::new()));
		let full = Arc::new(Mutex::new(false));
		let driver = AudioRendererDriver::new(
			ring.clone(),
			Box::new(CollectingPlayer {
				queued: queued.clone(),
				full: full.clone(),
			}),
		);
		(driver, ring, queued, full)
	}

	#[test]
	fn queues_ready_frames_in_order() {
		let (mut driver, ring, queued, _full) = driver();

		for id in 1..=3u32 {
			let frame = AudioFrame {
				data: vec![id as u8; 400],
			};
			for packet in frame_packets(id, &frame) {
				ring.lock().unwrap().receive_packet(&packet).unwrap();
			}
		}

		assert_eq!(driver.try_render(), 3);
		let queued = queued.lock().unwrap();
		assert_eq!(queued.len(), 3);
		assert_eq!(queued[0][0], 1);
		assert_eq!(queued[2][0], 3);
	}

	#[test]
	fn sentinels_advance_without_queueing() {
		let (mut driver, ring, queued, _full) = driver();

		for packet in frame_packets(1, &AudioFrame::default()) {
			ring.lock().unwrap().receive_packet(&packet).unwrap();
		}

		assert_eq!(driver.try_render(), 0);
		assert!(queued.lock().unwrap().is_empty());
		assert_eq!(ring.lock().unwrap().last_rendered_id(), 1);
	}

	#[test]
	fn full_queue_drops_instead_of_stalling() {
		let (mut driver, ring, queued, full) = driver();
		*full.lock().unwrap() = true;

		for packet in frame_packets(1, &AudioFrame { data: vec![7u8; 400] }) {
			ring.lock().unwrap().receive_packet(&packet).unwrap();
		}

		assert_eq!(driver.try_render(), 0);
		assert!(queued.lock().unwrap().is_empty());
		assert_eq!(driver.queue_full_drops(), 1);
		// The frame is consumed either way; playback never rewinds.
		assert_eq!(ring.lock().unwrap().last_rendered_id(), 1);
	}
}
