use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::alloc::{Block, BlockAllocator};
use crate::analyzer::ProtocolAnalyzer;
use crate::frame::{VideoFrame, LARGEST_AUDIO_FRAME_SIZE, LARGEST_VIDEO_FRAME_SIZE};
use crate::packet::{Packet, StreamKind, MAX_PACKETS, MAX_PAYLOAD_SIZE};

mod fec;
mod nack;

pub use fec::{num_fec_shards, FecDecoder, FecEncoder, FecShards};
pub use nack::NackRequest;

/// Largest ring buffer we are willing to allocate.
pub const MAX_RING_BUFFER_SIZE: usize = 500;

/// One frame being reassembled from packets.
pub(crate) struct FrameSlot {
	pub id: i64,
	pub num_original: usize,
	pub num_fec: usize,
	pub buffer: Block,
	/// Sum of payload sizes; only meaningful for frames without FEC.
	pub frame_size: usize,
	pub received_indices: Vec<bool>,
	pub times_index_nacked: Vec<u8>,
	pub original_packets_received: usize,
	pub fec_packets_received: usize,
	pub fec_decoder: Option<FecDecoder>,
	pub decoded: Option<Vec<u8>>,

	// Nack bookkeeping.
	pub recovery_mode: bool,
	pub num_times_nacked: u32,
	pub last_nacked_index: i64,
	pub created: Instant,
	pub last_nonnack_packet: Instant,
	pub last_nacked: Instant,
}

impl FrameSlot {
	fn framebuffer(&self) -> Option<&[u8]> {
		if self.num_fec > 0 {
			self.decoded.as_deref()
		} else if self.original_packets_received == self.num_original {
			Some(&self.buffer[..self.frame_size])
		} else {
			None
		}
	}
}

/// What happened to a packet offered to [`RingBuffer::receive_packet`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReceiveOutcome {
	pub accepted: bool,
	pub became_ready: bool,
	pub ring_reset: bool,
}

/// Receive statistics accumulated for the congestion controller. Reset each
/// control interval, separately from the ring buffer itself.
#[derive(Clone, Debug, Default)]
pub struct RingStats {
	pub packets_received: u64,
	pub packets_nacked: u64,
	pub frames_rendered: u64,
	pub frames_skipped: u64,
	pub total_delay_gradient_us: f64,
	pub total_delay_gradient_squared: f64,
	pub num_gradient_frames_tracked: u64,
}

/// Per-stream reassembly buffer: turns packets into in-order ready frames and
/// decides when to request retransmission. A slot at `id % size` holds at
/// most one in-progress frame; collisions evict per the overwrite policy.
pub struct RingBuffer {
	pub(crate) kind: StreamKind,
	pub(crate) size: usize,
	pub(crate) slots: Vec<Option<FrameSlot>>,
	allocator: BlockAllocator,
	largest_frame_size: usize,

	pub(crate) currently_rendering_id: i64,
	currently_rendering: Option<FrameSlot>,
	pub(crate) last_rendered_id: i64,
	pub(crate) max_id: i64,
	pub(crate) frames_received: u64,
	pub(crate) last_missing_frame_nack: i64,

	pub(crate) stats: RingStats,
	pub(crate) nack_tx: Option<mpsc::UnboundedSender<NackRequest>>,
	pub(crate) nack_throttle: nack::NackThrottle,
	analyzer: Option<Arc<ProtocolAnalyzer>>,

	// Delay gradient tracking across consecutively ready frames.
	prev_ready_at: Option<Instant>,
	prev_server_timestamp: i64,
}

impl RingBuffer {
	/// A `nack_tx` of `None` disables nacking entirely.
	pub fn new(kind: StreamKind, size: usize, nack_tx: Option<mpsc::UnboundedSender<NackRequest>>) -> Self {
		assert!(size > 0 && size <= MAX_RING_BUFFER_SIZE);

		let largest_frame_size = match kind {
			StreamKind::Audio => LARGEST_AUDIO_FRAME_SIZE,
			_ => LARGEST_VIDEO_FRAME_SIZE,
		};

		Self {
			kind,
			size,
			slots: (0..size).map(|_| None).collect(),
			allocator: BlockAllocator::new(largest_frame_size),
			largest_frame_size,
			currently_rendering_id: -1,
			currently_rendering: None,
			last_rendered_id: -1,
			max_id: -1,
			frames_received: 0,
			last_missing_frame_nack: -1,
			stats: RingStats::default(),
			nack_tx,
			nack_throttle: nack::NackThrottle::new(),
			analyzer: None,
			prev_ready_at: None,
			prev_server_timestamp: 0,
		}
	}

	pub fn set_analyzer(&mut self, analyzer: Arc<ProtocolAnalyzer>) {
		self.analyzer = Some(analyzer);
	}

	pub fn kind(&self) -> StreamKind {
		self.kind
	}

	pub fn last_rendered_id(&self) -> i64 {
		self.last_rendered_id
	}

	pub fn currently_rendering_id(&self) -> i64 {
		self.currently_rendering_id
	}

	pub fn max_id(&self) -> i64 {
		self.max_id
	}

	/// Frames completed since the last ring reset.
	pub fn frames_received(&self) -> u64 {
		self.frames_received
	}

	pub fn slot_exists(&self, id: i64) -> bool {
		matches!(&self.slots[(id % self.size as i64) as usize], Some(slot) if slot.id == id)
	}

	/// Age of the oldest packet of an in-progress frame, used by the renderer
	/// to decide when waiting for a missing frame is no longer worth it.
	pub fn slot_age(&self, id: i64) -> Option<std::time::Duration> {
		match &self.slots[(id % self.size as i64) as usize] {
			Some(slot) if slot.id == id => Some(slot.created.elapsed()),
			_ => None,
		}
	}

	pub fn stats(&self) -> &RingStats {
		&self.stats
	}

	/// Hand the accumulated statistics to the congestion controller and start
	/// a fresh interval.
	pub fn take_stats(&mut self) -> RingStats {
		std::mem::take(&mut self.stats)
	}

	fn slot_mut(&mut self, id: i64) -> &mut Option<FrameSlot> {
		let index = (id % self.size as i64) as usize;
		&mut self.slots[index]
	}

	fn init_slot(&mut self, id: i64, num_original: usize, num_fec: usize) {
		let buffer = self.allocator.allocate();
		let num_indices = num_original + num_fec;

		let fec_decoder = if num_fec > 0 {
			match FecDecoder::new(num_original, num_fec, MAX_PAYLOAD_SIZE) {
				Ok(decoder) => Some(decoder),
				Err(()) => None,
			}
		} else {
			None
		};

		let now = Instant::now();
		let slot = self.slot_mut(id);
		assert!(slot.is_none(), "Initializing a slot that is still occupied.");
		*slot = Some(FrameSlot {
			id,
			num_original,
			num_fec,
			buffer,
			frame_size: 0,
			received_indices: vec![false; num_indices],
			times_index_nacked: vec![0; num_indices],
			original_packets_received: 0,
			fec_packets_received: 0,
			fec_decoder,
			decoded: None,
			recovery_mode: false,
			num_times_nacked: 0,
			last_nacked_index: -1,
			created: now,
			last_nonnack_packet: now,
			last_nacked: now,
		});
	}

	/// Forget all packets received so far, returning the buffer to its
	/// freshly initialized state. The currently rendering frame is untouched,
	/// someone may still be reading it.
	pub fn reset(&mut self) {
		for slot in self.slots.iter_mut() {
			*slot = None;
		}
		self.max_id = -1;
		self.frames_received = 0;

		if let Some(analyzer) = &self.analyzer {
			analyzer.record_ring_reset(self.kind);
		}
	}

	pub fn is_ready_to_render(&self, id: i64) -> bool {
		match &self.slots[(id % self.size as i64) as usize] {
			Some(slot) if slot.id == id => slot.framebuffer().is_some(),
			_ => false,
		}
	}

	/// Process one inbound packet, creating or re-homing the slot as needed.
	pub fn receive_packet(&mut self, packet: &Packet) -> Result<ReceiveOutcome, ()> {
		assert!((packet.index as usize) < packet.num_indices as usize);
		assert!((packet.num_indices as usize) <= MAX_PACKETS);
		assert!(packet.num_fec_indices < packet.num_indices);

		self.stats.packets_received += 1;

		let id = packet.frame_id as i64;
		let mut outcome = ReceiveOutcome::default();

		let resident_id = self.slots[(id % self.size as i64) as usize].as_ref().map(|s| s.id);
		match resident_id {
			Some(resident) if id < resident => {
				tracing::warn!("Very stale packet (ID {id}) received, current slot occupant's ID is {resident}.");
				return Ok(outcome);
			},
			_ if id <= self.currently_rendering_id => {
				// Can no longer help us render anything new.
				return Ok(outcome);
			},
			Some(resident) if id > resident => {
				if resident > self.currently_rendering_id {
					// The slot's occupant still needed rendering: the ring is
					// full because a render has stalled. Wipe everything.
					tracing::warn!(
						"Frame ID {id} would overwrite frame ID {resident}, but the renderer is only at ID {}. \
						 Resetting the entire ring buffer.",
						self.currently_rendering_id
					);
					self.reset();
					outcome.ring_reset = true;
				} else {
					tracing::error!("Allocating frame ID {id}, but frame ID {resident} has not been rendered away yet.");
					*self.slot_mut(id) = None;
				}
			},
			_ => {},
		}

		if !self.slot_exists(id) {
			let num_original = (packet.num_indices - packet.num_fec_indices) as usize;
			self.init_slot(id, num_original, packet.num_fec_indices as usize);
			self.max_id = self.max_id.max(id);
		}

		let largest_frame_size = self.largest_frame_size;
		let analyzer = self.analyzer.clone();
		let kind = self.kind;

		let mut fec_used = false;
		let mut ready_server_timestamp = None;
		{
			let slot = self.slot_mut(id).as_mut().unwrap();

			assert_eq!(slot.num_fec, packet.num_fec_indices as usize);
			assert_eq!(slot.num_original + slot.num_fec, packet.num_indices as usize);

			let index = packet.index as usize;
			if packet.is_nack_response {
				if !slot.received_indices[index] {
					tracing::info!("NACK response for ID {id}, index {index} received.");
				} else {
					tracing::info!("NACK response for ID {id}, index {index} received, but it wasn't needed.");
				}
			} else {
				slot.last_nonnack_packet = Instant::now();
				if slot.times_index_nacked[index] > 0 {
					tracing::info!("Received original ID {id}, index {index}, but we had NACK'ed for it.");
				}
			}

			if slot.received_indices[index] {
				// Receiving an index twice should only happen when nacking got
				// involved; anything else is a genuine network duplicate.
				if slot.times_index_nacked[index] == 0 {
					tracing::error!("Received packet (ID {id} / index {index}) twice, but we never nacked for it.");
					return Err(());
				}
				return Ok(outcome);
			}

			let was_already_ready = slot.framebuffer().is_some();

			slot.received_indices[index] = true;
			if index < slot.num_original {
				slot.original_packets_received += 1;
				assert!(slot.original_packets_received <= slot.num_original);
			} else {
				slot.fec_packets_received += 1;
			}

			let buffer_offset = index * MAX_PAYLOAD_SIZE;
			if buffer_offset + packet.payload.len() > largest_frame_size {
				tracing::error!("Packet payload too large for the frame buffer, dropping the packet.");
				return Err(());
			}
			slot.buffer[buffer_offset..buffer_offset + packet.payload.len()].copy_from_slice(&packet.payload);

			if slot.num_fec == 0 {
				slot.frame_size += packet.payload.len();
			} else if slot.decoded.is_none() {
				if let Some(decoder) = &mut slot.fec_decoder {
					decoder.register_shard(index, &packet.payload);
					if let Some(frame) = decoder.try_decode() {
						if slot.original_packets_received < slot.num_original {
							tracing::info!(
								"Recovered frame ID {id} from {}/{} original packets using {} FEC packets.",
								slot.original_packets_received,
								slot.num_original,
								slot.fec_packets_received
							);
						}
						slot.frame_size = frame.len();
						slot.decoded = Some(frame);
					}
				}
			}

			outcome.accepted = true;

			if !was_already_ready {
				if let Some(buffer) = slot.framebuffer() {
					outcome.became_ready = true;
					fec_used = slot.decoded.is_some();
					if kind == StreamKind::Video {
						ready_server_timestamp = VideoFrame::peek_server_timestamp(buffer);
					}
				}
			}
		}

		if let Some(analyzer) = &analyzer {
			let is_fec = packet.index >= packet.num_indices - packet.num_fec_indices;
			analyzer.record_packet(kind, id, packet.is_nack_response, is_fec);
		}

		if outcome.became_ready {
			self.frames_received += 1;

			// Delay gradient: how much slower frames are arriving than they
			// were captured.
			if let Some(server_timestamp) = ready_server_timestamp {
				let now = Instant::now();
				if let Some(prev_ready_at) = self.prev_ready_at {
					let gradient = now.duration_since(prev_ready_at).as_micros() as f64
						- (server_timestamp - self.prev_server_timestamp) as f64;
					self.stats.total_delay_gradient_us += gradient;
					self.stats.total_delay_gradient_squared += gradient * gradient;
					self.stats.num_gradient_frames_tracked += 1;
				}
				self.prev_ready_at = Some(now);
				self.prev_server_timestamp = server_timestamp;
			}

			if let Some(analyzer) = &analyzer {
				analyzer.record_ready(kind, id, fec_used);
			}
		}

		Ok(outcome)
	}

	/// Move frame `id` out of its slot and hand its buffer to the renderer.
	/// The previous rendering frame's buffer returns to the allocator.
	///
	/// Panics if `id` is not ready or does not advance the render cursor;
	/// callers gate on [`Self::is_ready_to_render`].
	pub fn set_rendering(&mut self, id: i64) -> &[u8] {
		assert!(
			id > self.last_rendered_id,
			"set_rendering called with ID {id} <= last rendered ID {}",
			self.last_rendered_id
		);
		assert!(self.is_ready_to_render(id));

		if id > self.last_rendered_id + 1 && self.last_rendered_id != -1 {
			self.stats.frames_skipped += (id - self.last_rendered_id - 1) as u64;
		}
		self.last_rendered_id = id;

		// Dropping the previous frame returns its block to the allocator.
		self.currently_rendering = self.slot_mut(id).take();
		self.currently_rendering_id = id;
		self.stats.frames_rendered += 1;

		if let Some(analyzer) = &self.analyzer {
			analyzer.record_rendered(self.kind, id);
		}

		self.currently_rendering.as_ref().unwrap().framebuffer().unwrap()
	}
}
