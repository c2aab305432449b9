use std::time::{Duration, Instant};

use super::RingBuffer;
use crate::packet::{StreamKind, MAX_PAYLOAD_SIZE};

/// The max number of times any one index may be nacked, so we never get stuck
/// on a packet that will never arrive.
pub const MAX_PACKET_NACKS: u8 = 2;

/// NACK bandwidth cap over the 100 ms average window, bits per second.
pub const MAX_NACK_AVG_BPS: f64 = 2_200_000.0;

/// NACK bandwidth cap over the 5 ms burst window, bits per second.
pub const MAX_NACK_BURST_BPS: f64 = 4_800_000.0;

/// How far out of order a packet may arrive before we treat it as lost
/// rather than as ordinary UDP reordering.
pub const MAX_UNORDERED_PACKETS: i64 = 10;

/// How many leading indices to probe when an entire frame is missing. Small
/// frames recover in one round trip; large ones fill in via the per-index
/// scan as their packets arrive.
const MISSING_FRAME_PROBE_INDICES: usize = 21;

const BURST_INTERVAL: Duration = Duration::from_millis(5);
const AVG_INTERVAL: Duration = Duration::from_millis(100);

/// Retransmission request emitted toward the sender.
#[derive(Clone, Debug, PartialEq)]
pub enum NackRequest {
	Single {
		stream: StreamKind,
		frame_id: u32,
		index: u16,
	},
	Bitarray {
		stream: StreamKind,
		frame_id: u32,
		start_index: u16,
		bits: Vec<bool>,
	},
}

/// Token counters bounding NACK emission to the burst and average caps.
pub(crate) struct NackThrottle {
	first_call: bool,
	burst_timer: Instant,
	avg_timer: Instant,
	burst_counter: i64,
	avg_counter: i64,
	last_nack_possible: bool,
}

impl NackThrottle {
	pub(crate) fn new() -> Self {
		Self {
			first_call: true,
			burst_timer: Instant::now(),
			avg_timer: Instant::now(),
			burst_counter: 0,
			avg_counter: 0,
			last_nack_possible: true,
		}
	}
}

impl RingBuffer {
	/// Scan for missing packets and emit retransmission requests, oldest
	/// frames first, within the NACK bandwidth budget. Call this rapidly
	/// (every 5-10 ms); internal timers throttle the actual work.
	///
	/// Returns false when the average budget is saturated.
	pub fn try_nacking(&mut self, latency: Duration) -> bool {
		if self.max_id == -1 {
			// Nothing received yet; nacking vacuously succeeds.
			return true;
		}
		if self.last_rendered_id == -1 {
			self.last_rendered_id = self.max_id - 1;
		}

		let now = Instant::now();
		if self.nack_throttle.first_call || now.duration_since(self.nack_throttle.burst_timer) > BURST_INTERVAL {
			self.nack_throttle.burst_counter = 0;
			self.nack_throttle.burst_timer = now;
		}
		if self.nack_throttle.first_call || now.duration_since(self.nack_throttle.avg_timer) > AVG_INTERVAL {
			self.nack_throttle.avg_counter = 0;
			self.nack_throttle.avg_timer = now;
			self.nack_throttle.first_call = false;
		}

		// Each NACK is budgeted as one full payload of retransmitted bytes.
		let burst_nacks_remaining = (MAX_NACK_BURST_BPS * BURST_INTERVAL.as_secs_f64() / 8.0 / MAX_PAYLOAD_SIZE as f64)
			as i64 - self.nack_throttle.burst_counter;
		let avg_nacks_remaining = (MAX_NACK_AVG_BPS * AVG_INTERVAL.as_secs_f64() / 8.0 / MAX_PAYLOAD_SIZE as f64)
			as i64 - self.nack_throttle.avg_counter;
		let max_nacks = burst_nacks_remaining.min(avg_nacks_remaining);

		if max_nacks <= 0 {
			if self.nack_throttle.last_nack_possible {
				tracing::info!("Can't nack anymore, hit the NACK bitrate limit.");
				self.nack_throttle.last_nack_possible = false;
			}
			// Saturating the burst budget is just distribution; only a
			// saturated average budget counts as failure.
			return avg_nacks_remaining > 0;
		} else if !self.nack_throttle.last_nack_possible {
			tracing::info!("NACKing is possible again.");
			self.nack_throttle.last_nack_possible = true;
		}

		let max_id = self.max_id;
		let size = self.size as i64;
		let mut num_packets_nacked: i64 = 0;

		for id in (self.last_rendered_id + 1)..=max_id {
			if num_packets_nacked >= max_nacks {
				break;
			}

			if !self.slot_exists(id) {
				// Nothing at all received for a frame before max_id: probe
				// its first indices with a single bitarray request.
				if self.last_missing_frame_nack < id {
					tracing::info!("NACKing for missing frame ID {id}.");
					self.emit(NackRequest::Bitarray {
						stream: self.kind,
						frame_id: id as u32,
						start_index: 0,
						bits: vec![true; MISSING_FRAME_PROBE_INDICES],
					});
					num_packets_nacked += MISSING_FRAME_PROBE_INDICES as i64;
					self.stats.packets_nacked += MISSING_FRAME_PROBE_INDICES as u64;
					self.last_missing_frame_nack = id;
				}
				continue;
			}

			if self.is_ready_to_render(id) {
				continue;
			}

			let nacked_indices = {
				let slot = self.slots[(id % size) as usize].as_mut().unwrap();

				let mut last_packet_received: i64 = 0;
				for i in (0..slot.num_original).rev() {
					if slot.received_indices[i] {
						last_packet_received = i as i64;
						break;
					}
				}

				// Once newer frames exist, or the frame has gone quiet for a
				// fraction of the round trip, out-of-order arrival is no
				// longer a plausible explanation: switch to recovery mode.
				if (id < max_id || slot.last_nonnack_packet.elapsed() > latency.mul_f64(0.2)) && !slot.recovery_mode {
					tracing::trace!("Too long since the last non-nack packet of frame ID {id}, entering recovery mode.");
					slot.recovery_mode = true;
				}

				let budget = max_nacks - num_packets_nacked;
				let mut nacked = Vec::new();

				if !slot.recovery_mode {
					nack_missing_up_to(slot, last_packet_received - MAX_UNORDERED_PACKETS, budget, &mut nacked);
				} else if slot.last_nacked.elapsed() > latency.mul_f64(1.2 * slot.num_times_nacked.max(1) as f64)
					|| slot.num_times_nacked == 0
				{
					nack_missing_up_to(slot, slot.num_original as i64 - 1, budget, &mut nacked);
					if slot.last_nacked_index == slot.num_original as i64 - 1 {
						// Completed a full pass over the frame; back off
						// before the next one.
						slot.last_nacked_index = -1;
						slot.last_nacked = Instant::now();
						slot.num_times_nacked += 1;
					}
				}

				nacked
			};

			if !nacked_indices.is_empty() {
				tracing::info!("NACKing frame ID {id}, indices {nacked_indices:?}");
			}
			num_packets_nacked += nacked_indices.len() as i64;
			self.stats.packets_nacked += nacked_indices.len() as u64;
			for index in nacked_indices {
				self.emit(NackRequest::Single {
					stream: self.kind,
					frame_id: id as u32,
					index,
				});
			}
		}

		self.nack_throttle.burst_counter += num_packets_nacked;
		self.nack_throttle.avg_counter += num_packets_nacked;

		true
	}

	fn emit(&self, request: NackRequest) {
		if let Some(nack_tx) = &self.nack_tx {
			let _ = nack_tx.send(request);
		}
	}
}

/// Nack every unreceived index in `(slot.last_nacked_index, end_index]` that
/// has nacks remaining, up to `budget` packets.
fn nack_missing_up_to(slot: &mut super::FrameSlot, end_index: i64, budget: i64, nacked: &mut Vec<u16>) {
	let start = slot.last_nacked_index + 1;

	let mut i = start;
	while i <= end_index && (nacked.len() as i64) < budget {
		let index = i as usize;
		if !slot.received_indices[index] && slot.times_index_nacked[index] < MAX_PACKET_NACKS {
			slot.times_index_nacked[index] += 1;
			slot.last_nacked_index = i;
			nacked.push(i as u16);
		}
		i += 1;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::packet::Packet;
	use crate::ringbuffer::FecEncoder;
	use tokio::sync::mpsc;

	fn make_packets(id: u32, payload: &[u8]) -> Vec<Packet> {
		let mut encoder = FecEncoder::new();
		let shards = encoder.encode(payload, 0.0, MAX_PAYLOAD_SIZE).unwrap();
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

	fn ring_with_nacks() -> (RingBuffer, mpsc::UnboundedReceiver<NackRequest>) {
		let (nack_tx, nack_rx) = mpsc::unbounded_channel();
		(RingBuffer::new(StreamKind::Video, 16, Some(nack_tx)), nack_rx)
	}

	fn drain(rx: &mut mpsc::UnboundedReceiver<NackRequest>) -> Vec<NackRequest> {
		let mut requests = Vec::new();
		while let Ok(request) = rx.try_recv() {
			requests.push(request);
		}
		requests
	}

	#[test]
	fn no_nacks_before_anything_received() {
		let (mut ring, mut nack_rx) = ring_with_nacks();
		assert!(ring.try_nacking(Duration::from_millis(50)));
		assert!(drain(&mut nack_rx).is_empty());
	}

	#[test]
	fn nacks_for_gap_beyond_reorder_window() {
		let (mut ring, mut nack_rx) = ring_with_nacks();

		// 20 packets; drop index 5, deliver the rest.
		let packets = make_packets(200, &vec![7u8; 20 * MAX_PAYLOAD_SIZE - 30]);
		assert_eq!(packets.len(), 20);
		for packet in packets.iter().filter(|p| p.index != 5) {
			ring.receive_packet(packet).unwrap();
		}

		ring.try_nacking(Duration::from_millis(50));

		let requests = drain(&mut nack_rx);
		assert_eq!(
			requests,
			vec![NackRequest::Single {
				stream: StreamKind::Video,
				frame_id: 200,
				index: 5,
			}]
		);

		// A second scan must not nack again until the recovery back-off
		// has expired.
		ring.try_nacking(Duration::from_millis(50));
		assert!(drain(&mut nack_rx).is_empty());
	}

	#[test]
	fn respects_reorder_window() {
		let (mut ring, mut nack_rx) = ring_with_nacks();

		// Drop index 11 of 20: only 9 behind the high-water mark (index 19
		// received, 19 - 10 = 9 < 11), so normal mode must not nack it.
		let packets = make_packets(300, &vec![7u8; 20 * MAX_PAYLOAD_SIZE - 30]);
		for packet in packets.iter().filter(|p| p.index != 11) {
			ring.receive_packet(packet).unwrap();
		}

		// Immediately after receiving (still in normal mode for this frame,
		// and the non-nack timer is fresh).
		let requests: Vec<_> = {
			ring.try_nacking(Duration::from_secs(1));
			drain(&mut nack_rx)
				.into_iter()
				.filter(|r| matches!(r, NackRequest::Single { index: 11, .. }))
				.collect()
		};
		assert!(requests.is_empty());
	}

	#[test]
	fn missing_frame_probed_once_with_bitarray() {
		let (mut ring, mut nack_rx) = ring_with_nacks();

		// Frame 1 rendered, frame 3 arriving, frame 2 never seen at all.
		let packets = make_packets(1, b"first");
		ring.receive_packet(&packets[0]).unwrap();
		ring.set_rendering(1);
		let packets = make_packets(3, b"third");
		ring.receive_packet(&packets[0]).unwrap();

		ring.try_nacking(Duration::from_millis(50));
		let requests = drain(&mut nack_rx);
		assert!(matches!(
			requests.first(),
			Some(NackRequest::Bitarray { frame_id: 2, start_index: 0, bits, .. }) if bits.len() == 21
		));

		// The probe is not repeated.
		ring.try_nacking(Duration::from_millis(50));
		assert!(!drain(&mut nack_rx)
			.iter()
			.any(|r| matches!(r, NackRequest::Bitarray { frame_id: 2, .. })));
	}

	#[test]
	fn per_index_nack_limit_is_enforced() {
		let (mut ring, mut nack_rx) = ring_with_nacks();

		// Drop the final index so every recovery pass runs to completion.
		let packets = make_packets(400, &vec![7u8; 20 * MAX_PAYLOAD_SIZE - 30]);
		for packet in packets.iter().filter(|p| p.index != 19) {
			ring.receive_packet(packet).unwrap();
		}

		// With zero latency the recovery back-off expires instantly, so
		// repeated scans re-nack until the per-index cap is reached.
		for _ in 0..20 {
			ring.try_nacking(Duration::ZERO);
		}

		let nacks_for_19 = drain(&mut nack_rx)
			.into_iter()
			.filter(|r| matches!(r, NackRequest::Single { index: 19, .. }))
			.count();
		assert_eq!(nacks_for_19 as u8, MAX_PACKET_NACKS);
	}

	#[test]
	fn nack_budget_bounds_burst() {
		let (mut ring, mut nack_rx) = ring_with_nacks();

		// A frame with many missing indices in recovery mode.
		let packets = make_packets(500, &vec![7u8; 300 * MAX_PAYLOAD_SIZE - 30]);
		ring.receive_packet(&packets[0]).unwrap();
		ring.receive_packet(packets.last().unwrap()).unwrap();

		ring.try_nacking(Duration::ZERO);
		let requests = drain(&mut nack_rx);

		// 4.8 Mbps over 5 ms at 1200 bytes per payload caps a single burst
		// window at 2 packets (plus whatever single scan overshoots by).
		let burst_budget = (MAX_NACK_BURST_BPS * 0.005 / 8.0 / MAX_PAYLOAD_SIZE as f64) as usize;
		assert!(requests.len() <= burst_budget);
	}
}
