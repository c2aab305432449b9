use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::packet::StreamKind;

/// How many frames of history to keep per stream.
const MAX_TRACKED_FRAMES: usize = 512;

/// Everything observed about one frame, from first packet to render.
#[derive(Clone, Debug, Default)]
pub struct FrameTimeline {
	pub first_packet_at: Option<Instant>,
	pub ready_at: Option<Instant>,
	pub rendered_at: Option<Instant>,
	pub packets_received: u32,
	pub fec_packets_received: u32,
	pub nack_responses_received: u32,
	pub fec_used: bool,
	pub nack_used: bool,
	pub skipped: bool,
	pub saw_ring_reset: bool,
	pub stream_reset_requested: bool,
}

#[derive(Default)]
struct AnalyzerInner {
	frames: HashMap<(StreamKind, i64), FrameTimeline>,
	highest_id: HashMap<StreamKind, i64>,
}

impl AnalyzerInner {
	fn frame(&mut self, stream: StreamKind, id: i64) -> &mut FrameTimeline {
		let highest = self.highest_id.entry(stream).or_insert(id);
		*highest = (*highest).max(id);

		// Bound the history; old frames are no longer interesting.
		if self.frames.len() > MAX_TRACKED_FRAMES * 2 {
			let cutoff = *highest - MAX_TRACKED_FRAMES as i64;
			self.frames.retain(|(_, frame_id), _| *frame_id >= cutoff);
		}

		self.frames.entry((stream, id)).or_default()
	}
}

/// Per-frame timeline recorder used for debugging the transport. Purely
/// observational: correctness never depends on it.
#[derive(Default)]
pub struct ProtocolAnalyzer {
	inner: Mutex<AnalyzerInner>,
}

impl ProtocolAnalyzer {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_packet(&self, stream: StreamKind, id: i64, is_nack_response: bool, is_fec: bool) {
		let mut inner = self.inner.lock().unwrap();
		let frame = inner.frame(stream, id);

		frame.first_packet_at.get_or_insert_with(Instant::now);
		frame.packets_received += 1;
		if is_fec {
			frame.fec_packets_received += 1;
		}
		if is_nack_response {
			frame.nack_responses_received += 1;
			frame.nack_used = true;
		}
	}

	pub fn record_ready(&self, stream: StreamKind, id: i64, fec_used: bool) {
		let mut inner = self.inner.lock().unwrap();
		let frame = inner.frame(stream, id);
		frame.ready_at.get_or_insert_with(Instant::now);
		frame.fec_used = fec_used;
	}

	pub fn record_rendered(&self, stream: StreamKind, id: i64) {
		let mut inner = self.inner.lock().unwrap();
		inner.frame(stream, id).rendered_at.get_or_insert_with(Instant::now);
	}

	pub fn record_skip(&self, stream: StreamKind, id: i64) {
		let mut inner = self.inner.lock().unwrap();
		inner.frame(stream, id).skipped = true;
	}

	pub fn record_stream_reset(&self, stream: StreamKind, greatest_failed_id: i64) {
		let mut inner = self.inner.lock().unwrap();
		inner.frame(stream, greatest_failed_id).stream_reset_requested = true;
	}

	pub fn record_ring_reset(&self, stream: StreamKind) {
		let mut inner = self.inner.lock().unwrap();
		let highest = inner.highest_id.get(&stream).copied();
		if let Some(id) = highest {
			inner.frame(stream, id).saw_ring_reset = true;
		}
	}

	pub fn frame_timeline(&self, stream: StreamKind, id: i64) -> Option<FrameTimeline> {
		self.inner.lock().unwrap().frames.get(&(stream, id)).cloned()
	}

	/// Human-readable account of the last few frames of a stream.
	pub fn report(&self, stream: StreamKind, count: usize) -> String {
		let inner = self.inner.lock().unwrap();
		let highest = match inner.highest_id.get(&stream) {
			Some(highest) => *highest,
			None => return String::from("no frames observed"),
		};

		let mut report = String::new();
		for id in (highest - count as i64 + 1).max(0)..=highest {
			let Some(frame) = inner.frames.get(&(stream, id)) else {
				report.push_str(&format!("frame {id}: never seen\n"));
				continue;
			};

			let assembly = match (frame.first_packet_at, frame.ready_at) {
				(Some(first), Some(ready)) => format!("{:?}", ready.duration_since(first)),
				_ => String::from("incomplete"),
			};
			report.push_str(&format!(
				"frame {id}: packets={} fec={} nack_responses={} assembly={assembly}{}{}{}{}\n",
				frame.packets_received,
				frame.fec_packets_received,
				frame.nack_responses_received,
				if frame.fec_used { " fec_used" } else { "" },
				if frame.nack_used { " nack_used" } else { "" },
				if frame.skipped { " skipped" } else { "" },
				if frame.stream_reset_requested { " stream_reset" } else { "" },
			));
		}

		report
	}
}
