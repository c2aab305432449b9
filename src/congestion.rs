use std::time::{Duration, Instant};

use crate::frame::CodecKind;
use crate::packet::MAX_FEC_RATIO;

pub const MAXIMUM_BITRATE: u32 = 30_000_000;
pub const MINIMUM_BITRATE: u32 = 2_000_000;
pub const STARTING_BITRATE: u32 = 10_400_000;
pub const STARTING_BURST_BITRATE: u32 = 31_800_000;

/// Instantaneous rate cap relative to the sustained target.
pub const BURST_BITRATE_RATIO: f64 = 2.0;

pub const MAX_FPS: u32 = 60;
pub const MIN_FPS: u32 = 10;

/// How often a new settings snapshot may be produced.
pub const CONTROL_INTERVAL: Duration = Duration::from_millis(500);

const LOSS_THRESHOLD: f64 = 0.05;
const BACKOFF_RATIO: f64 = 0.85;
const PROBE_RATIO: f64 = 1.05;

/// Mean inter-frame delay gradient above which the queue is considered to be
/// building, in microseconds per frame.
const GRADIENT_THRESHOLD_US: f64 = 500.0;

/// Extra parity added on top of the loss-derived base while probing upward.
const PROBING_EXTRA_FEC: f64 = 0.05;

/// Safety margin added to the measured loss when sizing the FEC ratio.
const FEC_SAFETY_MARGIN: f64 = 0.02;

/// Snapshot of the sender-side pacing and encoding targets. Exchanged by
/// value: the congestion controller produces one at most once per control
/// interval and the sender reads the latest atomically before pacing a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkSettings {
	pub bitrate_bps: u32,
	pub burst_bitrate_bps: u32,
	pub audio_fec_ratio: f64,
	pub video_fec_ratio: f64,
	pub desired_codec: CodecKind,
	pub fps: u32,
	pub saturate_bandwidth: bool,
}

impl Default for NetworkSettings {
	fn default() -> Self {
		Self {
			bitrate_bps: STARTING_BITRATE,
			burst_bitrate_bps: STARTING_BURST_BITRATE,
			audio_fec_ratio: 0.1,
			video_fec_ratio: 0.05,
			desired_codec: CodecKind::H264,
			fps: MAX_FPS,
			saturate_bandwidth: false,
		}
	}
}

impl NetworkSettings {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.bitrate_bps.to_le_bytes());
		buffer.extend(self.burst_bitrate_bps.to_le_bytes());
		buffer.extend(self.audio_fec_ratio.to_le_bytes());
		buffer.extend(self.video_fec_ratio.to_le_bytes());
		buffer.extend((self.desired_codec as i32).to_le_bytes());
		buffer.extend(self.fps.to_le_bytes());
		buffer.push(self.saturate_bandwidth as u8);
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 33 {
			tracing::warn!("Expected network settings of 33 bytes, got {} bytes.", buffer.len());
			return Err(());
		}

		let codec = i32::from_le_bytes(buffer[24..28].try_into().unwrap());
		let audio_fec_ratio = f64::from_le_bytes(buffer[8..16].try_into().unwrap());
		let video_fec_ratio = f64::from_le_bytes(buffer[16..24].try_into().unwrap());
		if !(0.0..=1.0).contains(&audio_fec_ratio) || !(0.0..=1.0).contains(&video_fec_ratio) {
			tracing::warn!("Network settings carry FEC ratios outside [0, 1].");
			return Err(());
		}

		Ok(Self {
			bitrate_bps: u32::from_le_bytes(buffer[0..4].try_into().unwrap()),
			burst_bitrate_bps: u32::from_le_bytes(buffer[4..8].try_into().unwrap()),
			audio_fec_ratio,
			video_fec_ratio,
			desired_codec: CodecKind::from_repr(codec)
				.ok_or_else(|| tracing::warn!("Unknown codec in network settings: {codec}"))?,
			fps: u32::from_le_bytes(buffer[28..32].try_into().unwrap()),
			saturate_bandwidth: buffer[32] != 0,
		})
	}
}

/// Receive-side observations accumulated over one control interval.
#[derive(Clone, Debug, Default)]
pub struct CongestionSample {
	pub packets_received: u64,
	pub packets_nacked: u64,
	/// Running sum of per-frame delay gradients, microseconds.
	pub total_delay_gradient_us: f64,
	pub total_delay_gradient_squared: f64,
	pub num_gradient_frames: u64,
	pub rtt: Duration,
	/// Bitrate actually observed on the wire over the interval.
	pub incoming_bitrate_bps: f64,
}

impl CongestionSample {
	pub fn loss_ratio(&self) -> f64 {
		if self.packets_received == 0 {
			return 0.0;
		}
		self.packets_nacked as f64 / self.packets_received as f64
	}

	pub fn mean_gradient_us(&self) -> f64 {
		if self.num_gradient_frames == 0 {
			return 0.0;
		}
		self.total_delay_gradient_us / self.num_gradient_frames as f64
	}

	pub fn gradient_std_us(&self) -> f64 {
		if self.num_gradient_frames == 0 {
			return 0.0;
		}
		let mean = self.mean_gradient_us();
		let variance = self.total_delay_gradient_squared / self.num_gradient_frames as f64 - mean * mean;
		variance.max(0.0).sqrt()
	}
}

/// Observes loss and delay gradients and produces the stream of
/// [`NetworkSettings`] snapshots that drive the sender and encoder.
pub struct CongestionController {
	settings: NetworkSettings,
	last_update: Instant,
	probing: bool,
	consecutive_backoffs: u32,
}

impl Default for CongestionController {
	fn default() -> Self {
		Self::new()
	}
}

impl CongestionController {
	pub fn new() -> Self {
		Self {
			settings: NetworkSettings::default(),
			last_update: Instant::now(),
			probing: false,
			consecutive_backoffs: 0,
		}
	}

	pub fn settings(&self) -> NetworkSettings {
		self.settings
	}

	/// Feed one interval's observations. Returns a new snapshot when the
	/// control interval has elapsed and anything changed.
	pub fn update(&mut self, sample: &CongestionSample) -> Option<NetworkSettings> {
		if self.last_update.elapsed() < CONTROL_INTERVAL {
			return None;
		}
		self.last_update = Instant::now();

		let loss = sample.loss_ratio();
		let mean_gradient = sample.mean_gradient_us();
		// A gradient within the measured jitter is not evidence of queueing.
		let gradient_limit = GRADIENT_THRESHOLD_US.max(sample.gradient_std_us());

		let mut settings = self.settings;

		if loss > LOSS_THRESHOLD || mean_gradient > gradient_limit {
			settings.bitrate_bps =
				(((settings.bitrate_bps as f64) * BACKOFF_RATIO) as u32).max(MINIMUM_BITRATE);
			self.probing = false;
			self.consecutive_backoffs += 1;
			tracing::debug!(
				"Backing off to {} bps (loss {:.3}, gradient {:.0} us).",
				settings.bitrate_bps,
				loss,
				mean_gradient
			);
		} else {
			settings.bitrate_bps =
				(((settings.bitrate_bps as f64) * PROBE_RATIO) as u32).min(MAXIMUM_BITRATE);
			self.probing = settings.bitrate_bps < MAXIMUM_BITRATE;
			self.consecutive_backoffs = 0;
		}

		settings.burst_bitrate_bps =
			((settings.bitrate_bps as f64 * BURST_BITRATE_RATIO) as u32).min(STARTING_BURST_BITRATE.max(settings.bitrate_bps));

		// Enough parity to cover the expected losses plus a safety margin,
		// with an extra helping while probing for more bandwidth.
		let base_fec = (loss + FEC_SAFETY_MARGIN).min(MAX_FEC_RATIO);
		let extra_fec = if self.probing { PROBING_EXTRA_FEC } else { 0.0 };
		settings.video_fec_ratio = (base_fec + extra_fec).min(MAX_FEC_RATIO);
		settings.audio_fec_ratio = (2.0 * loss + 0.1).min(MAX_FEC_RATIO);
		tracing::debug!(
			"FEC ratio: base {base_fec:.3} + extra {extra_fec:.3} -> {:.3} (target {} bps, incoming {:.0} bps, rtt {:?}).",
			settings.video_fec_ratio,
			settings.bitrate_bps,
			sample.incoming_bitrate_bps,
			sample.rtt
		);

		// Codec and FPS changes force an encoder rebuild, so move them only
		// after the link has proven persistently bad.
		if self.consecutive_backoffs >= 3 {
			settings.fps = (settings.fps / 2).max(MIN_FPS);
			settings.desired_codec = CodecKind::H265;
		} else if self.consecutive_backoffs == 0 {
			settings.fps = MAX_FPS;
		}

		if settings != self.settings {
			self.settings = settings;
			Some(settings)
		} else {
			None
		}
	}

	#[cfg(test)]
	fn expire_interval(&mut self) {
		self.last_update = Instant::now() - CONTROL_INTERVAL;
	}
}
