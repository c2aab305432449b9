use std::sync::Arc;

use crate::frame::{CodecKind, VideoFrameKind};
use crate::session::video::ltr::LtrAction;
use crate::session::video::CapturedFrame;

/// Rate-control look-ahead window in seconds; kept small to match
/// ultra-low-latency encoder presets. Multiplied by the burst ratio when
/// sizing the VBV.
pub const VBV_SEC: f64 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EncoderConfig {
	pub width: u32,
	pub height: u32,
	pub bitrate_bps: u32,
	pub vbv_size: u32,
	pub codec: CodecKind,
	pub fps: u32,
}

/// One encoded frame as produced by the encoder backend.
pub struct EncodedFrame {
	pub kind: VideoFrameKind,
	pub long_term_index: i32,
	pub data: Vec<u8>,
}

/// Contract with the opaque codec backend. The core drives it; what happens
/// inside (NVENC, VAAPI, software) is injected at startup.
pub trait VideoEncoder: Send {
	/// In-place reconfiguration. An `Err` means the encoder must be rebuilt.
	fn reconfigure(&mut self, config: &EncoderConfig) -> Result<(), ()>;

	/// The next encoded frame must be a self-contained intra frame.
	fn request_intra(&mut self);

	/// Apply a long-term reference decision to the next frame.
	fn set_ltr_action(&mut self, action: LtrAction);

	fn encode(&mut self, input: &CapturedFrame) -> Result<EncodedFrame, ()>;
}

/// Builds encoder backends. Creation can take hundreds of milliseconds for
/// hardware encoders, so rebuilds run on a helper thread while the previous
/// encoder keeps encoding.
pub trait EncoderFactory: Send + Sync {
	fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>, ()>;
}

/// A replacement encoder under construction on a background thread.
pub struct PendingEncoder {
	result_rx: crossbeam_channel::Receiver<Result<Box<dyn VideoEncoder>, ()>>,
}

impl PendingEncoder {
	pub fn build(factory: Arc<dyn EncoderFactory>, config: EncoderConfig) -> Self {
		let (result_tx, result_rx) = crossbeam_channel::bounded(1);

		std::thread::spawn(move || {
			let result = factory.create(&config);
			if result.is_err() {
				tracing::error!("Encoder factory failed to build a replacement encoder.");
			}
			let _ = result_tx.send(result);
		});

		Self { result_rx }
	}

	/// Non-blocking poll for the finished encoder.
	pub fn try_take(&self) -> Option<Result<Box<dyn VideoEncoder>, ()>> {
		self.result_rx.try_recv().ok()
	}

	/// Block until construction finishes.
	pub fn wait(self) -> Result<Box<dyn VideoEncoder>, ()> {
		self.result_rx
			.recv()
			.map_err(|_| tracing::error!("Encoder factory thread disappeared."))?
	}
}

/// Tear an encoder down without stalling the capture loop; hardware encoder
/// destruction can block on the driver.
pub fn destroy_in_background(encoder: Box<dyn VideoEncoder>) {
	std::thread::spawn(move || drop(encoder));
}

/// The virtual encoder variant: wraps captured pixels untouched. Used by the
/// virtual binding and throughout the tests; a real deployment injects a
/// hardware-backed implementation instead.
pub struct PassthroughEncoder {
	config: EncoderConfig,
	intra_requested: bool,
	ltr_action: LtrAction,
}

impl PassthroughEncoder {
	pub fn new(config: EncoderConfig) -> Self {
		Self {
			config,
			intra_requested: true,
			ltr_action: LtrAction::Normal,
		}
	}
}

impl VideoEncoder for PassthroughEncoder {
	fn reconfigure(&mut self, config: &EncoderConfig) -> Result<(), ()> {
		self.config = *config;
		self.intra_requested = true;
		Ok(())
	}

	fn request_intra(&mut self) {
		self.intra_requested = true;
	}

	fn set_ltr_action(&mut self, action: LtrAction) {
		self.ltr_action = action;
	}

	fn encode(&mut self, input: &CapturedFrame) -> Result<EncodedFrame, ()> {
		tracing::trace!(
			"Encoding a {}x{} frame at {} bps.",
			self.config.width,
			self.config.height,
			self.config.bitrate_bps
		);

		let (kind, long_term_index) = match self.ltr_action {
			LtrAction::Intra => (VideoFrameKind::Intra, -1),
			LtrAction::CreateLongTerm(index) => (VideoFrameKind::CreateLongTerm, index),
			LtrAction::ReferLongTerm(index) => (VideoFrameKind::ReferLongTerm, index),
			LtrAction::Normal if self.intra_requested => (VideoFrameKind::Intra, -1),
			LtrAction::Normal => (VideoFrameKind::Normal, -1),
		};
		self.intra_requested = false;
		self.ltr_action = LtrAction::Normal;

		Ok(EncodedFrame {
			kind,
			long_term_index,
			data: input.data.clone(),
		})
	}
}

/// Factory for the virtual encoder variant.
pub struct PassthroughEncoderFactory;

impl EncoderFactory for PassthroughEncoderFactory {
	fn create(&self, config: &EncoderConfig) -> Result<Box<dyn VideoEncoder>, ()> {
		Ok(Box::new(PassthroughEncoder::new(*config)))
	}
}
