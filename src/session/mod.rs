use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_shutdown::ShutdownManager;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::messages::ControlMessage;
use crate::packet::StreamKind;
use crate::udp::UdpSocketContext;

use self::input::{InputDevice, InputReplayer};

pub mod audio;
pub mod input;
pub mod video;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClientDimensions {
	pub width: u32,
	pub height: u32,
	pub dpi: i32,
}

/// Flags and values shared between the dispatch loop and the media pipelines.
/// Everything here is advisory state polled by the pipeline threads.
#[derive(Default)]
pub struct SessionState {
	pub update_device: AtomicBool,
	pub update_encoder: AtomicBool,
	pub stream_needs_restart: AtomicBool,
	pub stream_needs_recovery: AtomicBool,
	pub stop_streaming: AtomicBool,
	pub exiting: AtomicBool,

	dimensions: Mutex<Option<ClientDimensions>>,
	frame_ack: Mutex<Option<i64>>,
	client_input_timestamp_us: AtomicI64,
}

impl SessionState {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn dimensions(&self) -> Option<ClientDimensions> {
		*self.dimensions.lock().unwrap()
	}

	pub fn set_dimensions(&self, dimensions: ClientDimensions) {
		let mut current = self.dimensions.lock().unwrap();
		// Resize events can arrive duplicated across streams; reconfiguring
		// for the same dimensions would only churn the encoder.
		if *current == Some(dimensions) {
			return;
		}
		*current = Some(dimensions);
		self.update_device.store(true, Ordering::Relaxed);
	}

	pub fn take_frame_ack(&self) -> Option<i64> {
		self.frame_ack.lock().unwrap().take()
	}

	pub fn set_frame_ack(&self, frame_id: i64) {
		let mut ack = self.frame_ack.lock().unwrap();
		*ack = Some(ack.map_or(frame_id, |current| current.max(frame_id)));
	}

	pub fn client_input_timestamp_us(&self) -> i64 {
		self.client_input_timestamp_us.load(Ordering::Relaxed)
	}

	fn mark_client_input(&self) {
		let now = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.unwrap_or_default()
			.as_micros() as i64;
		self.client_input_timestamp_us.store(now, Ordering::Relaxed);
	}
}

/// Server-side message dispatch: applies every inbound control message to the
/// session state, the input replayer or the transport.
pub struct MessageDispatcher {
	state: Arc<SessionState>,
	udp: UdpSocketContext,
	replayer: InputReplayer,
	config: Config,
	shutdown: ShutdownManager<()>,
}

impl MessageDispatcher {
	pub fn spawn(
		config: Config,
		state: Arc<SessionState>,
		udp: UdpSocketContext,
		device: Box<dyn InputDevice>,
		mut message_rx: mpsc::UnboundedReceiver<(u32, ControlMessage)>,
		shutdown: ShutdownManager<()>,
	) {
		let dispatcher = Self {
			state,
			udp,
			replayer: InputReplayer::new(device),
			config,
			shutdown: shutdown.clone(),
		};

		tokio::spawn(async move {
			let _delay_stop = shutdown.delay_shutdown_token();
			let mut dispatcher = dispatcher;

			while let Ok(Some((message_id, message))) = shutdown.wrap_cancel(message_rx.recv()).await {
				dispatcher.handle(message_id, message).await;
			}

			tracing::debug!("Message dispatcher stopped.");
		});
	}

	async fn handle(&mut self, message_id: u32, message: ControlMessage) {
		match message {
			ControlMessage::Keyboard { .. }
			| ControlMessage::KeyboardState { .. }
			| ControlMessage::MouseButton { .. }
			| ControlMessage::MouseWheel { .. }
			| ControlMessage::MouseMotion { .. }
			| ControlMessage::MouseInactive
			| ControlMessage::Multigesture { .. }
			| ControlMessage::ReleaseAllInput => {
				self.state.mark_client_input();
				let _ = self.replayer.handle(message_id, &message);
			},
			ControlMessage::InteractionMode(mode) => {
				self.replayer.set_interaction_mode(mode);
			},
			ControlMessage::Dimensions { width, height, dpi, codec } => {
				tracing::info!("Client requests {width}x{height} at {dpi} DPI with {codec:?}.");
				if width <= 0 || height <= 0 {
					tracing::warn!("Ignoring dimensions message with non-positive size.");
					return;
				}
				self.state.set_dimensions(ClientDimensions {
					width: width as u32,
					height: height as u32,
					dpi,
				});
				// Absolute mouse coordinates are interpreted against the
				// streamed surface.
				self.replayer.set_screen_size(width as u32, height as u32);
			},
			ControlMessage::StreamReset { stream, greatest_failed_id } => {
				tracing::info!("Client requests a {stream:?} stream reset, greatest failed ID {greatest_failed_id}.");
				if stream == StreamKind::Video {
					self.state.stream_needs_recovery.store(true, Ordering::Relaxed);
				}
			},
			ControlMessage::FrameAck { frame_id } => {
				self.state.set_frame_ack(frame_id as i64);
			},
			ControlMessage::NetworkFeedback(settings) => {
				tracing::debug!("Applying network settings from the client: {settings:?}");
				self.udp.handle_network_settings(settings).await;
			},
			ControlMessage::DiscoveryRequest => {
				let _ = self
					.udp
					.send_message(&ControlMessage::AudioFrequency {
						hz: self.config.stream.audio.sample_rate,
					})
					.await;
			},
			ControlMessage::Quit => {
				tracing::info!("Client asked to quit the session.");
				self.state.exiting.store(true, Ordering::Relaxed);
				let _ = self.shutdown.trigger_shutdown(());
			},
			ControlMessage::ClipboardChunk(chunk) => {
				tracing::trace!("Ignoring clipboard chunk of {} bytes on the message stream.", chunk.len());
			},
			message => {
				tracing::trace!("Skipped control message: {message:?}");
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn duplicate_dimensions_do_not_rerequest_device_updates() {
		let state = SessionState::new();
		let dimensions = ClientDimensions {
			width: 1920,
			height: 1080,
			dpi: 96,
		};

		state.set_dimensions(dimensions);
		assert!(state.update_device.swap(false, Ordering::Relaxed));

		state.set_dimensions(dimensions);
		assert!(!state.update_device.load(Ordering::Relaxed));

		state.set_dimensions(ClientDimensions {
			width: 2560,
			..dimensions
		});
		assert!(state.update_device.load(Ordering::Relaxed));
	}

	#[test]
	fn frame_acks_keep_the_newest_id() {
		let state = SessionState::new();
		state.set_frame_ack(10);
		state.set_frame_ack(7);
		assert_eq!(state.take_frame_ack(), Some(10));
		assert_eq!(state.take_frame_ack(), None);
	}
}
