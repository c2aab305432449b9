use strum_macros::FromRepr;

use crate::congestion::NetworkSettings;
use crate::frame::CodecKind;
use crate::packet::StreamKind;

/// Number of keycodes tracked by a full keyboard state snapshot.
pub const NUM_KEYCODES: usize = 265;

/// Absolute mouse coordinates are normalized to this range across the screen,
/// so the client's display resolution does not affect server-side replay.
pub const MOUSE_SCALING_FACTOR: i32 = 100_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromRepr)]
#[repr(u32)]
enum ControlMessageType {
	Keyboard = 1,
	KeyboardState = 2,
	MouseButton = 3,
	MouseWheel = 4,
	MouseMotion = 5,
	MouseInactive = 6,
	Multigesture = 7,
	ReleaseAllInput = 8,
	Ping = 108,
	Dimensions = 109,
	Nack = 110,
	BitarrayNack = 111,
	ClipboardChunk = 112,
	StreamReset = 113,
	InteractionMode = 115,
	DiscoveryRequest = 116,
	FrameAck = 117,
	NetworkFeedback = 118,
	Pong = 120,
	AudioFrequency = 121,
	TcpPing = 130,
	TcpPong = 131,
	Quit = 999,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromRepr)]
#[repr(u8)]
pub enum MouseButton {
	Left = 1,
	Middle = 2,
	Right = 3,
	Side = 4,
	Extra = 5,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromRepr)]
#[repr(u8)]
pub enum InteractionMode {
	Control = 1,
	Spectate = 2,
	ExclusiveControl = 3,
}

/// Everything carried on the Message stream (and, for the reliable subset,
/// over the TCP association): input events, NACKs, pings, congestion
/// feedback, stream resets and session control.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
	Keyboard {
		code: u32,
		modifiers: u16,
		pressed: bool,
	},
	KeyboardState {
		caps_lock: bool,
		num_lock: bool,
		pressed: Vec<bool>,
	},
	MouseButton {
		button: MouseButton,
		pressed: bool,
	},
	MouseWheel {
		x: i32,
		y: i32,
		precise_x: f32,
		precise_y: f32,
	},
	MouseMotion {
		relative: bool,
		x: i32,
		y: i32,
	},
	MouseInactive,
	Multigesture {
		d_theta: f32,
		d_dist: f32,
		x: f32,
		y: f32,
		num_fingers: u16,
	},
	ReleaseAllInput,
	Ping {
		id: u32,
	},
	Pong {
		id: u32,
	},
	TcpPing {
		id: u32,
	},
	TcpPong {
		id: u32,
	},
	Dimensions {
		width: i32,
		height: i32,
		dpi: i32,
		codec: CodecKind,
	},
	Nack {
		stream: StreamKind,
		frame_id: u32,
		index: u16,
	},
	BitarrayNack {
		stream: StreamKind,
		frame_id: u32,
		start_index: u16,
		bits: Vec<bool>,
	},
	StreamReset {
		stream: StreamKind,
		greatest_failed_id: u32,
	},
	FrameAck {
		frame_id: u32,
	},
	NetworkFeedback(NetworkSettings),
	AudioFrequency {
		hz: u32,
	},
	InteractionMode(InteractionMode),
	DiscoveryRequest,
	ClipboardChunk(Vec<u8>),
	Quit,
}

impl ControlMessage {
	fn message_type(&self) -> ControlMessageType {
		match self {
			ControlMessage::Keyboard { .. } => ControlMessageType::Keyboard,
			ControlMessage::KeyboardState { .. } => ControlMessageType::KeyboardState,
			ControlMessage::MouseButton { .. } => ControlMessageType::MouseButton,
			ControlMessage::MouseWheel { .. } => ControlMessageType::MouseWheel,
			ControlMessage::MouseMotion { .. } => ControlMessageType::MouseMotion,
			ControlMessage::MouseInactive => ControlMessageType::MouseInactive,
			ControlMessage::Multigesture { .. } => ControlMessageType::Multigesture,
			ControlMessage::ReleaseAllInput => ControlMessageType::ReleaseAllInput,
			ControlMessage::Ping { .. } => ControlMessageType::Ping,
			ControlMessage::Pong { .. } => ControlMessageType::Pong,
			ControlMessage::TcpPing { .. } => ControlMessageType::TcpPing,
			ControlMessage::TcpPong { .. } => ControlMessageType::TcpPong,
			ControlMessage::Dimensions { .. } => ControlMessageType::Dimensions,
			ControlMessage::Nack { .. } => ControlMessageType::Nack,
			ControlMessage::BitarrayNack { .. } => ControlMessageType::BitarrayNack,
			ControlMessage::StreamReset { .. } => ControlMessageType::StreamReset,
			ControlMessage::FrameAck { .. } => ControlMessageType::FrameAck,
			ControlMessage::NetworkFeedback(_) => ControlMessageType::NetworkFeedback,
			ControlMessage::AudioFrequency { .. } => ControlMessageType::AudioFrequency,
			ControlMessage::InteractionMode(_) => ControlMessageType::InteractionMode,
			ControlMessage::DiscoveryRequest => ControlMessageType::DiscoveryRequest,
			ControlMessage::ClipboardChunk(_) => ControlMessageType::ClipboardChunk,
			ControlMessage::Quit => ControlMessageType::Quit,
		}
	}

	/// Serialize as `type || message_id || payload`. The message id orders
	/// keyboard messages on the replay side.
	pub fn serialize(&self, message_id: u32) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(16);
		buffer.extend((self.message_type() as u32).to_le_bytes());
		buffer.extend(message_id.to_le_bytes());

		match self {
			ControlMessage::Keyboard { code, modifiers, pressed } => {
				buffer.extend(code.to_le_bytes());
				buffer.extend(modifiers.to_le_bytes());
				buffer.push(*pressed as u8);
			},
			ControlMessage::KeyboardState { caps_lock, num_lock, pressed } => {
				buffer.push(*caps_lock as u8);
				buffer.push(*num_lock as u8);
				buffer.extend((pressed.len() as u16).to_le_bytes());
				buffer.extend(pressed.iter().map(|&p| p as u8));
			},
			ControlMessage::MouseButton { button, pressed } => {
				buffer.push(*button as u8);
				buffer.push(*pressed as u8);
			},
			ControlMessage::MouseWheel { x, y, precise_x, precise_y } => {
				buffer.extend(x.to_le_bytes());
				buffer.extend(y.to_le_bytes());
				buffer.extend(precise_x.to_le_bytes());
				buffer.extend(precise_y.to_le_bytes());
			},
			ControlMessage::MouseMotion { relative, x, y } => {
				buffer.push(*relative as u8);
				buffer.extend(x.to_le_bytes());
				buffer.extend(y.to_le_bytes());
			},
			ControlMessage::Multigesture { d_theta, d_dist, x, y, num_fingers } => {
				buffer.extend(d_theta.to_le_bytes());
				buffer.extend(d_dist.to_le_bytes());
				buffer.extend(x.to_le_bytes());
				buffer.extend(y.to_le_bytes());
				buffer.extend(num_fingers.to_le_bytes());
			},
			ControlMessage::Ping { id }
			| ControlMessage::Pong { id }
			| ControlMessage::TcpPing { id }
			| ControlMessage::TcpPong { id } => {
				buffer.extend(id.to_le_bytes());
			},
			ControlMessage::Dimensions { width, height, dpi, codec } => {
				buffer.extend(width.to_le_bytes());
				buffer.extend(height.to_le_bytes());
				buffer.extend(dpi.to_le_bytes());
				buffer.extend((*codec as i32).to_le_bytes());
			},
			ControlMessage::Nack { stream, frame_id, index } => {
				buffer.push(*stream as u8);
				buffer.extend(frame_id.to_le_bytes());
				buffer.extend(index.to_le_bytes());
			},
			ControlMessage::BitarrayNack { stream, frame_id, start_index, bits } => {
				buffer.push(*stream as u8);
				buffer.extend(frame_id.to_le_bytes());
				buffer.extend(start_index.to_le_bytes());
				buffer.extend((bits.len() as u32).to_le_bytes());
				let mut packed = vec![0u8; bits.len().div_ceil(8)];
				for (i, &bit) in bits.iter().enumerate() {
					if bit {
						packed[i / 8] |= 1 << (i % 8);
					}
				}
				buffer.extend(packed);
			},
			ControlMessage::StreamReset { stream, greatest_failed_id } => {
				buffer.push(*stream as u8);
				buffer.extend(greatest_failed_id.to_le_bytes());
			},
			ControlMessage::FrameAck { frame_id } => {
				buffer.extend(frame_id.to_le_bytes());
			},
			ControlMessage::NetworkFeedback(settings) => {
				settings.serialize(&mut buffer);
			},
			ControlMessage::AudioFrequency { hz } => {
				buffer.extend(hz.to_le_bytes());
			},
			ControlMessage::InteractionMode(mode) => {
				buffer.push(*mode as u8);
			},
			ControlMessage::ClipboardChunk(data) => {
				buffer.extend((data.len() as u32).to_le_bytes());
				buffer.extend(data);
			},
			ControlMessage::MouseInactive
			| ControlMessage::ReleaseAllInput
			| ControlMessage::DiscoveryRequest
			| ControlMessage::Quit => {},
		}

		buffer
	}

	/// Parse a message, returning it together with its message id.
	pub fn from_bytes(buffer: &[u8]) -> Result<(u32, Self), ()> {
		if buffer.len() < 8 {
			tracing::trace!("Expected control message of at least 8 bytes, got {} bytes.", buffer.len());
			return Err(());
		}

		let message_type = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
		let message_type = ControlMessageType::from_repr(message_type)
			.ok_or_else(|| tracing::warn!("Received unknown control message type: {message_type}"))?;
		let message_id = u32::from_le_bytes(buffer[4..8].try_into().unwrap());
		let payload = &buffer[8..];

		let message = match message_type {
			ControlMessageType::Keyboard => {
				check_length(payload, 7)?;
				ControlMessage::Keyboard {
					code: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
					modifiers: u16::from_le_bytes(payload[4..6].try_into().unwrap()),
					pressed: payload[6] != 0,
				}
			},
			ControlMessageType::KeyboardState => {
				check_length(payload, 4)?;
				let num_keycodes = u16::from_le_bytes(payload[2..4].try_into().unwrap()) as usize;
				if num_keycodes > NUM_KEYCODES {
					tracing::warn!("Keyboard state declares {num_keycodes} keycodes, limit is {NUM_KEYCODES}.");
					return Err(());
				}
				check_length(payload, 4 + num_keycodes)?;
				ControlMessage::KeyboardState {
					caps_lock: payload[0] != 0,
					num_lock: payload[1] != 0,
					pressed: payload[4..4 + num_keycodes].iter().map(|&p| p != 0).collect(),
				}
			},
			ControlMessageType::MouseButton => {
				check_length(payload, 2)?;
				ControlMessage::MouseButton {
					button: MouseButton::from_repr(payload[0])
						.ok_or_else(|| tracing::warn!("Unknown mouse button: {}", payload[0]))?,
					pressed: payload[1] != 0,
				}
			},
			ControlMessageType::MouseWheel => {
				check_length(payload, 16)?;
				ControlMessage::MouseWheel {
					x: i32::from_le_bytes(payload[0..4].try_into().unwrap()),
					y: i32::from_le_bytes(payload[4..8].try_into().unwrap()),
					precise_x: f32::from_le_bytes(payload[8..12].try_into().unwrap()),
					precise_y: f32::from_le_bytes(payload[12..16].try_into().unwrap()),
				}
			},
			ControlMessageType::MouseMotion => {
				check_length(payload, 9)?;
				ControlMessage::MouseMotion {
					relative: payload[0] != 0,
					x: i32::from_le_bytes(payload[1..5].try_into().unwrap()),
					y: i32::from_le_bytes(payload[5..9].try_into().unwrap()),
				}
			},
			ControlMessageType::MouseInactive => ControlMessage::MouseInactive,
			ControlMessageType::Multigesture => {
				check_length(payload, 18)?;
				ControlMessage::Multigesture {
					d_theta: f32::from_le_bytes(payload[0..4].try_into().unwrap()),
					d_dist: f32::from_le_bytes(payload[4..8].try_into().unwrap()),
					x: f32::from_le_bytes(payload[8..12].try_into().unwrap()),
					y: f32::from_le_bytes(payload[12..16].try_into().unwrap()),
					num_fingers: u16::from_le_bytes(payload[16..18].try_into().unwrap()),
				}
			},
			ControlMessageType::ReleaseAllInput => ControlMessage::ReleaseAllInput,
			ControlMessageType::Ping => ControlMessage::Ping { id: parse_u32(payload)? },
			ControlMessageType::Pong => ControlMessage::Pong { id: parse_u32(payload)? },
			ControlMessageType::TcpPing => ControlMessage::TcpPing { id: parse_u32(payload)? },
			ControlMessageType::TcpPong => ControlMessage::TcpPong { id: parse_u32(payload)? },
			ControlMessageType::Dimensions => {
				check_length(payload, 16)?;
				let codec = i32::from_le_bytes(payload[12..16].try_into().unwrap());
				ControlMessage::Dimensions {
					width: i32::from_le_bytes(payload[0..4].try_into().unwrap()),
					height: i32::from_le_bytes(payload[4..8].try_into().unwrap()),
					dpi: i32::from_le_bytes(payload[8..12].try_into().unwrap()),
					codec: CodecKind::from_repr(codec)
						.ok_or_else(|| tracing::warn!("Unknown codec in dimensions message: {codec}"))?,
				}
			},
			ControlMessageType::Nack => {
				check_length(payload, 7)?;
				ControlMessage::Nack {
					stream: parse_stream(payload[0])?,
					frame_id: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
					index: u16::from_le_bytes(payload[5..7].try_into().unwrap()),
				}
			},
			ControlMessageType::BitarrayNack => {
				check_length(payload, 11)?;
				let num_bits = u32::from_le_bytes(payload[7..11].try_into().unwrap()) as usize;
				if num_bits > crate::packet::MAX_PACKETS {
					tracing::warn!("Bitarray NACK declares {num_bits} bits, limit is {}.", crate::packet::MAX_PACKETS);
					return Err(());
				}
				check_length(payload, 11 + num_bits.div_ceil(8))?;
				let bits = (0..num_bits)
					.map(|i| payload[11 + i / 8] & (1 << (i % 8)) != 0)
					.collect();
				ControlMessage::BitarrayNack {
					stream: parse_stream(payload[0])?,
					frame_id: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
					start_index: u16::from_le_bytes(payload[5..7].try_into().unwrap()),
					bits,
				}
			},
			ControlMessageType::StreamReset => {
				check_length(payload, 5)?;
				ControlMessage::StreamReset {
					stream: parse_stream(payload[0])?,
					greatest_failed_id: u32::from_le_bytes(payload[1..5].try_into().unwrap()),
				}
			},
			ControlMessageType::FrameAck => ControlMessage::FrameAck { frame_id: parse_u32(payload)? },
			ControlMessageType::NetworkFeedback => ControlMessage::NetworkFeedback(NetworkSettings::from_bytes(payload)?),
			ControlMessageType::AudioFrequency => ControlMessage::AudioFrequency { hz: parse_u32(payload)? },
			ControlMessageType::InteractionMode => {
				check_length(payload, 1)?;
				ControlMessage::InteractionMode(
					InteractionMode::from_repr(payload[0])
						.ok_or_else(|| tracing::warn!("Unknown interaction mode: {}", payload[0]))?,
				)
			},
			ControlMessageType::DiscoveryRequest => ControlMessage::DiscoveryRequest,
			ControlMessageType::ClipboardChunk => {
				check_length(payload, 4)?;
				let length = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
				check_length(payload, 4 + length)?;
				ControlMessage::ClipboardChunk(payload[4..4 + length].to_vec())
			},
			ControlMessageType::Quit => ControlMessage::Quit,
		};

		Ok((message_id, message))
	}
}

fn check_length(payload: &[u8], expected: usize) -> Result<(), ()> {
	if payload.len() < expected {
		tracing::warn!("Control message payload has {} bytes, expected at least {expected}.", payload.len());
		return Err(());
	}
	Ok(())
}

fn parse_u32(payload: &[u8]) -> Result<u32, ()> {
	check_length(payload, 4)?;
	Ok(u32::from_le_bytes(payload[0..4].try_into().unwrap()))
}

fn parse_stream(value: u8) -> Result<StreamKind, ()> {
	StreamKind::from_repr(value).ok_or_else(|| tracing::warn!("Unknown stream type in control message: {value}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn round_trip(message: ControlMessage) {
		let buffer = message.serialize(7);
		let (id, parsed) = ControlMessage::from_bytes(&buffer).unwrap();
		assert_eq!(id, 7);
		assert_eq!(parsed, message);
	}

	#[test]
	fn keyboard_round_trip() {
		round_trip(ControlMessage::Keyboard {
			code: 44,
			modifiers: 0x2001,
			pressed: true,
		});
	}

	#[test]
	fn keyboard_state_round_trip() {
		let mut pressed = vec![false; NUM_KEYCODES];
		pressed[4] = true;
		pressed[224] = true;
		round_trip(ControlMessage::KeyboardState {
			caps_lock: true,
			num_lock: false,
			pressed,
		});
	}

	#[test]
	fn mouse_messages_round_trip() {
		round_trip(ControlMessage::MouseButton {
			button: MouseButton::Left,
			pressed: true,
		});
		round_trip(ControlMessage::MouseMotion {
			relative: false,
			x: 51_200,
			y: 73_000,
		});
		round_trip(ControlMessage::MouseWheel {
			x: 0,
			y: -1,
			precise_x: 0.0,
			precise_y: -1.5,
		});
		round_trip(ControlMessage::MouseInactive);
	}

	#[test]
	fn nack_round_trip() {
		round_trip(ControlMessage::Nack {
			stream: StreamKind::Video,
			frame_id: 200,
			index: 5,
		});
	}

	#[test]
	fn bitarray_nack_round_trip() {
		let mut bits = vec![false; 21];
		bits[0] = true;
		bits[7] = true;
		bits[20] = true;
		round_trip(ControlMessage::BitarrayNack {
			stream: StreamKind::Audio,
			frame_id: 33,
			start_index: 0,
			bits,
		});
	}

	#[test]
	fn session_messages_round_trip() {
		round_trip(ControlMessage::Ping { id: 12 });
		round_trip(ControlMessage::Pong { id: 12 });
		round_trip(ControlMessage::Dimensions {
			width: 2560,
			height: 1440,
			dpi: 96,
			codec: CodecKind::H265,
		});
		round_trip(ControlMessage::StreamReset {
			stream: StreamKind::Video,
			greatest_failed_id: 512,
		});
		round_trip(ControlMessage::FrameAck { frame_id: 512 });
		round_trip(ControlMessage::Quit);
	}

	#[test]
	fn network_feedback_round_trip() {
		round_trip(ControlMessage::NetworkFeedback(NetworkSettings::default()));
	}

	#[test]
	fn rejects_unknown_type() {
		let mut buffer = ControlMessage::Quit.serialize(0);
		buffer[0..4].copy_from_slice(&12_345u32.to_le_bytes());
		assert!(ControlMessage::from_bytes(&buffer).is_err());
	}

	#[test]
	fn rejects_truncated_payload() {
		let buffer = ControlMessage::Nack {
			stream: StreamKind::Video,
			frame_id: 1,
			index: 1,
		}
		.serialize(0);
		assert!(ControlMessage::from_bytes(&buffer[..buffer.len() - 1]).is_err());
	}
}
