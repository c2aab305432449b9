use strum_macros::FromRepr;

/// No valid video frame, including its embedded cursor, is larger than this.
pub const LARGEST_VIDEO_FRAME_SIZE: usize = 1_000_000;

/// Largest valid audio frame: a little more than one decoded 8 KiB block.
pub const LARGEST_AUDIO_FRAME_SIZE: usize = 9_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromRepr)]
#[repr(i32)]
pub enum CodecKind {
	H264 = 264,
	H265 = 265,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromRepr)]
#[repr(i32)]
pub enum VideoFrameKind {
	Normal = 0,
	Intra = 1,
	CreateLongTerm = 2,
	ReferLongTerm = 3,
}

impl VideoFrameKind {
	/// Whether a decoder can resume from this frame after losing stream state.
	pub fn is_recovery_point(&self) -> bool {
		matches!(self, VideoFrameKind::Intra | VideoFrameKind::ReferLongTerm)
	}
}

/// Single color sample the renderer uses to tint letterboxing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RgbColor {
	pub r: u8,
	pub g: u8,
	pub b: u8,
}

/// Cursor image embedded in a video frame when the cursor changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CursorImage {
	pub width: u16,
	pub height: u16,
	pub hot_x: u16,
	pub hot_y: u16,
	pub pixels: Vec<u8>,
}

impl CursorImage {
	fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.width.to_le_bytes());
		buffer.extend(self.height.to_le_bytes());
		buffer.extend(self.hot_x.to_le_bytes());
		buffer.extend(self.hot_y.to_le_bytes());
		buffer.extend((self.pixels.len() as u32).to_le_bytes());
		buffer.extend(&self.pixels);
	}

	fn from_bytes(buffer: &[u8]) -> Result<(Self, usize), ()> {
		if buffer.len() < 12 {
			tracing::trace!("Expected cursor image of at least 12 bytes, got {} bytes.", buffer.len());
			return Err(());
		}

		let size = u32::from_le_bytes(buffer[8..12].try_into().unwrap()) as usize;
		if buffer.len() < 12 + size {
			tracing::trace!("Cursor image declares {size} pixel bytes, but only {} remain.", buffer.len() - 12);
			return Err(());
		}

		Ok((
			Self {
				width: u16::from_le_bytes(buffer[0..2].try_into().unwrap()),
				height: u16::from_le_bytes(buffer[2..4].try_into().unwrap()),
				hot_x: u16::from_le_bytes(buffer[4..6].try_into().unwrap()),
				hot_y: u16::from_le_bytes(buffer[6..8].try_into().unwrap()),
				pixels: buffer[12..12 + size].to_vec(),
			},
			12 + size,
		))
	}
}

/// One reassembled video frame: a small header followed by encoded payload.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoFrame {
	pub width: i32,
	pub height: i32,
	pub codec: CodecKind,
	pub kind: VideoFrameKind,
	pub long_term_index: i32,
	pub is_empty: bool,
	pub is_window_visible: bool,
	pub corner_color: RgbColor,
	pub cursor: Option<CursorImage>,
	/// Capture time on the server, microseconds.
	pub server_timestamp: i64,
	/// Most recent client input timestamp, echoed back for RTT measurement.
	pub client_input_timestamp: i64,
	pub data: Vec<u8>,
}

impl VideoFrame {
	/// Heartbeat frame: tells the client the stream is alive and the screen
	/// unchanged, without carrying any image payload.
	pub fn empty(is_window_visible: bool) -> Self {
		Self {
			width: 0,
			height: 0,
			codec: CodecKind::H264,
			kind: VideoFrameKind::Normal,
			long_term_index: -1,
			is_empty: true,
			is_window_visible,
			corner_color: RgbColor::default(),
			cursor: None,
			server_timestamp: 0,
			client_input_timestamp: 0,
			data: Vec::new(),
		}
	}

	pub fn serialize(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(64 + self.data.len());

		buffer.extend(self.width.to_le_bytes());
		buffer.extend(self.height.to_le_bytes());
		buffer.extend((self.codec as i32).to_le_bytes());
		buffer.extend((self.kind as i32).to_le_bytes());
		buffer.extend(self.long_term_index.to_le_bytes());
		buffer.extend((self.is_empty as u8).to_le_bytes());
		buffer.extend((self.is_window_visible as u8).to_le_bytes());
		buffer.push(self.corner_color.r);
		buffer.push(self.corner_color.g);
		buffer.push(self.corner_color.b);
		buffer.extend((self.cursor.is_some() as u8).to_le_bytes());
		if let Some(cursor) = &self.cursor {
			cursor.serialize(&mut buffer);
		}
		buffer.extend(self.server_timestamp.to_le_bytes());
		buffer.extend(self.client_input_timestamp.to_le_bytes());
		buffer.extend((self.data.len() as i32).to_le_bytes());
		buffer.extend(&self.data);

		buffer
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 26 {
			tracing::trace!("Expected video frame header of at least 26 bytes, got {} bytes.", buffer.len());
			return Err(());
		}

		let codec = i32::from_le_bytes(buffer[8..12].try_into().unwrap());
		let codec = CodecKind::from_repr(codec)
			.ok_or_else(|| tracing::trace!("Received video frame with unknown codec: {codec}"))?;
		let kind = i32::from_le_bytes(buffer[12..16].try_into().unwrap());
		let kind = VideoFrameKind::from_repr(kind)
			.ok_or_else(|| tracing::trace!("Received video frame with unknown frame type: {kind}"))?;

		let has_cursor = buffer[25] != 0;
		let mut offset = 26;
		let cursor = if has_cursor {
			let (cursor, consumed) = CursorImage::from_bytes(&buffer[offset..])?;
			offset += consumed;
			Some(cursor)
		} else {
			None
		};

		if buffer.len() < offset + 20 {
			tracing::trace!("Video frame truncated after cursor image.");
			return Err(());
		}

		let server_timestamp = i64::from_le_bytes(buffer[offset..offset + 8].try_into().unwrap());
		let client_input_timestamp = i64::from_le_bytes(buffer[offset + 8..offset + 16].try_into().unwrap());
		let data_length = i32::from_le_bytes(buffer[offset + 16..offset + 20].try_into().unwrap());
		if data_length < 0 || buffer.len() < offset + 20 + data_length as usize {
			tracing::trace!("Video frame declares {data_length} payload bytes, but the buffer is shorter.");
			return Err(());
		}

		Ok(Self {
			width: i32::from_le_bytes(buffer[0..4].try_into().unwrap()),
			height: i32::from_le_bytes(buffer[4..8].try_into().unwrap()),
			codec,
			kind,
			long_term_index: i32::from_le_bytes(buffer[16..20].try_into().unwrap()),
			is_empty: buffer[20] != 0,
			is_window_visible: buffer[21] != 0,
			corner_color: RgbColor {
				r: buffer[22],
				g: buffer[23],
				b: buffer[24],
			},
			cursor,
			server_timestamp,
			client_input_timestamp,
			data: buffer[offset + 20..offset + 20 + data_length as usize].to_vec(),
		})
	}

	/// Read the server capture timestamp without deserializing the payload.
	/// Used by the ring buffer for delay-gradient tracking.
	pub fn peek_server_timestamp(buffer: &[u8]) -> Option<i64> {
		if buffer.len() < 26 {
			return None;
		}

		let mut offset = 26;
		if buffer[25] != 0 {
			if buffer.len() < offset + 12 {
				return None;
			}
			let size = u32::from_le_bytes(buffer[offset + 8..offset + 12].try_into().unwrap()) as usize;
			offset += 12 + size;
		}

		if buffer.len() < offset + 8 {
			return None;
		}
		Some(i64::from_le_bytes(buffer[offset..offset + 8].try_into().unwrap()))
	}
}

/// One reassembled audio frame. A zero-length payload is the empty sentinel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AudioFrame {
	pub data: Vec<u8>,
}

impl AudioFrame {
	pub fn serialize(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(4 + self.data.len());
		buffer.extend((self.data.len() as i32).to_le_bytes());
		buffer.extend(&self.data);
		buffer
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 4 {
			tracing::trace!("Expected audio frame of at least 4 bytes, got {} bytes.", buffer.len());
			return Err(());
		}

		let data_length = i32::from_le_bytes(buffer[0..4].try_into().unwrap());
		if data_length < 0 || buffer.len() < 4 + data_length as usize {
			tracing::trace!("Audio frame declares {data_length} payload bytes, but the buffer is shorter.");
			return Err(());
		}

		Ok(Self {
			data: buffer[4..4 + data_length as usize].to_vec(),
		})
	}

	pub fn is_empty_sentinel(&self) -> bool {
		self.data.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn frame() -> VideoFrame {
		VideoFrame {
			width: 1280,
			height: 720,
			codec: CodecKind::H265,
			kind: VideoFrameKind::Intra,
			long_term_index: -1,
			is_empty: false,
			is_window_visible: true,
			corner_color: RgbColor { r: 10, g: 20, b: 30 },
			cursor: None,
			server_timestamp: 1_234_567,
			client_input_timestamp: 7_654_321,
			data: vec![0x42; 5000],
		}
	}

	#[test]
	fn video_round_trip() {
		let original = frame();
		assert_eq!(VideoFrame::from_bytes(&original.serialize()).unwrap(), original);
	}

	#[test]
	fn video_round_trip_with_cursor() {
		let mut original = frame();
		original.cursor = Some(CursorImage {
			width: 32,
			height: 32,
			hot_x: 4,
			hot_y: 2,
			pixels: vec![0xFF; 32 * 32 * 4],
		});
		assert_eq!(VideoFrame::from_bytes(&original.serialize()).unwrap(), original);
	}

	#[test]
	fn peek_server_timestamp_matches_header() {
		let mut original = frame();
		assert_eq!(VideoFrame::peek_server_timestamp(&original.serialize()), Some(1_234_567));

		original.cursor = Some(CursorImage {
			width: 8,
			height: 8,
			hot_x: 0,
			hot_y: 0,
			pixels: vec![0; 8 * 8 * 4],
		});
		assert_eq!(VideoFrame::peek_server_timestamp(&original.serialize()), Some(1_234_567));
	}

	#[test]
	fn empty_frame_round_trip() {
		let original = VideoFrame::empty(true);
		let parsed = VideoFrame::from_bytes(&original.serialize()).unwrap();
		assert!(parsed.is_empty);
		assert!(parsed.is_window_visible);
		assert!(parsed.data.is_empty());
	}

	#[test]
	fn rejects_truncated_video_payload() {
		let mut buffer = frame().serialize();
		buffer.truncate(buffer.len() - 1);
		assert!(VideoFrame::from_bytes(&buffer).is_err());
	}

	#[test]
	fn audio_round_trip_and_sentinel() {
		let original = AudioFrame { data: vec![1, 2, 3] };
		assert_eq!(AudioFrame::from_bytes(&original.serialize()).unwrap(), original);
		assert!(!original.is_empty_sentinel());

		let sentinel = AudioFrame::default();
		assert!(AudioFrame::from_bytes(&sentinel.serialize()).unwrap().is_empty_sentinel());
	}
}
