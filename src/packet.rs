use strum_macros::FromRepr;

/// Maximum payload carried by a single UDP packet. Chosen to fit within common
/// MTUs once the encryption envelope is added.
pub const MAX_PAYLOAD_SIZE: usize = 1200;

/// Most original indices a video frame may fragment into.
pub const MAX_VIDEO_PACKETS: usize = 500;

/// Most original indices an audio frame may fragment into.
pub const MAX_AUDIO_PACKETS: usize = 3;

/// Upper bound on the FEC ratio the congestion controller may request.
pub const MAX_FEC_RATIO: f64 = 0.5;

/// Largest number of indices (original + FEC) any frame may consist of.
pub const MAX_PACKETS: usize = MAX_VIDEO_PACKETS + (MAX_VIDEO_PACKETS as f64 * MAX_FEC_RATIO) as usize;

/// Size of the serialized packet header, excluding the payload.
pub const PACKET_HEADER_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, FromRepr)]
#[repr(u8)]
pub enum StreamKind {
	Video = 1,
	Audio = 2,
	Message = 3,
}

/// The smallest transmittable unit: one fragment of a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
	pub stream: StreamKind,
	pub is_nack_response: bool,
	pub is_stream_start: bool,
	pub frame_id: u32,
	pub index: u16,
	pub num_indices: u16,
	pub num_fec_indices: u16,
	pub payload: Vec<u8>,
}

impl Packet {
	pub fn serialize(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());

		buffer.extend((self.stream as u8).to_le_bytes());
		buffer.extend((self.is_nack_response as u8).to_le_bytes());
		buffer.extend((self.is_stream_start as u8).to_le_bytes());
		buffer.push(0u8);
		buffer.extend(self.frame_id.to_le_bytes());
		buffer.extend(self.index.to_le_bytes());
		buffer.extend(self.num_indices.to_le_bytes());
		buffer.extend(self.num_fec_indices.to_le_bytes());
		buffer.extend((self.payload.len() as u16).to_le_bytes());
		buffer.extend(&self.payload);

		buffer
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < PACKET_HEADER_SIZE {
			tracing::trace!("Expected packet of at least {PACKET_HEADER_SIZE} bytes, got {} bytes.", buffer.len());
			return Err(());
		}

		let stream = StreamKind::from_repr(buffer[0])
			.ok_or_else(|| tracing::trace!("Received packet with unknown stream type: {}", buffer[0]))?;
		let is_nack_response = buffer[1] != 0;
		let is_stream_start = buffer[2] != 0;
		let frame_id = u32::from_le_bytes(buffer[4..8].try_into().unwrap());
		let index = u16::from_le_bytes(buffer[8..10].try_into().unwrap());
		let num_indices = u16::from_le_bytes(buffer[10..12].try_into().unwrap());
		let num_fec_indices = u16::from_le_bytes(buffer[12..14].try_into().unwrap());
		let payload_size = u16::from_le_bytes(buffer[14..16].try_into().unwrap());

		if index >= num_indices {
			tracing::trace!("Received packet with index {index} out of range for {num_indices} indices.");
			return Err(());
		}
		if num_fec_indices >= num_indices {
			tracing::trace!("Received packet with {num_fec_indices} FEC indices out of {num_indices} total.");
			return Err(());
		}
		if num_indices as usize > MAX_PACKETS {
			tracing::trace!("Received packet claiming {num_indices} indices, limit is {MAX_PACKETS}.");
			return Err(());
		}
		if payload_size as usize > MAX_PAYLOAD_SIZE {
			tracing::trace!("Received packet with payload of {payload_size} bytes, limit is {MAX_PAYLOAD_SIZE}.");
			return Err(());
		}
		if buffer.len() < PACKET_HEADER_SIZE + payload_size as usize {
			tracing::trace!(
				"Received packet declaring {payload_size} payload bytes, but only {} bytes remain.",
				buffer.len() - PACKET_HEADER_SIZE
			);
			return Err(());
		}

		Ok(Self {
			stream,
			is_nack_response,
			is_stream_start,
			frame_id,
			index,
			num_indices,
			num_fec_indices,
			payload: buffer[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + payload_size as usize].to_vec(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn packet() -> Packet {
		Packet {
			stream: StreamKind::Video,
			is_nack_response: false,
			is_stream_start: true,
			frame_id: 42,
			index: 3,
			num_indices: 12,
			num_fec_indices: 2,
			payload: vec![0xAB; 100],
		}
	}

	#[test]
	fn round_trip() {
		let original = packet();
		let parsed = Packet::from_bytes(&original.serialize()).unwrap();
		assert_eq!(parsed, original);
	}

	#[test]
	fn rejects_index_out_of_range() {
		let mut p = packet();
		p.index = 12;
		assert!(Packet::from_bytes(&p.serialize()).is_err());
	}

	#[test]
	fn rejects_fec_count_not_below_total() {
		let mut p = packet();
		p.num_fec_indices = 12;
		assert!(Packet::from_bytes(&p.serialize()).is_err());
	}

	#[test]
	fn rejects_truncated_payload() {
		let mut buffer = packet().serialize();
		buffer.truncate(buffer.len() - 1);
		assert!(Packet::from_bytes(&buffer).is_err());
	}

	#[test]
	fn rejects_unknown_stream() {
		let mut buffer = packet().serialize();
		buffer[0] = 9;
		assert!(Packet::from_bytes(&buffer).is_err());
	}
}
