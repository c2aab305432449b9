use std::collections::{hash_map::Entry, HashMap};

use reed_solomon_erasure::{galois_8, ReedSolomon};

/// When parity shards are in use, the frame's exact byte length is prepended
/// to the payload so reconstruction can trim the zero padding back off.
const LENGTH_PREFIX_SIZE: usize = 4;

pub fn num_fec_shards(num_original: usize, fec_ratio: f64) -> usize {
	(num_original as f64 * fec_ratio).round() as usize
}

/// Result of splitting one frame into equal-size shards plus parity.
pub struct FecShards {
	/// Original shards followed by parity shards, all `shard_size` long
	/// except that the final original shard of an unprotected frame keeps
	/// its natural length.
	pub shards: Vec<Vec<u8>>,
	pub num_original: usize,
	pub num_fec: usize,
}

/// Systematic Reed-Solomon encoder for outgoing frames. Encoders are cached
/// per shard-count combination because building the coding matrix is not free.
pub struct FecEncoder {
	encoders: HashMap<(usize, usize), ReedSolomon<galois_8::Field>>,
}

impl Default for FecEncoder {
	fn default() -> Self {
		Self::new()
	}
}

impl FecEncoder {
	pub fn new() -> Self {
		Self { encoders: HashMap::new() }
	}

	/// Fragment `payload` into shards of at most `shard_size` bytes,
	/// appending `round(num_original * fec_ratio)` parity shards when the
	/// ratio calls for any.
	pub fn encode(&mut self, payload: &[u8], fec_ratio: f64, shard_size: usize) -> Result<FecShards, ()> {
		assert!(!payload.is_empty());

		let plain_original = payload.len().div_ceil(shard_size);
		if num_fec_shards(plain_original, fec_ratio) == 0 {
			// No parity: plain fragmentation, the last shard keeps its size.
			let shards = payload.chunks(shard_size).map(|c| c.to_vec()).collect::<Vec<_>>();
			return Ok(FecShards {
				num_original: shards.len(),
				num_fec: 0,
				shards,
			});
		}

		let mut prefixed = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
		prefixed.extend((payload.len() as u32).to_le_bytes());
		prefixed.extend(payload);

		let num_original = prefixed.len().div_ceil(shard_size);
		let num_fec = num_fec_shards(num_original, fec_ratio).max(1);

		let mut shards = Vec::with_capacity(num_original + num_fec);
		for chunk in prefixed.chunks(shard_size) {
			let mut shard = chunk.to_vec();
			// Parity is computed over equally sized, zero padded shards.
			shard.resize(shard_size, 0);
			shards.push(shard);
		}
		for _ in 0..num_fec {
			shards.push(vec![0u8; shard_size]);
		}

		let encoder = self.get_encoder(num_original, num_fec)?;
		encoder
			.encode(&mut shards)
			.map_err(|e| tracing::error!("Failed to compute parity shards: {e}"))?;

		Ok(FecShards {
			shards,
			num_original,
			num_fec,
		})
	}

	fn get_encoder(&mut self, num_original: usize, num_fec: usize) -> Result<&mut ReedSolomon<galois_8::Field>, ()> {
		Ok(match self.encoders.entry((num_original, num_fec)) {
			Entry::Occupied(e) => e.into_mut(),
			Entry::Vacant(e) => e.insert(
				ReedSolomon::<galois_8::Field>::new(num_original, num_fec)
					.map_err(|e| tracing::error!("Couldn't create error correction encoder: {e}"))?,
			),
		})
	}
}

/// Per-frame Reed-Solomon decoder. Shards are registered as packets arrive;
/// once any `num_original` of them are present the frame reconstructs.
pub struct FecDecoder {
	decoder: ReedSolomon<galois_8::Field>,
	shards: Vec<Option<Vec<u8>>>,
	shard_size: usize,
	num_original: usize,
	num_present: usize,
}

impl FecDecoder {
	pub fn new(num_original: usize, num_fec: usize, shard_size: usize) -> Result<Self, ()> {
		Ok(Self {
			decoder: ReedSolomon::<galois_8::Field>::new(num_original, num_fec)
				.map_err(|e| tracing::error!("Couldn't create error correction decoder: {e}"))?,
			shards: vec![None; num_original + num_fec],
			shard_size,
			num_original,
			num_present: 0,
		})
	}

	pub fn register_shard(&mut self, index: usize, payload: &[u8]) {
		if index >= self.shards.len() || self.shards[index].is_some() {
			return;
		}

		let mut shard = payload.to_vec();
		shard.resize(self.shard_size, 0);
		self.shards[index] = Some(shard);
		self.num_present += 1;
	}

	/// Attempt reconstruction. Returns the frame payload, trimmed to its
	/// exact length, once enough shards have been registered.
	pub fn try_decode(&mut self) -> Option<Vec<u8>> {
		if self.num_present < self.num_original {
			return None;
		}

		let mut shards = self.shards.clone();
		if let Err(e) = self.decoder.reconstruct_data(&mut shards) {
			tracing::error!("Failed to reconstruct frame from {} shards: {e}", self.num_present);
			return None;
		}

		let mut prefixed = Vec::with_capacity(self.num_original * self.shard_size);
		for shard in shards.iter().take(self.num_original) {
			prefixed.extend(shard.as_ref().unwrap());
		}

		if prefixed.len() < LENGTH_PREFIX_SIZE {
			tracing::error!("Reconstructed frame is too short to carry a length prefix.");
			return None;
		}
		let length = u32::from_le_bytes(prefixed[..LENGTH_PREFIX_SIZE].try_into().unwrap()) as usize;
		if length > prefixed.len() - LENGTH_PREFIX_SIZE {
			tracing::error!(
				"Reconstructed frame declares {length} bytes, but only {} were recovered.",
				prefixed.len() - LENGTH_PREFIX_SIZE
			);
			return None;
		}

		prefixed.drain(..LENGTH_PREFIX_SIZE);
		prefixed.truncate(length);
		Some(prefixed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SHARD_SIZE: usize = 100;

	#[test]
	fn zero_ratio_fragments_without_parity() {
		let mut encoder = FecEncoder::new();
		let payload = vec![7u8; 250];
		let shards = encoder.encode(&payload, 0.0, SHARD_SIZE).unwrap();

		assert_eq!(shards.num_original, 3);
		assert_eq!(shards.num_fec, 0);
		assert_eq!(shards.shards[2].len(), 50);
		assert_eq!(shards.shards.concat(), payload);
	}

	#[test]
	fn reconstructs_with_any_original_count_of_shards() {
		let mut encoder = FecEncoder::new();
		let payload: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
		let encoded = encoder.encode(&payload, 0.4, SHARD_SIZE).unwrap();
		assert!(encoded.num_fec > 0);

		// Drop as many shards as there is parity, spread over the frame.
		let mut decoder = FecDecoder::new(encoded.num_original, encoded.num_fec, SHARD_SIZE).unwrap();
		let dropped: Vec<usize> = (0..encoded.num_fec).map(|i| i * 2).collect();
		for (index, shard) in encoded.shards.iter().enumerate() {
			if !dropped.contains(&index) {
				decoder.register_shard(index, shard);
			}
		}

		assert_eq!(decoder.try_decode().unwrap(), payload);
	}

	#[test]
	fn does_not_decode_below_threshold() {
		let mut encoder = FecEncoder::new();
		let payload = vec![3u8; 1000];
		let encoded = encoder.encode(&payload, 0.5, SHARD_SIZE).unwrap();

		let mut decoder = FecDecoder::new(encoded.num_original, encoded.num_fec, SHARD_SIZE).unwrap();
		for (index, shard) in encoded.shards.iter().enumerate().take(encoded.num_original - 1) {
			decoder.register_shard(index, shard);
		}

		assert!(decoder.try_decode().is_none());
	}

	#[test]
	fn length_is_exact_when_last_shard_is_lost() {
		let mut encoder = FecEncoder::new();
		// A payload that does not fill its final shard.
		let payload = vec![9u8; 523];
		let encoded = encoder.encode(&payload, 0.5, SHARD_SIZE).unwrap();

		let mut decoder = FecDecoder::new(encoded.num_original, encoded.num_fec, SHARD_SIZE).unwrap();
		for (index, shard) in encoded.shards.iter().enumerate() {
			// Withhold the final original shard, forcing parity to carry it.
			if index != encoded.num_original - 1 {
				decoder.register_shard(index, shard);
			}
		}

		assert_eq!(decoder.try_decode().unwrap(), payload);
	}

	#[test]
	fn duplicate_registration_is_ignored() {
		let mut encoder = FecEncoder::new();
		let payload = vec![1u8; 300];
		let encoded = encoder.encode(&payload, 0.5, SHARD_SIZE).unwrap();

		let mut decoder = FecDecoder::new(encoded.num_original, encoded.num_fec, SHARD_SIZE).unwrap();
		for _ in 0..5 {
			decoder.register_shard(0, &encoded.shards[0]);
		}
		assert!(decoder.try_decode().is_none());
	}
}
