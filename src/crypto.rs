use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes128Gcm, Key, Nonce,
};
use rand::RngCore;

/// Length of the pre-shared session key.
pub const KEY_LENGTH: usize = 16;

const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// Size of the serialized [`AesMetadata`] prefix.
pub const AES_METADATA_SIZE: usize = IV_LENGTH + TAG_LENGTH + 4;

/// Authentication envelope prepended to every encrypted payload:
/// `iv || tag || ciphertext_size`.
#[derive(Clone, Debug, PartialEq)]
pub struct AesMetadata {
	pub iv: [u8; IV_LENGTH],
	pub tag: [u8; TAG_LENGTH],
	pub size: u32,
}

impl AesMetadata {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.iv);
		buffer.extend(self.tag);
		buffer.extend(self.size.to_le_bytes());
	}

	pub fn from_bytes(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < AES_METADATA_SIZE {
			tracing::trace!("Expected AES metadata of {AES_METADATA_SIZE} bytes, got {} bytes.", buffer.len());
			return Err(());
		}

		Ok(Self {
			iv: buffer[..IV_LENGTH].try_into().unwrap(),
			tag: buffer[IV_LENGTH..IV_LENGTH + TAG_LENGTH].try_into().unwrap(),
			size: u32::from_le_bytes(buffer[IV_LENGTH + TAG_LENGTH..AES_METADATA_SIZE].try_into().unwrap()),
		})
	}
}

pub fn encrypt(plaintext: &[u8], key: &[u8], iv: &[u8], tag: &mut [u8]) -> Result<Vec<u8>, aes_gcm::Error> {
	let key = Key::<Aes128Gcm>::from_slice(key);
	let nonce = Nonce::from_slice(iv);
	let cipher = Aes128Gcm::new(key);

	// The aes-gcm crate appends the tag to the ciphertext; the wire format
	// carries it separately in the metadata, so split it off here.
	let mut ciphertext = cipher.encrypt(nonce, plaintext)?;

	let len = ciphertext.len();
	if len < TAG_LENGTH {
		return Err(aes_gcm::Error);
	}
	tag.copy_from_slice(&ciphertext[len - TAG_LENGTH..]);
	ciphertext.truncate(len - TAG_LENGTH);

	Ok(ciphertext)
}

pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8], tag: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
	let key = Key::<Aes128Gcm>::from_slice(key);
	let nonce = Nonce::from_slice(iv);
	let cipher = Aes128Gcm::new(key);

	let mut payload = Vec::with_capacity(ciphertext.len() + tag.len());
	payload.extend_from_slice(ciphertext);
	payload.extend_from_slice(tag);

	cipher.decrypt(nonce, payload.as_ref())
}

/// Encrypt a plaintext under a fresh random nonce and wrap it in the
/// authenticated envelope used on both the UDP and TCP wire.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>, ()> {
	let mut iv = [0u8; IV_LENGTH];
	rand::thread_rng().fill_bytes(&mut iv);

	let mut tag = [0u8; TAG_LENGTH];
	let ciphertext = encrypt(plaintext, key, &iv, &mut tag)
		.map_err(|e| tracing::warn!("Failed to encrypt payload: {e}"))?;

	let metadata = AesMetadata {
		iv,
		tag,
		size: ciphertext.len() as u32,
	};

	let mut buffer = Vec::with_capacity(AES_METADATA_SIZE + ciphertext.len());
	metadata.serialize(&mut buffer);
	buffer.extend(ciphertext);

	Ok(buffer)
}

/// Reverse of [`seal`]. Tampered or truncated envelopes are rejected.
pub fn open(buffer: &[u8], key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>, ()> {
	let metadata = AesMetadata::from_bytes(buffer)?;

	let ciphertext = &buffer[AES_METADATA_SIZE..];
	if metadata.size as usize != ciphertext.len() {
		tracing::trace!(
			"Envelope declares {} ciphertext bytes, but {} bytes follow the metadata.",
			metadata.size,
			ciphertext.len()
		);
		return Err(());
	}

	decrypt(ciphertext, key, &metadata.iv, &metadata.tag)
		.map_err(|_| tracing::trace!("Dropping packet that failed authentication."))
}
