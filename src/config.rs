use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::KEY_LENGTH;

/// Compiled-in fallback key, for local testing only.
pub const DEFAULT_PRIVATE_KEY_HEX: &str = "ED5EF33CD728D17DB8064581428D19EF";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "lowercase")]
pub enum Environment {
	Development,
	Staging,
	Production,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Identifier this peer reports to the webserver.
	pub identifier: String,

	/// Address to bind to.
	pub address: String,

	/// URL of the webserver coordinating sessions.
	pub webserver: String,

	/// Deployment environment.
	pub environment: Environment,

	/// Configuration for the streams.
	pub stream: StreamConfig,

	/// Time in milliseconds the connection handshake may take.
	pub connection_timeout_ms: u64,
}

impl Config {
	#[allow(clippy::result_unit_err)]
	pub fn read_from_file<P: AsRef<Path>>(file: P) -> Result<Config, ()> {
		let config = std::fs::read_to_string(file)
			.map_err(|e| tracing::error!("Failed to open configuration file: {e}"))?;
		let config: Config = toml::from_str(&config)
			.map_err(|e| tracing::error!("Failed to parse configuration file: {e}"))?;

		Ok(config)
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			identifier: "skylark".to_string(),
			address: "0.0.0.0".to_string(),
			webserver: "https://localhost:8080".to_string(),
			environment: Environment::Development,
			stream: Default::default(),
			connection_timeout_ms: 2000,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamConfig {
	/// Port of the UDP media association.
	pub udp_port: u16,

	/// Port of the TCP association for reliable payloads.
	pub tcp_port: u16,

	/// Configuration for the video stream.
	pub video: VideoStreamConfig,

	/// Configuration for the audio stream.
	pub audio: AudioStreamConfig,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			udp_port: 32263,
			tcp_port: 32273,
			video: Default::default(),
			audio: Default::default(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoStreamConfig {
	/// Number of frames the receive ring buffer can hold.
	pub ring_size: usize,

	/// Whether long-term reference frames are used for loss recovery.
	pub long_term_references: bool,
}

impl Default for VideoStreamConfig {
	fn default() -> Self {
		Self {
			ring_size: 256,
			long_term_references: true,
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioStreamConfig {
	/// Number of frames the receive ring buffer can hold.
	pub ring_size: usize,

	/// Sample rate announced to the client.
	pub sample_rate: u32,
}

impl Default for AudioStreamConfig {
	fn default() -> Self {
		Self {
			ring_size: 32,
			sample_rate: 48_000,
		}
	}
}

/// Read a 32-character hexadecimal string into the 16-byte session key.
#[allow(clippy::result_unit_err)]
pub fn read_private_key(hex_key: &str) -> Result<[u8; KEY_LENGTH], ()> {
	let bytes = hex::decode(hex_key).map_err(|e| tracing::error!("Private key is not valid hexadecimal: {e}"))?;
	bytes
		.try_into()
		.map_err(|_| tracing::error!("Private key must be exactly {KEY_LENGTH} bytes."))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn default_key_parses() {
		let key = read_private_key(DEFAULT_PRIVATE_KEY_HEX).unwrap();
		assert_eq!(key.len(), KEY_LENGTH);
		assert_eq!(key[0], 0xED);
	}

	#[test]
	fn rejects_malformed_keys() {
		assert!(read_private_key("not hex").is_err());
		assert!(read_private_key("ED5E").is_err());
	}

	#[test]
	fn config_round_trips_through_toml() {
		let config = Config::default();
		let serialized = toml::to_string(&config).unwrap();

		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(serialized.as_bytes()).unwrap();

		let parsed = Config::read_from_file(file.path()).unwrap();
		assert_eq!(parsed.stream.udp_port, config.stream.udp_port);
		assert_eq!(parsed.stream.video.ring_size, config.stream.video.ring_size);
		assert_eq!(parsed.environment, Environment::Development);
	}
}
