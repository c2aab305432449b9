use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::crypto::{self, KEY_LENGTH, AES_METADATA_SIZE};

/// Default bound on the whole handshake exchange.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(2000);

const CHALLENGE_SIZE: usize = 16;
const SEALED_CHALLENGE_SIZE: usize = AES_METADATA_SIZE + CHALLENGE_SIZE;

const HELLO_MAGIC: u32 = 0x4C59_4B53;
const VERIFY_MAGIC: u32 = HELLO_MAGIC + 1;
const FINISH_MAGIC: u32 = HELLO_MAGIC + 2;

const HELLO_SIZE: usize = 4 + CHALLENGE_SIZE;
const VERIFY_SIZE: usize = 4 + CHALLENGE_SIZE + SEALED_CHALLENGE_SIZE;
const FINISH_SIZE: usize = 4 + SEALED_CHALLENGE_SIZE;

fn new_challenge() -> [u8; CHALLENGE_SIZE] {
	let mut challenge = [0u8; CHALLENGE_SIZE];
	rand::thread_rng().fill_bytes(&mut challenge);
	challenge
}

fn answer(challenge: &[u8], key: &[u8; KEY_LENGTH]) -> Result<Vec<u8>, ()> {
	crypto::seal(challenge, key)
}

fn verify_answer(sealed: &[u8], challenge: &[u8], key: &[u8; KEY_LENGTH]) -> Result<(), ()> {
	let opened = crypto::open(sealed, key)?;
	if opened != challenge {
		tracing::warn!("Handshake answer decrypted to the wrong challenge.");
		return Err(());
	}
	Ok(())
}

/// Both peers prove possession of the pre-shared key without transmitting it:
///
/// 1. initiator -> `HELLO  || nonce_i`
/// 2. acceptor  -> `VERIFY || nonce_a || seal(nonce_i)`
/// 3. initiator -> `FINISH || seal(nonce_a)`
///
/// On UDP the acceptor additionally learns the initiator's address. Failure
/// closes the association without retry at this layer.
pub async fn udp_connect(
	socket: &UdpSocket,
	server: SocketAddr,
	key: &[u8; KEY_LENGTH],
	timeout: Duration,
) -> Result<(), ()> {
	tokio::time::timeout(timeout, async {
		let challenge = new_challenge();
		let mut hello = Vec::with_capacity(HELLO_SIZE);
		hello.extend(HELLO_MAGIC.to_le_bytes());
		hello.extend(challenge);
		socket
			.send_to(&hello, server)
			.await
			.map_err(|e| tracing::error!("Failed to send handshake hello: {e}"))?;

		let mut buffer = [0u8; 2048];
		loop {
			let (len, address) = socket
				.recv_from(&mut buffer)
				.await
				.map_err(|e| tracing::error!("Failed to receive handshake reply: {e}"))?;
			if address != server || len != VERIFY_SIZE {
				continue;
			}
			let reply = &buffer[..len];
			if u32::from_le_bytes(reply[..4].try_into().unwrap()) != VERIFY_MAGIC {
				continue;
			}

			let their_challenge = &reply[4..4 + CHALLENGE_SIZE];
			verify_answer(&reply[4 + CHALLENGE_SIZE..], &challenge, key)?;

			let mut finish = Vec::with_capacity(FINISH_SIZE);
			finish.extend(FINISH_MAGIC.to_le_bytes());
			finish.extend(answer(their_challenge, key)?);
			socket
				.send_to(&finish, server)
				.await
				.map_err(|e| tracing::error!("Failed to send handshake finish: {e}"))?;

			return Ok(());
		}
	})
	.await
	.map_err(|_| tracing::warn!("UDP handshake timed out."))?
}

/// Accept one peer on a bound UDP socket. Returns the authenticated address.
pub async fn udp_accept(socket: &UdpSocket, key: &[u8; KEY_LENGTH], timeout: Duration) -> Result<SocketAddr, ()> {
	tokio::time::timeout(timeout, async {
		let mut buffer = [0u8; 2048];

		loop {
			let (len, address) = socket
				.recv_from(&mut buffer)
				.await
				.map_err(|e| tracing::error!("Failed to receive handshake hello: {e}"))?;
			if len != HELLO_SIZE || u32::from_le_bytes(buffer[..4].try_into().unwrap()) != HELLO_MAGIC {
				continue;
			}

			let their_challenge = buffer[4..4 + CHALLENGE_SIZE].to_vec();
			let challenge = new_challenge();

			let mut verify = Vec::with_capacity(VERIFY_SIZE);
			verify.extend(VERIFY_MAGIC.to_le_bytes());
			verify.extend(challenge);
			verify.extend(answer(&their_challenge, key)?);
			socket
				.send_to(&verify, address)
				.await
				.map_err(|e| tracing::error!("Failed to send handshake verify: {e}"))?;

			loop {
				let (len, finish_address) = socket
					.recv_from(&mut buffer)
					.await
					.map_err(|e| tracing::error!("Failed to receive handshake finish: {e}"))?;
				if finish_address != address {
					continue;
				}
				if len != FINISH_SIZE || u32::from_le_bytes(buffer[..4].try_into().unwrap()) != FINISH_MAGIC {
					continue;
				}

				verify_answer(&buffer[4..FINISH_SIZE], &challenge, key)?;
				return Ok(address);
			}
		}
	})
	.await
	.map_err(|_| tracing::warn!("UDP handshake timed out."))?
}

pub async fn tcp_connect(stream: &mut TcpStream, key: &[u8; KEY_LENGTH], timeout: Duration) -> Result<(), ()> {
	tokio::time::timeout(timeout, async {
		let challenge = new_challenge();
		let mut hello = Vec::with_capacity(HELLO_SIZE);
		hello.extend(HELLO_MAGIC.to_le_bytes());
		hello.extend(challenge);
		stream
			.write_all(&hello)
			.await
			.map_err(|e| tracing::error!("Failed to send handshake hello: {e}"))?;

		let mut verify = [0u8; VERIFY_SIZE];
		stream
			.read_exact(&mut verify)
			.await
			.map_err(|e| tracing::error!("Failed to read handshake verify: {e}"))?;
		if u32::from_le_bytes(verify[..4].try_into().unwrap()) != VERIFY_MAGIC {
			tracing::warn!("Unexpected handshake verify message.");
			return Err(());
		}

		let their_challenge = &verify[4..4 + CHALLENGE_SIZE];
		verify_answer(&verify[4 + CHALLENGE_SIZE..], &challenge, key)?;

		let mut finish = Vec::with_capacity(FINISH_SIZE);
		finish.extend(FINISH_MAGIC.to_le_bytes());
		finish.extend(answer(their_challenge, key)?);
		stream
			.write_all(&finish)
			.await
			.map_err(|e| tracing::error!("Failed to send handshake finish: {e}"))
	})
	.await
	.map_err(|_| tracing::warn!("TCP handshake timed out."))?
}

pub async fn tcp_accept(stream: &mut TcpStream, key: &[u8; KEY_LENGTH], timeout: Duration) -> Result<(), ()> {
	tokio::time::timeout(timeout, async {
		let mut hello = [0u8; HELLO_SIZE];
		stream
			.read_exact(&mut hello)
			.await
			.map_err(|e| tracing::error!("Failed to read handshake hello: {e}"))?;
		if u32::from_le_bytes(hello[..4].try_into().unwrap()) != HELLO_MAGIC {
			tracing::warn!("Unexpected handshake hello message.");
			return Err(());
		}

		let their_challenge = hello[4..].to_vec();
		let challenge = new_challenge();

		let mut verify = Vec::with_capacity(VERIFY_SIZE);
		verify.extend(VERIFY_MAGIC.to_le_bytes());
		verify.extend(challenge);
		verify.extend(answer(&their_challenge, key)?);
		stream
			.write_all(&verify)
			.await
			.map_err(|e| tracing::error!("Failed to send handshake verify: {e}"))?;

		let mut finish = [0u8; FINISH_SIZE];
		stream
			.read_exact(&mut finish)
			.await
			.map_err(|e| tracing::error!("Failed to read handshake finish: {e}"))?;
		if u32::from_le_bytes(finish[..4].try_into().unwrap()) != FINISH_MAGIC {
			tracing::warn!("Unexpected handshake finish message.");
			return Err(());
		}

		verify_answer(&finish[4..], &challenge, key)
	})
	.await
	.map_err(|_| tracing::warn!("TCP handshake timed out."))?
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::net::TcpListener;

	const KEY: [u8; KEY_LENGTH] = *b"0123456789abcdef";
	const OTHER_KEY: [u8; KEY_LENGTH] = *b"fedcba9876543210";

	#[tokio::test]
	async fn udp_handshake_succeeds_with_shared_key() {
		let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_address = server_socket.local_addr().unwrap();
		let client_address = client_socket.local_addr().unwrap();

		let (accepted, connected) = tokio::join!(
			udp_accept(&server_socket, &KEY, Duration::from_secs(2)),
			udp_connect(&client_socket, server_address, &KEY, Duration::from_secs(2)),
		);

		assert_eq!(accepted.unwrap(), client_address);
		connected.unwrap();
	}

	#[tokio::test]
	async fn udp_handshake_fails_on_key_mismatch() {
		let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_address = server_socket.local_addr().unwrap();

		let (accepted, connected) = tokio::join!(
			udp_accept(&server_socket, &KEY, Duration::from_millis(300)),
			udp_connect(&client_socket, server_address, &OTHER_KEY, Duration::from_millis(300)),
		);

		assert!(accepted.is_err());
		assert!(connected.is_err());
	}

	#[tokio::test]
	async fn tcp_handshake_succeeds_with_shared_key() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();

		let accept = async {
			let (mut stream, _) = listener.accept().await.unwrap();
			tcp_accept(&mut stream, &KEY, Duration::from_secs(2)).await
		};
		let connect = async {
			let mut stream = TcpStream::connect(address).await.unwrap();
			tcp_connect(&mut stream, &KEY, Duration::from_secs(2)).await
		};

		let (accepted, connected) = tokio::join!(accept, connect);
		accepted.unwrap();
		connected.unwrap();
	}

	#[tokio::test]
	async fn tcp_handshake_fails_on_key_mismatch() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let address = listener.local_addr().unwrap();

		let accept = async {
			let (mut stream, _) = listener.accept().await.unwrap();
			tcp_accept(&mut stream, &KEY, Duration::from_millis(300)).await
		};
		let connect = async {
			let mut stream = TcpStream::connect(address).await.unwrap();
			tcp_connect(&mut stream, &OTHER_KEY, Duration::from_millis(300)).await
		};

		let (accepted, connected) = tokio::join!(accept, connect);
		assert!(accepted.is_err());
		assert!(connected.is_err());
	}
}
