use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use clap::Parser;

use skylark::client::audio::AudioPlayer;
use skylark::client::video::VideoRenderer;
use skylark::client::ClientSession;
use skylark::config::{read_private_key, Config, DEFAULT_PRIVATE_KEY_HEX};
use skylark::frame::{CodecKind, VideoFrame};
use skylark::handshake;
use skylark::messages::ControlMessage;
use skylark::tcp::TcpSocketContext;
use skylark::udp::{PeerRole, UdpSocketContext, MAX_RECONNECTION_TIME};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Address of the server, e.g. `192.168.1.10`.
	server: String,

	/// Path to configuration file.
	#[clap(long)]
	config: Option<PathBuf>,

	/// 32-character hexadecimal pre-shared session key.
	#[clap(long)]
	private_key: Option<String>,

	/// Width of the render surface.
	#[clap(long, default_value_t = 1920)]
	width: i32,

	/// Height of the render surface.
	#[clap(long, default_value_t = 1080)]
	height: i32,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,
}

/// Headless render backend: counts frames and keeps the most recent one.
/// A real client injects a decoder and presentation surface here.
struct HeadlessRenderer {
	frames_rendered: u64,
}

impl VideoRenderer for HeadlessRenderer {
	fn render_frame(&mut self, frame: &VideoFrame) -> Result<(), ()> {
		self.frames_rendered += 1;
		if self.frames_rendered == 1 || self.frames_rendered % 300 == 0 {
			tracing::info!(
				"Rendered frame #{}: {}x{} {:?} ({} bytes).",
				self.frames_rendered,
				frame.width,
				frame.height,
				frame.kind,
				frame.data.len()
			);
		}
		Ok(())
	}
}

struct HeadlessAudioPlayer;

impl AudioPlayer for HeadlessAudioPlayer {
	fn queue_full(&self) -> bool {
		false
	}

	fn queue_frame(&mut self, _data: &[u8]) -> Result<(), ()> {
		Ok(())
	}
}

fn init_tracing(verbose: u8, quiet: u8) {
	let level = match i16::from(verbose) - i16::from(quiet) {
		..=-2 => "error",
		-1 => "warn",
		0 => "info",
		1 => "debug",
		2.. => "trace",
	};

	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("skylark={level}"))),
		)
		.init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), ()> {
	let args = Args::parse();
	init_tracing(args.verbose, args.quiet);

	let config = match &args.config {
		Some(path) => Config::read_from_file(path).map_err(|_| std::process::exit(1))?,
		None => Config::default(),
	};

	let key = match &args.private_key {
		Some(hex_key) => read_private_key(hex_key).map_err(|_| std::process::exit(1))?,
		None => {
			tracing::warn!("Using the compiled-in development key.");
			read_private_key(DEFAULT_PRIVATE_KEY_HEX)?
		},
	};

	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if tokio::signal::ctrl_c().await.is_err() {
				std::process::exit(1);
			}
			tracing::info!("Received interrupt signal, shutting down.");
			let _ = shutdown.trigger_shutdown(());
		}
	});

	let handshake_timeout = Duration::from_millis(config.connection_timeout_ms);
	let server_address: SocketAddr = format!("{}:{}", args.server, config.stream.udp_port)
		.parse()
		.map_err(|e| tracing::error!("Invalid server address: {e}"))?;

	let udp_socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
		.await
		.map_err(|e| tracing::error!("Failed to bind UDP socket: {e}"))?;
	handshake::udp_connect(&udp_socket, server_address, &key, handshake_timeout).await?;
	tracing::info!("UDP association established with {server_address}.");

	let udp = UdpSocketContext::new(udp_socket, key, PeerRole::Client);
	udp.set_peer(server_address);

	let tcp = match tokio::net::TcpStream::connect((args.server.as_str(), config.stream.tcp_port)).await {
		Ok(mut stream) => {
			if handshake::tcp_connect(&mut stream, &key, handshake_timeout).await.is_ok() {
				tracing::info!("TCP association established.");
				let (tcp, tcp_rx) = TcpSocketContext::new(stream, key, PeerRole::Client, shutdown.clone());
				drop(tcp_rx);
				Some(tcp)
			} else {
				None
			}
		},
		Err(e) => {
			tracing::warn!("No TCP association: {e}");
			None
		},
	};

	let session = ClientSession::new(
		udp,
		Box::new(HeadlessRenderer { frames_rendered: 0 }),
		Box::new(HeadlessAudioPlayer),
		config.stream.video.ring_size,
		config.stream.audio.ring_size,
		config.stream.video.long_term_references,
		shutdown.clone(),
	);

	session.announce_dimensions(args.width, args.height, 96, CodecKind::H264).await?;

	// Drive rendering at display cadence; the helper task covers stalls.
	tokio::spawn({
		let session = session.clone();
		let shutdown = shutdown.clone();
		async move {
			let mut interval = tokio::time::interval(Duration::from_micros(16_667));
			let mut lost_since: Option<Instant> = None;

			loop {
				if shutdown.wrap_cancel(interval.tick()).await.is_err() {
					break;
				}
				session.try_render();

				let poisoned = tcp.as_ref().is_some_and(|tcp| tcp.is_poisoned());
				if poisoned {
					tracing::error!("TCP association was poisoned, disconnecting.");
					let _ = shutdown.trigger_shutdown(());
					break;
				}

				if session.is_connection_lost() {
					let since = lost_since.get_or_insert_with(Instant::now);
					if since.elapsed() > MAX_RECONNECTION_TIME {
						tracing::warn!("Server unreachable for too long, disconnecting.");
						let _ = shutdown.trigger_shutdown(());
						break;
					}
				} else {
					lost_since = None;
				}
			}
		}
	});

	shutdown.wait_shutdown_triggered().await;
	session.post_message(ControlMessage::Quit);
	shutdown.wait_shutdown_complete().await;

	tracing::info!("Disconnected.");
	Ok(())
}
