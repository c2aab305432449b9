use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use clap::Parser;

use skylark::config::{read_private_key, Config, Environment, DEFAULT_PRIVATE_KEY_HEX};
use skylark::handshake;
use skylark::messages::ControlMessage;
use skylark::session::audio::{AudioPipeline, PassthroughAudioEncoder, VirtualAudioCapture};
use skylark::session::input::VirtualInputDevice;
use skylark::session::video::encoder::PassthroughEncoderFactory;
use skylark::session::video::{VideoPipeline, VirtualCaptureDevice};
use skylark::session::{MessageDispatcher, SessionState};
use skylark::tcp::TcpSocketContext;
use skylark::udp::{PeerRole, UdpHandlers, UdpSocketContext, MAX_RECONNECTION_TIME};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
	/// Path to configuration file.
	#[clap(long)]
	config: Option<PathBuf>,

	/// 32-character hexadecimal pre-shared session key.
	#[clap(long)]
	private_key: Option<String>,

	/// Identifier reported to the webserver.
	#[clap(long)]
	identifier: Option<String>,

	/// Deployment environment.
	#[clap(long, value_enum)]
	environment: Option<Environment>,

	/// URL of the webserver coordinating sessions.
	#[clap(long)]
	webserver: Option<String>,

	/// Show more log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	verbose: u8,

	/// Show less log messages.
	#[clap(long, short)]
	#[clap(action = clap::ArgAction::Count)]
	quiet: u8,
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

	let mut config = match &args.config {
		Some(path) => Config::read_from_file(path).map_err(|_| std::process::exit(1))?,
		None => Config::default(),
	};
	if let Some(identifier) = args.identifier {
		config.identifier = identifier;
	}
	if let Some(environment) = args.environment {
		config.environment = environment;
	}
	if let Some(webserver) = args.webserver {
		config.webserver = webserver;
	}

	let key = match &args.private_key {
		Some(hex_key) => read_private_key(hex_key).map_err(|_| std::process::exit(1))?,
		None => {
			if config.environment != Environment::Development {
				tracing::error!("A private key is required outside of development.");
				std::process::exit(1);
			}
			tracing::warn!("Using the compiled-in development key.");
			read_private_key(DEFAULT_PRIVATE_KEY_HEX)?
		},
	};

	tracing::info!(
		"Starting {} ({:?}) against {}.",
		config.identifier,
		config.environment,
		config.webserver
	);

	let shutdown = ShutdownManager::new();
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				tracing::error!("Failed to wait for CTRL+C: {e}");
				std::process::exit(1);
			}
			tracing::info!("Received interrupt signal, shutting down.");
			let _ = shutdown.trigger_shutdown(());
		}
	});

	let handshake_timeout = Duration::from_millis(config.connection_timeout_ms);

	// One client per session: authenticate it on UDP first, then TCP.
	let udp_socket = tokio::net::UdpSocket::bind((config.address.as_str(), config.stream.udp_port))
		.await
		.map_err(|e| tracing::error!("Failed to bind UDP socket: {e}"))?;
	tracing::info!("Waiting for a client on UDP port {}.", config.stream.udp_port);
	let client_address = loop {
		match handshake::udp_accept(&udp_socket, &key, Duration::from_secs(3600)).await {
			Ok(address) => break address,
			Err(()) => tracing::warn!("UDP handshake failed, waiting for the next client."),
		}
	};
	tracing::info!("Client connected from {client_address}.");

	let udp = UdpSocketContext::new(udp_socket, key, PeerRole::Server);
	udp.set_peer(client_address);

	let tcp_listener = tokio::net::TcpListener::bind((config.address.as_str(), config.stream.tcp_port))
		.await
		.map_err(|e| tracing::error!("Failed to bind TCP socket: {e}"))?;
	let tcp = match tokio::time::timeout(handshake_timeout, tcp_listener.accept()).await {
		Ok(Ok((mut stream, address))) => {
			if handshake::tcp_accept(&mut stream, &key, handshake_timeout).await.is_ok() {
				tracing::info!("TCP association established with {address}.");
				let (tcp, tcp_rx) = TcpSocketContext::new(stream, key, PeerRole::Server, shutdown.clone());
				drop(tcp_rx);
				Some(tcp)
			} else {
				None
			}
		},
		_ => {
			tracing::warn!("No TCP association was established.");
			None
		},
	};

	let state = SessionState::new();

	let (video_tx, video_rx) = tokio::sync::mpsc::unbounded_channel();
	let (audio_tx, audio_rx) = tokio::sync::mpsc::unbounded_channel();
	let (message_tx, message_rx) = tokio::sync::mpsc::unbounded_channel();
	// The server never receives media, only messages.
	drop(video_rx);
	drop(audio_rx);
	udp.spawn_receiver(
		UdpHandlers {
			video_tx,
			audio_tx,
			message_tx,
		},
		shutdown.clone(),
	);

	let input_device = Arc::new(Mutex::new(VirtualInputDevice::new()));
	MessageDispatcher::spawn(
		config.clone(),
		state.clone(),
		udp.clone(),
		Box::new(input_device),
		message_rx,
		shutdown.clone(),
	);

	let mut video_pipeline = VideoPipeline::launch(
		udp.clone(),
		state.clone(),
		Box::new(VirtualCaptureDevice::new(60)),
		Arc::new(PassthroughEncoderFactory),
		config.stream.video.long_term_references,
		shutdown.clone(),
	);
	let mut audio_pipeline = AudioPipeline::launch(
		udp.clone(),
		state.clone(),
		Box::new(VirtualAudioCapture::new(config.stream.audio.sample_rate)),
		Box::new(PassthroughAudioEncoder),
		shutdown.clone(),
	);

	let _ = udp
		.send_message(&ControlMessage::AudioFrequency {
			hz: config.stream.audio.sample_rate,
		})
		.await;

	// Watch for a dead connection; give reconnection its grace window, then
	// tear the session down.
	tokio::spawn({
		let shutdown = shutdown.clone();
		let udp = udp.clone();
		let tcp = tcp.clone();
		async move {
			let mut lost_since: Option<Instant> = None;
			let mut interval = tokio::time::interval(Duration::from_secs(1));
			loop {
				if shutdown.wrap_cancel(interval.tick()).await.is_err() {
					break;
				}

				let poisoned = tcp.as_ref().is_some_and(|tcp| tcp.is_poisoned());
				if poisoned {
					tracing::error!("TCP association was poisoned, ending the session.");
					let _ = shutdown.trigger_shutdown(());
					break;
				}

				if udp.is_connection_lost() {
					let since = lost_since.get_or_insert_with(Instant::now);
					if since.elapsed() > MAX_RECONNECTION_TIME {
						tracing::warn!("Client unreachable for too long, ending the session.");
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
	state.exiting.store(true, Ordering::Relaxed);
	video_pipeline.join();
	audio_pipeline.join();
	shutdown.wait_shutdown_complete().await;

	tracing::info!("Session ended.");
	Ok(())
}
