pub mod alloc;
pub mod analyzer;
pub mod client;
pub mod config;
pub mod congestion;
pub mod crypto;
pub mod frame;
pub mod handshake;
pub mod messages;
pub mod packet;
pub mod ringbuffer;
pub mod session;
pub mod tcp;
pub mod throttle;
pub mod udp;
