//! kbridge daemon implementation
//!
//! - `protocol`: frame codec (1-byte type, 4-byte LE length, payload)
//! - `connection`: exact-count framed reads and writes over one stream
//! - `server`: TCP accept loop, per-connection handler threads, idle monitor
//! - `client`: connect-or-spawn client that executes one snippet per call
//! - `launcher`: starts `kbridged` detached
//! - `config`: rc file / environment configuration

pub mod client;
pub mod config;
pub mod connection;
pub mod launcher;
pub mod protocol;
pub mod server;

pub use client::{wait_for_listener, BridgeClient};
pub use config::BridgeConfig;
pub use connection::Connection;
pub use launcher::DaemonLauncher;
pub use protocol::{decode, decode_header, encode, FailureReport, Message, MessageType};
pub use server::{BridgeServer, IdleClock, ShutdownReason};
