pub mod attach;
pub mod client;
pub mod config;
pub mod listeners;
pub mod protocol;
pub mod pty;
pub mod server;
pub mod terminal;
pub mod transport;
