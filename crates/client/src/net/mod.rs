mod client;
mod config;

pub use client::{ChatClient, ClientState};
pub use config::ClientConfig;
