//! QUIC transport: server-side dispatch and a lightweight request client.

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;
