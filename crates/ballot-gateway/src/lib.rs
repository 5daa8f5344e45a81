//! ballot-gateway - WebSocket front door for the answer pipeline
//!
//! Clients ask questions over a WebSocket and receive sources, numbered
//! answer chunks and provider health changes as JSON events.

pub mod connection;
pub mod events;
pub mod protocol;
pub mod server;

pub use server::GatewayServer;
