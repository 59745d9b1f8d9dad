//! Axum gateway: WebSocket push plus HTTP long-poll, both over one broker.

pub mod app;
pub mod http;
pub mod ws;
