pub mod call_store;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod signaling;
pub mod state;
pub mod sweeper;
pub mod turn;
pub mod websocket;
