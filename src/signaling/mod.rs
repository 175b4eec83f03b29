pub mod envelope;
pub mod hub;

pub use envelope::SessionEnvelope;
pub use hub::{HubClient, SignalingHub};
