use std::sync::Arc;

use crate::call_store::CallStore;
use crate::config::Config;
use crate::signaling::SignalingHub;
use crate::turn::TurnState;

/// Shared application state passed to all handlers and the WebSocket
/// upgrade task.
///
/// `CallStore`, `SignalingHub`, and `TurnState` each wrap an `Arc`
/// internally, so cloning `AppState` per request is inexpensive.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub calls: CallStore,
    pub hub: SignalingHub,
    pub turn: TurnState,
}
