pub mod session;

pub use session::ws_upgrade_handler;
