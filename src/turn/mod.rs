//! TURN/STUN relay (`spec.md` §4.4, §6.3).
//!
//! A minimal RFC 5389/5766 subset: unauthenticated STUN binding responses
//! plus long-term-credential TURN allocation, permissions, and
//! send/data-indication relaying. There is exactly one realm and one
//! username/password pair per deployment (`spec.md` §6.4) — this is not a
//! general-purpose TURN server.

pub mod credentials;
pub mod relay;
pub mod stun;

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// Shared, cheaply cloneable TURN configuration and credentials, handed to
/// the relay task and to the `/api/turn-config` handler alike.
#[derive(Clone)]
pub struct TurnState {
    pub username: Arc<str>,
    pub password: Arc<str>,
    pub realm: Arc<str>,
    pub port: u16,
    pub public_ip: Arc<str>,
}

impl TurnState {
    /// Loads or generates persisted credentials and discovers the address
    /// to advertise to clients. Never fails startup on IP discovery error
    /// (`spec.md` §9) — only a missing/unwritable `keys_dir` is fatal.
    pub async fn bootstrap(config: &Config) -> io::Result<Self> {
        let creds = credentials::load_or_generate(&config.turn_keys_dir)?;
        let public_ip = discover_public_ip().await;

        Ok(TurnState {
            username: creds.username.into(),
            password: creds.password.into(),
            realm: config.turn_realm.clone().into(),
            port: config.turn_port,
            public_ip: public_ip.into(),
        })
    }

    pub fn credential_key(&self) -> &[u8] {
        self.password.as_bytes()
    }
}

/// Discover the address to hand out in `urls`/`XOR-RELAYED-ADDRESS`
/// attributes: an outbound HTTPS probe first, falling back to the local
/// interface address a UDP "connect" would use, which never touches the
/// network (`spec.md` §9).
async fn discover_public_ip() -> String {
    match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => match client.get("https://api.ipify.org").send().await {
            Ok(resp) => match resp.text().await {
                Ok(body) => {
                    let trimmed = body.trim();
                    if trimmed.parse::<IpAddr>().is_ok() {
                        return trimmed.to_string();
                    }
                    tracing::warn!(body = %trimmed, "public IP probe returned unparseable body");
                }
                Err(err) => tracing::warn!(error = %err, "public IP probe body read failed"),
            },
            Err(err) => tracing::warn!(error = %err, "public IP probe request failed"),
        },
        Err(err) => tracing::warn!(error = %err, "failed to build public IP probe client"),
    }

    local_ip().unwrap_or_else(|| "127.0.0.1".to_string())
}

/// The address the OS would pick as the source for a UDP packet to a
/// public address, without sending any actual traffic.
fn local_ip() -> Option<String> {
    let socket = StdUdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr: SocketAddr = socket.local_addr().ok()?;
    Some(addr.ip().to_string())
}
