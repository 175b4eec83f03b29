//! The TURN/STUN UDP listener: parses inbound messages, authenticates
//! Allocate/Refresh/CreatePermission requests against the long-term
//! credential, and relays Send/Data indications between clients and their
//! allocated relay sockets (`spec.md` §4.4, §6.3).

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::stun::{
    self, class_of, message_type, method_of, Message, ATTR_DATA, ATTR_ERROR_CODE, ATTR_LIFETIME,
    ATTR_MESSAGE_INTEGRITY, ATTR_NONCE, ATTR_REALM, CLASS_ERROR, CLASS_INDICATION, CLASS_REQUEST,
    CLASS_SUCCESS, METHOD_ALLOCATE, METHOD_BINDING, METHOD_CREATE_PERMISSION, METHOD_DATA,
    METHOD_REFRESH, METHOD_SEND,
};
use super::TurnState;

const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);
const MAX_LIFETIME: Duration = Duration::from_secs(3600);
/// How long a relay socket can sit idle in the table before we reap it.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

struct Allocation {
    relay_socket: Arc<UdpSocket>,
    permissions: HashSet<IpAddr>,
    expires_at: Instant,
}

#[derive(Default)]
struct Allocations {
    by_client: HashMap<SocketAddr, Allocation>,
}

/// Binds the relay's UDP listener and runs until the socket errors out.
/// Intended to be spawned as a background task from `main`.
pub async fn run(turn: TurnState) -> std::io::Result<()> {
    let socket = Arc::new(UdpSocket::bind(("0.0.0.0", turn.port)).await?);
    let allocations = Arc::new(Mutex::new(Allocations::default()));

    tracing::info!(port = turn.port, "TURN/STUN relay listening");

    reap_task(allocations.clone());

    let mut buf = vec![0u8; 2048];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "relay socket recv_from failed");
                continue;
            }
        };

        let Some(msg) = stun::parse(&buf[..len]) else {
            continue;
        };

        let socket = socket.clone();
        let allocations = allocations.clone();
        let turn = turn.clone();
        let raw = buf[..len].to_vec();
        tokio::spawn(async move {
            handle_message(&socket, &allocations, &turn, msg, raw, src).await;
        });
    }
}

fn reap_task(allocations: Arc<Mutex<Allocations>>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let mut allocations = allocations.lock().await;
            allocations.by_client.retain(|_, alloc| alloc.expires_at > now);
        }
    });
}

async fn handle_message(
    socket: &Arc<UdpSocket>,
    allocations: &Arc<Mutex<Allocations>>,
    turn: &TurnState,
    msg: Message,
    raw: Vec<u8>,
    src: SocketAddr,
) {
    let method = method_of(msg.message_type);
    let class = class_of(msg.message_type);

    if class != CLASS_REQUEST && class != CLASS_INDICATION {
        return;
    }

    match method {
        METHOD_BINDING if class == CLASS_REQUEST => {
            handle_binding(socket, &msg, src).await;
        }
        METHOD_ALLOCATE if class == CLASS_REQUEST => {
            handle_allocate(socket, allocations, turn, &msg, &raw, src).await;
        }
        METHOD_REFRESH if class == CLASS_REQUEST => {
            handle_refresh(socket, allocations, turn, &msg, &raw, src).await;
        }
        METHOD_CREATE_PERMISSION if class == CLASS_REQUEST => {
            handle_create_permission(socket, allocations, turn, &msg, &raw, src).await;
        }
        METHOD_SEND if class == CLASS_INDICATION => {
            handle_send_indication(allocations, &msg, src).await;
        }
        _ => {}
    }
}

async fn handle_binding(socket: &Arc<UdpSocket>, req: &Message, src: SocketAddr) {
    let mut resp = Message::new(
        message_type(METHOD_BINDING, CLASS_SUCCESS),
        req.transaction_id,
    );
    resp.push_xor_mapped_address(src);
    let _ = socket.send_to(&resp.encode(), src).await;
}

/// Checks the long-term-credential mechanism: missing MESSAGE-INTEGRITY
/// gets a 401 challenge with REALM+NONCE; present-but-wrong gets the same.
/// Returns `true` once verified.
async fn authenticate(
    socket: &Arc<UdpSocket>,
    turn: &TurnState,
    method: u16,
    req: &Message,
    raw: &[u8],
    src: SocketAddr,
) -> bool {
    if req.get(ATTR_MESSAGE_INTEGRITY).is_none() {
        send_unauthorized(socket, turn, method, req, src).await;
        return false;
    }

    let key = turn.credential_key();
    let username_ok = req.username() == Some(&*turn.username);
    let integrity_ok = req.verify_integrity(raw, key);

    if !username_ok || !integrity_ok {
        send_error(socket, method, req, src, 401, "Unauthorized").await;
        return false;
    }

    true
}

async fn send_unauthorized(
    socket: &Arc<UdpSocket>,
    turn: &TurnState,
    method: u16,
    req: &Message,
    src: SocketAddr,
) {
    let mut resp = Message::new(message_type(method, CLASS_ERROR), req.transaction_id);
    resp.push(ATTR_ERROR_CODE, encode_error_code(401, "Unauthorized"));
    resp.push(ATTR_REALM, turn.realm.as_bytes().to_vec());
    resp.push(ATTR_NONCE, generate_nonce());
    let _ = socket.send_to(&resp.encode(), src).await;
}

async fn send_error(
    socket: &Arc<UdpSocket>,
    method: u16,
    req: &Message,
    src: SocketAddr,
    code: u16,
    reason: &str,
) {
    let mut resp = Message::new(message_type(method, CLASS_ERROR), req.transaction_id);
    resp.push(ATTR_ERROR_CODE, encode_error_code(code, reason));
    let _ = socket.send_to(&resp.encode(), src).await;
}

fn encode_error_code(code: u16, reason: &str) -> Vec<u8> {
    let mut out = vec![0u8, 0u8, (code / 100) as u8, (code % 100) as u8];
    out.extend_from_slice(reason.as_bytes());
    out
}

fn generate_nonce() -> Vec<u8> {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes).into_bytes()
}

async fn handle_allocate(
    socket: &Arc<UdpSocket>,
    allocations: &Arc<Mutex<Allocations>>,
    turn: &TurnState,
    req: &Message,
    raw: &[u8],
    src: SocketAddr,
) {
    if !authenticate(socket, turn, METHOD_ALLOCATE, req, raw, src).await {
        return;
    }

    let relay_socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => Arc::new(s),
        Err(err) => {
            tracing::error!(error = %err, "failed to allocate relay socket");
            send_error(socket, METHOD_ALLOCATE, req, src, 508, "Insufficient Capacity").await;
            return;
        }
    };
    let relay_addr = match relay_socket.local_addr() {
        Ok(addr) => SocketAddr::new(turn.public_ip.parse().unwrap_or(addr.ip()), addr.port()),
        Err(_) => return,
    };

    {
        let mut allocations = allocations.lock().await;
        allocations.by_client.insert(
            src,
            Allocation {
                relay_socket: relay_socket.clone(),
                permissions: HashSet::new(),
                expires_at: Instant::now() + DEFAULT_LIFETIME,
            },
        );
    }

    spawn_relay_reader(socket.clone(), relay_socket, src);

    let mut resp = Message::new(
        message_type(METHOD_ALLOCATE, CLASS_SUCCESS),
        req.transaction_id,
    );
    resp.push_xor_relayed_address(relay_addr);
    resp.push_xor_mapped_address(src);
    resp.push(ATTR_LIFETIME, (DEFAULT_LIFETIME.as_secs() as u32).to_be_bytes().to_vec());
    let _ = socket.send_to(&resp.encode_signed(turn.credential_key()), src).await;
}

/// Reads packets arriving at a client's relay socket and forwards them as
/// Data-indications (`spec.md` §4.4) until the socket is reaped.
fn spawn_relay_reader(main_socket: Arc<UdpSocket>, relay_socket: Arc<UdpSocket>, client: SocketAddr) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, peer) = match relay_socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };

            let mut ind = Message::new(
                message_type(METHOD_DATA, CLASS_INDICATION),
                fresh_transaction_id(),
            );
            ind.push_xor_peer_address(peer);
            ind.push(ATTR_DATA, buf[..len].to_vec());
            let _ = main_socket.send_to(&ind.encode(), client).await;
        }
    });
}

fn fresh_transaction_id() -> [u8; 12] {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

async fn handle_refresh(
    socket: &Arc<UdpSocket>,
    allocations: &Arc<Mutex<Allocations>>,
    turn: &TurnState,
    req: &Message,
    raw: &[u8],
    src: SocketAddr,
) {
    if !authenticate(socket, turn, METHOD_REFRESH, req, raw, src).await {
        return;
    }

    let requested_lifetime = req
        .get(ATTR_LIFETIME)
        .filter(|v| v.len() == 4)
        .map(|v| Duration::from_secs(u32::from_be_bytes([v[0], v[1], v[2], v[3]]) as u64))
        .unwrap_or(DEFAULT_LIFETIME)
        .min(MAX_LIFETIME);

    let mut allocations = allocations.lock().await;
    if !allocations.by_client.contains_key(&src) {
        drop(allocations);
        send_error(socket, METHOD_REFRESH, req, src, 437, "Allocation Mismatch").await;
        return;
    }

    if requested_lifetime.is_zero() {
        allocations.by_client.remove(&src);
    } else if let Some(alloc) = allocations.by_client.get_mut(&src) {
        alloc.expires_at = Instant::now() + requested_lifetime;
    }
    drop(allocations);

    let mut resp = Message::new(
        message_type(METHOD_REFRESH, CLASS_SUCCESS),
        req.transaction_id,
    );
    resp.push(
        ATTR_LIFETIME,
        (requested_lifetime.as_secs() as u32).to_be_bytes().to_vec(),
    );
    let _ = socket.send_to(&resp.encode_signed(turn.credential_key()), src).await;
}

async fn handle_create_permission(
    socket: &Arc<UdpSocket>,
    allocations: &Arc<Mutex<Allocations>>,
    turn: &TurnState,
    req: &Message,
    raw: &[u8],
    src: SocketAddr,
) {
    if !authenticate(socket, turn, METHOD_CREATE_PERMISSION, req, raw, src).await {
        return;
    }

    let Some(peer_addr) = req.xor_peer_address() else {
        send_error(socket, METHOD_CREATE_PERMISSION, req, src, 400, "Bad Request").await;
        return;
    };

    let mut allocations = allocations.lock().await;
    match allocations.by_client.get_mut(&src) {
        Some(alloc) => {
            alloc.permissions.insert(peer_addr.ip());
        }
        None => {
            send_error(socket, METHOD_CREATE_PERMISSION, req, src, 437, "Allocation Mismatch").await;
            return;
        }
    }
    drop(allocations);

    let resp = Message::new(
        message_type(METHOD_CREATE_PERMISSION, CLASS_SUCCESS),
        req.transaction_id,
    );
    let _ = socket.send_to(&resp.encode_signed(turn.credential_key()), src).await;
}

async fn handle_send_indication(allocations: &Arc<Mutex<Allocations>>, req: &Message, src: SocketAddr) {
    let Some(peer_addr) = req.xor_peer_address() else {
        return;
    };
    let Some(data) = req.get(ATTR_DATA) else {
        return;
    };

    let allocations = allocations.lock().await;
    let Some(alloc) = allocations.by_client.get(&src) else {
        return;
    };
    if !alloc.permissions.contains(&peer_addr.ip()) {
        return;
    }

    let _ = alloc.relay_socket.send_to(data, peer_addr).await;
}
