//! Minimal STUN/TURN message encoding and decoding (RFC 5389 / RFC 5766
//! subset) sufficient for binding requests and long-term-credential TURN
//! allocation (`spec.md` §4.4, §6.3).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

// Method + class bits packed into the 14-bit method field of the message
// type (RFC 5389 §6).
pub const METHOD_BINDING: u16 = 0x0001;
pub const METHOD_ALLOCATE: u16 = 0x0003;
pub const METHOD_REFRESH: u16 = 0x0004;
pub const METHOD_SEND: u16 = 0x0006;
pub const METHOD_DATA: u16 = 0x0007;
pub const METHOD_CREATE_PERMISSION: u16 = 0x0008;
pub const METHOD_CHANNEL_BIND: u16 = 0x0009;

pub const CLASS_REQUEST: u16 = 0b00;
pub const CLASS_INDICATION: u16 = 0b01;
pub const CLASS_SUCCESS: u16 = 0b10;
pub const CLASS_ERROR: u16 = 0b11;

// Attribute types (RFC 5389 / RFC 5766).
pub const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_REALM: u16 = 0x0014;
pub const ATTR_NONCE: u16 = 0x0015;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const ATTR_LIFETIME: u16 = 0x000D;
pub const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
pub const ATTR_DATA: u16 = 0x0013;
pub const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone)]
pub struct Attribute {
    pub kind: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Message {
    /// Packed method + class (the raw 14-bit message-type field).
    pub message_type: u16,
    pub transaction_id: [u8; 12],
    pub attributes: Vec<Attribute>,
}

/// Packs a 12-bit method and a 2-bit class into the 16-bit message-type
/// field, per RFC 5389 §6: class bit C0 sits at bit 4 and C1 at bit 8,
/// splitting the method's bits into three runs (M0-M3, M4-M6, M7-M11).
pub fn message_type(method: u16, class: u16) -> u16 {
    let m = method & 0x0FFF;
    let m_low = m & 0x000F;
    let m_mid = (m >> 4) & 0x0007;
    let m_high = (m >> 7) & 0x001F;
    let c0 = class & 0x1;
    let c1 = (class >> 1) & 0x1;
    m_low | (c0 << 4) | (m_mid << 5) | (c1 << 8) | (m_high << 9)
}

pub fn method_of(message_type: u16) -> u16 {
    let m_low = message_type & 0x000F;
    let m_mid = (message_type >> 5) & 0x0007;
    let m_high = (message_type >> 9) & 0x001F;
    m_low | (m_mid << 4) | (m_high << 7)
}

pub fn class_of(message_type: u16) -> u16 {
    let c0 = (message_type >> 4) & 0x1;
    let c1 = (message_type >> 8) & 0x1;
    c0 | (c1 << 1)
}

impl Message {
    pub fn new(message_type: u16, transaction_id: [u8; 12]) -> Self {
        Message {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn push(&mut self, kind: u16, value: Vec<u8>) {
        self.attributes.push(Attribute { kind, value });
    }

    pub fn get(&self, kind: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.kind == kind)
            .map(|a| a.value.as_slice())
    }

    pub fn push_xor_mapped_address(&mut self, addr: SocketAddr) {
        self.push(
            ATTR_XOR_MAPPED_ADDRESS,
            encode_xor_address(addr, &self.transaction_id),
        );
    }

    pub fn push_xor_relayed_address(&mut self, addr: SocketAddr) {
        self.push(
            ATTR_XOR_RELAYED_ADDRESS,
            encode_xor_address(addr, &self.transaction_id),
        );
    }

    pub fn push_xor_peer_address(&mut self, addr: SocketAddr) {
        self.push(
            ATTR_XOR_PEER_ADDRESS,
            encode_xor_address(addr, &self.transaction_id),
        );
    }

    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.get(ATTR_XOR_PEER_ADDRESS)
            .and_then(|v| decode_xor_address(v, &self.transaction_id))
    }

    pub fn username(&self) -> Option<&str> {
        self.get(ATTR_USERNAME).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Serialize without a MESSAGE-INTEGRITY attribute.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_inner(None)
    }

    /// Serialize with a MESSAGE-INTEGRITY attribute appended, keyed by
    /// `key` (`spec.md` §4.4 / `DESIGN.md` note 2: the key is the raw TURN
    /// password bytes, not the RFC 5389 MD5 long-term-credential key).
    pub fn encode_signed(&self, key: &[u8]) -> Vec<u8> {
        self.encode_inner(Some(key))
    }

    fn encode_inner(&self, sign_key: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        for attr in &self.attributes {
            encode_attr(&mut body, attr.kind, &attr.value);
        }

        if let Some(key) = sign_key {
            // The length field used for the HMAC must include the
            // MESSAGE-INTEGRITY attribute's own 24 bytes (4 header + 20
            // digest) per RFC 5389 §15.4.
            let mut header = Vec::with_capacity(HEADER_LEN);
            header.extend_from_slice(&self.message_type.to_be_bytes());
            header.extend_from_slice(&((body.len() + 24) as u16).to_be_bytes());
            header.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
            header.extend_from_slice(&self.transaction_id);

            let mut to_sign = header;
            to_sign.extend_from_slice(&body);

            let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(&to_sign);
            let digest = mac.finalize().into_bytes();

            encode_attr(&mut body, ATTR_MESSAGE_INTEGRITY, &digest);
        }

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&self.message_type.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        out.extend_from_slice(&self.transaction_id);
        out.extend_from_slice(&body);
        out
    }

    /// Verify the MESSAGE-INTEGRITY attribute against `raw`, the original
    /// bytes this message was parsed from.
    pub fn verify_integrity(&self, raw: &[u8], key: &[u8]) -> bool {
        let Some(attr) = self.attributes.iter().find(|a| a.kind == ATTR_MESSAGE_INTEGRITY) else {
            return false;
        };

        // Find where the MESSAGE-INTEGRITY attribute starts in the raw
        // bytes so we can recompute the HMAC over everything before it,
        // with the header length field adjusted to stop there (RFC 5389
        // §15.4).
        let mi_offset = match find_attr_offset(raw, ATTR_MESSAGE_INTEGRITY) {
            Some(off) => off,
            None => return false,
        };

        let mut signed_prefix = raw[..mi_offset].to_vec();
        let new_len = (mi_offset - HEADER_LEN + 24) as u16;
        signed_prefix[2..4].copy_from_slice(&new_len.to_be_bytes());

        let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(&signed_prefix);
        let expected = mac.finalize().into_bytes();

        expected.as_slice() == attr.value.as_slice()
    }
}

fn find_attr_offset(raw: &[u8], kind: u16) -> Option<usize> {
    let mut offset = HEADER_LEN;
    while offset + 4 <= raw.len() {
        let attr_kind = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        let attr_len = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
        if attr_kind == kind {
            return Some(offset);
        }
        let padded = (attr_len + 3) / 4 * 4;
        offset += 4 + padded;
    }
    None
}

fn encode_attr(out: &mut Vec<u8>, kind: u16, value: &[u8]) {
    out.extend_from_slice(&kind.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    let pad = (4 - value.len() % 4) % 4;
    out.extend(std::iter::repeat(0u8).take(pad));
}

pub fn parse(raw: &[u8]) -> Option<Message> {
    if raw.len() < HEADER_LEN {
        return None;
    }

    let message_type = u16::from_be_bytes([raw[0], raw[1]]);
    let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let cookie = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if cookie != MAGIC_COOKIE {
        return None;
    }
    if raw.len() < HEADER_LEN + length {
        return None;
    }

    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&raw[8..20]);

    let mut attributes = Vec::new();
    let mut offset = HEADER_LEN;
    let end = HEADER_LEN + length;
    while offset + 4 <= end {
        let kind = u16::from_be_bytes([raw[offset], raw[offset + 1]]);
        let attr_len = u16::from_be_bytes([raw[offset + 2], raw[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > end {
            break;
        }
        attributes.push(Attribute {
            kind,
            value: raw[value_start..value_end].to_vec(),
        });
        let padded = (attr_len + 3) / 4 * 4;
        offset = value_start + padded;
    }

    Some(Message {
        message_type,
        transaction_id,
        attributes,
    })
}

fn encode_xor_address(addr: SocketAddr, transaction_id: &[u8; 12]) -> Vec<u8> {
    let port = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
    let mut out = vec![0u8, if addr.is_ipv4() { 0x01 } else { 0x02 }];
    out.extend_from_slice(&port.to_be_bytes());

    match addr.ip() {
        IpAddr::V4(v4) => {
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let octets = v4.octets();
            for i in 0..4 {
                out.push(octets[i] ^ cookie[i]);
            }
        }
        IpAddr::V6(v6) => {
            let mut xor_bytes = [0u8; 16];
            xor_bytes[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_bytes[4..16].copy_from_slice(transaction_id);
            for (b, x) in v6.octets().iter().zip(xor_bytes.iter()) {
                out.push(b ^ x);
            }
        }
    }
    out
}

fn decode_xor_address(value: &[u8], transaction_id: &[u8; 12]) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let xor_port = u16::from_be_bytes([value[2], value[3]]);
    let port = xor_port ^ ((MAGIC_COOKIE >> 16) as u16);

    match family {
        0x01 if value.len() >= 8 => {
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let mut octets = [0u8; 4];
            for i in 0..4 {
                octets[i] = value[4 + i] ^ cookie[i];
            }
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut xor_bytes = [0u8; 16];
            xor_bytes[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_bytes[4..16].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ xor_bytes[i];
            }
            Some(SocketAddr::new(IpAddr::V6(octets.into()), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_round_trips_through_encode_and_parse() {
        let msg = Message::new(message_type(METHOD_BINDING, CLASS_REQUEST), [7u8; 12]);
        let raw = msg.encode();

        let parsed = parse(&raw).unwrap();
        assert_eq!(method_of(parsed.message_type), METHOD_BINDING);
        assert_eq!(class_of(parsed.message_type), CLASS_REQUEST);
    }

    #[test]
    fn xor_mapped_address_round_trips() {
        let mut msg = Message::new(message_type(METHOD_BINDING, CLASS_SUCCESS), [1u8; 12]);
        let addr: SocketAddr = "203.0.113.5:54321".parse().unwrap();
        msg.push_xor_mapped_address(addr);

        let raw = msg.encode();
        let parsed = parse(&raw).unwrap();
        let value = parsed.get(ATTR_XOR_MAPPED_ADDRESS).unwrap();
        let decoded = decode_xor_address(value, &parsed.transaction_id).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn message_integrity_verifies_with_correct_key() {
        let mut msg = Message::new(message_type(METHOD_ALLOCATE, CLASS_REQUEST), [2u8; 12]);
        msg.push(ATTR_USERNAME, b"meetbridge".to_vec());

        let key = b"super-secret-password";
        let raw = msg.encode_signed(key);

        let parsed = parse(&raw).unwrap();
        assert!(parsed.verify_integrity(&raw, key));
    }

    #[test]
    fn message_integrity_rejects_wrong_key() {
        let mut msg = Message::new(message_type(METHOD_ALLOCATE, CLASS_REQUEST), [3u8; 12]);
        msg.push(ATTR_USERNAME, b"meetbridge".to_vec());

        let raw = msg.encode_signed(b"correct-password");
        let parsed = parse(&raw).unwrap();

        assert!(!parsed.verify_integrity(&raw, b"wrong-password"));
    }

    #[test]
    fn parse_rejects_bad_magic_cookie() {
        let mut raw = vec![0u8; 20];
        raw[0..2].copy_from_slice(&message_type(METHOD_BINDING, CLASS_REQUEST).to_be_bytes());
        // magic cookie left as zero — invalid.
        assert!(parse(&raw).is_none());
    }

    #[test]
    fn method_and_class_round_trip_through_message_type() {
        for method in [
            METHOD_BINDING,
            METHOD_ALLOCATE,
            METHOD_REFRESH,
            METHOD_SEND,
            METHOD_DATA,
            METHOD_CREATE_PERMISSION,
            METHOD_CHANNEL_BIND,
        ] {
            for class in [CLASS_REQUEST, CLASS_INDICATION, CLASS_SUCCESS, CLASS_ERROR] {
                let mt = message_type(method, class);
                assert_eq!(method_of(mt), method, "method mismatch for {method:#06x}");
                assert_eq!(class_of(mt), class, "class mismatch for {method:#06x}/{class:#04x}");
            }
        }
    }
}
