//! Command codes and payload layouts.
//!
//! Integers are big-endian. Strings and blobs are `u32` length-prefixed.

use crate::error::{RpcError, RpcResult};

/// Protocol version string, part of the registration transcript.
pub const PROTOCOL_VERSION: &str = "revrpc-v1";

/// Command codes.
pub mod codes {
    pub const ENUM_COMMANDS: u32 = 0xC000_0001;
    pub const STOP_SERVER: u32 = 0xC0FF_FFFF;
    pub const WHO_ARE_YOU: u32 = 0xCDD0_0101;
    pub const LIST_RESOURCES: u32 = 0xCDD0_0001;
    pub const IS_RESOURCE_PRESENT: u32 = 0xCDD0_0002;
    pub const SEND_TO: u32 = 0xCDD0_0003;
    pub const SEND: u32 = 0xCDD0_0004;
}

/// Length of the routing header the relay prepends to SEND replies.
pub const ROUTING_HEADER_LEN: usize = 16;

/// Bytes in front of the payload of a SEND-by-id request.
pub const SEND_HEADER_LEN: usize = 16;

/// Length of the registration challenge.
pub const CHALLENGE_LEN: usize = 32;

/// Cursor over a payload that fails with [`RpcError::Format`] on short input.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> RpcResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(RpcError::Format(format!(
                "payload truncated: need {n} bytes, have {}",
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    pub fn u32(&mut self) -> RpcResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> RpcResult<u64> {
        let b = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_be_bytes(word))
    }

    pub fn blob(&mut self) -> RpcResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> RpcResult<String> {
        let raw = self.blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| RpcError::Format("string is not valid UTF-8".into()))
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> RpcResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(RpcError::Format(format!(
                "{} trailing bytes in payload",
                self.buf.len()
            )))
        }
    }
}

/// Append-only payload builder.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn blob(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(data);
        self
    }

    pub fn string(self, s: &str) -> Self {
        self.blob(s.as_bytes())
    }

    pub fn raw(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

// ── ENUM_COMMANDS ──────────────────────────────────────────────────

pub fn encode_codes(codes: &[u32]) -> Vec<u8> {
    codes
        .iter()
        .fold(WireWriter::with_capacity(4 + codes.len() * 4).u32(codes.len() as u32), |w, c| w.u32(*c))
        .finish()
}

pub fn decode_codes(data: &[u8]) -> RpcResult<Vec<u32>> {
    let mut r = WireReader::new(data);
    let count = r.u32()? as usize;
    if count > data.len() / 4 {
        return Err(RpcError::Format(format!("code count {count} exceeds payload")));
    }
    let codes = (0..count).map(|_| r.u32()).collect::<RpcResult<Vec<_>>>()?;
    r.finish()?;
    Ok(codes)
}

// ── LIST_RESOURCES / IS_RESOURCE_PRESENT ───────────────────────────

/// A single length-prefixed string (LIST_RESOURCES prefix, IS_RESOURCE_PRESENT name).
pub fn encode_name(name: &str) -> Vec<u8> {
    WireWriter::with_capacity(4 + name.len()).string(name).finish()
}

pub fn decode_name(data: &[u8]) -> RpcResult<String> {
    let mut r = WireReader::new(data);
    let name = r.string()?;
    r.finish()?;
    Ok(name)
}

pub fn encode_names(names: &[String]) -> Vec<u8> {
    names
        .iter()
        .fold(WireWriter::new().u32(names.len() as u32), |w, n| w.string(n))
        .finish()
}

pub fn decode_names(data: &[u8]) -> RpcResult<Vec<String>> {
    let mut r = WireReader::new(data);
    let count = r.u32()? as usize;
    if count > data.len() / 4 {
        return Err(RpcError::Format(format!("name count {count} exceeds payload")));
    }
    let names = (0..count).map(|_| r.string()).collect::<RpcResult<Vec<_>>>()?;
    r.finish()?;
    Ok(names)
}

pub fn encode_resource_id(id: u64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub fn decode_resource_id(data: &[u8]) -> RpcResult<u64> {
    let mut r = WireReader::new(data);
    let id = r.u64()?;
    r.finish()?;
    Ok(id)
}

// ── SEND / SEND_TO ─────────────────────────────────────────────────

/// Who a SEND-family request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Id(u64),
    Name(String),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Id(id) => write!(f, "#{id}"),
            Target::Name(name) => write!(f, "{name:?}"),
        }
    }
}

/// Build a SEND (by id) or SEND_TO (by name) request payload.
pub fn encode_send(target: &Target, payload: &[u8]) -> Vec<u8> {
    let w = WireWriter::with_capacity(payload.len() + 24);
    let w = match target {
        Target::Id(id) => w.u64(*id),
        Target::Name(name) => w.string(name),
    };
    w.u32(0).blob(payload).finish()
}

/// Parse a SEND (`by_name = false`) or SEND_TO (`by_name = true`) request.
pub fn decode_send(data: &[u8], by_name: bool) -> RpcResult<(Target, &[u8])> {
    let mut r = WireReader::new(data);
    let target = if by_name {
        Target::Name(r.string()?)
    } else {
        Target::Id(r.u64()?)
    };
    let _reserved = r.u32()?;
    let payload = r.blob()?;
    r.finish()?;
    Ok((target, payload))
}

/// Routing metadata prepended to a forwarded reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingHeader {
    pub resource_id: u64,
    pub sequence: u32,
    pub reply_len: u32,
}

pub fn encode_routed(header: &RoutingHeader, reply: &[u8]) -> Vec<u8> {
    WireWriter::with_capacity(ROUTING_HEADER_LEN + reply.len())
        .u64(header.resource_id)
        .u32(header.sequence)
        .u32(header.reply_len)
        .raw(reply)
        .finish()
}

/// Split a routed reply into its header and payload.
pub fn decode_routed(mut data: Vec<u8>) -> RpcResult<(RoutingHeader, Vec<u8>)> {
    let mut r = WireReader::new(&data);
    let header = RoutingHeader {
        resource_id: r.u64()?,
        sequence: r.u32()?,
        reply_len: r.u32()?,
    };
    let body_len = data.len() - ROUTING_HEADER_LEN;
    if header.reply_len as usize != body_len {
        return Err(RpcError::Format(format!(
            "routing header declares {} reply bytes, got {body_len}",
            header.reply_len
        )));
    }
    let reply = data.split_off(ROUTING_HEADER_LEN);
    Ok((header, reply))
}

// ── WHO_ARE_YOU ────────────────────────────────────────────────────

/// A Resource's answer to WHO_ARE_YOU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub name: String,
    pub description: String,
    pub command_data_limit: u32,
    /// Empty for an anonymous resource.
    pub public_key: Vec<u8>,
    /// Empty for an anonymous resource.
    pub signature: Vec<u8>,
}

impl Introduction {
    pub fn encode(&self) -> Vec<u8> {
        WireWriter::new()
            .string(&self.name)
            .string(&self.description)
            .u32(self.command_data_limit)
            .blob(&self.public_key)
            .blob(&self.signature)
            .finish()
    }

    pub fn decode(data: &[u8]) -> RpcResult<Self> {
        let mut r = WireReader::new(data);
        let intro = Self {
            name: r.string()?,
            description: r.string()?,
            command_data_limit: r.u32()?,
            public_key: r.blob()?.to_vec(),
            signature: r.blob()?.to_vec(),
        };
        r.finish()?;
        Ok(intro)
    }

    pub fn is_anonymous(&self) -> bool {
        self.public_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_by_id_layout() {
        let data = encode_send(&Target::Id(5), b"ab");
        assert_eq!(
            data,
            vec![0, 0, 0, 0, 0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0, 2, b'a', b'b']
        );
        let (target, payload) = decode_send(&data, false).unwrap();
        assert_eq!(target, Target::Id(5));
        assert_eq!(payload, b"ab");
    }

    #[test]
    fn send_to_resolves_name() {
        let data = encode_send(&Target::Name("Echo".into()), &[1, 2, 3]);
        let (target, payload) = decode_send(&data, true).unwrap();
        assert_eq!(target, Target::Name("Echo".into()));
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn send_with_bad_length_is_rejected() {
        let mut data = encode_send(&Target::Id(1), b"abc");
        data.pop();
        assert!(matches!(decode_send(&data, false), Err(RpcError::Format(_))));
        data.extend_from_slice(b"cd");
        assert!(matches!(decode_send(&data, false), Err(RpcError::Format(_))));
    }

    #[test]
    fn routed_reply_is_stripped() {
        let header = RoutingHeader {
            resource_id: 9,
            sequence: 3,
            reply_len: 1,
        };
        let data = encode_routed(&header, &[0xA5]);
        assert_eq!(data.len(), ROUTING_HEADER_LEN + 1);
        let (got, reply) = decode_routed(data).unwrap();
        assert_eq!(got, header);
        assert_eq!(reply, vec![0xA5]);
    }

    #[test]
    fn routed_reply_length_mismatch() {
        let header = RoutingHeader {
            resource_id: 1,
            sequence: 1,
            reply_len: 4,
        };
        let data = encode_routed(&header, &[1, 2]);
        assert!(decode_routed(data).is_err());
        assert!(decode_routed(vec![0; 10]).is_err());
    }

    #[test]
    fn names_and_codes() {
        let names = vec!["Acc1".to_string(), "Printer".to_string()];
        assert_eq!(decode_names(&encode_names(&names)).unwrap(), names);
        assert_eq!(decode_names(&encode_names(&[])).unwrap(), Vec::<String>::new());

        let codes = vec![codes::ENUM_COMMANDS, codes::SEND];
        assert_eq!(decode_codes(&encode_codes(&codes)).unwrap(), codes);
    }

    #[test]
    fn absurd_counts_are_rejected() {
        let data = WireWriter::new().u32(u32::MAX).finish();
        assert!(decode_names(&data).is_err());
        assert!(decode_codes(&data).is_err());
    }

    #[test]
    fn introduction_layout() {
        let intro = Introduction {
            name: "Echo".into(),
            description: "echoes".into(),
            command_data_limit: 1024,
            public_key: vec![],
            signature: vec![],
        };
        let decoded = Introduction::decode(&intro.encode()).unwrap();
        assert_eq!(decoded, intro);
        assert!(decoded.is_anonymous());
    }

    #[test]
    fn invalid_utf8_name() {
        let data = WireWriter::new().blob(&[0xFF, 0xFE]).finish();
        assert!(matches!(decode_name(&data), Err(RpcError::Format(_))));
    }
}
