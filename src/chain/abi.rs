//! Minimal Solidity ABI codec for the handful of calls the EVM adapter makes.
//!
//! Static types occupy one 32-byte word. Dynamic `string`/`bytes` use the
//! standard head/tail layout (offset in the head, length-prefixed padded tail).

use sha3::{Digest, Keccak256};

use crate::error::ChainError;

pub const WORD: usize = 32;

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

/// First four bytes of keccak256 of the canonical signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Topic0 of an event
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Uint(u128),
    Address([u8; 20]),
    Bool(bool),
    Bytes32([u8; 32]),
    Bytes(Vec<u8>),
    String(String),
}

fn uint_word(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn padded(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let rem = out.len() % WORD;
    if rem != 0 {
        out.resize(out.len() + WORD - rem, 0);
    }
    out
}

fn push_dynamic(head: &mut Vec<u8>, tail: &mut Vec<u8>, head_len: usize, data: &[u8]) {
    head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
    tail.extend_from_slice(&uint_word(data.len() as u128));
    tail.extend_from_slice(&padded(data));
}

/// Encode a tuple of arguments
pub fn encode(args: &[Token]) -> Vec<u8> {
    let mut head = Vec::with_capacity(args.len() * WORD);
    let mut tail = Vec::new();
    let head_len = args.len() * WORD;

    for arg in args {
        match arg {
            Token::Uint(v) => head.extend_from_slice(&uint_word(*v)),
            Token::Bool(b) => head.extend_from_slice(&uint_word(*b as u128)),
            Token::Address(a) => {
                let mut word = [0u8; 32];
                word[12..].copy_from_slice(a);
                head.extend_from_slice(&word);
            }
            Token::Bytes32(b) => head.extend_from_slice(b),
            Token::Bytes(data) => push_dynamic(&mut head, &mut tail, head_len, data),
            Token::String(text) => push_dynamic(&mut head, &mut tail, head_len, text.as_bytes()),
        }
    }

    head.extend_from_slice(&tail);
    head
}

pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&encode(args));
    data
}

/// Split calldata into selector and argument words
pub fn split_call(data: &[u8]) -> Option<([u8; 4], &[u8])> {
    if data.len() < 4 {
        return None;
    }
    Some(([data[0], data[1], data[2], data[3]], &data[4..]))
}

// ============================================================================
// DECODING
// ============================================================================

/// Reads head words (and their dynamic tails) from ABI-encoded return data
pub struct Decoder<'a> {
    data: &'a [u8],
    what: &'static str,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, what }
    }

    fn err(&self, reason: impl Into<String>) -> ChainError {
        ChainError::decode(self.what, reason)
    }

    pub fn word(&self, index: usize) -> Result<&'a [u8], ChainError> {
        let start = index * WORD;
        self.data
            .get(start..start + WORD)
            .ok_or_else(|| self.err(format!("missing word {}", index)))
    }

    pub fn uint(&self, index: usize) -> Result<u128, ChainError> {
        let word = self.word(index)?;
        if word[..16].iter().any(|b| *b != 0) {
            return Err(self.err(format!("word {} exceeds 128 bits", index)));
        }
        let mut buf = [0u8; 16];
        buf.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(buf))
    }

    pub fn u64(&self, index: usize) -> Result<u64, ChainError> {
        u64::try_from(self.uint(index)?).map_err(|_| self.err(format!("word {} exceeds 64 bits", index)))
    }

    pub fn bool(&self, index: usize) -> Result<bool, ChainError> {
        match self.uint(index)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.err(format!("word {} is not a bool ({})", index, other))),
        }
    }

    pub fn address(&self, index: usize) -> Result<[u8; 20], ChainError> {
        let word = self.word(index)?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&word[12..]);
        Ok(out)
    }

    pub fn bytes32(&self, index: usize) -> Result<[u8; 32], ChainError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.word(index)?);
        Ok(out)
    }

    pub fn bytes(&self, index: usize) -> Result<Vec<u8>, ChainError> {
        let offset = usize::try_from(self.uint(index)?).map_err(|_| self.err("offset overflow"))?;
        let len_word = self
            .data
            .get(offset..offset + WORD)
            .ok_or_else(|| self.err("dynamic offset out of range"))?;
        let len = Decoder::new(len_word, self.what).u64(0)? as usize;
        let start = offset + WORD;
        self.data
            .get(start..start + len)
            .map(|b| b.to_vec())
            .ok_or_else(|| self.err("dynamic data truncated"))
    }

    pub fn string(&self, index: usize) -> Result<String, ChainError> {
        String::from_utf8(self.bytes(index)?).map_err(|e| self.err(e.to_string()))
    }
}

// ============================================================================
// ADDRESSES
// ============================================================================

pub fn parse_address(s: &str) -> Option<[u8; 20]> {
    let stripped = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if stripped.len() != 40 {
        return None;
    }
    let bytes = hex::decode(stripped).ok()?;
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Some(out)
}

pub fn format_address(address: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(address))
}

/// Left-pad an EVM address into the 32-byte universal form
pub fn address_to_bytes32(address: &[u8; 20]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address);
    out
}

pub fn bytes32_to_address(word: &[u8; 32]) -> Option<[u8; 20]> {
    if word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&word[12..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("approve(address,uint256)")), "095ea7b3");
        assert_eq!(hex::encode(selector("balanceOf(address)")), "70a08231");
    }

    #[test]
    fn test_static_words() {
        let encoded = encode(&[Token::Uint(7), Token::Bool(true)]);
        assert_eq!(encoded.len(), 64);
        let d = Decoder::new(&encoded, "test");
        assert_eq!(d.u64(0).unwrap(), 7);
        assert!(d.bool(1).unwrap());
        assert!(d.word(2).is_err());
    }

    #[test]
    fn test_dynamic_string_layout() {
        let encoded = encode(&[Token::String("GOLD".into()), Token::Uint(5)]);
        // head: offset(64) + uint, tail: len + one padded word
        assert_eq!(encoded.len(), 4 * WORD);
        let d = Decoder::new(&encoded, "test");
        assert_eq!(d.uint(0).unwrap(), 64);
        assert_eq!(d.string(0).unwrap(), "GOLD");
        assert_eq!(d.u64(1).unwrap(), 5);
    }

    #[test]
    fn test_address_parsing() {
        let addr = parse_address("0x00000000000000000000000000000000000000ff").unwrap();
        assert_eq!(addr[19], 0xff);
        assert_eq!(bytes32_to_address(&address_to_bytes32(&addr)), Some(addr));
        assert!(parse_address("0x1234").is_none());
        assert!(parse_address("00000000000000000000000000000000000000ff").is_none());
    }
}
