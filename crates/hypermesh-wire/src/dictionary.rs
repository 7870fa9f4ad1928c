//! In-protocol key/value dictionaries
//!
//! A small string-keyed store used for open-definition protocol payloads
//! such as HELLO metadata. Keys are short ASCII names; values are byte
//! strings, with integers conventionally encoded as hex strings. The binary
//! form is line-oriented `key=value` with a tiny escape alphabet so values
//! may contain arbitrary bytes.

use std::collections::BTreeMap;

use crate::error::{WireError, WireResult};

/// Maximum key length
pub const DICTIONARY_MAX_KEY_LEN: usize = 8;

/// Well-known HELLO metadata keys
pub mod keys {
    /// Physical destination endpoint the sender addressed
    pub const SENT_TO: &str = "s";
    /// Packed software version of the sender
    pub const VERSION: &str = "v";
    /// Probe token the sender will answer to
    pub const PROBE_TOKEN: &str = "p";
}

/// A key/value dictionary with a canonical binary encoding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Dictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no entries are present
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Set a raw byte value
    pub fn add_bytes(&mut self, key: &str, value: &[u8]) -> WireResult<()> {
        if key.is_empty() || key.len() > DICTIONARY_MAX_KEY_LEN || !key.is_ascii() {
            return Err(WireError::InvalidField("dictionary key"));
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    /// Set a string value
    pub fn add_str(&mut self, key: &str, value: &str) -> WireResult<()> {
        self.add_bytes(key, value.as_bytes())
    }

    /// Set an integer value (hex string by convention)
    pub fn add_u64(&mut self, key: &str, value: u64) -> WireResult<()> {
        self.add_str(key, &format!("{:x}", value))
    }

    /// Get a raw byte value
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// Get a string value, if valid UTF-8
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get_bytes(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Get an integer value
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_str(key)
            .and_then(|s| u64::from_str_radix(s, 16).ok())
    }

    /// Encode to the canonical binary form
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.entries {
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            for &b in value {
                match b {
                    0 => out.extend_from_slice(b"\\0"),
                    b'\n' => out.extend_from_slice(b"\\n"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    b'=' => out.extend_from_slice(b"\\e"),
                    b'\\' => out.extend_from_slice(b"\\\\"),
                    _ => out.push(b),
                }
            }
            out.push(b'\n');
        }
        out
    }

    /// Decode from the canonical binary form
    pub fn decode(data: &[u8]) -> WireResult<Self> {
        let mut dict = Dictionary::new();
        for line in data.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let eq = line
                .iter()
                .position(|b| *b == b'=')
                .ok_or(WireError::InvalidField("dictionary line"))?;
            let key = std::str::from_utf8(&line[..eq])
                .map_err(|_| WireError::InvalidField("dictionary key"))?;
            if key.is_empty() || key.len() > DICTIONARY_MAX_KEY_LEN {
                return Err(WireError::InvalidField("dictionary key"));
            }
            let mut value = Vec::new();
            let mut escaped = false;
            for &b in &line[eq + 1..] {
                if escaped {
                    value.push(match b {
                        b'0' => 0,
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b'e' => b'=',
                        b'\\' => b'\\',
                        _ => return Err(WireError::InvalidField("dictionary escape")),
                    });
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else {
                    value.push(b);
                }
            }
            if escaped {
                return Err(WireError::InvalidField("dictionary escape"));
            }
            dict.entries.insert(key.to_string(), value);
        }
        Ok(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut d = Dictionary::new();
        d.add_str(keys::SENT_TO, "203.0.113.9/793").unwrap();
        d.add_u64(keys::VERSION, 0x0001_0002_0003).unwrap();
        d.add_bytes("blob", &[0, 1, b'\n', b'=', b'\\', 255]).unwrap();

        let bytes = d.encode();
        let back = Dictionary::decode(&bytes).unwrap();
        assert_eq!(back, d);
        assert_eq!(back.get_str(keys::SENT_TO), Some("203.0.113.9/793"));
        assert_eq!(back.get_u64(keys::VERSION), Some(0x0001_0002_0003));
        assert_eq!(
            back.get_bytes("blob"),
            Some(&[0u8, 1, b'\n', b'=', b'\\', 255][..])
        );
    }

    #[test]
    fn test_empty() {
        let d = Dictionary::new();
        assert!(d.is_empty());
        assert!(Dictionary::decode(&d.encode()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_inputs() {
        let mut d = Dictionary::new();
        assert!(d.add_str("way-too-long-key", "x").is_err());
        assert!(d.add_str("", "x").is_err());
        assert!(Dictionary::decode(b"no-equals-sign\n").is_err());
        assert!(Dictionary::decode(b"k=bad\\q\n").is_err());
        assert!(Dictionary::decode(b"k=trailing\\").is_err());
    }

    #[test]
    fn test_encoding_is_canonical() {
        // Same entries inserted in any order produce identical bytes.
        let mut a = Dictionary::new();
        a.add_str("b", "2").unwrap();
        a.add_str("a", "1").unwrap();
        let mut b = Dictionary::new();
        b.add_str("a", "1").unwrap();
        b.add_str("b", "2").unwrap();
        assert_eq!(a.encode(), b.encode());
    }
}
