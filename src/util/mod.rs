//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

/// Number of leading bytes shown in a dropped-message diagnostic
pub const DIAGNOSTIC_PREFIX_LEN: usize = 10;

/// Hex dump of at most the first ten bytes of a datagram
pub fn hex_prefix(bytes: &[u8]) -> String {
    let end = bytes.len().min(DIAGNOSTIC_PREFIX_LEN);
    hex::encode(&bytes[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_prefix_short() {
        assert_eq!(hex_prefix(&[0x0b, 0x01, 0xff]), "0b01ff");
        assert_eq!(hex_prefix(&[]), "");
    }

    #[test]
    fn test_hex_prefix_truncates() {
        let bytes: Vec<u8> = (0u8..16).collect();
        assert_eq!(hex_prefix(&bytes), "00010203040506070809");
    }
}
