//! Percent-encoding for object keys.
//!
//! Spaces become `%20`, never `+`: Google Storage does not decode `+` the
//! way AWS does, so the conservative form is used for both providers.

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'/' | b'.' | b'-' | b'*' | b'_')
}

/// Percent-encodes an object key for use in a request path.
pub fn encode(key: &str) -> String {
    let mut out = String::with_capacity(key.len());

    for &b in key.as_bytes() {
        if is_unreserved(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0xf) as usize] as char);
        }
    }

    out
}

/// Decodes a percent-encoded key. Malformed escapes are passed through verbatim.
pub fn decode(encoded: &str) -> String {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unreserved_passes_through() {
        assert_eq!(encode("a/b.c-d*e_f0"), "a/b.c-d*e_f0");
    }

    #[test]
    fn test_space_is_percent_20() {
        assert_eq!(encode("a b"), "a%20b");
    }

    #[test]
    fn test_uppercase_hex() {
        assert_eq!(encode("a~b"), "a%7Eb");
        assert_eq!(encode("caf\u{e9}"), "caf%C3%A9");
    }

    #[test]
    fn test_decode_inverts_encode() {
        let key = "dir/file name (1)+\u{e9}.txt";
        assert_eq!(decode(&encode(key)), key);
    }

    proptest! {
        #[test]
        fn prop_encode_is_idempotent_on_unreserved(key in "[A-Za-z0-9/.\\-*_]{0,64}") {
            prop_assert_eq!(encode(&key), key.clone());
            prop_assert_eq!(encode(&encode(&key)), key);
        }

        #[test]
        fn prop_round_trip(key in "\\PC{0,64}") {
            prop_assert_eq!(decode(&encode(&key)), key);
        }
    }
}
