use anyhow::{bail, Context, Result};

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex encoding of arbitrary bytes.
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Decodes a hex digest, rejecting odd lengths and non-hex characters.
pub fn decode_hex(value: &str) -> Result<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("hex digest cannot be empty");
    }
    if trimmed.len() % 2 != 0 {
        bail!("hex digest must have an even number of characters");
    }

    let mut bytes = Vec::with_capacity(trimmed.len() / 2);
    let raw = trimmed.as_bytes();
    let mut index = 0usize;
    while index < raw.len() {
        let pair = std::str::from_utf8(&raw[index..index + 2]).context("invalid utf-8 in digest")?;
        let byte = u8::from_str_radix(pair, 16)
            .with_context(|| format!("invalid hex byte '{}' in digest", pair))?;
        bytes.push(byte);
        index = index.saturating_add(2);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_encode_decode_round_trip() {
        let bytes = [0x00, 0x7f, 0xa5, 0xff];
        let encoded = encode_hex(&bytes);
        assert_eq!(encoded, "007fa5ff");
        assert_eq!(decode_hex(&encoded).expect("decode"), bytes);
    }

    #[test]
    fn unit_decode_rejects_odd_length_and_bad_chars() {
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
        assert!(decode_hex("").is_err());
    }
}
