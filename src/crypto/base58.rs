//! Base58Check encoding
//!
//! Payload followed by the first four bytes of its double SHA-256.

use super::hash::double_sha256;
use thiserror::Error;

/// Base58Check decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Base58Error {
    #[error("Invalid base58 string: {0}")]
    InvalidEncoding(String),
    #[error("Payload too short")]
    TooShort,
    #[error("Checksum mismatch")]
    BadChecksum,
}

/// Encode bytes with a 4-byte checksum suffix
pub fn encode_check(payload: &[u8]) -> String {
    let checksum = double_sha256(payload);
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

/// Decode a Base58Check string, verifying and stripping its checksum
pub fn decode_check(encoded: &str) -> Result<Vec<u8>, Base58Error> {
    let mut data = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| Base58Error::InvalidEncoding(e.to_string()))?;

    if data.len() < 4 {
        return Err(Base58Error::TooShort);
    }

    let split = data.len() - 4;
    let checksum = double_sha256(&data[..split]);
    if checksum[..4] != data[split..] {
        return Err(Base58Error::BadChecksum);
    }

    data.truncate(split);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let payload = [0x05u8, 1, 2, 3, 4, 5];
        let encoded = encode_check(&payload);
        assert_eq!(decode_check(&encoded).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let encoded = encode_check(b"copayer");
        let mut chars: Vec<char> = encoded.chars().collect();
        chars[1] = if chars[1] == '2' { '3' } else { '2' };
        let corrupted: String = chars.into_iter().collect();
        assert!(decode_check(&corrupted).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            decode_check("0OIl"),
            Err(Base58Error::InvalidEncoding(_))
        ));
        assert_eq!(decode_check("1"), Err(Base58Error::TooShort));
    }
}
