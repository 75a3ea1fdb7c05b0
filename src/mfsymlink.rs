//! Minshall-French symlink codec.
//!
//! SMB clients without native symlink support store them as regular files
//! with this fixed 1067-byte layout:
//!
//! ```text
//! XSym\n
//! NNNN\n          four-digit target length
//! <32 hex md5>\n  digest of the target
//! <target>\n
//! <space padding to 1067 bytes>
//! ```

use openssl::hash::{hash, MessageDigest};

use crate::error::{ErrorCode, StoreError};

pub const MFSYMLINK_SIZE: usize = 1067;
pub const MFSYMLINK_MAX_TARGET: usize = 1023;

const MAGIC: &[u8] = b"XSym\n";
const HEADER_LEN: usize = 43;

fn md5_hex(data: &[u8]) -> Result<String, StoreError> {
    let digest = hash(MessageDigest::md5(), data)
        .map_err(|err| StoreError::io_error(format!("md5: {}", err)))?;
    Ok(hex::encode(&digest[..]))
}

pub fn encode(target: &str) -> Result<Vec<u8>, StoreError> {
    if target.is_empty() {
        return Err(StoreError::invalid_argument("empty symlink target"));
    }
    if target.len() > MFSYMLINK_MAX_TARGET {
        return Err(StoreError::new(
            ErrorCode::NameTooLong,
            format!("symlink target exceeds {} bytes", MFSYMLINK_MAX_TARGET),
        ));
    }

    let mut out = Vec::with_capacity(MFSYMLINK_SIZE);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(format!("{:04}\n", target.len()).as_bytes());
    out.extend_from_slice(md5_hex(target.as_bytes())?.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(target.as_bytes());
    out.push(b'\n');
    out.resize(MFSYMLINK_SIZE, b' ');
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<String, StoreError> {
    if data.len() != MFSYMLINK_SIZE {
        return Err(StoreError::invalid_argument(format!(
            "mfsymlink blob must be {} bytes, got {}",
            MFSYMLINK_SIZE,
            data.len()
        )));
    }
    if &data[0..5] != MAGIC {
        return Err(StoreError::invalid_argument("bad mfsymlink magic"));
    }
    if data[9] != b'\n' || data[42] != b'\n' {
        return Err(StoreError::invalid_argument("bad mfsymlink framing"));
    }
    let length: usize = std::str::from_utf8(&data[5..9])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| StoreError::invalid_argument("bad mfsymlink length field"))?;
    if length == 0 || length > MFSYMLINK_MAX_TARGET {
        return Err(StoreError::invalid_argument(format!(
            "mfsymlink target length {} out of range",
            length
        )));
    }
    if data[HEADER_LEN + length] != b'\n' {
        return Err(StoreError::invalid_argument("bad mfsymlink target framing"));
    }

    let target = &data[HEADER_LEN..HEADER_LEN + length];
    let expected = std::str::from_utf8(&data[10..42])
        .map_err(|_| StoreError::invalid_argument("bad mfsymlink digest"))?;
    if md5_hex(target)? != expected {
        return Err(StoreError::invalid_argument("mfsymlink digest mismatch"));
    }

    String::from_utf8(target.to_vec())
        .map_err(|_| StoreError::invalid_argument("mfsymlink target is not UTF-8"))
}

/// Cheap pre-test on size and leading bytes, used before fetching the
/// whole blob.
pub fn quick_check(size: u64, first_bytes: &[u8]) -> bool {
    size == MFSYMLINK_SIZE as u64 && first_bytes.starts_with(MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_bit_exact() {
        let blob = encode("target/path").unwrap();
        assert_eq!(blob.len(), 1067);
        assert_eq!(&blob[0..5], b"XSym\n");
        assert_eq!(&blob[5..10], b"0011\n");
        // MD5 of "target/path".
        assert_eq!(&blob[10..42], b"2413686286714a2be5bdcbbeba577398");
        assert_eq!(blob[42], b'\n');
        assert_eq!(&blob[43..54], b"target/path");
        assert_eq!(blob[54], b'\n');
        assert!(blob[55..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn roundtrip_various_lengths() {
        for len in &[1usize, 2, 10, 255, 1022, 1023] {
            let target: String = "x".repeat(*len);
            let blob = encode(&target).unwrap();
            assert_eq!(blob.len(), MFSYMLINK_SIZE);
            assert_eq!(decode(&blob).unwrap(), target);
        }
    }

    #[test]
    fn encode_rejects_bad_targets() {
        assert_eq!(
            encode("").unwrap_err().code,
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            encode(&"x".repeat(1024)).unwrap_err().code,
            ErrorCode::NameTooLong
        );
    }

    #[test]
    fn decode_rejects_corruption() {
        let good = encode("some/where").unwrap();

        let mut short = good.clone();
        short.pop();
        assert!(decode(&short).is_err());

        let mut bad_magic = good.clone();
        bad_magic[0] = b'Y';
        assert!(decode(&bad_magic).is_err());

        let mut bad_len = good.clone();
        bad_len[5..9].copy_from_slice(b"9999");
        assert!(decode(&bad_len).is_err());

        let mut bad_digest = good.clone();
        bad_digest[10] = if bad_digest[10] == b'0' { b'1' } else { b'0' };
        assert!(decode(&bad_digest).is_err());

        let mut bad_target = good;
        bad_target[43] = b'!';
        assert!(decode(&bad_target).is_err());
    }

    #[test]
    fn quick_check_probes_magic_and_size() {
        assert!(quick_check(1067, b"XSym\nwhatever"));
        assert!(!quick_check(1066, b"XSym\n"));
        assert!(!quick_check(1067, b"notXSym"));
        assert!(quick_check(1067, &encode("a").unwrap()[..16]));
    }
}
