//! Opaque file handle codec.
//!
//! A handle is the byte string `"{share}:{uuid}"`, capped at 64 bytes.
//! Callers treat handles as opaque; only this module parses them. The
//! 64-bit inode presented to NFS clients is derived from the handle bytes
//! so it stays stable across restarts.

use std::fmt;

use uuid::Uuid;

use crate::error::{ErrorCode, StoreError};

/// Hard ceiling from the NFSv3 file handle limit.
pub const MAX_HANDLE_SIZE: usize = 64;

#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(Vec<u8>);

impl FileHandle {
    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds the canonical `share:uuid` handle.
    pub fn encode(share: &str, id: &Uuid) -> Result<Self, StoreError> {
        let text = format!("{}:{}", share, id);
        if text.len() > MAX_HANDLE_SIZE {
            return Err(StoreError::new(
                ErrorCode::NameTooLong,
                format!("file handle exceeds {} bytes: {}", MAX_HANDLE_SIZE, text),
            ));
        }
        Ok(Self(text.into_bytes()))
    }

    /// Splits a handle back into its share name and file id.
    pub fn decode(&self) -> Result<(String, Uuid), StoreError> {
        let text = std::str::from_utf8(&self.0)
            .map_err(|_| StoreError::invalid_handle("file handle is not valid UTF-8"))?;
        let sep = text
            .find(':')
            .ok_or_else(|| StoreError::invalid_handle("file handle has no share separator"))?;
        let (share, rest) = text.split_at(sep);
        if share.is_empty() {
            return Err(StoreError::invalid_handle("file handle has an empty share name"));
        }
        let id = Uuid::parse_str(&rest[1..])
            .map_err(|_| StoreError::invalid_handle("file handle carries a malformed UUID"))?;
        Ok((share.to_string(), id))
    }

    pub fn generate_new(share: &str) -> Result<Self, StoreError> {
        Self::encode(share, &Uuid::new_v4())
    }

    /// Stable 64-bit inode number: the first 8 bytes of the SHA-256 of the
    /// handle. The empty handle maps to inode 0.
    pub fn inode(&self) -> u64 {
        if self.0.is_empty() {
            return 0;
        }
        let digest = openssl::sha::sha256(&self.0);
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[0..8]);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FileHandle({})", String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_share_and_id() {
        for share in &["export", "a", "some-share.name"] {
            for _ in 0..16 {
                let id = Uuid::new_v4();
                let handle = FileHandle::encode(share, &id).unwrap();
                let (s, u) = handle.decode().unwrap();
                assert_eq!(&s, share);
                assert_eq!(u, id);
            }
        }
    }

    #[test]
    fn encode_rejects_oversized_handles() {
        let share = "x".repeat(60);
        let err = FileHandle::encode(&share, &Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code, ErrorCode::NameTooLong);

        // 27-byte share names are the longest that still fit.
        let share = "x".repeat(27);
        assert!(FileHandle::encode(&share, &Uuid::new_v4()).is_ok());
        let share = "x".repeat(28);
        assert!(FileHandle::encode(&share, &Uuid::new_v4()).is_err());
    }

    #[test]
    fn decode_rejects_malformed_handles() {
        for bad in &["no-separator", ":leading", "share:not-a-uuid"] {
            let err = FileHandle::from_bytes(bad.as_bytes().to_vec())
                .decode()
                .unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidHandle);
        }
    }

    #[test]
    fn inode_is_stable_and_nonzero() {
        let handle = FileHandle::generate_new("share1").unwrap();
        let ino = handle.inode();
        assert_ne!(ino, 0);
        assert_eq!(ino, FileHandle::from_bytes(handle.as_bytes().to_vec()).inode());
        assert_eq!(FileHandle::default().inode(), 0);
    }
}
