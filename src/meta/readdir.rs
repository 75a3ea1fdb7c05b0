//! Directory listing pagination.
//!
//! NFS readdir cookies are opaque 64-bit values; the cookie manager maps
//! them back to resume names per directory. Cookie generation is a keyed
//! SipHash over `(dir, name)` so repeated listings agree on cookie values.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Mutex;

use siphasher::sip::SipHasher24;

use crate::handle::FileHandle;

use super::file::File;

/// Rough wire size of one directory entry, used to derive page limits.
pub const ENTRY_SIZE_ESTIMATE: usize = 200;
pub const DEFAULT_LIST_LIMIT: usize = 1000;
pub const MIN_LIST_LIMIT: usize = 10;

/// Page limit for a byte-bounded readdir request; unbounded requests get
/// the default.
pub fn limit_for_max_bytes(max_bytes: usize) -> usize {
    if max_bytes == 0 {
        DEFAULT_LIST_LIMIT
    } else {
        std::cmp::max(MIN_LIST_LIMIT, max_bytes / ENTRY_SIZE_ESTIMATE)
    }
}

#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub handle: FileHandle,
    pub file: Option<File>,
}

#[derive(Clone, Debug, Default)]
pub struct DirListing {
    pub entries: Vec<DirEntry>,
    pub next_token: String,
    pub has_more: bool,
}

const COOKIE_KEY_0: u64 = 0x6469_7474_6f66_7331;
const COOKIE_KEY_1: u64 = 0x7265_6164_6469_7232;

/// Maps opaque readdir cookies to resume names, one namespace per
/// directory. Cookie 0 is the start-of-directory marker.
#[derive(Default)]
pub struct CookieManager {
    tokens: Mutex<HashMap<(FileHandle, u64), String>>,
}

impl CookieManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic cookie for `(dir, name)`; never returns 0.
    pub fn generate_cookie(&self, dir: &FileHandle, name: &str) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(COOKIE_KEY_0, COOKIE_KEY_1);
        hasher.write(dir.as_bytes());
        hasher.write_u8(0xff);
        hasher.write(name.as_bytes());
        let cookie = match hasher.finish() {
            0 => 1,
            c => c,
        };
        self.tokens
            .lock()
            .unwrap()
            .insert((dir.clone(), cookie), name.to_string());
        cookie
    }

    /// Resume name for a cookie previously handed out on this directory.
    /// Cookie 0 always resolves to the empty token.
    pub fn get_token(&self, dir: &FileHandle, cookie: u64) -> Option<String> {
        if cookie == 0 {
            return Some(String::new());
        }
        self.tokens.lock().unwrap().get(&(dir.clone(), cookie)).cloned()
    }

    /// Drops all cookies of a directory, e.g. after it was removed.
    pub fn forget_dir(&self, dir: &FileHandle) {
        self.tokens.lock().unwrap().retain(|(d, _), _| d != dir);
    }
}
