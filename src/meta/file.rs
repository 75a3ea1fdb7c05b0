//! File metadata types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::NfsAcl;
use crate::chunks::ContentHash;
use crate::error::StoreError;
use crate::handle::FileHandle;
use crate::tools::{epoch_now, strip_leading_slash};

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_PATH_LEN: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Block,
    Char,
    Socket,
    Fifo,
}

impl FileType {
    pub fn is_device(self) -> bool {
        matches!(self, FileType::Block | FileType::Char)
    }

    pub fn is_special(self) -> bool {
        matches!(
            self,
            FileType::Block | FileType::Char | FileType::Socket | FileType::Fifo
        )
    }

    pub fn default_mode(self) -> u32 {
        match self {
            FileType::Directory => 0o755,
            FileType::Symlink => 0o777,
            _ => 0o644,
        }
    }
}

/// Device number encoding: `(major << 20) | (minor & 0xFFFFF)`.
pub fn make_rdev(major: u32, minor: u32) -> u64 {
    ((major as u64) << 20) | ((minor as u64) & 0xFFFFF)
}

pub fn rdev_major(rdev: u64) -> u32 {
    (rdev >> 20) as u32
}

pub fn rdev_minor(rdev: u64) -> u32 {
    (rdev & 0xFFFFF) as u32
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileAttr {
    pub file_type: FileType,
    /// Permission bits incl. suid/sgid/sticky, masked to `0o7777`.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub btime: i64,
    /// Content key in the object store; stable per file identity.
    pub payload_id: String,
    pub object_id: Option<ContentHash>,
    pub cow_source_payload_id: Option<String>,
    pub link_target: Option<String>,
    pub rdev: u64,
    pub hidden: bool,
    pub acl: Option<NfsAcl>,
}

impl FileAttr {
    pub fn new(file_type: FileType, mode: u32) -> Self {
        let now = epoch_now();
        Self {
            file_type,
            mode: mode & 0o7777,
            uid: 0,
            gid: 0,
            nlink: 1,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            btime: now,
            payload_id: String::new(),
            object_id: None,
            cow_source_payload_id: None,
            link_target: None,
            rdev: 0,
            hidden: false,
            acl: None,
        }
    }

    pub fn new_regular(mode: u32) -> Self {
        Self::new(FileType::Regular, mode)
    }

    pub fn new_directory(mode: u32) -> Self {
        let mut attr = Self::new(FileType::Directory, mode);
        attr.nlink = 2;
        attr
    }

    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    pub fn touch_ctime(&mut self) {
        self.ctime = epoch_now();
    }

    pub fn touch_mtime(&mut self) {
        let now = epoch_now();
        self.mtime = now;
        self.ctime = now;
    }
}

/// One file as held by the metadata store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct File {
    pub id: Uuid,
    pub share_name: String,
    /// Absolute path within the share, starting with `/`.
    pub path: String,
    pub attr: FileAttr,
}

impl File {
    pub fn handle(&self) -> Result<FileHandle, StoreError> {
        FileHandle::encode(&self.share_name, &self.id)
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// `stripLeadingSlash(share) + "/" + stripLeadingSlash(path)`; an empty
/// share collapses to the bare path.
pub fn build_payload_id(share: &str, path: &str) -> String {
    let share = strip_leading_slash(share);
    let path = strip_leading_slash(path);
    if share.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", share, path)
    }
}

/// Which timestamp a setattr carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetTime {
    Now,
    Time(i64),
}

/// Selective attribute update, NFS SETATTR style.
#[derive(Clone, Debug, Default)]
pub struct SetAttrs {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
    pub acl: Option<NfsAcl>,
}

impl SetAttrs {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
            && self.acl.is_none()
    }
}
