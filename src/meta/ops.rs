//! POSIX metadata operations.
//!
//! Everything that creates, renames, links, unlinks or restamps a file
//! goes through this engine. Name/path validation, permission checks,
//! sticky-bit rules and nlink bookkeeping all live here; multi-write
//! updates run inside one store transaction.

use std::sync::Arc;

use log::warn;

use crate::access::{
    adjust_acl_for_mode, check_execute, check_list, check_sticky_delete, check_sticky_rename_dir,
    check_write, inherit_acl, AuthContext,
};
use crate::cache::SliceCache;
use crate::error::{ErrorCode, StoreError};
use crate::handle::FileHandle;
use crate::tools::epoch_now;

use super::file::{
    build_payload_id, make_rdev, File, FileAttr, FileType, SetAttrs, SetTime, MAX_NAME_LEN,
    MAX_PATH_LEN,
};
use super::readdir::{limit_for_max_bytes, CookieManager, DirEntry, DirListing};
use super::store::MetadataStore;

const ANONYMOUS_UID: u32 = 65534;
const ANONYMOUS_GID: u32 = 65534;

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::invalid_argument("empty file name"));
    }
    if name == "." || name == ".." {
        return Err(StoreError::invalid_argument(format!(
            "reserved file name '{}'",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::new(
            ErrorCode::NameTooLong,
            format!("file name exceeds {} bytes", MAX_NAME_LEN),
        ));
    }
    if name.contains('/') {
        return Err(StoreError::invalid_argument("file name contains '/'"));
    }
    Ok(())
}

fn join_path(parent: &str, name: &str) -> Result<String, StoreError> {
    let path = if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    };
    if path.len() > MAX_PATH_LEN {
        return Err(StoreError::new(
            ErrorCode::NameTooLong,
            format!("path exceeds {} bytes", MAX_PATH_LEN),
        ));
    }
    Ok(path)
}

fn not_a_directory(path: &str) -> StoreError {
    StoreError::new(ErrorCode::NotDirectory, format!("{} is not a directory", path))
}

/// The metadata operation engine for one share.
pub struct MetadataEngine {
    store: Arc<dyn MetadataStore>,
    cache: Option<Arc<SliceCache>>,
}

impl MetadataEngine {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store, cache: None }
    }

    /// Wires up the write cache so truncates can drop pending data.
    pub fn with_cache(mut self, cache: Arc<SliceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    fn load_directory(&self, ctx: &AuthContext, dir: &FileHandle) -> Result<File, StoreError> {
        let parent = self.store.get_file(dir)?;
        if !parent.attr.is_directory() {
            return Err(not_a_directory(&parent.path));
        }
        check_execute(ctx, &parent.attr, &parent.path)?;
        Ok(parent)
    }

    fn ensure_name_free(&self, dir: &FileHandle, name: &str) -> Result<(), StoreError> {
        match self.store.get_child(dir, name) {
            Ok(_) => Err(StoreError::new(
                ErrorCode::AlreadyExists,
                format!("{} already exists", name),
            )),
            Err(err) if err.code == ErrorCode::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn lookup(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
    ) -> Result<File, StoreError> {
        ctx.cancel.check()?;
        let parent = self.load_directory(ctx, dir)?;
        match name {
            "." => Ok(parent),
            ".." => match self.store.get_parent(dir) {
                Ok(grandparent) => self.store.get_file(&grandparent),
                // The share root is its own parent.
                Err(err) if err.code == ErrorCode::NotFound => Ok(parent),
                Err(err) => Err(err),
            },
            _ => {
                validate_name(name)?;
                let child = self.store.get_child(dir, name)?;
                self.store.get_file(&child)
            }
        }
    }

    pub fn create_file(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
        mode: Option<u32>,
    ) -> Result<File, StoreError> {
        self.create_entry(ctx, dir, name, FileType::Regular, mode, None, 0)
    }

    pub fn create_directory(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
        mode: Option<u32>,
    ) -> Result<File, StoreError> {
        self.create_entry(ctx, dir, name, FileType::Directory, mode, None, 0)
    }

    pub fn create_symlink(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
        target: &str,
    ) -> Result<File, StoreError> {
        self.create_entry(ctx, dir, name, FileType::Symlink, None, Some(target), 0)
    }

    pub fn create_special_file(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
        file_type: FileType,
        mode: Option<u32>,
        major: u32,
        minor: u32,
    ) -> Result<File, StoreError> {
        if !file_type.is_special() {
            return Err(StoreError::invalid_argument(format!(
                "{:?} is not a special file type",
                file_type
            )));
        }
        if file_type.is_device() && !ctx.is_root() {
            return Err(StoreError::new(
                ErrorCode::PrivilegeRequired,
                "device nodes require root",
            ));
        }
        let rdev = if file_type.is_device() {
            make_rdev(major, minor)
        } else {
            0
        };
        self.create_entry(ctx, dir, name, file_type, mode, None, rdev)
    }

    fn create_entry(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
        file_type: FileType,
        mode: Option<u32>,
        link_target: Option<&str>,
        rdev: u64,
    ) -> Result<File, StoreError> {
        ctx.cancel.check()?;
        validate_name(name)?;
        let parent = self.load_directory(ctx, dir)?;
        check_write(ctx, &parent.attr, &parent.path)?;
        let path = join_path(&parent.path, name)?;
        self.ensure_name_free(dir, name)?;

        let handle = self.store.generate_handle(&parent.share_name, &path)?;
        let (share, id) = handle.decode()?;

        let mut attr = FileAttr::new(file_type, mode.unwrap_or_else(|| file_type.default_mode()));
        attr.uid = ctx.uid().unwrap_or(ANONYMOUS_UID);
        attr.gid = ctx
            .identity
            .as_ref()
            .and_then(|i| i.gid)
            .unwrap_or(ANONYMOUS_GID);

        let parent_sgid = parent.attr.mode & 0o2000 != 0;
        if parent_sgid {
            attr.gid = parent.attr.gid;
        }
        if !ctx.is_root() {
            attr.mode &= !0o4000;
            let member = ctx
                .identity
                .as_ref()
                .map(|i| i.is_member_of(attr.gid))
                .unwrap_or(false);
            if !member {
                attr.mode &= !0o2000;
            }
        }
        if parent_sgid {
            match file_type {
                FileType::Directory => attr.mode |= 0o2000,
                FileType::Regular => attr.mode &= !0o2000,
                _ => {}
            }
        }

        if let Some(target) = link_target {
            attr.size = target.len() as u64;
            attr.link_target = Some(target.to_string());
        }
        attr.rdev = rdev;
        attr.nlink = if file_type == FileType::Directory { 2 } else { 1 };
        attr.payload_id = build_payload_id(&share, &path);
        attr.acl = parent
            .attr
            .acl
            .as_ref()
            .and_then(|acl| inherit_acl(acl, file_type == FileType::Directory));

        let file = File {
            id,
            share_name: share,
            path,
            attr,
        };
        let is_directory = file_type == FileType::Directory;

        self.store.with_transaction(&mut |txn| {
            txn.put_file(&file)?;
            txn.set_link_count(&handle, file.attr.nlink)?;
            txn.set_parent(&handle, dir)?;
            txn.set_child(dir, name, &handle)?;

            let mut parent = txn.get_file(dir)?;
            if is_directory {
                parent.attr.nlink += 1;
                txn.set_link_count(dir, parent.attr.nlink)?;
            }
            parent.attr.touch_mtime();
            txn.put_file(&parent)
        })?;

        Ok(file)
    }

    pub fn create_hard_link(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
        target: &FileHandle,
    ) -> Result<File, StoreError> {
        ctx.cancel.check()?;
        validate_name(name)?;
        let parent = self.load_directory(ctx, dir)?;
        check_write(ctx, &parent.attr, &parent.path)?;
        join_path(&parent.path, name)?;

        let target_file = self.store.get_file(target)?;
        if target_file.attr.is_directory() {
            return Err(StoreError::new(
                ErrorCode::IsDirectory,
                "hard links to directories are not allowed",
            ));
        }
        self.ensure_name_free(dir, name)?;

        let mut linked = target_file;
        self.store.with_transaction(&mut |txn| {
            let count = txn.get_link_count(target)? + 1;
            txn.set_link_count(target, count)?;
            linked.attr.nlink = count;
            linked.attr.touch_ctime();
            txn.put_file(&linked)?;
            txn.set_child(dir, name, target)?;

            let mut parent = txn.get_file(dir)?;
            parent.attr.touch_mtime();
            txn.put_file(&parent)
        })?;

        Ok(linked)
    }

    /// Unlinks a non-directory. The returned metadata reflects the new
    /// link count; `payload_id` is cleared when other links remain so the
    /// caller knows not to delete the content.
    pub fn remove_file(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
    ) -> Result<File, StoreError> {
        ctx.cancel.check()?;
        validate_name(name)?;
        let parent = self.load_directory(ctx, dir)?;
        check_write(ctx, &parent.attr, &parent.path)?;

        let child_handle = self.store.get_child(dir, name)?;
        let child = self.store.get_file(&child_handle)?;
        if child.attr.is_directory() {
            return Err(StoreError::new(
                ErrorCode::IsDirectory,
                format!("{} is a directory", child.path),
            ));
        }
        check_sticky_delete(ctx, &parent.attr, &child.attr, &child.path)?;

        let mut removed = child;
        self.store.with_transaction(&mut |txn| {
            let count = txn.get_link_count(&child_handle)?;
            if count > 1 {
                removed.attr.nlink = count - 1;
                removed.attr.touch_ctime();
                txn.set_link_count(&child_handle, count - 1)?;
                txn.put_file(&removed)?;
            } else {
                // Keep the metadata at nlink 0 for open-unlink semantics;
                // content removal is the caller's follow-up.
                removed.attr.nlink = 0;
                removed.attr.touch_ctime();
                txn.set_link_count(&child_handle, 0)?;
                txn.put_file(&removed)?;
            }
            txn.delete_child(dir, name)?;

            let mut parent = txn.get_file(dir)?;
            parent.attr.touch_mtime();
            txn.put_file(&parent)
        })?;

        if removed.attr.nlink > 0 {
            removed.attr.payload_id = String::new();
        }
        Ok(removed)
    }

    pub fn remove_directory(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        name: &str,
    ) -> Result<(), StoreError> {
        ctx.cancel.check()?;
        validate_name(name)?;
        let parent = self.load_directory(ctx, dir)?;
        check_write(ctx, &parent.attr, &parent.path)?;

        let child_handle = self.store.get_child(dir, name)?;
        let child = self.store.get_file(&child_handle)?;
        if !child.attr.is_directory() {
            return Err(not_a_directory(&child.path));
        }
        check_sticky_delete(ctx, &parent.attr, &child.attr, &child.path)?;

        let (entries, _) = self.store.list_children(&child_handle, "", 1)?;
        if !entries.is_empty() {
            return Err(StoreError::new(
                ErrorCode::NotEmpty,
                format!("{} is not empty", child.path),
            ));
        }

        self.store.with_transaction(&mut |txn| {
            txn.delete_child(dir, name)?;
            txn.delete_file(&child_handle)?;

            let mut parent = txn.get_file(dir)?;
            parent.attr.nlink = parent.attr.nlink.saturating_sub(1);
            txn.set_link_count(dir, parent.attr.nlink)?;
            parent.attr.touch_mtime();
            txn.put_file(&parent)
        })
    }

    /// POSIX rename with atomic replacement of the destination.
    pub fn move_entry(
        &self,
        ctx: &AuthContext,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
    ) -> Result<File, StoreError> {
        ctx.cancel.check()?;
        validate_name(from_name)?;
        validate_name(to_name)?;

        let from_parent = self.load_directory(ctx, from_dir)?;
        check_write(ctx, &from_parent.attr, &from_parent.path)?;
        let same_dir = from_dir == to_dir;
        let to_parent = if same_dir {
            from_parent.clone()
        } else {
            let parent = self.load_directory(ctx, to_dir)?;
            check_write(ctx, &parent.attr, &parent.path)?;
            parent
        };

        let child_handle = self.store.get_child(from_dir, from_name)?;
        if same_dir && from_name == to_name {
            return self.store.get_file(&child_handle);
        }
        let mut child = self.store.get_file(&child_handle)?;
        let dest_path = join_path(&to_parent.path, to_name)?;

        check_sticky_delete(ctx, &from_parent.attr, &child.attr, &child.path)?;
        if !same_dir {
            check_sticky_rename_dir(ctx, &from_parent.attr, &child.attr, &child.path)?;
        }

        let existing = match self.store.get_child(to_dir, to_name) {
            Ok(handle) => {
                if handle == child_handle {
                    // Both names already refer to the same file.
                    return Ok(child);
                }
                Some((handle.clone(), self.store.get_file(&handle)?))
            }
            Err(err) if err.code == ErrorCode::NotFound => None,
            Err(err) => return Err(err),
        };

        if let Some((dest_handle, dest)) = &existing {
            check_sticky_delete(ctx, &to_parent.attr, &dest.attr, &dest.path)?;
            match (child.attr.is_directory(), dest.attr.is_directory()) {
                (true, true) => {
                    let (entries, _) = self.store.list_children(dest_handle, "", 1)?;
                    if !entries.is_empty() {
                        return Err(StoreError::new(
                            ErrorCode::NotEmpty,
                            format!("{} is not empty", dest.path),
                        ));
                    }
                }
                (true, false) => return Err(not_a_directory(&dest.path)),
                (false, true) => {
                    return Err(StoreError::new(
                        ErrorCode::IsDirectory,
                        format!("{} is a directory", dest.path),
                    ))
                }
                (false, false) => {}
            }
        }

        let moving_directory = child.attr.is_directory();
        child.path = dest_path;
        child.attr.touch_ctime();

        self.store.with_transaction(&mut |txn| {
            let mut to_parent_nlink_delta: i64 = 0;

            if let Some((dest_handle, dest)) = &existing {
                if dest.attr.is_directory() {
                    txn.delete_file(dest_handle)?;
                    to_parent_nlink_delta -= 1;
                } else {
                    let count = txn.get_link_count(dest_handle)?;
                    let mut dest = dest.clone();
                    dest.attr.nlink = count.saturating_sub(1);
                    dest.attr.touch_ctime();
                    txn.set_link_count(dest_handle, dest.attr.nlink)?;
                    txn.put_file(&dest)?;
                }
                txn.delete_child(to_dir, to_name)?;
            }

            txn.delete_child(from_dir, from_name)?;
            txn.set_child(to_dir, to_name, &child_handle)?;
            txn.put_file(&child)?;

            if !same_dir {
                txn.set_parent(&child_handle, to_dir)?;
                if moving_directory {
                    let mut from_parent = txn.get_file(from_dir)?;
                    from_parent.attr.nlink = from_parent.attr.nlink.saturating_sub(1);
                    txn.set_link_count(from_dir, from_parent.attr.nlink)?;
                    from_parent.attr.touch_mtime();
                    txn.put_file(&from_parent)?;

                    to_parent_nlink_delta += 1;
                } else {
                    let mut from_parent = txn.get_file(from_dir)?;
                    from_parent.attr.touch_mtime();
                    txn.put_file(&from_parent)?;
                }
            }

            let mut to_parent = txn.get_file(to_dir)?;
            if to_parent_nlink_delta != 0 {
                let nlink = to_parent.attr.nlink as i64 + to_parent_nlink_delta;
                to_parent.attr.nlink = nlink.max(0) as u32;
                txn.set_link_count(to_dir, to_parent.attr.nlink)?;
            }
            to_parent.attr.touch_mtime();
            txn.put_file(&to_parent)
        })?;

        Ok(child)
    }

    pub fn set_file_attributes(
        &self,
        ctx: &AuthContext,
        handle: &FileHandle,
        set: SetAttrs,
    ) -> Result<File, StoreError> {
        ctx.cancel.check()?;
        let mut file = self.store.get_file(handle)?;
        if set.is_empty() {
            return Ok(file);
        }

        let is_root = ctx.is_root();
        let is_owner = ctx.uid() == Some(file.attr.uid);
        let is_dir = file.attr.is_directory();

        // Ownership, mode and ACL changes belong to the owner, with one
        // exception: a write-permitted caller may clear SUID/SGID ahead of
        // a write (the Linux client's file_remove_privs pattern).
        let wants_privileged_change =
            set.mode.is_some() || set.acl.is_some() || set.uid.is_some() || set.gid.is_some();
        if wants_privileged_change && !is_root && !is_owner {
            let clears_privs_only = set.acl.is_none()
                && set.uid.is_none()
                && set.gid.is_none()
                && set.size.is_none()
                && set.atime.is_none()
                && set.mtime.is_none()
                && file.attr.mode & 0o6000 != 0
                && set.mode == Some(file.attr.mode & !0o6000);
            if clears_privs_only {
                check_write(ctx, &file.attr, &file.path)?;
            } else {
                return Err(StoreError::new(
                    ErrorCode::PermissionDenied,
                    "only the owner may change mode, ownership or ACL",
                ));
            }
        }

        if let Some(new_uid) = set.uid {
            if new_uid != file.attr.uid && !is_root {
                return Err(StoreError::new(
                    ErrorCode::PermissionDenied,
                    "changing the owner requires root",
                ));
            }
        }
        if let Some(new_gid) = set.gid {
            if new_gid != file.attr.gid && !is_root {
                let member = ctx
                    .identity
                    .as_ref()
                    .map(|i| i.is_member_of(new_gid))
                    .unwrap_or(false);
                if !member {
                    return Err(StoreError::new(
                        ErrorCode::PermissionDenied,
                        "changing the group requires membership",
                    ));
                }
            }
        }

        for time in [&set.atime, &set.mtime].iter().copied().flatten() {
            match time {
                SetTime::Now => {
                    if !is_root && !is_owner {
                        check_write(ctx, &file.attr, &file.path)?;
                    }
                }
                SetTime::Time(_) => {
                    if !is_root && !is_owner {
                        return Err(StoreError::new(
                            ErrorCode::PermissionDenied,
                            "setting explicit timestamps requires ownership",
                        ));
                    }
                }
            }
        }

        if set.size.is_some() && !is_root {
            check_write(ctx, &file.attr, &file.path)?;
        }

        let now = epoch_now();
        let mut owner_changed = false;
        let mut truncated = false;

        if let Some(new_mode) = set.mode {
            let mut mode = new_mode & 0o7777;
            if !is_root {
                if !is_owner {
                    mode &= !0o4000;
                }
                let effective_gid = set.gid.unwrap_or(file.attr.gid);
                let sgid_ok = is_owner
                    && ctx
                        .identity
                        .as_ref()
                        .map(|i| i.is_member_of(effective_gid))
                        .unwrap_or(false);
                if !sgid_ok {
                    mode &= !0o2000;
                }
            }
            file.attr.mode = mode;
            if let Some(acl) = file.attr.acl.as_mut() {
                adjust_acl_for_mode(acl, mode, is_dir);
            }
        }

        if let Some(new_uid) = set.uid {
            if new_uid != file.attr.uid {
                file.attr.uid = new_uid;
                owner_changed = true;
            }
        }
        if let Some(new_gid) = set.gid {
            if new_gid != file.attr.gid {
                file.attr.gid = new_gid;
                owner_changed = true;
            }
        }
        if owner_changed && !is_dir && file.attr.file_type != FileType::Symlink {
            file.attr.mode &= !0o6000;
        }

        if let Some(acl) = set.acl {
            file.attr.acl = Some(acl);
        }

        if let Some(new_size) = set.size {
            file.attr.size = new_size;
            file.attr.mtime = now;
            truncated = true;
            if !is_root && file.attr.file_type == FileType::Regular {
                file.attr.mode &= !0o6000;
            }
        }

        if let Some(atime) = set.atime {
            file.attr.atime = match atime {
                SetTime::Now => now,
                SetTime::Time(t) => t,
            };
        }
        if let Some(mtime) = set.mtime {
            file.attr.mtime = match mtime {
                SetTime::Now => now,
                SetTime::Time(t) => t,
            };
        }

        file.attr.ctime = now;

        self.store.with_transaction(&mut |txn| txn.put_file(&file))?;

        if truncated {
            if let Some(cache) = &self.cache {
                cache.invalidate(handle);
            }
        }

        Ok(file)
    }

    /// NFS silly-rename support: detaches the file from its link count
    /// without touching the directory tree.
    pub fn mark_file_as_orphaned(
        &self,
        ctx: &AuthContext,
        handle: &FileHandle,
    ) -> Result<(), StoreError> {
        ctx.cancel.check()?;
        let mut file = self.store.get_file(handle)?;
        if file.attr.is_directory() {
            return Err(StoreError::new(
                ErrorCode::IsDirectory,
                "directories cannot be orphaned",
            ));
        }
        file.attr.nlink = 0;
        file.attr.touch_ctime();
        self.store.with_transaction(&mut |txn| {
            txn.set_link_count(handle, 0)?;
            txn.put_file(&file)
        })
    }

    pub fn read_directory(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        token: &str,
        max_bytes: usize,
    ) -> Result<DirListing, StoreError> {
        ctx.cancel.check()?;
        let parent = self.store.get_file(dir)?;
        if !parent.attr.is_directory() {
            return Err(not_a_directory(&parent.path));
        }
        check_list(ctx, &parent.attr, &parent.path)?;

        let limit = limit_for_max_bytes(max_bytes);
        let (children, next_token) = self.store.list_children(dir, token, limit)?;

        let mut entries = Vec::with_capacity(children.len());
        for (name, handle) in children {
            ctx.cancel.check()?;
            let file = match self.store.get_file(&handle) {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!("readdir: stale child {} in {}: {}", name, parent.path, err);
                    None
                }
            };
            entries.push(DirEntry { name, handle, file });
        }

        let has_more = !next_token.is_empty();
        Ok(DirListing {
            entries,
            next_token,
            has_more,
        })
    }

    /// NFS-style listing: translates the client's 64-bit cookie into a
    /// resume token and mints a cookie for every returned entry.
    pub fn read_directory_by_cookie(
        &self,
        ctx: &AuthContext,
        dir: &FileHandle,
        cookie: u64,
        max_bytes: usize,
        cookies: &CookieManager,
    ) -> Result<(DirListing, Vec<u64>), StoreError> {
        let token = cookies.get_token(dir, cookie).ok_or_else(|| {
            StoreError::invalid_argument(format!("unknown readdir cookie {}", cookie))
        })?;
        let listing = self.read_directory(ctx, dir, &token, max_bytes)?;
        let entry_cookies = listing
            .entries
            .iter()
            .map(|entry| cookies.generate_cookie(dir, &entry.name))
            .collect();
        Ok((listing, entry_cookies))
    }
}
