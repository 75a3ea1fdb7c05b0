//! The permission engine.
//!
//! Evaluation order: share-write bypass, then ACL or classic Unix mode
//! bits, then the read-only share clamp. Helpers wrap the engine for the
//! common single-bit checks.

use bitflags::bitflags;

use super::acl::{AceMask, AclPrincipal};
use super::share::AuthContext;
use crate::error::StoreError;
use crate::meta::{FileAttr, FileType};

bitflags! {
    pub struct Permission: u32 {
        const READ               = 1;
        const WRITE              = 2;
        const EXECUTE            = 4;
        const DELETE             = 8;
        const LIST_DIRECTORY     = 16;
        const TRAVERSE           = 32;
        const CHANGE_PERMISSIONS = 64;
        const CHANGE_OWNERSHIP   = 128;
    }
}

/// Permission bits granted by one rwx class of the mode.
fn class_bits(bits: u32) -> Permission {
    let mut granted = Permission::empty();
    if bits & 0o4 != 0 {
        granted |= Permission::READ | Permission::LIST_DIRECTORY;
    }
    if bits & 0o2 != 0 {
        granted |= Permission::WRITE | Permission::DELETE;
    }
    if bits & 0o1 != 0 {
        granted |= Permission::EXECUTE | Permission::TRAVERSE;
    }
    granted
}

/// NFSv4 ACE mask equivalent of a single permission bit.
fn ace_mask_for(bit: Permission) -> AceMask {
    if bit == Permission::READ {
        AceMask::READ_DATA
    } else if bit == Permission::WRITE {
        AceMask::WRITE_DATA | AceMask::APPEND_DATA
    } else if bit == Permission::EXECUTE || bit == Permission::TRAVERSE {
        AceMask::EXECUTE
    } else if bit == Permission::DELETE {
        AceMask::DELETE
    } else if bit == Permission::LIST_DIRECTORY {
        AceMask::LIST_DIRECTORY
    } else if bit == Permission::CHANGE_PERMISSIONS {
        AceMask::WRITE_ACL
    } else if bit == Permission::CHANGE_OWNERSHIP {
        AceMask::WRITE_OWNER
    } else {
        AceMask::empty()
    }
}

fn unix_bits(ctx: &AuthContext, attr: &FileAttr) -> Permission {
    let identity = match &ctx.identity {
        Some(identity) if identity.uid.is_some() => identity,
        // Anonymous callers only ever get the "other" class.
        _ => return class_bits(attr.mode & 0o7),
    };
    if identity.is_root() {
        return Permission::all();
    }
    if identity.uid == Some(attr.uid) {
        return class_bits((attr.mode >> 6) & 0o7)
            | Permission::CHANGE_PERMISSIONS
            | Permission::CHANGE_OWNERSHIP;
    }
    if identity.is_member_of(attr.gid) {
        return class_bits((attr.mode >> 3) & 0o7);
    }
    class_bits(attr.mode & 0o7)
}

fn acl_bits(ctx: &AuthContext, attr: &FileAttr, requested: Permission) -> Permission {
    let acl = match &attr.acl {
        Some(acl) => acl,
        None => return Permission::empty(),
    };
    let (uid, gid, gids, who) = match &ctx.identity {
        Some(identity) => (
            identity.uid,
            identity.gid,
            identity.supplementary_gids(),
            identity.qualified_name(),
        ),
        None => (None, None, &[][..], String::new()),
    };
    let principal = AclPrincipal {
        uid,
        gid,
        gids,
        file_owner_uid: attr.uid,
        file_owner_gid: attr.gid,
        who,
    };
    let mut granted = Permission::empty();
    for bit in [
        Permission::READ,
        Permission::WRITE,
        Permission::EXECUTE,
        Permission::DELETE,
        Permission::LIST_DIRECTORY,
        Permission::TRAVERSE,
        Permission::CHANGE_PERMISSIONS,
        Permission::CHANGE_OWNERSHIP,
    ]
    .iter()
    .copied()
    {
        if !requested.contains(bit) {
            continue;
        }
        if acl.check_access(&principal, ace_mask_for(bit)) {
            granted |= bit;
        }
    }
    granted
}

/// Evaluates `requested` against the file and returns the granted subset.
pub fn check_file_permissions(
    ctx: &AuthContext,
    attr: &FileAttr,
    requested: Permission,
) -> Permission {
    let mut granted = Permission::empty();
    let mut remaining = requested;

    // Writable shares bypass file-level checks for write/delete only;
    // read-type bits still take the normal path below.
    if ctx.share_writable && !ctx.share_read_only {
        let bypass = requested & (Permission::WRITE | Permission::DELETE);
        granted |= bypass;
        remaining -= bypass;
    }

    if attr.acl.is_some() {
        if ctx.is_root() {
            granted |= remaining;
        } else {
            granted |= acl_bits(ctx, attr, remaining);
        }
    } else {
        granted |= unix_bits(ctx, attr) & remaining;
    }

    if ctx.share_read_only {
        granted -= Permission::WRITE | Permission::DELETE;
    }

    granted & requested
}

fn require(
    ctx: &AuthContext,
    attr: &FileAttr,
    bit: Permission,
    what: &str,
    path: &str,
) -> Result<(), StoreError> {
    if check_file_permissions(ctx, attr, bit).contains(bit) {
        Ok(())
    } else {
        Err(StoreError::access_denied(format!("{} access denied", what)).with_path(path))
    }
}

pub fn check_read(ctx: &AuthContext, attr: &FileAttr, path: &str) -> Result<(), StoreError> {
    require(ctx, attr, Permission::READ, "read", path)
}

pub fn check_write(ctx: &AuthContext, attr: &FileAttr, path: &str) -> Result<(), StoreError> {
    require(ctx, attr, Permission::WRITE, "write", path)
}

pub fn check_execute(ctx: &AuthContext, attr: &FileAttr, path: &str) -> Result<(), StoreError> {
    require(ctx, attr, Permission::TRAVERSE, "traverse", path)
}

pub fn check_list(ctx: &AuthContext, attr: &FileAttr, path: &str) -> Result<(), StoreError> {
    require(ctx, attr, Permission::LIST_DIRECTORY, "list", path)
}

/// Sticky-bit rule for unlink/rename: with `mode & 0o1000` set on the
/// parent, only root, the child's owner, or the parent's owner may remove
/// the entry.
pub fn check_sticky_delete(
    ctx: &AuthContext,
    parent: &FileAttr,
    child: &FileAttr,
    path: &str,
) -> Result<(), StoreError> {
    if parent.mode & 0o1000 == 0 {
        return Ok(());
    }
    if ctx.is_root() {
        return Ok(());
    }
    match ctx.uid() {
        Some(uid) if uid == child.uid || uid == parent.uid => Ok(()),
        _ => Err(
            StoreError::access_denied("sticky directory restricts deletion to the owner")
                .with_path(path),
        ),
    }
}

/// rename(2): moving a directory out of a sticky parent into a different
/// parent additionally requires owning the directory itself.
pub fn check_sticky_rename_dir(
    ctx: &AuthContext,
    parent: &FileAttr,
    child: &FileAttr,
    path: &str,
) -> Result<(), StoreError> {
    if parent.mode & 0o1000 == 0 || child.file_type != FileType::Directory {
        return Ok(());
    }
    if ctx.is_root() || ctx.uid() == Some(child.uid) {
        return Ok(());
    }
    Err(
        StoreError::access_denied("sticky directory restricts directory rename to the owner")
            .with_path(path),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Identity, NfsAce, NfsAcl, WHO_EVERYONE};

    fn attr(mode: u32, uid: u32, gid: u32) -> FileAttr {
        let mut attr = FileAttr::new_regular(mode);
        attr.uid = uid;
        attr.gid = gid;
        attr
    }

    fn ctx(uid: u32, gid: u32) -> AuthContext {
        AuthContext::with_identity(Identity::unix(uid, gid))
    }

    #[test]
    fn owner_gets_everything_on_0700() {
        let granted = check_file_permissions(&ctx(1000, 1000), &attr(0o700, 1000, 1000), Permission::all());
        assert_eq!(granted, Permission::all());
    }

    #[test]
    fn root_is_clamped_on_read_only_shares() {
        let mut root_ctx = ctx(0, 0);
        root_ctx.share_read_only = true;
        let requested = Permission::READ
            | Permission::WRITE
            | Permission::DELETE
            | Permission::LIST_DIRECTORY;
        let granted = check_file_permissions(&root_ctx, &attr(0o777, 1000, 1000), requested);
        assert_eq!(granted, Permission::READ | Permission::LIST_DIRECTORY);
    }

    #[test]
    fn group_member_gets_group_class() {
        let caller = AuthContext::with_identity(Identity::unix(2000, 5).with_gids(vec![42]));
        let granted =
            check_file_permissions(&caller, &attr(0o640, 1000, 42), Permission::READ | Permission::WRITE);
        assert_eq!(granted, Permission::READ);
    }

    #[test]
    fn anonymous_gets_other_class_only() {
        let anon = AuthContext::anonymous();
        let granted = check_file_permissions(&anon, &attr(0o705, 1000, 1000), Permission::all());
        assert_eq!(
            granted,
            Permission::READ | Permission::LIST_DIRECTORY | Permission::EXECUTE | Permission::TRAVERSE
        );
    }

    #[test]
    fn share_writable_bypass_is_write_delete_only() {
        let mut caller = ctx(2000, 2000);
        caller.share_writable = true;
        let granted = check_file_permissions(
            &caller,
            &attr(0o600, 1000, 1000),
            Permission::READ | Permission::WRITE | Permission::DELETE,
        );
        // Write and delete granted by the share, read still denied by mode.
        assert_eq!(granted, Permission::WRITE | Permission::DELETE);
    }

    #[test]
    fn read_only_clamp_applies_in_acl_path() {
        let mut file = attr(0o777, 1000, 1000);
        file.acl = Some(NfsAcl::new(vec![NfsAce::allow(WHO_EVERYONE, AceMask::all())]));
        let mut caller = ctx(2000, 2000);
        caller.share_read_only = true;
        let granted =
            check_file_permissions(&caller, &file, Permission::READ | Permission::WRITE | Permission::DELETE);
        assert_eq!(granted, Permission::READ);
    }

    #[test]
    fn acl_grants_mapped_bits() {
        let mut file = attr(0o000, 1000, 1000);
        file.acl = Some(NfsAcl::new(vec![NfsAce::allow(
            "bob",
            AceMask::WRITE_DATA | AceMask::APPEND_DATA | AceMask::DELETE,
        )]));
        let mut identity = Identity::unix(2000, 2000);
        identity.username = "bob".to_string();
        let caller = AuthContext::with_identity(identity);
        let granted = check_file_permissions(
            &caller,
            &file,
            Permission::READ | Permission::WRITE | Permission::DELETE,
        );
        assert_eq!(granted, Permission::WRITE | Permission::DELETE);
    }

    #[test]
    fn sticky_bit_restricts_unlink() {
        let parent = attr(0o1777, 500, 500);
        let child = attr(0o644, 1000, 1000);
        assert!(check_sticky_delete(&ctx(1000, 1000), &parent, &child, "/t/f").is_ok());
        assert!(check_sticky_delete(&ctx(500, 500), &parent, &child, "/t/f").is_ok());
        assert!(check_sticky_delete(&ctx(0, 0), &parent, &child, "/t/f").is_ok());
        assert!(check_sticky_delete(&ctx(2000, 2000), &parent, &child, "/t/f").is_err());
        assert!(check_sticky_delete(&AuthContext::anonymous(), &parent, &child, "/t/f").is_err());
    }

    #[test]
    fn sticky_dir_rename_needs_dir_ownership() {
        let parent = attr(0o1777, 500, 500);
        let mut dir = attr(0o755, 1000, 1000);
        dir.file_type = FileType::Directory;
        // The parent's owner may unlink but not move the directory away.
        assert!(check_sticky_delete(&ctx(500, 500), &parent, &dir, "/t/d").is_ok());
        assert!(check_sticky_rename_dir(&ctx(500, 500), &parent, &dir, "/t/d").is_err());
        assert!(check_sticky_rename_dir(&ctx(1000, 1000), &parent, &dir, "/t/d").is_ok());
        assert!(check_sticky_rename_dir(&ctx(0, 0), &parent, &dir, "/t/d").is_ok());
    }
}
