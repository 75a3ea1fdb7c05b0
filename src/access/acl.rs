//! NFSv4 ACL value type and evaluation.
//!
//! ACLs are stored by value inside `FileAttr` as an ordered ACE list. The
//! first ACE that applies to the principal and mentions a requested mask
//! bit decides that bit; undecided bits are denied.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// NFSv4 ACE access mask (RFC 7530 §6.2.1.3).
    #[derive(Serialize, Deserialize)]
    pub struct AceMask: u32 {
        const READ_DATA         = 0x0000_0001;
        const LIST_DIRECTORY    = 0x0000_0001;
        const WRITE_DATA        = 0x0000_0002;
        const ADD_FILE          = 0x0000_0002;
        const APPEND_DATA       = 0x0000_0004;
        const ADD_SUBDIRECTORY  = 0x0000_0004;
        const READ_NAMED_ATTRS  = 0x0000_0008;
        const WRITE_NAMED_ATTRS = 0x0000_0010;
        const EXECUTE           = 0x0000_0020;
        const DELETE_CHILD      = 0x0000_0040;
        const READ_ATTRIBUTES   = 0x0000_0080;
        const WRITE_ATTRIBUTES  = 0x0000_0100;
        const DELETE            = 0x0001_0000;
        const READ_ACL          = 0x0002_0000;
        const WRITE_ACL         = 0x0004_0000;
        const WRITE_OWNER       = 0x0008_0000;
        const SYNCHRONIZE       = 0x0010_0000;
    }
}

bitflags! {
    #[derive(Serialize, Deserialize)]
    pub struct AceFlags: u32 {
        const FILE_INHERIT      = 0x0000_0001;
        const DIRECTORY_INHERIT = 0x0000_0002;
        const INHERIT_ONLY      = 0x0000_0008;
        const IDENTIFIER_GROUP  = 0x0000_0040;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AceType {
    Allow,
    Deny,
}

pub const WHO_OWNER: &str = "OWNER@";
pub const WHO_GROUP: &str = "GROUP@";
pub const WHO_EVERYONE: &str = "EVERYONE@";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NfsAce {
    pub ace_type: AceType,
    pub flags: AceFlags,
    pub mask: AceMask,
    /// `OWNER@`, `GROUP@`, `EVERYONE@`, or a principal name
    /// (`user` or `user@domain`).
    pub who: String,
}

impl NfsAce {
    pub fn allow<S: Into<String>>(who: S, mask: AceMask) -> Self {
        Self {
            ace_type: AceType::Allow,
            flags: AceFlags::empty(),
            mask,
            who: who.into(),
        }
    }

    pub fn deny<S: Into<String>>(who: S, mask: AceMask) -> Self {
        Self {
            ace_type: AceType::Deny,
            flags: AceFlags::empty(),
            mask,
            who: who.into(),
        }
    }

    fn is_special(&self) -> bool {
        matches!(self.who.as_str(), WHO_OWNER | WHO_GROUP | WHO_EVERYONE)
    }
}

/// Principal the ACL is evaluated against.
#[derive(Clone, Debug)]
pub struct AclPrincipal<'a> {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub gids: &'a [u32],
    pub file_owner_uid: u32,
    pub file_owner_gid: u32,
    /// `user@domain` when a domain is known, plain `user` otherwise.
    pub who: String,
}

impl<'a> AclPrincipal<'a> {
    fn in_file_group(&self) -> bool {
        self.gid == Some(self.file_owner_gid)
            || self.gids.contains(&self.file_owner_gid)
    }

    fn matches(&self, ace: &NfsAce) -> bool {
        match ace.who.as_str() {
            WHO_EVERYONE => true,
            WHO_OWNER => self.uid == Some(self.file_owner_uid),
            WHO_GROUP => self.in_file_group(),
            who => {
                if ace.flags.contains(AceFlags::IDENTIFIER_GROUP) {
                    // Named group principals cannot be resolved against
                    // numeric GIDs here; they never match.
                    false
                } else {
                    who == self.who || Some(who) == self.who.split('@').next()
                }
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NfsAcl {
    pub aces: Vec<NfsAce>,
}

impl NfsAcl {
    pub fn new(aces: Vec<NfsAce>) -> Self {
        Self { aces }
    }

    /// True when every bit of `mask` is granted to the principal. Each bit
    /// is decided by the first applicable ACE mentioning it; unmentioned
    /// bits are denied.
    pub fn check_access(&self, principal: &AclPrincipal, mask: AceMask) -> bool {
        if mask.is_empty() {
            return true;
        }
        let mut remaining = mask;
        for ace in &self.aces {
            if ace.flags.contains(AceFlags::INHERIT_ONLY) {
                continue;
            }
            if !principal.matches(ace) {
                continue;
            }
            let decided = ace.mask & remaining;
            if decided.is_empty() {
                continue;
            }
            match ace.ace_type {
                AceType::Deny => return false,
                AceType::Allow => {
                    remaining -= decided;
                    if remaining.is_empty() {
                        return true;
                    }
                }
            }
        }
        false
    }
}

fn class_mask(bits: u32, directory: bool) -> AceMask {
    let mut mask = AceMask::empty();
    if bits & 0o4 != 0 {
        mask |= AceMask::READ_DATA | AceMask::READ_ATTRIBUTES | AceMask::READ_ACL;
        if directory {
            mask |= AceMask::LIST_DIRECTORY;
        }
    }
    if bits & 0o2 != 0 {
        mask |= AceMask::WRITE_DATA | AceMask::APPEND_DATA | AceMask::WRITE_ATTRIBUTES;
        if directory {
            mask |= AceMask::ADD_FILE | AceMask::ADD_SUBDIRECTORY | AceMask::DELETE_CHILD;
        }
    }
    if bits & 0o1 != 0 {
        mask |= AceMask::EXECUTE;
    }
    mask
}

/// Derives the ACL a new child starts with.
///
/// Parent ACLs without inheritance flags (the common case for ACLs
/// synthesized from modes) are passed down whole. Otherwise RFC 7530
/// inheritance applies: files take the `FILE_INHERIT` ACEs with the
/// inheritance flags cleared; directories take the `DIRECTORY_INHERIT`
/// ACEs as-is for further propagation plus file-only ACEs demoted to
/// `INHERIT_ONLY`.
pub fn inherit_acl(parent: &NfsAcl, directory: bool) -> Option<NfsAcl> {
    let inheritable = AceFlags::FILE_INHERIT | AceFlags::DIRECTORY_INHERIT;
    if parent.aces.iter().all(|ace| (ace.flags & inheritable).is_empty()) {
        return Some(parent.clone());
    }

    let mut aces = Vec::new();
    for ace in &parent.aces {
        let file_inherit = ace.flags.contains(AceFlags::FILE_INHERIT);
        let dir_inherit = ace.flags.contains(AceFlags::DIRECTORY_INHERIT);
        if !file_inherit && !dir_inherit {
            continue;
        }
        let mut ace = ace.clone();
        if directory {
            if !dir_inherit {
                // Carried along only so future files can inherit it.
                ace.flags |= AceFlags::INHERIT_ONLY;
            } else {
                ace.flags -= AceFlags::INHERIT_ONLY;
            }
        } else {
            if !file_inherit {
                continue;
            }
            ace.flags -= inheritable | AceFlags::INHERIT_ONLY;
        }
        aces.push(ace);
    }
    if aces.is_empty() {
        None
    } else {
        Some(NfsAcl::new(aces))
    }
}

/// Re-synchronizes the OWNER@/GROUP@/EVERYONE@ ACEs after a chmod. Named
/// user/group ACEs keep their position and priority; the special ACEs are
/// rebuilt from the mode classes and appended.
pub fn adjust_acl_for_mode(acl: &mut NfsAcl, mode: u32, directory: bool) {
    acl.aces.retain(|ace| !ace.is_special());

    let owner_extra = AceMask::WRITE_ACL | AceMask::WRITE_OWNER | AceMask::READ_ACL;
    let mut owner = class_mask((mode >> 6) & 0o7, directory);
    owner |= owner_extra;
    acl.aces.push(NfsAce::allow(WHO_OWNER, owner));
    acl.aces
        .push(NfsAce::allow(WHO_GROUP, class_mask((mode >> 3) & 0o7, directory)));
    acl.aces
        .push(NfsAce::allow(WHO_EVERYONE, class_mask(mode & 0o7, directory)));
}
