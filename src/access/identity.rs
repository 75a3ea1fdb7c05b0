//! Caller identity and identity squashing.

use std::cell::RefCell;
use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Unix and/or Windows identity of a connected client.
///
/// Not thread-safe: the GID membership cache uses interior mutability, so
/// identities are cloned across thread boundaries instead of shared.
#[derive(Clone, Debug, Default)]
pub struct Identity {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    gids: Vec<u32>,
    pub sid: Option<String>,
    pub group_sids: Vec<String>,
    pub username: String,
    pub domain: String,
    gid_set: RefCell<Option<HashSet<u32>>>,
}

impl Identity {
    pub fn unix(uid: u32, gid: u32) -> Self {
        Self {
            uid: Some(uid),
            gid: Some(gid),
            ..Default::default()
        }
    }

    pub fn windows<S: Into<String>>(sid: S) -> Self {
        Self {
            sid: Some(sid.into()),
            ..Default::default()
        }
    }

    pub fn with_gids(mut self, gids: Vec<u32>) -> Self {
        self.set_supplementary_gids(gids);
        self
    }

    pub fn supplementary_gids(&self) -> &[u32] {
        &self.gids
    }

    pub fn set_supplementary_gids(&mut self, gids: Vec<u32>) {
        self.gids = gids;
        self.gid_set.replace(None);
    }

    /// O(1) membership test against the supplementary groups; the set is
    /// built lazily and rebuilt whenever the vector changes.
    pub fn is_member_of(&self, gid: u32) -> bool {
        if self.gid == Some(gid) {
            return true;
        }
        let mut cache = self.gid_set.borrow_mut();
        if cache.is_none() {
            *cache = Some(self.gids.iter().copied().collect());
        }
        cache.as_ref().map(|set| set.contains(&gid)).unwrap_or(false)
    }

    pub fn is_root(&self) -> bool {
        self.uid == Some(0)
    }

    pub fn is_anonymous(&self) -> bool {
        self.uid.is_none() && self.sid.is_none()
    }

    /// `user@domain` when a domain is known, plain username otherwise.
    pub fn qualified_name(&self) -> String {
        if self.domain.is_empty() {
            self.username.clone()
        } else {
            format!("{}@{}", self.username, self.domain)
        }
    }
}

/// Identity squashing rules configured per share.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct IdentityMapping {
    pub map_all_to_anonymous: bool,
    pub map_privileged_to_anonymous: bool,
    pub anonymous_uid: Option<u32>,
    pub anonymous_gid: Option<u32>,
    pub anonymous_sid: Option<String>,
}

lazy_static! {
    static ref DOMAIN_ADMIN_SID: Regex = Regex::new(r"^S-1-5-21-\d+-\d+-\d+-500$").unwrap();
}

const BUILTIN_ADMINISTRATORS_SID: &str = "S-1-5-32-544";

pub fn is_administrator_sid(sid: &str) -> bool {
    sid == BUILTIN_ADMINISTRATORS_SID || DOMAIN_ADMIN_SID.is_match(sid)
}

/// Applies the share's squashing rules to an incoming identity.
///
/// With no mapping the input is handed back unchanged (no clone). With
/// `map_all_to_anonymous` a fresh anonymous identity is built directly;
/// username and domain survive, supplementary groups do not.
pub fn apply_identity_mapping<'a>(
    identity: &'a Identity,
    mapping: Option<&IdentityMapping>,
) -> std::borrow::Cow<'a, Identity> {
    use std::borrow::Cow;

    let mapping = match mapping {
        Some(m) => m,
        None => return Cow::Borrowed(identity),
    };

    if mapping.map_all_to_anonymous {
        let mut anon = Identity::default();
        anon.uid = mapping.anonymous_uid;
        anon.gid = mapping.anonymous_gid;
        anon.sid = mapping.anonymous_sid.clone();
        anon.username = identity.username.clone();
        anon.domain = identity.domain.clone();
        return Cow::Owned(anon);
    }

    if !mapping.map_privileged_to_anonymous {
        return Cow::Borrowed(identity);
    }

    let squash_unix = identity.uid == Some(0);
    let squash_windows = identity
        .sid
        .as_deref()
        .map(is_administrator_sid)
        .unwrap_or(false);
    if !squash_unix && !squash_windows {
        return Cow::Borrowed(identity);
    }

    let mut mapped = identity.clone();
    if squash_unix {
        mapped.uid = mapping.anonymous_uid;
        mapped.gid = mapping.anonymous_gid;
        mapped.set_supplementary_gids(Vec::new());
    }
    if squash_windows {
        mapped.sid = mapping.anonymous_sid.clone();
        mapped.group_sids.clear();
    }
    Cow::Owned(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gid_cache_follows_vector_updates() {
        let mut identity = Identity::unix(1000, 1000).with_gids(vec![10, 20]);
        assert!(identity.is_member_of(10));
        assert!(identity.is_member_of(1000));
        assert!(!identity.is_member_of(30));
        identity.set_supplementary_gids(vec![30]);
        assert!(identity.is_member_of(30));
        assert!(!identity.is_member_of(10));
    }

    #[test]
    fn no_mapping_returns_borrowed_input() {
        let identity = Identity::unix(0, 0);
        let mapped = apply_identity_mapping(&identity, None);
        assert!(matches!(mapped, std::borrow::Cow::Borrowed(_)));
    }

    #[test]
    fn map_all_builds_fresh_anonymous_identity() {
        let mut identity = Identity::unix(1000, 1000).with_gids(vec![1, 2, 3]);
        identity.username = "alice".to_string();
        identity.domain = "example".to_string();
        let mapping = IdentityMapping {
            map_all_to_anonymous: true,
            anonymous_uid: Some(65534),
            anonymous_gid: Some(65534),
            ..Default::default()
        };
        let mapped = apply_identity_mapping(&identity, Some(&mapping));
        assert_eq!(mapped.uid, Some(65534));
        assert_eq!(mapped.gid, Some(65534));
        assert!(mapped.supplementary_gids().is_empty());
        assert_eq!(mapped.username, "alice");
        assert_eq!(mapped.domain, "example");
    }

    #[test]
    fn root_squash_clears_unix_side_only() {
        let mut identity = Identity::unix(0, 0).with_gids(vec![0, 4]);
        identity.sid = Some("S-1-5-21-1-2-3-1001".to_string());
        let mapping = IdentityMapping {
            map_privileged_to_anonymous: true,
            anonymous_uid: Some(65534),
            anonymous_gid: Some(65534),
            anonymous_sid: Some("S-1-5-7".to_string()),
            ..Default::default()
        };
        let mapped = apply_identity_mapping(&identity, Some(&mapping));
        assert_eq!(mapped.uid, Some(65534));
        assert!(mapped.supplementary_gids().is_empty());
        // Non-admin SID stays untouched.
        assert_eq!(mapped.sid.as_deref(), Some("S-1-5-21-1-2-3-1001"));
    }

    #[test]
    fn admin_sid_squash() {
        let mut identity = Identity::windows("S-1-5-32-544");
        identity.group_sids = vec!["S-1-5-32-545".to_string()];
        let mapping = IdentityMapping {
            map_privileged_to_anonymous: true,
            anonymous_sid: Some("S-1-5-7".to_string()),
            ..Default::default()
        };
        let mapped = apply_identity_mapping(&identity, Some(&mapping));
        assert_eq!(mapped.sid.as_deref(), Some("S-1-5-7"));
        assert!(mapped.group_sids.is_empty());
    }

    #[test]
    fn administrator_sid_patterns() {
        assert!(is_administrator_sid("S-1-5-32-544"));
        assert!(is_administrator_sid("S-1-5-21-100-200-300-500"));
        assert!(!is_administrator_sid("S-1-5-21-100-200-300-501"));
        assert!(!is_administrator_sid("S-1-5-32-545"));
    }

    #[test]
    fn unprivileged_identity_passes_through() {
        let identity = Identity::unix(1000, 1000);
        let mapping = IdentityMapping {
            map_privileged_to_anonymous: true,
            anonymous_uid: Some(65534),
            ..Default::default()
        };
        let mapped = apply_identity_mapping(&identity, Some(&mapping));
        assert!(matches!(mapped, std::borrow::Cow::Borrowed(_)));
        assert_eq!(mapped.uid, Some(1000));
    }
}
