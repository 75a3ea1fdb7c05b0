//! Share-level access control.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use super::identity::{apply_identity_mapping, Identity, IdentityMapping};
use crate::error::{ErrorCode, StoreError};
use crate::tools::CancelToken;

/// Per-share options served by the metadata store backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ShareOptions {
    pub read_only: bool,
    /// Grants write/delete regardless of file-level permissions.
    pub writable: bool,
    pub require_auth: bool,
    pub allowed_auth_methods: Vec<String>,
    pub allowed_clients: Vec<String>,
    pub denied_clients: Vec<String>,
    pub identity_mapping: Option<IdentityMapping>,
}

/// Request-scoped context handed to every permission-checked operation.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
    pub cancel: CancelToken,
    pub auth_method: String,
    pub identity: Option<Identity>,
    pub client_addr: Option<IpAddr>,
    pub share_read_only: bool,
    pub share_writable: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self {
            auth_method: "anonymous".to_string(),
            ..Default::default()
        }
    }

    pub fn with_identity(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            ..Default::default()
        }
    }

    pub fn is_root(&self) -> bool {
        self.identity.as_ref().map(Identity::is_root).unwrap_or(false)
    }

    pub fn uid(&self) -> Option<u32> {
        self.identity.as_ref().and_then(|i| i.uid)
    }
}

fn mask_v4(addr: Ipv4Addr, prefix: u8) -> u32 {
    let bits = u32::from(addr);
    if prefix == 0 {
        0
    } else {
        bits & (u32::MAX << (32 - u32::from(prefix)))
    }
}

fn mask_v6(addr: Ipv6Addr, prefix: u8) -> u128 {
    let bits = u128::from(addr);
    if prefix == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - u32::from(prefix)))
    }
}

/// Matches a client address against a CIDR pattern or an exact address.
/// Anything unparsable matches nothing.
pub fn matches_ip_pattern(ip: IpAddr, pattern: &str) -> bool {
    if let Some(sep) = pattern.find('/') {
        let (addr, prefix) = pattern.split_at(sep);
        let prefix: u8 = match prefix[1..].parse() {
            Ok(p) => p,
            Err(_) => return false,
        };
        return match (ip, addr.parse::<IpAddr>()) {
            (IpAddr::V4(ip), Ok(IpAddr::V4(net))) if prefix <= 32 => {
                mask_v4(ip, prefix) == mask_v4(net, prefix)
            }
            (IpAddr::V6(ip), Ok(IpAddr::V6(net))) if prefix <= 128 => {
                mask_v6(ip, prefix) == mask_v6(net, prefix)
            }
            _ => false,
        };
    }
    match pattern.parse::<IpAddr>() {
        Ok(addr) => addr == ip,
        Err(_) => false,
    }
}

// Client lists come from share config and can be large; check the token
// while walking them.
fn any_pattern_matches(
    ip: IpAddr,
    patterns: &[String],
    cancel: &CancelToken,
) -> Result<bool, StoreError> {
    let check_cancel = patterns.len() > 10;
    for pattern in patterns {
        if check_cancel {
            cancel.check()?;
        }
        if matches_ip_pattern(ip, pattern) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Runs the ordered share access checks and builds the effective
/// [`AuthContext`]. Each check short-circuits with a denial.
pub fn check_share_access(
    options: &ShareOptions,
    client_addr: IpAddr,
    auth_method: &str,
    identity: &Identity,
    cancel: CancelToken,
) -> Result<AuthContext, StoreError> {
    if options.require_auth && auth_method == "anonymous" {
        return Err(StoreError::new(
            ErrorCode::AuthRequired,
            "authentication required",
        ));
    }

    if !options.allowed_auth_methods.is_empty()
        && !options
            .allowed_auth_methods
            .iter()
            .any(|m| m == auth_method)
    {
        return Err(StoreError::access_denied(format!(
            "auth method '{}' not allowed",
            auth_method
        )));
    }

    if any_pattern_matches(client_addr, &options.denied_clients, &cancel)? {
        return Err(StoreError::access_denied(format!(
            "client {} is denied",
            client_addr
        )));
    }

    if !options.allowed_clients.is_empty()
        && !any_pattern_matches(client_addr, &options.allowed_clients, &cancel)?
    {
        return Err(StoreError::access_denied(format!(
            "client {} is not in the allow list",
            client_addr
        )));
    }

    let effective = apply_identity_mapping(identity, options.identity_mapping.as_ref());

    Ok(AuthContext {
        cancel,
        auth_method: auth_method.to_string(),
        identity: Some(effective.into_owned()),
        client_addr: Some(client_addr),
        share_read_only: options.read_only,
        share_writable: options.writable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cidr_and_exact_matching() {
        assert!(matches_ip_pattern(addr("10.1.2.3"), "10.1.0.0/16"));
        assert!(!matches_ip_pattern(addr("10.2.2.3"), "10.1.0.0/16"));
        assert!(matches_ip_pattern(addr("10.1.2.3"), "10.1.2.3"));
        assert!(!matches_ip_pattern(addr("10.1.2.3"), "10.1.2.4"));
        assert!(matches_ip_pattern(addr("fd00::1"), "fd00::/8"));
        assert!(!matches_ip_pattern(addr("fe80::1"), "fd00::/8"));
        assert!(matches_ip_pattern(addr("::1"), "::1"));
        // Invalid inputs never match.
        assert!(!matches_ip_pattern(addr("10.1.2.3"), "10.1.0.0/33"));
        assert!(!matches_ip_pattern(addr("10.1.2.3"), "not-an-address"));
        assert!(!matches_ip_pattern(addr("10.1.2.3"), "fd00::/8"));
    }

    #[test]
    fn anonymous_denied_when_auth_required() {
        let options = ShareOptions {
            require_auth: true,
            ..Default::default()
        };
        let err = check_share_access(
            &options,
            addr("10.0.0.1"),
            "anonymous",
            &Identity::default(),
            CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthRequired);
    }

    #[test]
    fn auth_method_allow_list() {
        let options = ShareOptions {
            allowed_auth_methods: vec!["krb5".to_string()],
            ..Default::default()
        };
        let err = check_share_access(
            &options,
            addr("10.0.0.1"),
            "sys",
            &Identity::unix(1000, 1000),
            CancelToken::new(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::AccessDenied);
    }

    #[test]
    fn deny_list_beats_allow_list() {
        let options = ShareOptions {
            allowed_clients: vec!["10.0.0.0/8".to_string()],
            denied_clients: vec!["10.0.0.66".to_string()],
            ..Default::default()
        };
        assert!(check_share_access(
            &options,
            addr("10.0.0.66"),
            "sys",
            &Identity::unix(1000, 1000),
            CancelToken::new(),
        )
        .is_err());
        assert!(check_share_access(
            &options,
            addr("10.0.0.65"),
            "sys",
            &Identity::unix(1000, 1000),
            CancelToken::new(),
        )
        .is_ok());
        assert!(check_share_access(
            &options,
            addr("192.168.0.1"),
            "sys",
            &Identity::unix(1000, 1000),
            CancelToken::new(),
        )
        .is_err());
    }

    #[test]
    fn context_carries_mapped_identity_and_share_flags() {
        let options = ShareOptions {
            read_only: true,
            identity_mapping: Some(IdentityMapping {
                map_privileged_to_anonymous: true,
                anonymous_uid: Some(65534),
                ..Default::default()
            }),
            ..Default::default()
        };
        let ctx = check_share_access(
            &options,
            addr("10.0.0.1"),
            "sys",
            &Identity::unix(0, 0),
            CancelToken::new(),
        )
        .unwrap();
        assert!(ctx.share_read_only);
        assert!(!ctx.share_writable);
        assert_eq!(ctx.uid(), Some(65534));
    }

    #[test]
    fn cancellation_is_honoured_on_large_lists() {
        let token = CancelToken::new();
        token.cancel();
        let options = ShareOptions {
            denied_clients: (0..20).map(|i| format!("192.168.1.{}", i)).collect(),
            ..Default::default()
        };
        let err = check_share_access(
            &options,
            addr("10.0.0.1"),
            "sys",
            &Identity::unix(1000, 1000),
            token,
        )
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
