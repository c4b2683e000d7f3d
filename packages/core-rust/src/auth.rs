//! Admin-plane identity: the per-cluster auth token plus validators for the
//! names and addresses operators submit.
//!
//! The token (`xauth`) is a keyed fingerprint of the cluster name, carried as
//! a path segment by every authenticated admin RPC so a coordinator refuses
//! requests aimed at a different cluster on the same host. It is not a
//! secret-management scheme.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const XAUTH_DOMAIN: &str = "Shardhelm-XAuth";

/// Length the hex digest is truncated to.
const XAUTH_LEN: usize = 32;

/// Derive the admin token for `cluster`: hex SHA-256 of the domain-separated
/// cluster name, truncated to [`XAUTH_LEN`] characters.
#[must_use]
pub fn derive_xauth(cluster: &str) -> String {
    let digest = Sha256::digest(format!("{XAUTH_DOMAIN}-[{cluster}]").as_bytes());
    let mut token = hex::encode(digest);
    token.truncate(XAUTH_LEN);
    token
}

/// Constant-time token comparison.
#[must_use]
pub fn verify_xauth(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Whether `name` can serve as a cluster name: word characters, dots and
/// dashes, starting with a word character.
#[must_use]
pub fn valid_cluster_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^\w[\w.\-]*$").expect("hard-coded pattern"));
    re.is_match(name)
}

/// Whether `addr` looks like a routable `host:port`.
#[must_use]
pub fn valid_addr(addr: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9][A-Za-z0-9.\-]*):(\d{1,5})$").expect("hard-coded pattern")
    });
    let Some(caps) = re.captures(addr) else {
        return false;
    };
    caps[2].parse::<u32>().is_ok_and(|port| (1..=65535).contains(&port))
}
