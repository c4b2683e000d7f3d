//! Failover watchdog (sentinel) roster.

use serde::{Deserialize, Serialize};

/// The set of sentinel addresses the coordinator keeps in sync with group
/// masters. Observation from these watchdogs is advisory; the coordinator
/// never lets them rewrite topology.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sentinel {
    pub servers: Vec<String>,
    /// Set when the roster or group masters changed and the watchdogs were
    /// not yet told; cleared by a successful resync-all.
    #[serde(default)]
    pub out_of_sync: bool,
}

impl Sentinel {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, addr: &str) -> bool {
        self.servers.iter().any(|s| s == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roster_is_empty_and_in_sync() {
        let sentinel = Sentinel::default();
        assert!(sentinel.is_empty());
        assert!(!sentinel.out_of_sync);
    }

    #[test]
    fn contains_matches_exact_addr() {
        let sentinel = Sentinel {
            servers: vec!["10.0.0.5:26379".to_string()],
            out_of_sync: false,
        };
        assert!(sentinel.contains("10.0.0.5:26379"));
        assert!(!sentinel.contains("10.0.0.5:2637"));
    }
}
