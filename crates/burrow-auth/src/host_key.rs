//! Gateway host key trust decisions

use std::collections::HashSet;
use std::fmt;
use tracing::warn;

use crate::identity::thumbprint;
use crate::{AuthError, AuthResult};

#[derive(Debug, Clone, Default)]
pub struct HostKeyPolicy {
    /// Accepted host key thumbprints
    pub pinned: HashSet<String>,
    /// Accept any host key (INSECURE)
    pub insecure_skip: bool,
}

/// How the host key was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyCheck {
    Pinned,
    SkippedInsecure,
    /// TLS with certificate verification already authenticated the gateway
    SkippedTransportAuthenticated,
}

impl fmt::Display for HostKeyCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyCheck::Pinned => write!(f, "pinned"),
            HostKeyCheck::SkippedInsecure => write!(f, "skipped (insecure)"),
            HostKeyCheck::SkippedTransportAuthenticated => {
                write!(f, "skipped (authenticated by TLS)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyReport {
    pub thumbprint: String,
    pub check: HostKeyCheck,
}

impl HostKeyPolicy {
    pub fn pinned<I, S>(thumbprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pinned: thumbprints.into_iter().map(Into::into).collect(),
            insecure_skip: false,
        }
    }

    pub fn with_insecure_skip(mut self, skip: bool) -> Self {
        self.insecure_skip = skip;
        self
    }

    pub fn check(&self, host_key: &[u8], transport_authenticated: bool) -> AuthResult<HostKeyReport> {
        let thumbprint = thumbprint(host_key);

        let check = if self.pinned.contains(&thumbprint) {
            HostKeyCheck::Pinned
        } else if self.insecure_skip {
            warn!("Accepting unverified gateway host key {}", thumbprint);
            HostKeyCheck::SkippedInsecure
        } else if transport_authenticated {
            HostKeyCheck::SkippedTransportAuthenticated
        } else {
            return Err(AuthError::UntrustedHostKey { thumbprint });
        };

        Ok(HostKeyReport { thumbprint, check })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Identity;

    #[test]
    fn test_pinned_key_accepted() {
        let host = Identity::generate();
        let policy = HostKeyPolicy::pinned([host.thumbprint()]);
        let report = policy.check(&host.public_key(), false).unwrap();
        assert_eq!(report.check, HostKeyCheck::Pinned);
        assert_eq!(report.thumbprint, host.thumbprint());
    }

    #[test]
    fn test_unpinned_key_rejected_on_plain_transport() {
        let policy = HostKeyPolicy::pinned(["something-else"]);
        let err = policy
            .check(&Identity::generate().public_key(), false)
            .unwrap_err();
        assert!(matches!(err, AuthError::UntrustedHostKey { .. }));
    }

    #[test]
    fn test_skips_are_reported() {
        let key = Identity::generate().public_key();

        let insecure = HostKeyPolicy::default().with_insecure_skip(true);
        assert_eq!(
            insecure.check(&key, false).unwrap().check,
            HostKeyCheck::SkippedInsecure
        );

        let tls = HostKeyPolicy::default();
        assert_eq!(
            tls.check(&key, true).unwrap().check,
            HostKeyCheck::SkippedTransportAuthenticated
        );
    }
}
