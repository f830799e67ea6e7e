//! Preview-then-approve token registry.
//!
//! A preview that passes validation is bound to a one-shot token: a 256-bit
//! random id tied to the SHA-256 digest of the statement's canonical form.
//! Execute must present the token together with SQL whose canonical form
//! hashes to the same digest; the comparison is constant-time. A token is
//! consumable at most once - consume removes the entry under the same lock
//! that found it.
//!
//! Expired entries are purged on every mutation, which bounds memory
//! without a background task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{GatewayError, Result};
use crate::security::normalize::canonicalize;
use crate::security::validator::QueryVerdict;
use crate::utils::{Clock, TokenEntropy};

const TOKEN_BYTES: usize = 32;

/// A token handed back to the caller by a successful preview.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IssuedApproval {
    /// Hex-encoded 256-bit token id.
    pub token: String,

    /// Seconds until the token expires.
    pub expires_in_seconds: u64,
}

struct StoredApproval {
    canonical_hash: [u8; 32],
    expires_at:     DateTime<Utc>,
    verdict:        QueryVerdict,
}

/// In-memory registry of outstanding approvals.
pub struct ApprovalRegistry {
    ttl:     Duration,
    clock:   Arc<dyn Clock>,
    entropy: Arc<dyn TokenEntropy>,
    index:   Mutex<HashMap<String, StoredApproval>>,
}

impl ApprovalRegistry {
    /// Create a registry issuing tokens valid for `ttl_secs` seconds.
    #[must_use]
    pub fn new(ttl_secs: u64, clock: Arc<dyn Clock>, entropy: Arc<dyn TokenEntropy>) -> Self {
        Self {
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX)),
            clock,
            entropy,
            index: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a token binding `verdict` to the canonical form it was
    /// computed from.
    #[must_use]
    pub fn issue(&self, verdict: &QueryVerdict, canonical: &str) -> IssuedApproval {
        let mut id_bytes = [0u8; TOKEN_BYTES];
        self.entropy.fill(&mut id_bytes);
        let token = hex::encode(id_bytes);

        let now = self.clock.now();
        let mut index = self.index.lock();
        purge_expired(&mut index, now);
        index.insert(
            token.clone(),
            StoredApproval {
                canonical_hash: digest(canonical),
                expires_at:     now + self.ttl,
                verdict:        verdict.clone(),
            },
        );

        IssuedApproval {
            token,
            expires_in_seconds: u64::try_from(self.ttl.num_seconds()).unwrap_or(0),
        }
    }

    /// Consume a token against the SQL presented at execute.
    ///
    /// # Errors
    ///
    /// - `ApprovalInvalid` when the id is unknown or already consumed
    /// - `ApprovalExpired` when the token is past its validity window
    /// - `ApprovalMismatch` when the canonical hash of `raw_sql` differs
    ///   from the hash bound at issue (a mismatch does not consume)
    pub fn consume(&self, token: &str, raw_sql: &str) -> Result<QueryVerdict> {
        let now = self.clock.now();
        let mut index = self.index.lock();

        let Some(stored) = index.get(token) else {
            return Err(GatewayError::approval_invalid("unknown or already consumed token"));
        };

        if now > stored.expires_at {
            let expired_for = (now - stored.expires_at).num_seconds().max(0);
            index.remove(token);
            purge_expired(&mut index, now);
            return Err(GatewayError::ApprovalExpired {
                expired_for_secs: u64::try_from(expired_for).unwrap_or(0),
            });
        }

        let presented = digest(&canonicalize(raw_sql));
        if !bool::from(presented[..].ct_eq(&stored.canonical_hash[..])) {
            return Err(GatewayError::ApprovalMismatch);
        }

        let stored = index
            .remove(token)
            .ok_or_else(|| GatewayError::internal("approval entry vanished under lock"))?;
        purge_expired(&mut index, now);
        Ok(stored.verdict)
    }

    /// Number of outstanding approvals (testing and introspection).
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.index.lock().len()
    }
}

fn digest(canonical: &str) -> [u8; 32] {
    Sha256::digest(canonical.as_bytes()).into()
}

fn purge_expired(index: &mut HashMap<String, StoredApproval>, now: DateTime<Utc>) {
    index.retain(|_, stored| stored.expires_at >= now);
}
