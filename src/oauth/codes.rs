//! Single-use authorization codes with PKCE verification.
//!
//! Codes are opaque 256-bit random values mapping to a stored backing
//! credential. Redemption is strictly single-use: [`AuthCodeStore::exchange_code`]
//! removes the record from the map *before* validating it, so under any
//! interleaving of concurrent redemptions exactly one caller observes the
//! record and everyone else sees nothing. A failed validation never
//! reinserts the record — a code burned on a bad PKCE verifier is gone.
//!
//! All redemption failures (unknown, expired, already used, PKCE mismatch)
//! are reported uniformly as `None`. The distinguishing reason goes to the
//! audit log only, never to the client.

use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use dashmap::DashMap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::auth::audit::{self, AuditEvent};

/// Authorization code lifetime.
const CODE_TTL: Duration = Duration::from_secs(300);

/// Random entropy per code, before base64url encoding.
const CODE_BYTES: usize = 32;

/// How often the sweeper purges expired codes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// PKCE code challenge methods (RFC 7636).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CodeChallengeMethod {
    /// Verifier sent as-is. Kept for legacy clients that cannot hash.
    #[serde(rename = "plain")]
    Plain,
    /// `base64url(SHA-256(verifier))`.
    #[serde(rename = "S256")]
    S256,
}

/// A registered PKCE challenge.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// The challenge value sent at authorization time.
    pub challenge: String,
    /// How the verifier is transformed before comparison.
    pub method: CodeChallengeMethod,
}

/// Stored state behind an issued code.
struct CodeRecord {
    backing_credential: String,
    service: String,
    pkce: Option<PkceChallenge>,
    issued_at: Instant,
}

impl CodeRecord {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() >= ttl
    }
}

/// In-memory store of outstanding authorization codes.
pub struct AuthCodeStore {
    codes: DashMap<String, CodeRecord>,
    ttl: Duration,
}

impl AuthCodeStore {
    /// Create a store with the default 5-minute code lifetime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(CODE_TTL)
    }

    /// Create a store with an explicit code lifetime.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            codes: DashMap::new(),
            ttl,
        }
    }

    /// Mint a code for `backing_credential`, optionally bound to a PKCE
    /// challenge. Returns the opaque code handed to the client.
    #[must_use]
    pub fn create_code(
        &self,
        service: &str,
        backing_credential: &str,
        pkce: Option<PkceChallenge>,
    ) -> String {
        let code = generate_code();
        audit::emit(AuditEvent::code_issued(service, pkce.is_some()));
        self.codes.insert(
            code.clone(),
            CodeRecord {
                backing_credential: backing_credential.to_string(),
                service: service.to_string(),
                pkce,
                issued_at: Instant::now(),
            },
        );
        code
    }

    /// Redeem a code, returning the backing credential on success.
    ///
    /// The record is removed before validation; whatever the outcome, the
    /// code can never be presented again.
    pub fn exchange_code(&self, code: &str, verifier: Option<&str>) -> Option<String> {
        // remove() is the atomicity point: only one concurrent caller gets
        // Some, and the record is already gone if validation fails below.
        let Some((_, record)) = self.codes.remove(code) else {
            audit::emit(AuditEvent::code_rejected("unknown or already used code"));
            return None;
        };

        if record.is_expired(self.ttl) {
            audit::emit(AuditEvent::code_rejected("expired code"));
            return None;
        }

        match (&record.pkce, verifier) {
            (None, _) => {}
            (Some(_), None) => {
                audit::emit(AuditEvent::code_rejected("pkce verifier required but absent"));
                return None;
            }
            (Some(challenge), Some(verifier)) => {
                if !verify_pkce(challenge, verifier) {
                    audit::emit(AuditEvent::code_rejected("pkce verifier mismatch"));
                    return None;
                }
            }
        }

        audit::emit(AuditEvent::code_redeemed(&record.service));
        Some(record.backing_credential)
    }

    /// Purge expired codes. Expiry is also enforced at redemption time, so
    /// this only bounds memory.
    pub fn sweep_expired(&self) {
        let ttl = self.ttl;
        let before = self.codes.len();
        self.codes.retain(|_, record| !record.is_expired(ttl));
        let swept = before - self.codes.len();
        if swept > 0 {
            debug!(swept, "Swept expired authorization codes");
        }
    }

    /// Spawn the background sweeper, stopping on shutdown signal.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.sweep_expired(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Backdate a code's issue time so expiry paths are testable without
    /// sleeping through the real TTL.
    #[cfg(test)]
    fn backdate(&self, code: &str, age: Duration) {
        if let Some(mut record) = self.codes.get_mut(code) {
            record.issued_at = Instant::now() - age;
        }
    }
}

impl Default for AuthCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 256 bits of randomness, base64url without padding.
fn generate_code() -> String {
    use rand::RngExt;
    let bytes: [u8; CODE_BYTES] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check a PKCE verifier against the registered challenge.
///
/// Both methods compare in constant time; for S256 the verifier is hashed
/// and base64url-encoded first (RFC 7636 §4.6).
fn verify_pkce(challenge: &PkceChallenge, verifier: &str) -> bool {
    let derived = match challenge.method {
        CodeChallengeMethod::Plain => verifier.to_string(),
        CodeChallengeMethod::S256 => {
            let digest = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(digest)
        }
    };
    derived.as_bytes().ct_eq(challenge.challenge.as_bytes()).into()
}
