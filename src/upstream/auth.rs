// =============================================================================
// Token Acquirer — short-lived bearer tokens from the upstream auth endpoint
// =============================================================================
//
// The upstream hands out JWT-like tokens with a ~60 s lifetime. Every
// acquisition carries a random `rnum` query parameter so intermediary caches
// never serve a stale token. Expiry comes from the `exp` claim in the middle
// segment when present, else from the configured TTL.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::audit::{AuditRecord, AuditSink};
use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("auth endpoint returned status {0}")]
    Status(u16),

    #[error("auth endpoint returned an empty body")]
    EmptyBody,

    #[error("auth endpoint returned a malformed token: {0}")]
    Malformed(&'static str),
}

/// A bearer token plus its decoded lifetime.
#[derive(Debug, Clone)]
pub struct AcquiredToken {
    pub token: String,
    /// Lifetime at acquisition, milliseconds.
    pub expires_in_ms: i64,
    /// Absolute expiry, milliseconds since epoch.
    pub expires_at: i64,
}

impl AcquiredToken {
    /// Remaining lifetime at `now`, clamped at zero.
    pub fn remaining_ms(&self, now: i64) -> i64 {
        (self.expires_at - now).max(0)
    }
}

// =============================================================================
// Acquirer
// =============================================================================

pub struct TokenAcquirer {
    http: reqwest::Client,
    auth_url: String,
    default_ttl_ms: i64,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
}

impl TokenAcquirer {
    /// Build the acquirer with the browser-shaped headers the upstream
    /// expects and hard HTTP deadlines (connect 10 s, total 30 s).
    pub fn new(
        auth_url: impl Into<String>,
        origin: &str,
        referer: &str,
        user_agent: &str,
        default_ttl_ms: i64,
        clock: Arc<dyn Clock>,
        audit: AuditSink,
    ) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ORIGIN,
            reqwest::header::HeaderValue::from_str(origin)?,
        );
        headers.insert(
            reqwest::header::REFERER,
            reqwest::header::HeaderValue::from_str(referer)?,
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("*/*"),
        );

        let http = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            auth_url: auth_url.into(),
            default_ttl_ms,
            clock,
            audit,
        })
    }

    /// Fetch a fresh token.
    #[instrument(skip(self), name = "auth::acquire")]
    pub async fn acquire(&self) -> Result<AcquiredToken, AuthError> {
        let rnum: f64 = rand::random();
        let url = format!("{}?rnum={}", self.auth_url, rnum);

        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "auth endpoint rejected token request");
            return Err(AuthError::Status(status.as_u16()));
        }

        let body = resp.text().await?;
        let token = body.trim();
        if token.is_empty() {
            return Err(AuthError::EmptyBody);
        }
        if token.split('.').count() != 3 {
            return Err(AuthError::Malformed("expected three dot-separated segments"));
        }

        let now = self.clock.now_ms();
        let expires_at = match token_expiry_ms(token) {
            Some(exp) => exp,
            None => now + self.default_ttl_ms,
        };
        let acquired = AcquiredToken {
            token: token.to_string(),
            expires_in_ms: (expires_at - now).max(0),
            expires_at,
        };

        self.audit.submit(
            AuditRecord::new("JWT_ACQUIRED", "auth")
                .field("expiresInMs", serde_json::json!(acquired.expires_in_ms)),
        );
        debug!(expires_in_ms = acquired.expires_in_ms, "token acquired");
        Ok(acquired)
    }

    /// Return `current` untouched while it still has more than `threshold_ms`
    /// of life left; otherwise acquire a fresh token.
    pub async fn refresh_if_needed(
        &self,
        current: &AcquiredToken,
        threshold_ms: i64,
    ) -> Result<AcquiredToken, AuthError> {
        let now = self.clock.now_ms();
        if current.expires_at - now > threshold_ms {
            return Ok(current.clone());
        }
        self.acquire().await
    }
}

impl std::fmt::Debug for TokenAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAcquirer")
            .field("auth_url", &self.auth_url)
            .field("default_ttl_ms", &self.default_ttl_ms)
            .finish()
    }
}

// =============================================================================
// Claim decoding
// =============================================================================

/// Decode the middle segment of a three-part token as base64url JSON and
/// extract the `exp` claim (seconds), scaled to milliseconds. Returns `None`
/// when the segment is not decodable or carries no `exp` — callers fall back
/// to the configured TTL.
pub fn token_expiry_ms(token: &str) -> Option<i64> {
    let middle = token.split('.').nth(1)?;
    let stripped = middle.trim_end_matches('=');
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(stripped)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    claims.get("exp")?.as_i64().map(|exp| exp * 1000)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn token_with_claims(claims: &serde_json::Value) -> String {
        format!(
            "hdr.{}.sig",
            URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes())
        )
    }

    #[test]
    fn exp_claim_scales_to_millis() {
        let token = token_with_claims(&serde_json::json!({ "exp": 1_700_000_060 }));
        assert_eq!(token_expiry_ms(&token), Some(1_700_000_060_000));
    }

    #[test]
    fn missing_exp_yields_none() {
        let token = token_with_claims(&serde_json::json!({ "sub": "ws" }));
        assert_eq!(token_expiry_ms(&token), None);
    }

    #[test]
    fn garbage_middle_segment_yields_none() {
        assert_eq!(token_expiry_ms("aaa.%%%.ccc"), None);
        assert_eq!(token_expiry_ms("not-a-token"), None);
    }

    #[test]
    fn padded_base64url_is_tolerated() {
        let body = URL_SAFE_NO_PAD.encode(br#"{"exp":1700000060}"#);
        let token = format!("hdr.{body}==.sig");
        assert_eq!(token_expiry_ms(&token), Some(1_700_000_060_000));
    }

    #[tokio::test]
    async fn refresh_is_a_noop_while_token_is_live() {
        use crate::audit::AuditSink;
        use crate::clock::ManualClock;
        use std::sync::Arc;

        let clock = Arc::new(ManualClock::at(1_700_000_000_000));
        // The endpoint is unreachable; any attempt to refresh would error,
        // so a passing call proves no request was made.
        let acquirer = TokenAcquirer::new(
            "https://auth.invalid/getwebsockettoken",
            "https://origin.invalid",
            "https://referer.invalid",
            "test-agent",
            60_000,
            clock.clone() as Arc<dyn crate::clock::Clock>,
            AuditSink::disabled(clock.clone() as Arc<dyn crate::clock::Clock>),
        )
        .unwrap();

        let current = AcquiredToken {
            token: "a.b.c".into(),
            expires_in_ms: 60_000,
            expires_at: 1_700_000_060_000,
        };

        let first = acquirer.refresh_if_needed(&current, 5_000).await.unwrap();
        let second = acquirer.refresh_if_needed(&first, 5_000).await.unwrap();
        assert_eq!(first.token, current.token);
        assert_eq!(second.token, current.token);
        assert_eq!(second.expires_at, current.expires_at);
    }

    #[test]
    fn remaining_ms_clamps_at_zero() {
        let t = AcquiredToken {
            token: "x.y.z".into(),
            expires_in_ms: 60_000,
            expires_at: 1_700_000_060_000,
        };
        assert_eq!(t.remaining_ms(1_700_000_000_000), 60_000);
        assert_eq!(t.remaining_ms(1_700_000_100_000), 0);
    }
}
