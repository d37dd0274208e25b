use crate::error::NodeError;
use crate::utils::sha256_hex;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Deserialize)]
struct ChallengeResponse {
    challenge: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    /// Lifetime in milliseconds.
    ttl: u64,
}

struct TokenState {
    value: String,
    obtained_at: Instant,
    ttl: Duration,
}

/// Obtains and refreshes the bearer credential used on every authenticated
/// outbound call. The exchange is challenge/response: the control plane
/// hands out a challenge for the cluster id and accepts a keyed SHA-256
/// digest of it under the cluster secret.
pub struct TokenManager {
    http: reqwest::Client,
    base_url: String,
    cluster_id: String,
    cluster_secret: String,
    state: Mutex<Option<TokenState>>,
}

/// Refresh when less than this fraction of the ttl remains.
const REFRESH_HEADROOM: f64 = 0.1;

fn needs_refresh(obtained_at: Instant, ttl: Duration, now: Instant) -> bool {
    let age = now.saturating_duration_since(obtained_at);
    let headroom = ttl.mul_f64(REFRESH_HEADROOM);
    age + headroom >= ttl
}

impl TokenManager {
    pub fn new(
        base_url: &str,
        cluster_id: &str,
        cluster_secret: &str,
        user_agent: &str,
    ) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            cluster_id: cluster_id.to_string(),
            cluster_secret: cluster_secret.to_string(),
            state: Mutex::new(None),
        })
    }

    /// A valid token, refreshed transparently near expiry. Concurrent
    /// callers during a refresh share the single outstanding exchange:
    /// whoever holds the lock refreshes, the rest observe the new state.
    pub async fn get_token(&self) -> Result<String, NodeError> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.as_ref() {
            if !needs_refresh(current.obtained_at, current.ttl, Instant::now()) {
                return Ok(current.value.clone());
            }
            debug!("token near expiry, refreshing");
        }
        let fresh = self.exchange().await?;
        let value = fresh.value.clone();
        *state = Some(fresh);
        Ok(value)
    }

    async fn exchange(&self) -> Result<TokenState, NodeError> {
        let challenge_url = format!(
            "{}/challenge?clusterId={}",
            self.base_url, self.cluster_id
        );
        let res = self.http.get(&challenge_url).send().await?;
        if !res.status().is_success() {
            return Err(NodeError::Auth(format!(
                "challenge request returned {}",
                res.status()
            )));
        }
        let challenge: ChallengeResponse = res.json().await?;

        let signature = sha256_hex(
            format!("{}{}", self.cluster_secret, challenge.challenge).as_bytes(),
        );
        let res = self
            .http
            .post(format!("{}/token", self.base_url))
            .json(&serde_json::json!({
                "clusterId": self.cluster_id,
                "challenge": challenge.challenge,
                "signature": signature,
            }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(NodeError::Auth(format!(
                "token exchange returned {}",
                res.status()
            )));
        }
        let token: TokenResponse = res.json().await?;
        info!("obtained control plane token, ttl {}ms", token.ttl);
        Ok(TokenState {
            value: token.token,
            obtained_at: Instant::now(),
            ttl: Duration::from_millis(token.ttl),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_only_near_expiry() {
        let ttl = Duration::from_secs(1000);
        let obtained = Instant::now();
        assert!(!needs_refresh(obtained, ttl, obtained));
        assert!(!needs_refresh(
            obtained,
            ttl,
            obtained + Duration::from_secs(800)
        ));
        // within the 10% headroom
        assert!(needs_refresh(
            obtained,
            ttl,
            obtained + Duration::from_secs(950)
        ));
        assert!(needs_refresh(
            obtained,
            ttl,
            obtained + Duration::from_secs(2000)
        ));
    }
}
