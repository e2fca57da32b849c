//! Challenge reachability probing
//!
//! Places a token file where the certificate authority will look for the
//! real challenge and fetches it through the public domain name, so DNS,
//! firewall and the proxy's challenge location are all exercised end to end.

use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use certpilot_common::{BackoffPolicy, ACME_CHALLENGE_DIR, ACME_CHALLENGE_PREFIX};

use crate::errors::OrchestratorError;
use crate::poll::{poll_until, PollError};

/// Per-request timeout for probe fetches
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique, non-secret probe token
fn new_token() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let n = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("certpilot-{}-{}", millis, n)
}

/// A token file under the challenge directory, removed on drop together
/// with any directories created for it
#[derive(Debug)]
pub struct ProbeFile {
    token: String,
    path: PathBuf,
    created_dirs: Vec<PathBuf>,
}

impl ProbeFile {
    pub fn create(challenge_dir: &Path) -> Result<Self, OrchestratorError> {
        let dir = challenge_dir.join(ACME_CHALLENGE_DIR);

        // Deepest first, so removal walks back up
        let mut created_dirs = Vec::new();
        let mut cursor = dir.as_path();
        while cursor != challenge_dir && !cursor.exists() {
            created_dirs.push(cursor.to_path_buf());
            match cursor.parent() {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        fs::create_dir_all(&dir).map_err(|e| OrchestratorError::io(&dir, e))?;

        let token = new_token();
        let path = dir.join(&token);
        let probe = Self {
            token,
            path,
            created_dirs,
        };
        fs::write(&probe.path, &probe.token).map_err(|e| OrchestratorError::io(&probe.path, e))?;
        debug!(path = %probe.path.display(), "Created challenge probe file");
        Ok(probe)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProbeFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove challenge probe file");
            }
        }
        for dir in &self.created_dirs {
            // Fails harmlessly when something else now lives there
            if fs::remove_dir(dir).is_err() {
                break;
            }
        }
    }
}

/// Result of a successful probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub url: String,
    pub attempts: u32,
}

/// Checks that the challenge path is publicly reachable
pub struct ChallengeProber {
    client: reqwest::Client,
    challenge_dir: PathBuf,
    policy: BackoffPolicy,
    port: Option<u16>,
    cancel: CancellationToken,
}

impl ChallengeProber {
    pub fn new(
        client: reqwest::Client,
        challenge_dir: impl Into<PathBuf>,
        policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            challenge_dir: challenge_dir.into(),
            policy,
            port: None,
            cancel,
        }
    }

    /// Probe a port other than 80
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }

    pub fn url_for(&self, domain: &str, token: &str) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        format!("http://{}{}{}{}", domain, port, ACME_CHALLENGE_PREFIX, token)
    }

    /// Create a probe file, fetch it through `domain` until the body matches
    /// the token, and remove the file whatever the outcome.
    pub async fn probe(&self, domain: &str) -> Result<ProbeReport, OrchestratorError> {
        let probe = ProbeFile::create(&self.challenge_dir)?;
        let url = self.url_for(domain, probe.token());
        info!(url = %url, "Probing challenge reachability");

        let last = Mutex::new(String::from("no attempt made"));
        let last_ref = &last;
        let client = &self.client;
        let url_ref = url.as_str();
        let token = probe.token();

        let result = poll_until(&self.policy, &self.cancel, move |attempt| async move {
            match fetch(client, url_ref, token).await {
                Ok(()) => true,
                Err(observation) => {
                    debug!(attempt, result = %observation, "Challenge probe not yet served");
                    *last_ref.lock() = observation;
                    false
                }
            }
        })
        .await;

        match result {
            Ok(attempts) => {
                info!(attempts, "Challenge path reachable");
                Ok(ProbeReport { url, attempts })
            }
            Err(PollError::Cancelled) => Err(OrchestratorError::Cancelled),
            Err(PollError::Exhausted { attempts, .. }) => {
                let last = last.into_inner();
                warn!(url = %url, attempts, last = %last, "Challenge path unreachable");
                Err(OrchestratorError::ChallengeUnreachable {
                    domain: domain.to_string(),
                    url,
                    attempts,
                    last,
                })
            }
        }
    }
}

/// One fetch; the error describes what was observed instead
async fn fetch(client: &reqwest::Client, url: &str, token: &str) -> Result<(), String> {
    let response = client
        .get(url)
        .timeout(PROBE_REQUEST_TIMEOUT)
        .send()
        .await
        .map_err(|e| format!("request failed: {}", e))?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(format!("HTTP {}", status.as_u16()));
    }

    let body = response
        .text()
        .await
        .map_err(|e| format!("reading body failed: {}", e))?;
    if body.trim() == token {
        Ok(())
    } else {
        let shown: String = body.trim().chars().take(64).collect();
        Err(format!("body mismatch (got '{}')", shown))
    }
}
