//! Reverse-proxy configuration toggling
//!
//! The configuration directory holds two variants, `bootstrap.conf` and
//! `full.conf`, and the live file `active.conf` that the proxy includes.
//! Activating a variant replaces the live file atomically: the content goes
//! to a temporary file in the same directory, the proxy checks its syntax,
//! and only then is it renamed over `active.conf`. A crash or cancellation
//! therefore leaves either the old or the new variant in place, never a
//! partial file.
//!
//! Before the first write of a run the live file is copied into a single
//! backup slot (`active.conf.backup`) that [`ConfigToggler::restore`] puts
//! back.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use certpilot_common::{ActiveState, BackoffPolicy, ConfigVariant, ACTIVE_FILE, BACKUP_FILE};
use certpilot_config::inspect_bundle;

use crate::errors::OrchestratorError;
use crate::poll::{poll_until, PollError};
use crate::proxy::ReverseProxy;

/// State of the run's backup slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupSlot {
    /// No write has happened yet in this run
    NotTaken,
    /// There was no live file before the run
    Empty,
    /// The pre-run live file was copied here
    Saved(PathBuf),
}

/// Hex sha256 of `bytes`
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, OrchestratorError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OrchestratorError::io(path, e)),
    }
}

/// Which variant the live file currently holds, by checksum
pub fn detect_active(config_dir: &Path) -> Result<ActiveState, OrchestratorError> {
    let Some(live) = read_optional(&config_dir.join(ACTIVE_FILE))? else {
        return Ok(ActiveState::Missing);
    };
    let live = checksum(&live);

    for variant in [ConfigVariant::Bootstrap, ConfigVariant::Full] {
        if let Some(content) = read_optional(&config_dir.join(variant.file_name()))? {
            if checksum(&content) == live {
                return Ok(ActiveState::Variant(variant));
            }
        }
    }
    Ok(ActiveState::Custom)
}

/// Reload the proxy, falling back to a restart
pub(crate) async fn signal_proxy(proxy: &dyn ReverseProxy, context: &str) -> Result<(), OrchestratorError> {
    let reload_err = match proxy.reload().await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    warn!(error = %reload_err, "Proxy reload failed, restarting");

    proxy.restart().await.map_err(|restart_err| {
        warn!(error = %restart_err, "Proxy restart failed");
        OrchestratorError::ProxyUnhealthy {
            context: format!("{} (reload failed: {}; restart failed: {})", context, reload_err, restart_err),
            attempts: 0,
            elapsed: std::time::Duration::ZERO,
        }
    })
}

/// Poll proxy health under `policy`
pub(crate) async fn wait_healthy(
    proxy: &dyn ReverseProxy,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    context: &str,
) -> Result<u32, OrchestratorError> {
    let result = poll_until(policy, cancel, move |_| async move { proxy.is_healthy().await }).await;
    match result {
        Ok(attempts) => {
            debug!(attempts, "Proxy healthy");
            Ok(attempts)
        }
        Err(PollError::Cancelled) => Err(OrchestratorError::Cancelled),
        Err(PollError::Exhausted { attempts, elapsed }) => Err(OrchestratorError::ProxyUnhealthy {
            context: context.to_string(),
            attempts,
            elapsed,
        }),
    }
}

/// Swaps the live proxy configuration between variants
pub struct ConfigToggler {
    config_dir: PathBuf,
    cert_dir: PathBuf,
    domain: String,
    proxy: Arc<dyn ReverseProxy>,
    health_policy: BackoffPolicy,
    cancel: CancellationToken,
    backup: BackupSlot,
}

impl ConfigToggler {
    pub fn new(
        config_dir: impl Into<PathBuf>,
        cert_dir: impl Into<PathBuf>,
        domain: impl Into<String>,
        proxy: Arc<dyn ReverseProxy>,
        health_policy: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            cert_dir: cert_dir.into(),
            domain: domain.into(),
            proxy,
            health_policy,
            cancel,
            backup: BackupSlot::NotTaken,
        }
    }

    pub fn live_path(&self) -> PathBuf {
        self.config_dir.join(ACTIVE_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.config_dir.join(BACKUP_FILE)
    }

    pub fn variant_path(&self, variant: ConfigVariant) -> PathBuf {
        self.config_dir.join(variant.file_name())
    }

    pub fn backup(&self) -> &BackupSlot {
        &self.backup
    }

    pub fn active_state(&self) -> Result<ActiveState, OrchestratorError> {
        detect_active(&self.config_dir)
    }

    /// Make `variant` the live configuration and wait for the proxy to be healthy.
    ///
    /// Preconditions are checked before anything is written: the variant
    /// file must exist, and `full` needs a readable certificate bundle.
    /// Activating the variant that is already live skips the write, and the
    /// proxy is only signalled if it is not healthy already. Health
    /// exhaustion is reported as `ProxyUnhealthy` without rolling back.
    pub async fn activate(&mut self, variant: ConfigVariant) -> Result<(), OrchestratorError> {
        let source = self.variant_path(variant);
        let content = match read_optional(&source)? {
            Some(content) => content,
            None => {
                return Err(OrchestratorError::ConfigWrite {
                    path: self.live_path(),
                    reason: format!("variant file {} does not exist", source.display()),
                })
            }
        };

        if variant.requires_certificate() {
            self.check_certificate()?;
        }

        self.snapshot()?;

        let context = format!("activating {}", variant);
        if self.live_matches(&content)? {
            info!(variant = %variant, "Variant already active, skipping write");
            self.signal_if_unhealthy(&context).await?;
        } else {
            self.install(&content, Some(&source)).await?;
            info!(variant = %variant, "Activated configuration variant");
            signal_proxy(self.proxy.as_ref(), &context).await?;
        }

        wait_healthy(self.proxy.as_ref(), &self.health_policy, &self.cancel, &context).await?;
        Ok(())
    }

    /// Put the pre-run configuration back.
    ///
    /// Returns `false` when there was nothing to restore: no backup was
    /// taken in this run, or there was no live file before the run (the
    /// current variant is left in place).
    pub async fn restore(&mut self) -> Result<bool, OrchestratorError> {
        let backup = match self.backup {
            BackupSlot::Saved(ref path) => path.clone(),
            BackupSlot::NotTaken => {
                debug!("No backup taken in this run, nothing to restore");
                return Ok(false);
            }
            BackupSlot::Empty => {
                info!("No configuration was active before this run, leaving current variant in place");
                return Ok(false);
            }
        };

        let content = fs::read(&backup).map_err(|e| OrchestratorError::io(&backup, e))?;
        let context = "restoring the pre-run configuration";
        if self.live_matches(&content)? {
            info!("Live configuration already equals the backup");
            self.signal_if_unhealthy(context).await?;
        } else {
            self.install(&content, None).await?;
            info!(backup = %backup.display(), "Restored pre-run configuration");
            signal_proxy(self.proxy.as_ref(), context).await?;
        }

        wait_healthy(self.proxy.as_ref(), &self.health_policy, &self.cancel, context).await?;
        Ok(true)
    }

    /// Nothing was written; only kick a proxy that is down
    async fn signal_if_unhealthy(&self, context: &str) -> Result<(), OrchestratorError> {
        if self.proxy.is_healthy().await {
            return Ok(());
        }
        warn!(context, "Proxy unhealthy with the wanted configuration already live, signalling");
        signal_proxy(self.proxy.as_ref(), context).await
    }

    fn check_certificate(&self) -> Result<(), OrchestratorError> {
        match inspect_bundle(&self.cert_dir, &self.domain) {
            Ok(Some(info)) => {
                debug!(subject = %info.subject, not_after = %info.not_after, "Certificate bundle present");
                Ok(())
            }
            Ok(None) => Err(OrchestratorError::ConfigWrite {
                path: self.live_path(),
                reason: format!(
                    "full configuration needs a certificate but none exists at {}",
                    self.cert_dir
                        .join("live")
                        .join(&self.domain)
                        .join("fullchain.pem")
                        .display()
                ),
            }),
            Err(e) => Err(OrchestratorError::ConfigWrite {
                path: self.live_path(),
                reason: e.message,
            }),
        }
    }

    fn live_matches(&self, content: &[u8]) -> Result<bool, OrchestratorError> {
        Ok(read_optional(&self.live_path())?
            .map(|live| checksum(&live) == checksum(content))
            .unwrap_or(false))
    }

    /// Copy the live file into the backup slot, once per run
    fn snapshot(&mut self) -> Result<(), OrchestratorError> {
        if self.backup != BackupSlot::NotTaken {
            return Ok(());
        }

        let backup = self.backup_path();
        match read_optional(&self.live_path())? {
            Some(live) => {
                let mut temp = self.temp_file()?;
                std::io::Write::write_all(&mut temp, &live)
                    .and_then(|_| temp.as_file().sync_all())
                    .map_err(|e| OrchestratorError::io(temp.path(), e))?;
                temp.persist(&backup)
                    .map_err(|e| OrchestratorError::io(&backup, e.error))?;
                info!(backup = %backup.display(), "Backed up live configuration");
                self.backup = BackupSlot::Saved(backup);
            }
            None => {
                // A stale backup from an earlier run must not be restored into this one
                if let Err(e) = fs::remove_file(&backup) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(OrchestratorError::io(&backup, e));
                    }
                }
                debug!("No live configuration to back up");
                self.backup = BackupSlot::Empty;
            }
        }
        Ok(())
    }

    fn temp_file(&self) -> Result<tempfile::NamedTempFile, OrchestratorError> {
        tempfile::Builder::new()
            .prefix(".active.conf.")
            .suffix(".tmp")
            .tempfile_in(&self.config_dir)
            .map_err(|e| OrchestratorError::io(&self.config_dir, e))
    }

    /// Write `content` to a temp file, have the proxy test it, then rename it live
    async fn install(&self, content: &[u8], permissions_from: Option<&Path>) -> Result<(), OrchestratorError> {
        let live = self.live_path();
        let mut temp = self.temp_file()?;
        std::io::Write::write_all(&mut temp, content)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|e| OrchestratorError::io(temp.path(), e))?;

        // Temp files are created 0600; the proxy may read as another user
        let reference = permissions_from.map(Path::to_path_buf).unwrap_or_else(|| live.clone());
        if let Ok(meta) = fs::metadata(&reference) {
            fs::set_permissions(temp.path(), meta.permissions())
                .map_err(|e| OrchestratorError::io(temp.path(), e))?;
        }

        self.proxy
            .test_config(temp.path())
            .await
            .map_err(|e| OrchestratorError::ConfigWrite {
                path: live.clone(),
                reason: e.to_string(),
            })?;

        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }

        temp.persist(&live).map_err(|e| OrchestratorError::ConfigWrite {
            path: live.clone(),
            reason: format!("atomic rename failed: {}", e.error),
        })?;
        Ok(())
    }
}
