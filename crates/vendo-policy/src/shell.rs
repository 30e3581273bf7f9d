//! Subprocess-shelling `PacketPolicy` adapter.
//!
//! Each operation invokes a small external enforcement binary (an nftables
//! or ipset front-end, depending on deployment) as a one-shot subprocess
//! and interprets its exit status and stdout. Every call is bounded by a
//! deadline so a hung enforcement command can never stall the Ticker.

use crate::{class_id_for_ip, Counter, PacketPolicy, PolicyError, PolicyResult, TrafficSample};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Tunables for [`ShellPacketPolicy`].
#[derive(Debug, Clone)]
pub struct ShellPolicyConfig {
    /// Path to the enforcement helper binary.
    pub binary: String,
    /// Deadline for authorize/deauthorize/sample/list probes.
    pub probe_deadline: Duration,
    /// Deadline for set/remove-limit rewrites (typically slower: they
    /// rewrite shaping rules rather than just querying state).
    pub rewrite_deadline: Duration,
}

impl ShellPolicyConfig {
    pub fn new(binary: impl Into<String>, probe_deadline_ms: u64, rewrite_deadline_ms: u64) -> Self {
        Self {
            binary: binary.into(),
            probe_deadline: Duration::from_millis(probe_deadline_ms),
            rewrite_deadline: Duration::from_millis(rewrite_deadline_ms),
        }
    }
}

/// Shells out to the configured enforcement binary for every operation.
pub struct ShellPacketPolicy {
    config: ShellPolicyConfig,
}

impl ShellPacketPolicy {
    pub fn new(config: ShellPolicyConfig) -> Self {
        Self { config }
    }

    async fn run(&self, args: &[&str], deadline: Duration) -> PolicyResult<String> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args);
        cmd.kill_on_drop(true);

        let output = timeout(deadline, cmd.output())
            .await
            .map_err(|_| PolicyError::Timeout(deadline))?
            .map_err(PolicyError::SpawnFailed)?;

        if !output.status.success() {
            return Err(PolicyError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl PacketPolicy for ShellPacketPolicy {
    async fn authorize(&self, mac: &str) -> PolicyResult<()> {
        debug!(mac, "authorizing mac");
        self.run(&["authorize", mac], self.config.probe_deadline).await?;
        Ok(())
    }

    async fn deauthorize(&self, mac: &str) -> PolicyResult<()> {
        debug!(mac, "deauthorizing mac");
        self.run(&["deauthorize", mac], self.config.probe_deadline).await?;
        Ok(())
    }

    async fn set_limit(&self, ip: &str, down_kbps: i64, up_kbps: i64) -> PolicyResult<()> {
        debug!(ip, down_kbps, up_kbps, "setting rate limit");
        self.run(
            &["set-limit", ip, &down_kbps.to_string(), &up_kbps.to_string()],
            self.config.rewrite_deadline,
        )
        .await?;
        Ok(())
    }

    async fn remove_limit(&self, ip: &str) -> PolicyResult<()> {
        debug!(ip, "removing rate limit");
        self.run(&["remove-limit", ip], self.config.rewrite_deadline).await?;
        Ok(())
    }

    async fn sample_counters(&self) -> PolicyResult<TrafficSample> {
        let output = self.run(&["sample-counters"], self.config.probe_deadline).await?;
        parse_counters(&output)
    }

    async fn list_authorized_macs(&self) -> PolicyResult<Vec<String>> {
        let output = self.run(&["list-authorized"], self.config.probe_deadline).await?;
        Ok(output.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    async fn has_live_flows(&self, ip: &str) -> PolicyResult<bool> {
        match self.run(&["has-flows", ip], self.config.probe_deadline).await {
            Ok(out) => Ok(out.trim() == "1"),
            Err(PolicyError::CommandFailed { .. }) => {
                warn!(ip, "flow probe reported no flows via nonzero exit");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Parse `ip upload_bytes upload_idle_s download_bytes download_idle_s`
/// lines. Uploads are filed under the IP; downloads under the class-id
/// derived from the IP's last octet, since the wire format only ever
/// reports per-IP (the class-id split is this adapter's bookkeeping, not
/// the enforcement binary's).
fn parse_counters(output: &str) -> PolicyResult<TrafficSample> {
    let mut sample = TrafficSample::default();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let ip = fields
            .next()
            .ok_or_else(|| PolicyError::ParseFailed(line.to_string()))?;
        let upload: u64 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PolicyError::ParseFailed(line.to_string()))?;
        let upload_idle: i64 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PolicyError::ParseFailed(line.to_string()))?;
        let download: u64 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PolicyError::ParseFailed(line.to_string()))?;
        let download_idle: i64 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PolicyError::ParseFailed(line.to_string()))?;

        sample.uploads.insert(ip.to_string(), Counter { bytes: upload, idle_seconds: upload_idle });
        if let Some(class_id) = class_id_for_ip(ip) {
            sample.downloads.insert(class_id, Counter { bytes: download, idle_seconds: download_idle });
        }
    }
    Ok(sample)
}
