//! Hot reload of the gateway configuration
//!
//! notify callbacks run on their own OS thread, so the watcher keeps them
//! minimal: a coalesced change signal crosses a channel and everything else
//! (settle delay, file I/O, validation, the per-device diff) happens on the
//! async side. Edits that fail validation are logged and skipped; the
//! running config stays in force.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppConfig;

/// Settle time after a change signal; editors often write a file in
/// several chunks.
const SETTLE: Duration = Duration::from_millis(100);

/// A validated config change, diffed per device against the one it replaces
#[derive(Debug)]
pub struct ConfigUpdate {
    pub config: AppConfig,
    /// Device ids present now but not before
    pub added: Vec<String>,
    /// Device ids that disappeared
    pub removed: Vec<String>,
    /// Device ids whose entry changed in place (tuning, addressing, blend)
    pub changed: Vec<String>,
}

pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    signals: mpsc::Receiver<()>,
    path: String,
    current: AppConfig,
}

impl ConfigWatcher {
    /// Load the config and start watching the file for edits.
    pub async fn new(path: String) -> Result<(Self, AppConfig)> {
        let current = AppConfig::load(&path)
            .await
            .context("Failed to load initial config")?;

        // Capacity 1: a full channel means a reload is already pending, and
        // one reload picks up any number of edits.
        let (tx, signals) = mpsc::channel(1);
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) if matches!(event.kind, EventKind::Modify(_)) => {
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(e) => warn!("Config watch error: {}", e),
            })?;
        watcher
            .watch(Path::new(&path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", path))?;

        info!("Config hot reload active for: {}", path);

        let initial = current.clone();
        Ok((
            Self {
                _watcher: watcher,
                signals,
                path,
                current,
            },
            initial,
        ))
    }

    /// Wait for the next edit that parses and validates.
    ///
    /// Returns `None` once the watch channel is gone. Touches that leave the
    /// config identical are skipped silently.
    pub async fn next_update(&mut self) -> Option<ConfigUpdate> {
        loop {
            self.signals.recv().await?;
            tokio::time::sleep(SETTLE).await;
            while self.signals.try_recv().is_ok() {}

            match AppConfig::load(&self.path).await {
                Ok(next) => {
                    if next == self.current {
                        debug!("Config file touched but unchanged");
                        continue;
                    }
                    let (added, removed, changed) = diff_devices(&self.current, &next);
                    info!(
                        added = added.len(),
                        removed = removed.len(),
                        changed = changed.len(),
                        "Configuration change accepted"
                    );
                    self.current = next.clone();
                    return Some(ConfigUpdate {
                        config: next,
                        added,
                        removed,
                        changed,
                    });
                }
                Err(e) => {
                    warn!("Rejected config edit (keeping the running config): {}", e);
                }
            }
        }
    }
}

fn diff_devices(old: &AppConfig, new: &AppConfig) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut added = Vec::new();
    let mut changed = Vec::new();
    for device in &new.devices {
        match old.devices.iter().find(|d| d.id == device.id) {
            None => added.push(device.id.clone()),
            Some(previous) if previous != device => changed.push(device.id.clone()),
            Some(_) => {}
        }
    }
    let removed = old
        .devices
        .iter()
        .filter(|d| !new.devices.iter().any(|n| n.id == d.id))
        .map(|d| d.id.clone())
        .collect();
    (added, removed, changed)
}
