//! Configuration file watcher for hot reload.
//!
//! Editors usually fire several modify/create events for one save, so events
//! are collected until the file has been quiet for the debounce period before
//! it is reloaded. Only Outputs can change at runtime: a reload whose
//! `[[output]]` tables equal the last ones sent is not forwarded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::loader::load_config;
use crate::config::plugin::parse_output;
use crate::config::schema::{PluginTable, ReplayConfig};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Watches the configuration file and forwards validated Output changes.
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
    /// Output tables of the configuration the pipeline currently runs.
    last_outputs: Vec<PluginTable>,
    update_tx: mpsc::UnboundedSender<ReplayConfig>,
}

/// Output names that differ between two configurations.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OutputChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl OutputChanges {
    pub fn between(before: &[PluginTable], after: &[PluginTable]) -> Self {
        let before = by_name(before);
        let after = by_name(after);
        let mut changes = Self::default();
        for (name, table) in &after {
            match before.get(name) {
                None => changes.added.push(name.clone()),
                Some(old) if old != table => changes.changed.push(name.clone()),
                Some(_) => {}
            }
        }
        changes.removed = before
            .keys()
            .filter(|name| !after.contains_key(*name))
            .cloned()
            .collect();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

fn by_name(tables: &[PluginTable]) -> BTreeMap<String, &PluginTable> {
    tables
        .iter()
        .enumerate()
        .map(|(index, table)| {
            let name = parse_output(table)
                .map(|spec| spec.name(index))
                .unwrap_or_else(|_| format!("output[{index}]"));
            (name, table)
        })
        .collect()
}

impl ConfigWatcher {
    /// Create a watcher for `path`, whose running configuration is `current`.
    ///
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(
        path: &Path,
        current: &ReplayConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ReplayConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            debounce: DEFAULT_DEBOUNCE,
            last_outputs: current.outputs.clone(),
            update_tx,
        };
        (watcher, update_rx)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching the file. The returned watcher must be kept alive;
    /// dropping it stops the reload task.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    let _ = event_tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        info!(path = %self.path.display(), debounce_ms = self.debounce.as_millis() as u64, "config watcher started");
        tokio::spawn(self.forward(event_rx));
        Ok(watcher)
    }

    async fn forward(mut self, mut events: mpsc::UnboundedReceiver<()>) {
        while events.recv().await.is_some() {
            loop {
                match tokio::time::timeout(self.debounce, events.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }

            let config = match load_config(&self.path) {
                Ok(config) => config,
                Err(e) => {
                    error!(path = %self.path.display(), error = %e, "reload rejected, keeping current configuration");
                    continue;
                }
            };
            let changes = OutputChanges::between(&self.last_outputs, &config.outputs);
            if changes.is_empty() {
                debug!(path = %self.path.display(), "config saved without output changes");
                continue;
            }
            info!(
                added = ?changes.added,
                removed = ?changes.removed,
                changed = ?changes.changed,
                "output configuration changed"
            );
            self.last_outputs = config.outputs.clone();
            if self.update_tx.send(config).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_config;

    const BASE: &str = r#"
[[input]]
type = "file"
path = "capture.trpl"

[[output]]
type = "stdout"
name = "console"

[[output]]
type = "file"
name = "archive"
path = "out.trpl"
"#;

    fn outputs(toml: &str) -> Vec<PluginTable> {
        parse_config(toml).unwrap().outputs
    }

    #[test]
    fn names_added_removed_and_changed_outputs() {
        let after = r#"
[[input]]
type = "file"
path = "capture.trpl"

[[output]]
type = "stdout"
name = "console"
format = "json"

[[output]]
type = "http"
name = "staging"
target = "http://127.0.0.1:9000"
"#;
        let changes = OutputChanges::between(&outputs(BASE), &outputs(after));
        assert_eq!(changes.added, ["staging"]);
        assert_eq!(changes.removed, ["archive"]);
        assert_eq!(changes.changed, ["console"]);
    }

    #[test]
    fn reordering_is_not_a_change() {
        let mut reordered = outputs(BASE);
        reordered.reverse();
        assert!(OutputChanges::between(&outputs(BASE), &reordered).is_empty());
    }

    #[tokio::test]
    async fn bursts_of_events_reload_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.toml");
        std::fs::write(&path, BASE).unwrap();
        let current = parse_config(BASE).unwrap();

        let (watcher, mut reloads) = ConfigWatcher::new(&path, &current);
        let watcher = watcher.with_debounce(Duration::from_millis(50));
        let (events, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(watcher.forward(event_rx));

        // Input edits alone are not forwarded.
        std::fs::write(&path, BASE.replace("capture.trpl", "other.trpl")).unwrap();
        events.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(reloads.try_recv().is_err());

        let edited = BASE.replace("name = \"archive\"", "name = \"vault\"");
        std::fs::write(&path, &edited).unwrap();
        for _ in 0..4 {
            events.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let reloaded = tokio::time::timeout(Duration::from_secs(2), reloads.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.outputs, outputs(&edited));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(reloads.try_recv().is_err());
    }
}
