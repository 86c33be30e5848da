//! Filesystem watching and reload debouncing.
//!
//! Raw notify events are matched against the configured rule-set globs and
//! folded into a sliding debounce window, so a burst of writes produces one
//! reload per rule-set. Watcher setup failure degrades the supervisor to
//! no-reload operation instead of aborting it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::errors::{Result, SupervisorError};
use crate::registry::ServiceRegistry;
use crate::supervisor::Signal;

/// Quiet period required after the last relevant change before reloads fire.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Compiled rule-set globs, name-sorted.
#[derive(Debug)]
pub struct WatchRules {
    sets: Vec<(String, GlobSet)>,
}

impl WatchRules {
    pub fn compile(rules: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut sets = Vec::with_capacity(rules.len());
        for (name, patterns) in rules {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                let normalized = pattern.strip_prefix("./").unwrap_or(pattern);
                let glob = Glob::new(normalized).map_err(|e| {
                    SupervisorError::ConfigInvalid(format!(
                        "rule-set '{}': invalid glob '{}': {}",
                        name, pattern, e
                    ))
                })?;
                builder.add(glob);
            }
            let set = builder.build().map_err(|e| {
                SupervisorError::ConfigInvalid(format!("rule-set '{}': {}", name, e))
            })?;
            sets.push((name.clone(), set));
        }
        Ok(Self { sets })
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Rule-set names whose globs match `path`. Notify reports absolute
    /// paths while globs are usually workspace-relative, so the path is
    /// also tried relative to the current directory.
    pub fn matching(&self, path: &Path) -> Vec<&str> {
        let relative = std::env::current_dir()
            .ok()
            .and_then(|cwd| path.strip_prefix(cwd).ok().map(Path::to_path_buf));
        self.sets
            .iter()
            .filter(|(_, set)| {
                set.is_match(path)
                    || relative.as_deref().map(|r| set.is_match(r)).unwrap_or(false)
            })
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Literal directory prefixes of all patterns, for watcher registration.
    pub fn roots(&self, rules: &BTreeMap<String, Vec<String>>) -> Vec<PathBuf> {
        let mut roots = BTreeSet::new();
        for patterns in rules.values() {
            for pattern in patterns {
                roots.insert(literal_prefix(pattern));
            }
        }
        roots.into_iter().collect()
    }
}

/// Directory part of a glob up to its first metacharacter.
fn literal_prefix(pattern: &str) -> PathBuf {
    let pattern = pattern.strip_prefix("./").unwrap_or(pattern);
    let mut prefix = if pattern.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for component in pattern.split('/').filter(|c| !c.is_empty()) {
        if component.contains(|c| matches!(c, '*' | '?' | '[' | '{')) {
            break;
        }
        prefix.push(component);
    }
    // The final component of a fully literal pattern is a file name.
    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else if prefix == Path::new(pattern) {
        prefix
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."))
    } else {
        prefix
    }
}

/// Sliding-window accumulator of touched rule-sets. The deadline resets on
/// every note, so reloads wait for the burst to settle.
pub struct Debounce {
    window: Duration,
    pending: BTreeSet<String>,
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeSet::new(),
            deadline: None,
        }
    }

    pub fn note(&mut self, rule_set: &str) {
        self.pending.insert(rule_set.to_string());
        self.deadline = Some(Instant::now() + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the accumulated rule-sets, name-ordered, and go idle.
    pub fn flush(&mut self) -> Vec<String> {
        self.deadline = None;
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Start watching the configured roots. Returns an error when the platform
/// watcher cannot be created; the caller decides whether that is fatal.
pub fn spawn_watcher(
    registry: std::sync::Arc<ServiceRegistry>,
    tx: mpsc::Sender<Signal>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let rules = WatchRules::compile(registry.watch_rules())?;
    let roots = rules.roots(registry.watch_rules());

    let (raw_tx, raw_rx) = std::sync::mpsc::channel::<notify::Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(e) => warn!("watch error: {}", e),
        }
    })
    .map_err(|e| SupervisorError::WatcherDegraded(e.to_string()))?;

    for root in &roots {
        if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
            // A missing directory only disables that root.
            warn!("cannot watch {}: {}", root.display(), e);
        }
    }
    debug!("watching {} root(s) for changes", roots.len());

    // Bridge the synchronous notify channel into the async world. The
    // watcher moves into the blocking task so it stays alive with it.
    let (event_tx, mut event_rx) = mpsc::channel::<notify::Event>(256);
    tokio::task::spawn_blocking(move || {
        let _watcher = watcher;
        while let Ok(event) = raw_rx.recv() {
            if event_tx.blocking_send(event).is_err() {
                return;
            }
        }
    });

    let handle = tokio::spawn(async move {
        let mut debounce = Debounce::new(DEBOUNCE_WINDOW);
        loop {
            let deadline = debounce.deadline();
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else {
                        // The bridge only closes when the platform watcher
                        // itself is gone.
                        let _ = tx.send(Signal::WatcherDegraded {
                            detail: "watch backend stopped delivering events".to_string(),
                        }).await;
                        return;
                    };
                    if !is_relevant(&event.kind) {
                        continue;
                    }
                    for path in &event.paths {
                        for rule_set in rules.matching(path) {
                            trace!("{} touched rule-set '{}'", path.display(), rule_set);
                            debounce.note(rule_set);
                        }
                    }
                }
                _ = sleep_until_or_forever(deadline) => {
                    for rule_set in debounce.flush() {
                        for service in registry.reload_targets(&rule_set) {
                            let event = Signal::Reload {
                                service,
                                rule_set: rule_set.clone(),
                            };
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    debug!("file watcher shutting down");
                    return;
                }
            }
        }
    });
    Ok(handle)
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
