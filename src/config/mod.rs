//! Config reader. Loads YAML config files and resolves dot-separated keys.
//!
//! Reads `.drover.yml` (project, current directory) and
//! `~/.drover/config.yml` (global). Project config overrides global config
//! for the same key.
//!
//! - In-memory cache: parsed YAML is cached per file
//! - File watching: a `notify` watcher invalidates the cache on change
//! - Change notifications: [`subscribe`] yields the path of a changed file
//!
//! Typed worker/manager settings built on top of these lookups live in
//! [`settings`].

pub mod settings;

pub use settings::{ManagerSettings, OracleSettings, WorkerMode, WorkerSettings};

use anyhow::Context;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

const PROJECT_FILE: &str = ".drover.yml";
const GLOBAL_FILE: &str = "config.yml";

/// Parsed YAML per file.
static CACHE: LazyLock<RwLock<HashMap<PathBuf, serde_yml::Value>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Files registered with the watcher.
static WATCHED: LazyLock<RwLock<HashSet<PathBuf>>> =
    LazyLock::new(|| RwLock::new(HashSet::new()));

/// Global file watcher instance (started on first use).
static FILE_WATCHER: LazyLock<Mutex<Option<RecommendedWatcher>>> =
    LazyLock::new(|| Mutex::new(None));

static CHANGE_TX: LazyLock<broadcast::Sender<PathBuf>> = LazyLock::new(|| {
    let (tx, _) = broadcast::channel(16);
    tx
});

/// Subscribe to config change notifications.
pub fn subscribe() -> broadcast::Receiver<PathBuf> {
    CHANGE_TX.subscribe()
}

/// Drop the cached copy of a file and notify subscribers.
fn invalidate_cache(path: &Path) {
    if let Ok(mut cache) = CACHE.write() {
        cache.remove(path);
        tracing::debug!(path = %path.display(), "config cache invalidated");
    }
    // no receivers is fine
    let _ = CHANGE_TX.send(path.to_path_buf());
}

fn ensure_watcher() {
    let Ok(mut guard) = FILE_WATCHER.lock() else {
        return;
    };
    if guard.is_some() {
        return;
    }

    let watcher = RecommendedWatcher::new(
        |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                for path in event.paths {
                    let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if filename == GLOBAL_FILE || filename == PROJECT_FILE {
                        invalidate_cache(&path);
                    }
                }
            }
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    );

    match watcher {
        Ok(w) => *guard = Some(w),
        Err(e) => tracing::warn!(?e, "config file watcher unavailable, hot reload disabled"),
    }
}

fn watch_file(path: &Path) {
    ensure_watcher();

    if let Ok(mut watched) = WATCHED.write() {
        if watched.insert(path.to_path_buf()) {
            if let Ok(mut guard) = FILE_WATCHER.lock() {
                if let Some(watcher) = guard.as_mut() {
                    if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                        tracing::debug!(path = %path.display(), ?e, "cannot watch config file");
                    } else {
                        tracing::debug!(path = %path.display(), "watching config file");
                    }
                }
            }
        }
    }
}

fn config_files() -> Vec<PathBuf> {
    let mut files = vec![PathBuf::from(PROJECT_FILE)];
    if let Ok(global) = crate::home::config_path() {
        files.push(global);
    }
    files
}

/// Raw YAML value for a dot-separated key, project config first.
fn lookup(key: &str) -> Option<serde_yml::Value> {
    config_files()
        .into_iter()
        .filter(|p| p.exists())
        .find_map(|p| match load(&p) {
            Ok(root) => find_value(&root, key).cloned(),
            Err(e) => {
                tracing::warn!(path = %p.display(), ?e, "ignoring unreadable config file");
                None
            }
        })
}

/// Get a config value by dot-separated key (e.g. "worker.oracle.model"),
/// rendered as a string.
pub fn get(key: &str) -> anyhow::Result<String> {
    match lookup(key) {
        Some(v) => render(&v),
        None => anyhow::bail!("config key not found: {key}"),
    }
}

pub fn get_u64(key: &str) -> Option<u64> {
    get(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a file (through the cache) and start watching it.
fn load(path: &Path) -> anyhow::Result<serde_yml::Value> {
    watch_file(path);

    if let Ok(cache) = CACHE.read() {
        if let Some(cached) = cache.get(path) {
            return Ok(cached.clone());
        }
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let parsed: serde_yml::Value =
        serde_yml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

    if let Ok(mut cache) = CACHE.write() {
        cache.insert(path.to_path_buf(), parsed.clone());
    }
    Ok(parsed)
}

fn find_value<'a>(root: &'a serde_yml::Value, key: &str) -> Option<&'a serde_yml::Value> {
    let mut current = root;
    for part in key.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn render(value: &serde_yml::Value) -> anyhow::Result<String> {
    Ok(match value {
        serde_yml::Value::String(s) => s.clone(),
        serde_yml::Value::Number(n) => n.to_string(),
        serde_yml::Value::Bool(b) => b.to_string(),
        serde_yml::Value::Null => String::new(),
        other => serde_yml::to_string(other)?,
    })
}

/// Split a comma-separated list, trimming blanks.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Default repository (`repo` key).
pub fn repo() -> Option<String> {
    get("repo").ok().filter(|r| !r.trim().is_empty())
}

/// GitHub credential: `GH_TOKEN`, then `GITHUB_TOKEN`, then `gh auth token`.
pub fn github_token() -> anyhow::Result<String> {
    for var in ["GH_TOKEN", "GITHUB_TOKEN"] {
        if let Ok(t) = std::env::var(var) {
            if !t.trim().is_empty() {
                return Ok(t.trim().to_string());
            }
        }
    }
    if let Ok(gh) = which::which("gh") {
        if let Ok(out) = std::process::Command::new(gh).args(["auth", "token"]).output() {
            let token = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if out.status.success() && !token.is_empty() {
                return Ok(token);
            }
        }
    }
    anyhow::bail!("no GitHub token found: set GH_TOKEN, GITHUB_TOKEN, or run `gh auth login`")
}
