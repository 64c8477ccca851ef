use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: Option<PathBuf>,
    pub server_addr: String,
    pub idle_backoff_secs: u64,
    pub startup_grace_secs: u64,
    pub stagger_secs: u64,
    pub segment_budget: usize,
    pub max_new_tokens: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            server_addr: "127.0.0.1:8601".to_string(),
            idle_backoff_secs: 60,
            startup_grace_secs: 10,
            stagger_secs: 1,
            segment_budget: 500,
            max_new_tokens: 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    storage: Option<StorageSettings>,
    server: Option<ServerSettings>,
    worker: Option<WorkerSettings>,
    translate: Option<TranslateSettings>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageSettings {
    data_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSettings {
    addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerSettings {
    idle_backoff_secs: Option<u64>,
    startup_grace_secs: Option<u64>,
    stagger_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TranslateSettings {
    segment_budget: Option<usize>,
    max_new_tokens: Option<u32>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: SettingsFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            settings.merge(parsed);
        }
    }

    Ok(settings)
}

impl Settings {
    fn merge(&mut self, incoming: SettingsFile) {
        if let Some(storage) = incoming.storage
            && let Some(data_dir) = storage.data_dir
            && !data_dir.trim().is_empty()
        {
            self.data_dir = Some(PathBuf::from(data_dir));
        }
        if let Some(server) = incoming.server
            && let Some(addr) = server.addr
            && !addr.trim().is_empty()
        {
            self.server_addr = addr;
        }
        if let Some(worker) = incoming.worker {
            if let Some(secs) = worker.idle_backoff_secs {
                self.idle_backoff_secs = secs;
            }
            if let Some(secs) = worker.startup_grace_secs {
                self.startup_grace_secs = secs;
            }
            if let Some(secs) = worker.stagger_secs {
                self.stagger_secs = secs;
            }
        }
        if let Some(translate) = incoming.translate {
            if let Some(budget) = translate.segment_budget
                && budget > 0
            {
                self.segment_budget = budget;
            }
            if let Some(tokens) = translate.max_new_tokens
                && tokens > 0
            {
                self.max_new_tokens = tokens;
            }
        }
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".novel-translator"))
        }
    })
}
