//! Command line, config file and environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

/// Interactive MessageU client.
#[derive(Debug, Parser)]
#[command(name = "msgu", about = "MessageU end-to-end encrypted messaging client")]
#[command(version)]
pub struct Cli {
    /// Path to a config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server address override (host:port).
    #[arg(long)]
    pub server: Option<String>,

    /// Identity file override.
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Client configuration. File: ~/.config/msgu/config.toml or /etc/msgu/config.toml.
/// Env overrides: MSGU_SERVER, MSGU_IDENTITY_PATH, MSGU_DOWNLOAD_DIR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server address (default 127.0.0.1:1357).
    #[serde(default = "default_server")]
    pub server: String,
    /// Local identity file (default me.info).
    #[serde(default = "default_identity_path")]
    pub identity_path: PathBuf,
    /// Where received files are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Largest variable-length response body accepted.
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u32,
}

fn default_server() -> String {
    "127.0.0.1:1357".into()
}
fn default_identity_path() -> PathBuf {
    PathBuf::from("me.info")
}
fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("msgu")
}
fn default_max_response_bytes() -> u32 {
    msgu_core::transport::DEFAULT_MAX_RESPONSE_LEN
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            identity_path: default_identity_path(),
            download_dir: default_download_dir(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

/// Load config: defaults, then config file (explicit or first found), then env, then flags.
pub fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut c = match &cli.config {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    if let Some(s) = &cli.server {
        c.server = s.clone();
    }
    if let Some(p) = &cli.identity {
        c.identity_path = p.clone();
    }
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MSGU_SERVER").filter(|s| !s.is_empty()) {
        c.server = s;
    }
    if let Some(s) = var("MSGU_IDENTITY_PATH").filter(|s| !s.is_empty()) {
        c.identity_path = PathBuf::from(s);
    }
    if let Some(s) = var("MSGU_DOWNLOAD_DIR").filter(|s| !s.is_empty()) {
        c.download_dir = PathBuf::from(s);
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/msgu/config.toml"));
    }
    out.push(PathBuf::from("/etc/msgu/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}
