use anyhow::Context;
use std::env;
use std::path::{Path, PathBuf};

fn home_dir() -> anyhow::Result<PathBuf> {
    // On Unix, HOME is standard.
    let home = env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home))
}

fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

fn chatwire_home() -> Option<PathBuf> {
    env::var_os("CHATWIRE_HOME").map(PathBuf::from)
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = chatwire_home() {
        return ensure_dir(&base.join("config"));
    }

    if let Some(xdg) = env::var_os("XDG_CONFIG_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join("chatwire"));
    }

    ensure_dir(&home_dir()?.join(".config").join("chatwire"))
}

pub fn state_dir() -> anyhow::Result<PathBuf> {
    if let Some(base) = chatwire_home() {
        return ensure_dir(&base.join("state"));
    }

    if let Some(xdg) = env::var_os("XDG_STATE_HOME").map(PathBuf::from) {
        return ensure_dir(&xdg.join("chatwire"));
    }

    ensure_dir(&home_dir()?.join(".local").join("state").join("chatwire"))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn providers_path() -> anyhow::Result<PathBuf> {
    Ok(state_dir()?.join("providers.json"))
}

pub fn conversations_dir() -> anyhow::Result<PathBuf> {
    ensure_dir(&state_dir()?.join("conversations"))
}
