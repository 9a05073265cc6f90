//! The provider list (`providers.json` in the state dir) and the
//! `providers` subcommands.

use crate::cli::ProvidersCommand;
use crate::config::Config;
use crate::descriptor::{self, compile, Mode, Placeholder, ProviderDescriptor};
use crate::paths;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub curl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_content_path: Option<String>,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
}

fn default_streaming() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub completion: Vec<ProviderEntry>,
    #[serde(default)]
    pub transcription: Vec<ProviderEntry>,
}

impl ProvidersFile {
    pub fn entries(&self, mode: Mode) -> &[ProviderEntry] {
        match mode {
            Mode::Completion => &self.completion,
            Mode::Transcription => &self.transcription,
        }
    }

    fn entries_mut(&mut self, mode: Mode) -> &mut Vec<ProviderEntry> {
        match mode {
            Mode::Completion => &mut self.completion,
            Mode::Transcription => &mut self.transcription,
        }
    }

    /// Compile every entry for `mode`. Entries that fail to compile are
    /// logged and left out; the rest stay usable.
    pub fn compile_all(&self, mode: Mode) -> Vec<(&ProviderEntry, ProviderDescriptor)> {
        self.entries(mode)
            .iter()
            .filter_map(|entry| match compile_entry(entry, mode) {
                Ok(d) => {
                    if mode == Mode::Completion
                        && !d.references(&Placeholder::Text)
                        && !d.references(&Placeholder::History)
                    {
                        tracing::warn!(id = %entry.id, "provider sends neither {{{{TEXT}}}} nor {{{{HISTORY}}}}");
                    }
                    Some((entry, d))
                }
                Err(e) => {
                    tracing::warn!(id = %entry.id, error = %e, "dropping invalid provider");
                    None
                }
            })
            .collect()
    }

    /// The provider named `id`, or the first usable one.
    pub fn resolve(&self, mode: Mode, id: Option<&str>) -> anyhow::Result<(ProviderEntry, ProviderDescriptor)> {
        let mut usable = self.compile_all(mode).into_iter();
        let found = match id {
            Some(id) => usable.find(|(e, _)| e.id == id),
            None => usable.next(),
        };
        match (found, id) {
            (Some((entry, d)), _) => Ok((entry.clone(), d)),
            (None, Some(id)) => anyhow::bail!("no usable {} provider named {id:?}", mode_name(mode)),
            (None, None) => anyhow::bail!(
                "no {} provider configured (add one with `chatwire providers add`)",
                mode_name(mode)
            ),
        }
    }
}

fn compile_entry(entry: &ProviderEntry, mode: Mode) -> Result<ProviderDescriptor, crate::error::CompileError> {
    Ok(compile(&entry.id, &entry.curl, mode)?.with_content_path(entry.response_content_path.clone()))
}

fn mode_name(mode: Mode) -> &'static str {
    match mode {
        Mode::Completion => "completion",
        Mode::Transcription => "transcription",
    }
}

fn mode_for(stt: bool) -> Mode {
    if stt {
        Mode::Transcription
    } else {
        Mode::Completion
    }
}

pub fn cmd_providers(cmd: ProvidersCommand, config: &Config) -> anyhow::Result<()> {
    let path = paths::providers_path()?;
    match cmd {
        ProvidersCommand::Add {
            id,
            curl,
            stt,
            content_path,
            no_stream,
        } => {
            let mode = mode_for(stt);
            let mut file = load_from(&path)?;
            let entry = ProviderEntry {
                id,
                curl,
                response_content_path: content_path,
                streaming: !no_stream,
            };
            add(&mut file, mode, entry)?;
            save_to(&path, &file)?;
            Ok(())
        }
        ProvidersCommand::List => {
            let file = load_from(&path)?;
            if file.completion.is_empty() && file.transcription.is_empty() {
                println!("(no providers configured)");
                return Ok(());
            }
            for mode in [Mode::Completion, Mode::Transcription] {
                for entry in file.entries(mode) {
                    let status = match compile_entry(entry, mode) {
                        Ok(_) => "ok".to_string(),
                        Err(e) => format!("invalid: {e}"),
                    };
                    println!("{}\t{}\t{}", mode_name(mode), entry.id, status);
                }
            }
            Ok(())
        }
        ProvidersCommand::Remove { id, stt } => {
            let mut file = load_from(&path)?;
            remove(&mut file, mode_for(stt), &id)?;
            save_to(&path, &file)?;
            Ok(())
        }
        ProvidersCommand::Show { id, stt } => {
            let mode = mode_for(stt);
            let file = load_from(&path)?;
            let entry = file
                .entries(mode)
                .iter()
                .find(|e| e.id == id)
                .with_context(|| format!("no such provider: {id}"))?;
            let d = compile_entry(entry, mode).with_context(|| format!("provider {id} is invalid"))?;

            let vars = match mode {
                Mode::Completion => &config.variables,
                Mode::Transcription => &config.stt_variables,
            };
            println!("id:           {}", d.id);
            println!("mode:         {}", mode_name(mode));
            println!("method:       {}", d.method);
            println!("streaming:    {}", entry.streaming);
            println!("images:       {}", descriptor::supports_images(&d));
            if let Some(p) = &d.content_path {
                println!("content path: {p}");
            }
            let placeholders: Vec<String> = d.placeholders.iter().map(|p| p.to_string()).collect();
            println!("placeholders: {}", placeholders.join(" "));
            for name in d.variables() {
                let state = if vars.contains_key(name) { "set" } else { "missing" };
                println!("  {name}: {state}");
            }
            println!("curl:         {}", entry.curl);
            Ok(())
        }
    }
}

/// Append `entry`, refusing duplicates and descriptions that do not compile.
fn add(file: &mut ProvidersFile, mode: Mode, entry: ProviderEntry) -> anyhow::Result<()> {
    if file.entries(mode).iter().any(|e| e.id == entry.id) {
        anyhow::bail!("provider already exists: {}", entry.id);
    }
    compile_entry(&entry, mode).with_context(|| format!("provider {} does not compile", entry.id))?;
    file.entries_mut(mode).push(entry);
    Ok(())
}

fn remove(file: &mut ProvidersFile, mode: Mode, id: &str) -> anyhow::Result<()> {
    let entries = file.entries_mut(mode);
    let before = entries.len();
    entries.retain(|e| e.id != id);
    if entries.len() == before {
        anyhow::bail!("no such provider: {id}");
    }
    Ok(())
}

pub fn load() -> anyhow::Result<ProvidersFile> {
    load_from(&paths::providers_path()?)
}

pub fn load_from(path: &Path) -> anyhow::Result<ProvidersFile> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ProvidersFile::default()),
        Err(e) => {
            return Err(anyhow::Error::new(e))
                .with_context(|| format!("failed to read providers file: {}", path.display()))
        }
    };

    let parsed: ProvidersFile = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse JSON: {}", path.display()))?;
    Ok(parsed)
}

pub fn save_to(path: &Path, file: &ProvidersFile) -> anyhow::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create state dir: {}", dir.display()))?;

    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec_pretty(file).context("failed to encode JSON")?;
    std::fs::write(&tmp, bytes).with_context(|| format!("failed to write: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace: {}", path.display()))?;
    Ok(())
}
