use crate::cli::{Args, ConversationsCommand};
use crate::config::Config;
use crate::descriptor::{self, Mode};
use crate::model::{AttachedFile, Conversation};
use crate::request::{self, Bindings};
use crate::session::{CompletionController, Handled, ProviderProfile, SessionStatus, SAVE_FAILED};
use crate::store::{ConversationStore, JsonFileStore};
use crate::stream::HttpTransport;
use crate::{paths, providers};
use anyhow::Context;
use base64::Engine;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stream one reply for `prompt` and save the conversation.
pub async fn cmd_chat(http: &reqwest::Client, cfg: &Config, args: &Args, prompt: &str) -> anyhow::Result<()> {
    let (entry, descriptor) = providers::load()?.resolve(
        Mode::Completion,
        args.provider.as_deref().or(cfg.provider.as_deref()),
    )?;

    let mut attachments = read_attachments(&args.images, cfg.max_files)?;
    if !attachments.is_empty() && !descriptor::supports_images(&descriptor) {
        tracing::warn!(provider = %entry.id, "provider takes no images; attachments ignored");
        attachments.clear();
    }

    let profile = ProviderProfile {
        descriptor: Arc::new(descriptor),
        system_prompt: Some(args.system.clone().unwrap_or_else(|| cfg.system_prompt.clone())),
        variables: cfg.variables_with(&args.vars),
    };

    let conversation_id = args.conversation.clone().unwrap_or_else(new_conversation_id);
    let store = Arc::new(JsonFileStore::new(paths::conversations_dir()?));
    let transport = Arc::new(HttpTransport::new(http.clone()));
    let (mut ctl, mut events) = CompletionController::open(&conversation_id, store, transport, profile)
        .await
        .with_context(|| format!("failed to open conversation {conversation_id}"))?;

    ctl.submit(prompt, &attachments)?;
    for warning in &ctl.subscribe().borrow().warnings {
        eprintln!("warning: {warning}");
    }

    let mut out = std::io::stdout();
    while ctl.is_busy() {
        let Some(event) = events.recv().await else { break };
        if let Handled::Delta(text) = ctl.handle(event).await {
            if entry.streaming {
                write!(out, "{text}").ok();
                out.flush().ok();
            }
        }
    }

    if !entry.streaming {
        if let Some(session) = ctl.session() {
            write!(out, "{}", session.accumulated_text).ok();
        }
    }
    writeln!(out).ok();

    let status = ctl.subscribe().borrow().status;
    if status == Some(SessionStatus::Failed) {
        let msg = ctl.error().unwrap_or("request failed").to_string();
        if msg != SAVE_FAILED {
            anyhow::bail!(msg);
        }
        tracing::warn!("retrying save once");
        ctl.retry_save().await.context(SAVE_FAILED)?;
    }

    eprintln!("conversation: {}", ctl.conversation().id);
    Ok(())
}

/// Send an audio file to a transcription provider and print the text.
pub async fn cmd_transcribe(
    http: &reqwest::Client,
    cfg: &Config,
    file: &Path,
    provider: Option<&str>,
) -> anyhow::Result<()> {
    let (_, descriptor) = providers::load()?.resolve(
        Mode::Transcription,
        provider.or(cfg.stt_provider.as_deref()),
    )?;

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read audio: {}", file.display()))?;

    let bindings = Bindings {
        system_prompt: Some(cfg.system_prompt.clone()),
        audio: Some(base64::engine::general_purpose::STANDARD.encode(&bytes)),
        variables: cfg.stt_variables.clone(),
        ..Default::default()
    };
    let req = request::build(&descriptor, &bindings).map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let text = HttpTransport::new(http.clone())
        .complete(req)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    println!("{}", text.trim());
    Ok(())
}

pub async fn cmd_conversations(cmd: ConversationsCommand) -> anyhow::Result<()> {
    let store = JsonFileStore::new(paths::conversations_dir()?);
    match cmd {
        ConversationsCommand::List => {
            let all = store.list().await.context("failed to list conversations")?;
            if all.is_empty() {
                println!("(no conversations)");
                return Ok(());
            }
            for c in &all {
                println!("{}\t{}\t{}", c.id, format_time(c.updated_at), c.title);
            }
            Ok(())
        }
        ConversationsCommand::Show { id } => {
            let c = store
                .get_by_id(&id)
                .await
                .with_context(|| format!("failed to read conversation {id}"))?
                .with_context(|| format!("no such conversation: {id}"))?;
            print!("{}", render_transcript(&c));
            Ok(())
        }
    }
}

pub fn new_conversation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Read image files as attachments, refusing more than `max_files`.
pub fn read_attachments(paths: &[PathBuf], max_files: usize) -> anyhow::Result<Vec<AttachedFile>> {
    if paths.len() > max_files {
        anyhow::bail!("too many attachments: {} (max {max_files})", paths.len());
    }
    paths.iter().map(|p| read_attachment(p)).collect()
}

pub fn read_attachment(path: &Path) -> anyhow::Result<AttachedFile> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read attachment: {}", path.display()))?;
    let mime_type = mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Ok(AttachedFile {
        id: uuid::Uuid::new_v4().simple().to_string(),
        name,
        mime_type,
        size: bytes.len() as u64,
        payload: base64::engine::general_purpose::STANDARD.encode(&bytes),
    })
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn render_transcript(c: &Conversation) -> String {
    let mut out = format!("# {}\n", c.title);
    for m in &c.messages {
        out.push_str(&format!("\n[{}] {}\n", m.role.as_str(), m.content));
    }
    out
}
