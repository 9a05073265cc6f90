use crate::config::parse_var;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Chat with any HTTP model API described by a curl command
#[derive(Debug, Parser)]
#[command(name = "chatwire")]
#[command(version)]
#[command(about = "Chat with any HTTP model API described by a curl command", long_about = None)]
pub struct Args {
    /// Completion provider id (default: config/provider or the first configured)
    #[arg(short = 'p', long = "provider")]
    pub provider: Option<String>,

    /// Conversation to continue (default: a new one)
    #[arg(short = 'c', long = "conversation", value_name = "ID")]
    pub conversation: Option<String>,

    /// Image to attach (repeatable)
    #[arg(short = 'i', long = "image", value_name = "PATH")]
    pub images: Vec<PathBuf>,

    /// System prompt for this request (default: config/system_prompt)
    #[arg(long = "system", value_name = "TEXT")]
    pub system: Option<String>,

    /// Placeholder value, e.g. --var MODEL=gpt-4o (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional) (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage provider descriptions
    Providers {
        #[command(subcommand)]
        cmd: ProvidersCommand,
    },

    /// Inspect saved conversations
    Conversations {
        #[command(subcommand)]
        cmd: ConversationsCommand,
    },

    /// Transcribe an audio file with a transcription provider
    Transcribe {
        /// Audio file
        file: PathBuf,
        /// Transcription provider id (default: config/stt_provider or the first configured)
        #[arg(long = "provider")]
        provider: Option<String>,
    },

    /// Run an interactive terminal chat UI
    #[cfg(feature = "tui")]
    Tui,
}

#[derive(Debug, Subcommand)]
pub enum ProvidersCommand {
    /// Add a provider from a curl command line
    Add {
        /// Provider id
        id: String,
        /// Curl command with {{PLACEHOLDER}} slots
        curl: String,
        /// Register as a transcription provider
        #[arg(long)]
        stt: bool,
        /// Path to the reply text in each response object, e.g. choices[0].delta.content
        #[arg(long = "content-path")]
        content_path: Option<String>,
        /// Print the reply only once it is complete
        #[arg(long = "no-stream")]
        no_stream: bool,
    },
    /// List configured providers
    List,
    /// Remove a provider by id
    Remove {
        id: String,
        #[arg(long)]
        stt: bool,
    },
    /// Show a compiled provider and its placeholders
    Show {
        id: String,
        #[arg(long)]
        stt: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConversationsCommand {
    /// List saved conversations, most recent first
    List,
    /// Print a conversation transcript
    Show { id: String },
}
