mod app;
mod cancel;
mod cli;
mod config;
mod descriptor;
mod error;
mod model;
mod paths;
mod providers;
mod request;
mod session;
mod store;
mod stream;

#[cfg(feature = "tui")]
mod tui;

use anyhow::Context;
use clap::Parser;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the reply.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    let config_path = paths::config_path()?;
    let mut cfg = config::Config::load_optional(&config_path)?.unwrap_or_default();
    cfg.apply_env();
    tracing::debug!(?config_path, provider = ?cfg.provider, "resolved config");

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));
    if let Some(secs) = cfg.request_timeout_secs {
        builder = builder.timeout(Duration::from_secs(secs));
    }
    let http = builder.build().context("failed to build HTTP client")?;

    match args.cmd {
        Some(cli::Command::Providers { cmd }) => {
            return providers::cmd_providers(cmd, &cfg);
        }
        Some(cli::Command::Conversations { cmd }) => {
            return app::cmd_conversations(cmd).await;
        }
        Some(cli::Command::Transcribe { ref file, ref provider }) => {
            return app::cmd_transcribe(&http, &cfg, file, provider.as_deref()).await;
        }
        #[cfg(feature = "tui")]
        Some(cli::Command::Tui) => {
            return tui::run_tui(&http, &cfg, &args).await;
        }
        None => {}
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: chatwire \"Hello\" or `chatwire tui` (feature flag)");
    }

    app::cmd_chat(&http, &cfg, &args, &prompt).await
}
