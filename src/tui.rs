#![cfg(feature = "tui")]

use crate::cli::Args;
use crate::config::Config;
use crate::descriptor::Mode;
use crate::model::Role;
use crate::session::{
    ChatState, CompletionController, ProviderProfile, SessionEvents, SessionStatus, SAVE_FAILED,
};
use crate::store::JsonFileStore;
use crate::stream::HttpTransport;
use crate::{app, paths, providers};
use anyhow::Context;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const HELP: &str =
    "Enter sends (and replaces a running answer), Esc stops it. Commands: /quit, /clear, /retry, /provider <id>";

#[derive(Debug, PartialEq, Eq)]
enum Action {
    None,
    Quit,
    Clear,
    RetrySave,
    Provider(String),
}

struct Chat {
    ctl: CompletionController,
    events: SessionEvents,
    state: watch::Receiver<Arc<ChatState>>,
}

async fn open_chat(http: &reqwest::Client, profile: ProviderProfile, conversation_id: &str) -> anyhow::Result<Chat> {
    let store = Arc::new(JsonFileStore::new(paths::conversations_dir()?));
    let transport = Arc::new(HttpTransport::new(http.clone()));
    let (ctl, events) = CompletionController::open(conversation_id, store, transport, profile)
        .await
        .with_context(|| format!("failed to open conversation {conversation_id}"))?;
    let state = ctl.subscribe();
    Ok(Chat { ctl, events, state })
}

pub async fn run_tui(http: &reqwest::Client, cfg: &Config, args: &Args) -> anyhow::Result<()> {
    let file = providers::load()?;
    let (_, descriptor) = file.resolve(Mode::Completion, args.provider.as_deref().or(cfg.provider.as_deref()))?;
    let profile = ProviderProfile {
        descriptor: Arc::new(descriptor),
        system_prompt: Some(args.system.clone().unwrap_or_else(|| cfg.system_prompt.clone())),
        variables: cfg.variables_with(&args.vars),
    };
    let conversation_id = args.conversation.clone().unwrap_or_else(app::new_conversation_id);
    let mut chat = open_chat(http, profile, &conversation_id).await?;

    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("enter alt screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || {
        while let Ok(ev) = crossterm::event::read() {
            if ev_tx.send(ev).is_err() {
                break;
            }
        }
    });

    let mut input = String::new();
    let mut notice = HELP.to_string();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));

    let res: anyhow::Result<()> = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let state = chat.state.borrow().clone();
                let title = format!("chatwire: {}", chat.ctl.profile().descriptor.id);
                if let Err(e) = draw(&mut terminal, &title, &state, &notice, &input) {
                    break Err(e);
                }
            }
            Some(ev) = ev_rx.recv() => {
                let Event::Key(key) = ev else { continue };
                match handle_key(key, &mut input, &mut chat.ctl) {
                    Action::None => {}
                    Action::Quit => break Ok(()),
                    Action::Clear => {
                        let profile = chat.ctl.profile().clone();
                        match open_chat(http, profile, &app::new_conversation_id()).await {
                            Ok(next) => chat = next,
                            Err(e) => notice = format!("{e:#}"),
                        }
                    }
                    Action::RetrySave => {
                        notice = match chat.ctl.retry_save().await {
                            Ok(()) => "conversation saved".to_string(),
                            Err(e) => format!("save failed: {e}"),
                        };
                    }
                    Action::Provider(id) => match file.resolve(Mode::Completion, Some(&id)) {
                        Ok((_, d)) => {
                            let mut profile = chat.ctl.profile().clone();
                            profile.descriptor = Arc::new(d);
                            chat.ctl.set_profile(profile);
                            notice = format!("provider set to: {id}");
                        }
                        Err(e) => notice = format!("{e:#}"),
                    },
                }
            }
            Some(event) = chat.events.recv() => {
                chat.ctl.handle(event).await;
            }
        }
    };

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    res
}

fn handle_key(key: KeyEvent, input: &mut String, ctl: &mut CompletionController) -> Action {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Action::Quit;
    }

    match key.code {
        KeyCode::Esc => {
            if !ctl.cancel() {
                return Action::Quit;
            }
        }
        KeyCode::Char(c) => input.push(c),
        KeyCode::Backspace => {
            input.pop();
        }
        KeyCode::Enter => {
            let msg = input.trim().to_string();
            input.clear();
            if msg.is_empty() {
                return Action::None;
            }

            if let Some(action) = command(&msg) {
                if action == Action::Clear {
                    ctl.cancel();
                }
                return action;
            }

            // Failures land in the published state's error line.
            if let Err(e) = ctl.submit(&msg, &[]) {
                tracing::debug!(error = %e, "submit refused");
            }
        }
        _ => {}
    }

    Action::None
}

/// Parse a slash command typed into the input line.
fn command(msg: &str) -> Option<Action> {
    match msg {
        "/quit" => Some(Action::Quit),
        "/clear" => Some(Action::Clear),
        "/retry" => Some(Action::RetrySave),
        _ => msg
            .strip_prefix("/provider ")
            .map(|id| Action::Provider(id.trim().to_string())),
    }
}

fn draw(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    title: &str,
    state: &ChatState,
    notice: &str,
    input: &str,
) -> anyhow::Result<()> {
    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(1), Constraint::Length(3)])
            .split(f.area());

        let mut text = Text::default();
        for m in &state.conversation.messages {
            let style = match m.role {
                Role::User => Style::default().add_modifier(Modifier::BOLD),
                _ => Style::default(),
            };
            text.lines.push(Line::styled(format!("{}: ", m.role.as_str()), style));
            text.lines.extend(Text::from(m.content.clone()).lines);
            text.lines.push(Line::from(""));
        }

        let chat = Paragraph::new(text)
            .block(Block::default().borders(Borders::ALL).title(title.to_string()))
            .wrap(Wrap { trim: false });

        let status = match (&state.error, state.status) {
            (Some(err), _) if err == SAVE_FAILED => Line::styled(
                format!("{err} Type /retry to save again."),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            (Some(err), _) => Line::styled(err.clone(), Style::default().add_modifier(Modifier::BOLD)),
            (None, Some(SessionStatus::Pending)) => Line::from("waiting for reply... (Esc to stop)"),
            (None, Some(SessionStatus::Streaming)) => Line::from("streaming... (Esc to stop)"),
            (None, Some(SessionStatus::Cancelled)) => Line::from("stopped"),
            _ => match state.warnings.first() {
                Some(w) => Line::from(w.clone()),
                None => Line::from(notice.to_string()),
            },
        };

        let input_w = Paragraph::new(input.to_string())
            .block(Block::default().borders(Borders::ALL).title("input"));

        f.render_widget(chat, chunks[0]);
        f.render_widget(Paragraph::new(status), chunks[1]);
        f.render_widget(input_w, chunks[2]);

        let x = chunks[2].x + 1 + input.chars().count() as u16;
        let y = chunks[2].y + 1;
        f.set_cursor_position((x.min(chunks[2].x + chunks[2].width.saturating_sub(2)), y));
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands() {
        assert_eq!(command("/retry"), Some(Action::RetrySave));
        assert_eq!(command("/clear"), Some(Action::Clear));
        assert_eq!(command("/quit"), Some(Action::Quit));
        assert_eq!(command("/provider  openai "), Some(Action::Provider("openai".to_string())));
        assert_eq!(command("/retry later"), None);
        assert_eq!(command("hello"), None);
    }
}
