//! Completion sessions: one controller per open conversation, at most one
//! active session at a time.
//!
//! Streaming work runs on a pump task per session. Pumps never touch the
//! transcript; they forward session-tagged events that the controller applies
//! only when the tag matches the current, still-active session. That single
//! comparison is what keeps a superseded reply out of the transcript.

use crate::cancel::CancelHandle;
use crate::descriptor::ProviderDescriptor;
use crate::error::{StoreError, SubmitError, TransportError};
use crate::model::{self, AttachedFile, Conversation, Message, Role};
use crate::request::{self, Bindings, HistoryEntry};
use crate::store::ConversationStore;
use crate::stream::{StreamDelta, Transport};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;

pub const SAVE_FAILED: &str = "Failed to save conversation. Please try again.";

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Streaming,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Pending | SessionStatus::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSession {
    pub id: SessionId,
    pub conversation_id: String,
    pub status: SessionStatus,
    pub accumulated_text: String,
    assistant_message_id: String,
    started_at: i64,
}

/// Immutable view published to observers after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatState {
    pub conversation: Conversation,
    pub status: Option<SessionStatus>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub enum SessionEventKind {
    Delta(StreamDelta),
    Finished,
    Failed(TransportError),
}

#[derive(Debug)]
pub struct SessionEvent {
    pub session: SessionId,
    pub kind: SessionEventKind,
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Delta(String),
    Completed,
    Failed(String),
    /// The event belonged to a superseded, cancelled, or finished session.
    Discarded,
}

/// The active provider plus the values bound on every submission.
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub descriptor: Arc<ProviderDescriptor>,
    pub system_prompt: Option<String>,
    pub variables: BTreeMap<String, String>,
}

pub struct CompletionController {
    store: Arc<dyn ConversationStore>,
    transport: Arc<dyn Transport>,
    profile: ProviderProfile,
    conversation: Conversation,
    session: Option<CompletionSession>,
    cancel: Option<CancelHandle>,
    next_id: SessionId,
    error: Option<String>,
    warnings: Vec<String>,
    unsaved: bool,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state_tx: watch::Sender<Arc<ChatState>>,
}

impl CompletionController {
    /// Load `conversation_id` (or start it empty) and return the controller
    /// with the receiver its pumps report to.
    pub async fn open(
        conversation_id: &str,
        store: Arc<dyn ConversationStore>,
        transport: Arc<dyn Transport>,
        profile: ProviderProfile,
    ) -> Result<(Self, SessionEvents), StoreError> {
        let conversation = store
            .get_by_id(conversation_id)
            .await?
            .unwrap_or_else(|| Conversation::empty(conversation_id, model::now_millis()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(Arc::new(ChatState {
            conversation: conversation.clone(),
            status: None,
            error: None,
            warnings: Vec::new(),
        }));

        tracing::debug!(conversation = %conversation.id, messages = conversation.messages.len(), "conversation opened");

        Ok((
            Self {
                store,
                transport,
                profile,
                conversation,
                session: None,
                cancel: None,
                next_id: 1,
                error: None,
                warnings: Vec::new(),
                unsaved: false,
                events_tx,
                state_tx,
            },
            events_rx,
        ))
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn session(&self) -> Option<&CompletionSession> {
        self.session.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    /// A session is waiting for or receiving deltas.
    pub fn is_busy(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.status.is_active())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ChatState>> {
        self.state_tx.subscribe()
    }

    /// Switch provider for subsequent submissions.
    pub fn set_profile(&mut self, profile: ProviderProfile) {
        self.profile = profile;
    }

    /// Start a new session for `user_text`, superseding any active one.
    ///
    /// The request is built before anything changes, so a misconfigured
    /// provider never leaves a half-started session behind.
    pub fn submit(&mut self, user_text: &str, attachments: &[AttachedFile]) -> Result<SessionId, SubmitError> {
        let text = user_text.trim();
        if text.is_empty() {
            return Err(SubmitError::EmptyInput);
        }

        let active_assistant = self
            .session
            .as_ref()
            .filter(|s| s.status.is_active())
            .map(|s| s.assistant_message_id.clone());

        let history = self
            .conversation
            .messages
            .iter()
            .filter(|m| Some(&m.id) != active_assistant.as_ref())
            .map(|m| HistoryEntry {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        let mut warnings = Vec::new();
        let mut images = Vec::new();
        for file in attachments {
            if file.is_image() {
                images.push(file.payload.clone());
            } else {
                warnings.push(format!("{} is not an image and was not sent", file.name));
            }
        }

        let bindings = Bindings {
            history,
            user_text: text.to_string(),
            system_prompt: self.profile.system_prompt.clone(),
            images,
            audio: None,
            variables: self.profile.variables.clone(),
        };

        let request = match request::build(&self.profile.descriptor, &bindings) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(provider = %self.profile.descriptor.id, error = %e, "request build failed");
                self.error = Some(e.user_message());
                self.publish();
                return Err(e.into());
            }
        };
        warnings.extend(request.warnings.iter().cloned());

        if let Some(old) = self.session.as_ref().filter(|s| s.status.is_active()) {
            tracing::debug!(session = old.id, "superseding active session");
            if let Some(cancel) = self.cancel.take() {
                cancel.cancel();
            }
            let stale = old.assistant_message_id.clone();
            self.conversation.messages.retain(|m| m.id != stale);
        }

        let id = self.next_id;
        self.next_id += 1;
        let now = model::now_millis();
        self.conversation.messages.push(Message::new(Role::User, text, now));

        self.session = Some(CompletionSession {
            id,
            conversation_id: self.conversation.id.clone(),
            status: SessionStatus::Pending,
            accumulated_text: String::new(),
            assistant_message_id: model::message_id(Role::Assistant),
            started_at: now,
        });
        self.error = None;
        self.warnings = warnings;
        self.unsaved = false;

        let cancel = CancelHandle::new();
        self.cancel = Some(cancel.clone());

        let mut stream = self.transport.stream(request, cancel.clone());
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let kind = match item {
                    Ok(delta) => SessionEventKind::Delta(delta),
                    Err(e) => {
                        let _ = tx.send(SessionEvent {
                            session: id,
                            kind: SessionEventKind::Failed(e),
                        });
                        return;
                    }
                };
                if tx.send(SessionEvent { session: id, kind }).is_err() {
                    return;
                }
            }
            if !cancel.is_cancelled() {
                let _ = tx.send(SessionEvent {
                    session: id,
                    kind: SessionEventKind::Finished,
                });
            }
        });

        tracing::debug!(session = id, conversation = %self.conversation.id, "session started");
        self.publish();
        Ok(id)
    }

    /// Stop the active session. Returns whether anything was cancelled; the
    /// partial reply is dropped and nothing is persisted.
    pub fn cancel(&mut self) -> bool {
        let Some(session) = self.session.as_mut().filter(|s| s.status.is_active()) else {
            return false;
        };
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        session.status = SessionStatus::Cancelled;
        let partial = session.assistant_message_id.clone();
        tracing::debug!(session = session.id, "session cancelled");

        self.conversation.messages.retain(|m| m.id != partial);
        self.publish();
        true
    }

    /// Apply one pump event.
    pub async fn handle(&mut self, event: SessionEvent) -> Handled {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.id == event.session && s.status.is_active());
        if !current {
            tracing::trace!(session = event.session, "discarding stale event");
            return Handled::Discarded;
        }

        match event.kind {
            SessionEventKind::Delta(delta) => self.apply_delta(delta),
            SessionEventKind::Finished => self.finalize().await,
            SessionEventKind::Failed(e) => self.fail(e),
        }
    }

    /// Drive events until no session is active.
    pub async fn run_until_idle(&mut self, events: &mut SessionEvents) -> Option<Handled> {
        let mut last = None;
        while self.is_busy() {
            let Some(event) = events.recv().await else { break };
            match self.handle(event).await {
                Handled::Discarded => {}
                other => last = Some(other),
            }
        }
        last
    }

    /// Retry persisting a completed reply whose save failed.
    pub async fn retry_save(&mut self) -> Result<(), StoreError> {
        if !self.unsaved {
            return Ok(());
        }
        self.store.save(&self.conversation).await?;
        self.unsaved = false;
        self.error = None;
        if let Some(s) = self.session.as_mut() {
            s.status = SessionStatus::Completed;
        }
        self.publish();
        Ok(())
    }

    fn apply_delta(&mut self, delta: StreamDelta) -> Handled {
        let Some(session) = self.session.as_mut() else {
            return Handled::Discarded;
        };
        session.status = SessionStatus::Streaming;
        session.accumulated_text.push_str(&delta.text);

        let message = Message {
            id: session.assistant_message_id.clone(),
            role: Role::Assistant,
            content: session.accumulated_text.clone(),
            timestamp: session.started_at + 1,
        };
        upsert(&mut self.conversation.messages, message);
        self.publish();
        Handled::Delta(delta.text)
    }

    fn fail(&mut self, error: TransportError) -> Handled {
        tracing::warn!(error = %error, "completion failed");
        if let Some(s) = self.session.as_mut() {
            s.status = SessionStatus::Failed;
        }
        self.cancel = None;
        let message = error.user_message();
        self.error = Some(message.clone());
        self.publish();
        Handled::Failed(message)
    }

    async fn finalize(&mut self) -> Handled {
        let Some(session) = self.session.as_mut() else {
            return Handled::Discarded;
        };
        session.status = SessionStatus::Finalizing;
        self.cancel = None;

        let text = session.accumulated_text.clone();
        if text.is_empty() {
            session.status = SessionStatus::Completed;
            self.publish();
            return Handled::Completed;
        }

        let finished_at = model::now_millis();
        upsert(
            &mut self.conversation.messages,
            Message {
                id: session.assistant_message_id.clone(),
                role: Role::Assistant,
                content: text,
                timestamp: finished_at,
            },
        );
        self.publish();

        let existing = match self.store.get_by_id(&self.conversation.id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read stored conversation");
                None
            }
        };

        let title = existing
            .as_ref()
            .map(|c| c.title.clone())
            .filter(|t| !t.trim().is_empty())
            .or_else(|| Some(self.conversation.title.clone()).filter(|t| !t.trim().is_empty()))
            .unwrap_or_else(|| {
                let opening = self
                    .conversation
                    .messages
                    .iter()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                model::derive_title(opening)
            });
        self.conversation.title = title;
        if let Some(c) = &existing {
            self.conversation.created_at = c.created_at;
        }
        self.conversation.updated_at = finished_at;

        let outcome = match self.store.save(&self.conversation).await {
            Ok(()) => {
                if let Ok(Some(stored)) = self.store.get_by_id(&self.conversation.id).await {
                    self.conversation = stored;
                }
                self.unsaved = false;
                self.error = None;
                Handled::Completed
            }
            Err(e) => {
                tracing::warn!(error = %e, conversation = %self.conversation.id, "failed to save conversation");
                self.unsaved = true;
                self.error = Some(SAVE_FAILED.to_string());
                Handled::Failed(SAVE_FAILED.to_string())
            }
        };

        if let Some(s) = self.session.as_mut() {
            s.status = match outcome {
                Handled::Completed => SessionStatus::Completed,
                _ => SessionStatus::Failed,
            };
            tracing::debug!(session = s.id, status = ?s.status, "session finalized");
        }
        self.publish();
        outcome
    }

    fn publish(&self) {
        self.state_tx.send_replace(Arc::new(ChatState {
            conversation: self.conversation.clone(),
            status: self.session.as_ref().map(|s| s.status),
            error: self.error.clone(),
            warnings: self.warnings.clone(),
        }));
    }
}

impl Drop for CompletionController {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Replace the message with the same id, or append it.
fn upsert(messages: &mut Vec<Message>, message: Message) {
    match messages.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}
