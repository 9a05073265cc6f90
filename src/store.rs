//! Conversation persistence boundary.

use crate::error::StoreError;
use crate::model::Conversation;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;
}

/// One pretty-printed JSON file per conversation.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Other(format!("invalid conversation id: {id:?}")));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    /// All stored conversations, most recently updated first.
    pub async fn list(&self) -> Result<Vec<Conversation>, StoreError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_conversation(&path).await {
                Ok(Some(c)) => out.push(c),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable conversation"),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}

async fn read_conversation(path: &Path) -> Result<Option<Conversation>, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        read_conversation(&self.path_for(id)?).await
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let path = self.path_for(&conversation.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(conversation)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(id = %conversation.id, messages = conversation.messages.len(), "conversation saved");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store with a save counter and failure switch.
    #[derive(Default)]
    pub struct MemoryStore {
        items: Mutex<HashMap<String, Conversation>>,
        pub saves: AtomicUsize,
        pub fail_saves: AtomicBool,
    }

    impl MemoryStore {
        pub fn with(conversation: Conversation) -> Self {
            let store = Self::default();
            store
                .items
                .lock()
                .unwrap()
                .insert(conversation.id.clone(), conversation);
            store
        }

        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        pub fn get(&self, id: &str) -> Option<Conversation> {
            self.items.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl ConversationStore for MemoryStore {
        async fn get_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
            Ok(self.get(id))
        }

        async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Other("disk full".to_string()));
            }
            self.items
                .lock()
                .unwrap()
                .insert(conversation.id.clone(), conversation.clone());
            Ok(())
        }
    }
}
