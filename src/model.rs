use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,

    /// Milliseconds since UNIX epoch.
    pub timestamp: i64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: message_id(role),
            role,
            content: content.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn empty(id: impl Into<String>, now: i64) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A file handed in by a capture source (file picker, screenshot, clipboard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,

    /// Base64 without a `data:` prefix.
    pub payload: String,
    pub size: u64,
}

impl AttachedFile {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

pub fn message_id(role: Role) -> String {
    format!("{}_{}", role.as_str(), uuid::Uuid::new_v4().simple())
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Title for a new conversation: the first words of the opening message.
pub fn derive_title(text: &str) -> String {
    const MAX_WORDS: usize = 6;
    const MAX_CHARS: usize = 48;

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return "New conversation".to_string();
    }

    let mut title = words[..words.len().min(MAX_WORDS)].join(" ");
    let mut truncated = words.len() > MAX_WORDS;
    if let Some((idx, _)) = title.char_indices().nth(MAX_CHARS) {
        title.truncate(idx);
        truncated = true;
    }
    if truncated {
        title = format!("{}...", title.trim_end());
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_keeps_short_messages_whole() {
        assert_eq!(derive_title("  Hi   there "), "Hi there");
    }

    #[test]
    fn title_cuts_after_six_words() {
        assert_eq!(
            derive_title("one two three four five six seven eight"),
            "one two three four five six..."
        );
    }

    #[test]
    fn title_for_blank_text() {
        assert_eq!(derive_title("   "), "New conversation");
    }

    #[test]
    fn conversation_serializes_camel_case() {
        let c = Conversation::empty("c1", 5);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["createdAt"], 5);
        assert_eq!(v["updatedAt"], 5);
    }

    #[test]
    fn message_ids_carry_role_prefix() {
        let m = Message::new(Role::Assistant, "x", 1);
        assert!(m.id.starts_with("assistant_"));
    }
}
