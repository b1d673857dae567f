//! Chat history store: one JSON file per chat id.
//!
//! Ids are restricted to `[A-Za-z0-9_-]` and anything else is rejected as
//! invalid input, never corrected. The store assumes single-user access;
//! writes are whole-file and last-writer-wins.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A stored conversation. Both keys are always present, defaulted to empty
/// when missing on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRecord {
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub images: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    dir: PathBuf,
}

impl ChatStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn filepath(&self, chat_id: &str) -> Result<PathBuf> {
        validate_chat_id(chat_id)?;
        Ok(self.dir.join(format!("{chat_id}.json")))
    }

    /// Loads a chat. A missing or unreadable file yields an empty record,
    /// not an error; an invalid id is rejected.
    pub fn load(&self, chat_id: &str) -> Result<ChatRecord> {
        let path = self.filepath(chat_id)?;
        if !path.exists() {
            debug!(chat_id, "chat file not found, returning empty record");
            return Ok(ChatRecord::default());
        }
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(record) => Ok(record),
                Err(err) => {
                    warn!(chat_id, error = %err, "chat file unreadable, returning empty record");
                    Ok(ChatRecord::default())
                }
            },
            Err(err) => {
                warn!(chat_id, error = %err, "chat file unreadable, returning empty record");
                Ok(ChatRecord::default())
            }
        }
    }

    pub fn save(&self, chat_id: &str, record: &ChatRecord) -> Result<()> {
        let path = self.filepath(chat_id)?;
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, serde_json::to_string_pretty(record)?)?;
        debug!(chat_id, path = %path.display(), "chat saved");
        Ok(())
    }

    /// Deletes the chat file. `Ok(false)` when it did not exist.
    pub fn delete(&self, chat_id: &str) -> Result<bool> {
        let path = self.filepath(chat_id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        info!(chat_id, "chat deleted");
        Ok(true)
    }

    /// Lists stored chats, newest-modified first, each with a display name
    /// hinted from the oldest user message.
    pub fn list(&self) -> Result<Vec<ChatSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((path, modified));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        Ok(entries
            .into_iter()
            .filter_map(|(path, _)| {
                let id = path.file_stem()?.to_str()?.to_string();
                let name = name_hint(&path).unwrap_or_else(|| fallback_name(&id));
                Some(ChatSummary { id, name })
            })
            .collect())
    }
}

/// Rejects anything outside `[A-Za-z0-9_-]+`; traversal sequences never
/// reach the filesystem.
pub fn validate_chat_id(chat_id: &str) -> Result<()> {
    let valid = !chat_id.is_empty()
        && chat_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "Invalid chat ID format: {chat_id}"
        )))
    }
}

/// First four words of the oldest user message, with an ellipsis when the
/// message continues past them.
fn name_hint(path: &Path) -> Option<String> {
    let record: ChatRecord = serde_json::from_str(&fs::read_to_string(path).ok()?).ok()?;
    // Messages are stored newest-first; the oldest user turn is last.
    let oldest = record
        .messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))?
        .get("content")?
        .as_str()?;
    let name: String = oldest.split_whitespace().take(4).collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        return None;
    }
    if oldest.len() > name.len() + 3 {
        Some(format!("{name}..."))
    } else {
        Some(name)
    }
}

fn fallback_name(id: &str) -> String {
    let suffix = id.rsplit('-').next().unwrap_or(id);
    format!("Chat {suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ChatStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChatStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn traversal_ids_are_rejected_and_safe_ids_round_trip() {
        let (_dir, store) = store();
        assert!(matches!(
            store.load("abc/../etc"),
            Err(Error::Validation(_))
        ));
        assert!(validate_chat_id("").is_err());
        assert!(validate_chat_id("with space").is_err());

        let record = ChatRecord {
            messages: vec![json!({"role": "user", "content": "hello"})],
            images: vec![],
        };
        store.save("abc-123_x", &record).unwrap();
        assert_eq!(store.load("abc-123_x").unwrap(), record);
    }

    #[test]
    fn missing_chat_loads_as_empty_record() {
        let (_dir, store) = store();
        let record = store.load("nope").unwrap();
        assert!(record.messages.is_empty());
        assert!(record.images.is_empty());
    }

    #[test]
    fn records_missing_keys_are_defaulted() {
        let (dir, store) = store();
        fs::write(dir.path().join("old.json"), r#"{"messages": []}"#).unwrap();
        let record = store.load("old").unwrap();
        assert!(record.images.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.save("gone", &ChatRecord::default()).unwrap();
        assert!(store.delete("gone").unwrap());
        assert!(!store.delete("gone").unwrap());
    }

    #[test]
    fn list_names_chats_from_the_oldest_user_message() {
        let (_dir, store) = store();
        let record = ChatRecord {
            messages: vec![
                json!({"role": "assistant", "content": "newest turn"}),
                json!({"role": "user", "content": "what is the airspeed of a laden swallow"}),
            ],
            images: vec![],
        };
        store.save("chat-42", &record).unwrap();
        store.save("empty-7", &ChatRecord::default()).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        let by_id = |id: &str| listed.iter().find(|c| c.id == id).unwrap();
        assert_eq!(by_id("chat-42").name, "what is the airspeed...");
        assert_eq!(by_id("empty-7").name, "Chat 7");
    }

    #[test]
    fn list_on_a_missing_directory_is_empty() {
        let store = ChatStore::new("/definitely/not/a/real/dir");
        assert!(store.list().unwrap().is_empty());
    }
}
