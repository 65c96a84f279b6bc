//! Conversation storage
//!
//! One JSON file per conversation under `<data_dir>/conversations`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::StorageError;
use crate::types::{Role, Turn};

const TITLE_MAX_CHARS: usize = 48;

/// A saved chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub title: String,
    pub turns: Vec<Turn>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            turns: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Title derived from the first user turn, if the conversation has none yet
    pub fn suggested_title(&self) -> Option<String> {
        let first = self.turns.iter().find(|t| t.role == Role::User)?;
        let line = first.content.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            return None;
        }
        let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
        if line.chars().count() > TITLE_MAX_CHARS {
            title.push('…');
        }
        Some(title)
    }
}

/// File-backed conversation history
#[derive(Debug, Clone)]
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `<data_dir>/conversations`
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("conversations"))
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Persist a conversation, stamping its update time
    pub fn save(&self, conversation: &mut Conversation) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        conversation.updated_at = Utc::now();
        if conversation.title.trim().is_empty() {
            if let Some(title) = conversation.suggested_title() {
                conversation.title = title;
            }
        }
        let json = serde_json::to_string_pretty(conversation)?;
        fs::write(self.path_for(&conversation.id), json)?;
        tracing::debug!("Saved conversation {}", conversation.id);
        Ok(())
    }

    pub fn load(&self, id: &Uuid) -> Result<Conversation, StorageError> {
        let path = self.path_for(id);
        let json = match fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&json)?)
    }

    /// All conversations, most recently updated first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<Conversation>, StorageError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut conversations = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(StorageError::from)
                .and_then(|json| serde_json::from_str::<Conversation>(&json).map_err(Into::into));
            match parsed {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => tracing::warn!("Skipping unreadable conversation {:?}: {}", path, e),
            }
        }

        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    /// Permanently delete a conversation
    pub fn delete(&self, id: &Uuid) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => {
                tracing::info!("Deleted conversation {}", id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}
