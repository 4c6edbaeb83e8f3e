//! Chat store capability.
//!
//! The pipeline reaches persisted conversations through [`ChatStore`], which
//! deals in raw JSON payloads; [`crate::adapt`] turns those into typed
//! values. Two implementations ship here: an in-memory store with failure
//! injection and a JSON-file store with one file per conversation.

use crate::error::StoreError;
use crate::types::{ConversationMessage, ModelInfo, Role};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Asynchronous request/response access to persisted conversations.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Fetch the transcript for a conversation.
    async fn get_conversation(&self, conversation_id: &str) -> Result<Value, StoreError>;

    /// Append a message. The reply has the shape `{ success, savedMessage? }`.
    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        model_info: Option<&ModelInfo>,
    ) -> Result<Value, StoreError>;
}

/// Build the wire form of a new message and push it onto a conversation
/// document. Returns the serialized message.
fn push_message(
    document: &mut Value,
    role: Role,
    content: &str,
    model_info: Option<&ModelInfo>,
) -> Result<Value, StoreError> {
    let mut message = ConversationMessage::new(role, content);
    if let Some(info) = model_info {
        message = message.with_model_info(info.clone());
    }
    let wire = serde_json::to_value(&message).map_err(|e| StoreError::Malformed {
        reason: e.to_string(),
    })?;

    let messages = document
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| StoreError::Malformed {
            reason: "stored conversation has no messages array".into(),
        })?;
    messages.push(wire.clone());
    Ok(wire)
}

fn empty_conversation(conversation_id: &str) -> Value {
    json!({
        "id": conversation_id,
        "createdAt": chrono::Utc::now(),
        "messages": [],
    })
}

#[derive(Default)]
struct InMemoryState {
    conversations: HashMap<String, Value>,
    fetch_failures: VecDeque<StoreError>,
    append_failures: HashMap<Role, StoreError>,
    fetch_calls: usize,
    append_calls: Vec<(String, Role)>,
}

/// A process-local chat store for tests and demos.
#[derive(Default)]
pub struct InMemoryChatStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an empty conversation if it does not exist yet.
    pub fn create_conversation(&self, conversation_id: &str) {
        self.lock()
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| empty_conversation(conversation_id));
    }

    /// Seed a conversation with typed messages.
    pub fn insert_messages(&self, conversation_id: &str, messages: &[ConversationMessage]) {
        let mut doc = empty_conversation(conversation_id);
        doc["messages"] = json!(messages);
        self.lock()
            .conversations
            .insert(conversation_id.to_string(), doc);
    }

    /// Seed a conversation with a raw payload, malformed or not.
    pub fn insert_raw(&self, conversation_id: &str, payload: Value) {
        self.lock()
            .conversations
            .insert(conversation_id.to_string(), payload);
    }

    /// Make the next `get_conversation` call fail with `error`. Queued
    /// failures are consumed in order.
    pub fn fail_next_fetch(&self, error: StoreError) {
        self.lock().fetch_failures.push_back(error);
    }

    /// Make every append of `role` fail with `error`.
    pub fn fail_appends(&self, role: Role, error: StoreError) {
        self.lock().append_failures.insert(role, error);
    }

    /// Stop injecting append failures.
    pub fn clear_append_failures(&self) {
        self.lock().append_failures.clear();
    }

    /// Raw messages currently stored for a conversation.
    pub fn stored_messages(&self, conversation_id: &str) -> Vec<Value> {
        self.lock()
            .conversations
            .get(conversation_id)
            .and_then(|doc| doc.get("messages"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of `get_conversation` calls observed.
    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    /// Every append attempted, in call order.
    pub fn append_calls(&self) -> Vec<(String, Role)> {
        self.lock().append_calls.clone()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Value, StoreError> {
        let mut state = self.lock();
        state.fetch_calls += 1;
        if let Some(error) = state.fetch_failures.pop_front() {
            return Err(error);
        }
        state
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                conversation_id: conversation_id.to_string(),
            })
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        model_info: Option<&ModelInfo>,
    ) -> Result<Value, StoreError> {
        let mut state = self.lock();
        state
            .append_calls
            .push((conversation_id.to_string(), role));
        if let Some(error) = state.append_failures.get(&role) {
            return Err(error.clone());
        }
        let document =
            state
                .conversations
                .get_mut(conversation_id)
                .ok_or_else(|| StoreError::NotFound {
                    conversation_id: conversation_id.to_string(),
                })?;
        let saved = push_message(document, role, content, model_info)?;
        Ok(json!({ "success": true, "savedMessage": saved }))
    }
}

/// Chat store backed by one JSON file per conversation.
///
/// Writes go to a `.tmp` sibling and are renamed into place, so a crash
/// never leaves a half-written transcript behind.
pub struct JsonFileChatStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileChatStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `conversation_id`.
    pub fn conversation_path(&self, conversation_id: &str) -> PathBuf {
        let safe: String = conversation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.json"))
    }

    /// Create an empty conversation file. Returns `false` if one exists.
    pub async fn create_conversation(&self, conversation_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.conversation_path(conversation_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        atomic_write_json(&path, &empty_conversation(conversation_id)).await?;
        Ok(true)
    }

    async fn read_document(&self, conversation_id: &str) -> Result<Value, StoreError> {
        let path = self.conversation_path(conversation_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    conversation_id: conversation_id.to_string(),
                });
            }
            Err(e) => {
                return Err(StoreError::Unavailable {
                    message: format!("failed to read {}: {e}", path.display()),
                });
            }
        };
        serde_json::from_str(&data).map_err(|e| StoreError::Malformed {
            reason: format!("{}: {e}", path.display()),
        })
    }
}

/// Write JSON to a `.tmp` sibling, then rename over the target.
async fn atomic_write_json(path: &Path, data: &Value) -> Result<(), StoreError> {
    let rejected = |e: std::io::Error| StoreError::Rejected {
        message: format!("failed to write {}: {e}", path.display()),
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(rejected)?;
    }
    let json = serde_json::to_string_pretty(data).map_err(|e| StoreError::Rejected {
        message: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json.as_bytes())
        .await
        .map_err(rejected)?;
    tokio::fs::rename(&tmp, path).await.map_err(rejected)?;
    Ok(())
}

#[async_trait]
impl ChatStore for JsonFileChatStore {
    async fn get_conversation(&self, conversation_id: &str) -> Result<Value, StoreError> {
        self.read_document(conversation_id).await
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        model_info: Option<&ModelInfo>,
    ) -> Result<Value, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document(conversation_id).await?;
        let saved = push_message(&mut document, role, content, model_info)?;
        let path = self.conversation_path(conversation_id);
        atomic_write_json(&path, &document).await?;
        debug!(conversation_id, role = %role, path = %path.display(), "Appended message");
        Ok(json!({ "success": true, "savedMessage": saved }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::{parse_append_receipt, parse_conversation};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_missing_conversation() {
        let store = InMemoryChatStore::new();
        let err = store.get_conversation("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        let err = store
            .append_message("nope", Role::User, "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_append_and_fetch() {
        let store = InMemoryChatStore::new();
        store.create_conversation("c1");
        let reply = store
            .append_message("c1", Role::User, "Hello", None)
            .await
            .unwrap();
        let receipt = parse_append_receipt(&reply).into_result().unwrap();
        assert!(receipt.success);

        let doc = store.get_conversation("c1").await.unwrap();
        let stored = parse_conversation(&doc).into_result().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert_eq!(stored.messages[0].content, "Hello");
        assert_eq!(store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_failure_injection() {
        let store = InMemoryChatStore::new();
        store.create_conversation("c1");
        store.fail_next_fetch(StoreError::Unavailable {
            message: "down".into(),
        });
        assert!(store.get_conversation("c1").await.is_err());
        assert!(store.get_conversation("c1").await.is_ok());

        store.fail_appends(
            Role::Assistant,
            StoreError::Rejected {
                message: "quota".into(),
            },
        );
        assert!(
            store
                .append_message("c1", Role::User, "q", None)
                .await
                .is_ok()
        );
        assert!(
            store
                .append_message("c1", Role::Assistant, "a", None)
                .await
                .is_err()
        );
        assert_eq!(store.stored_messages("c1").len(), 1);
        assert_eq!(store.append_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_json_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileChatStore::new(dir.path().join("conversations"));
        assert!(store.create_conversation("c1").await.unwrap());
        assert!(!store.create_conversation("c1").await.unwrap());

        let info = ModelInfo {
            name: "llama3.2".into(),
            version: None,
            provider: "ollama".into(),
        };
        store
            .append_message("c1", Role::User, "Hi", None)
            .await
            .unwrap();
        store
            .append_message("c1", Role::Assistant, "Hello!", Some(&info))
            .await
            .unwrap();

        let doc = store.get_conversation("c1").await.unwrap();
        let stored = parse_conversation(&doc).into_result().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].model_info.as_ref(), Some(&info));

        let path = store.conversation_path("c1");
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_json_store_sanitizes_ids() {
        let store = JsonFileChatStore::new("/tmp/store");
        let path = store.conversation_path("../etc/passwd");
        assert_eq!(path, PathBuf::from("/tmp/store/___etc_passwd.json"));
    }

    #[tokio::test]
    async fn test_json_store_malformed_file() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileChatStore::new(dir.path());
        std::fs::write(store.conversation_path("bad"), "{ not json").unwrap();
        let err = store.get_conversation("bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        let err = store.get_conversation("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
