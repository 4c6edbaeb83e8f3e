//! Adaptation of loosely-typed external payloads into the data model.
//!
//! The chat store and the document index hand back raw JSON. Everything
//! that crosses into the pipeline passes through here first, so the rest of
//! the crate only ever sees validated types. Coercions applied:
//!
//! - role names are matched case-insensitively
//! - missing or non-UUID message ids are replaced (the original is kept in
//!   metadata under `source_id`)
//! - timestamps may be RFC 3339 strings or epoch milliseconds; a missing
//!   timestamp inherits the previous message's
//! - wire keys are accepted in camelCase or snake_case
//! - relevance scores and confidence are clamped to `[0, 1]`

use crate::types::{
    CollectionStats, ConversationMessage, DocumentSource, GenerationSettings, ModelInfo, Role,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of adapting one external payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult<T> {
    Parsed(T),
    Malformed { reason: String },
}

impl<T> ParseResult<T> {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ParseResult::Malformed {
            reason: reason.into(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseResult<U> {
        match self {
            ParseResult::Parsed(value) => ParseResult::Parsed(f(value)),
            ParseResult::Malformed { reason } => ParseResult::Malformed { reason },
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            ParseResult::Parsed(value) => Ok(value),
            ParseResult::Malformed { reason } => Err(reason),
        }
    }
}

impl<T> From<Result<T, String>> for ParseResult<T> {
    fn from(result: Result<T, String>) -> Self {
        match result {
            Ok(value) => ParseResult::Parsed(value),
            Err(reason) => ParseResult::Malformed { reason },
        }
    }
}

/// A conversation as the chat store describes it. Override fields are
/// `None` when the store does not set them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoredConversation {
    pub messages: Vec<ConversationMessage>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_response_tokens: Option<usize>,
    pub extra: HashMap<String, Value>,
    pub max_context_messages: Option<usize>,
}

/// The store's reply to an append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReceipt {
    pub success: bool,
    pub saved_message: Option<ConversationMessage>,
}

/// A document query reply before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPayload {
    pub sources: Vec<DocumentSource>,
    pub confidence: Option<f32>,
}

/// Look a field up by its camelCase or snake_case name.
fn field<'a>(obj: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    obj.get(camel)
        .or_else(|| obj.get(snake))
        .filter(|v| !v.is_null())
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, String> {
    value
        .as_object()
        .ok_or_else(|| format!("{what} must be an object"))
}

fn as_count(value: &Value, name: &str) -> Result<u64, String> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f >= 0.0 => Ok(f as u64),
        _ => Err(format!("{name} must be a non-negative number")),
    }
}

fn clamp_unit(value: f64) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0) as f32
    }
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, String> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("invalid timestamp '{s}': {e}")),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| format!("invalid epoch timestamp {n}")),
        other => Err(format!("invalid timestamp {other}")),
    }
}

fn parse_model_info(value: &Value) -> Result<ModelInfo, String> {
    let obj = as_object(value, "modelInfo")?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or("modelInfo.name must be a string")?;
    Ok(ModelInfo {
        name: name.to_string(),
        version: obj
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string),
        provider: obj
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    })
}

/// Adapt one stored message. `fallback_timestamp` is used when the payload
/// carries none.
pub fn parse_message(
    value: &Value,
    fallback_timestamp: DateTime<Utc>,
) -> ParseResult<ConversationMessage> {
    parse_message_inner(value, fallback_timestamp).into()
}

fn parse_message_inner(
    value: &Value,
    fallback_timestamp: DateTime<Utc>,
) -> Result<ConversationMessage, String> {
    let obj = as_object(value, "message")?;

    let role_name = obj
        .get("role")
        .and_then(Value::as_str)
        .ok_or("message.role must be a string")?;
    let role = Role::parse(role_name).ok_or_else(|| format!("unknown role '{role_name}'"))?;

    let content = obj
        .get("content")
        .and_then(Value::as_str)
        .ok_or("message.content must be a string")?
        .to_string();

    let mut metadata: HashMap<String, Value> = match obj.get("metadata") {
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        Some(Value::Null) | None => HashMap::new(),
        Some(_) => return Err("message.metadata must be an object".into()),
    };

    let id = match obj.get("id") {
        Some(Value::String(s)) => match Uuid::parse_str(s) {
            Ok(id) => id,
            Err(_) => {
                metadata.insert("source_id".into(), Value::String(s.clone()));
                Uuid::new_v4()
            }
        },
        Some(Value::Number(n)) => {
            metadata.insert("source_id".into(), Value::String(n.to_string()));
            Uuid::new_v4()
        }
        _ => Uuid::new_v4(),
    };

    let timestamp = match field(obj, "timestamp", "created_at") {
        Some(ts) => parse_timestamp(ts)?,
        None => fallback_timestamp,
    };

    let model_info = match field(obj, "modelInfo", "model_info") {
        Some(info) if role == Role::Assistant => Some(parse_model_info(info)?),
        _ => None,
    };

    Ok(ConversationMessage {
        id,
        role,
        content,
        timestamp,
        model_info,
        metadata,
    })
}

/// Adapt a full transcript. Accepts either an object with a `messages`
/// array plus optional overrides, or a bare array of messages.
pub fn parse_conversation(value: &Value) -> ParseResult<StoredConversation> {
    parse_conversation_inner(value).into()
}

fn parse_conversation_inner(value: &Value) -> Result<StoredConversation, String> {
    let (raw_messages, obj) = match value {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(obj) => {
            let items = match obj.get("messages") {
                Some(Value::Array(items)) => items.as_slice(),
                Some(Value::Null) | None => &[][..],
                Some(_) => return Err("conversation.messages must be an array".into()),
            };
            (items, Some(obj))
        }
        _ => return Err("conversation must be an object or an array".into()),
    };

    let mut messages = Vec::with_capacity(raw_messages.len());
    let mut last_timestamp = DateTime::<Utc>::UNIX_EPOCH;
    for (index, raw) in raw_messages.iter().enumerate() {
        let message = parse_message_inner(raw, last_timestamp)
            .map_err(|reason| format!("message {index}: {reason}"))?;
        last_timestamp = message.timestamp;
        messages.push(message);
    }

    let mut stored = StoredConversation {
        messages,
        ..Default::default()
    };
    let Some(obj) = obj else {
        return Ok(stored);
    };

    if let Some(prompt) = field(obj, "systemPrompt", "system_prompt") {
        let prompt = prompt.as_str().ok_or("systemPrompt must be a string")?;
        if !prompt.trim().is_empty() {
            stored.system_prompt = Some(prompt.to_string());
        }
    }
    if let Some(cap) = field(obj, "maxContextMessages", "max_context_messages") {
        stored.max_context_messages = Some(as_count(cap, "maxContextMessages")? as usize);
    }
    if let Some(settings) = field(obj, "generationSettings", "generation_settings") {
        let settings = as_object(settings, "generationSettings")?;
        if let Some(t) = settings.get("temperature").filter(|v| !v.is_null()) {
            let t = t.as_f64().ok_or("temperature must be a number")?;
            stored.temperature = Some(t as f32);
        }
        if let Some(max) = field(settings, "maxResponseTokens", "max_response_tokens") {
            stored.max_response_tokens = Some(as_count(max, "maxResponseTokens")? as usize);
        }
        if let Some(Value::Object(extra)) = settings.get("extra") {
            stored.extra = extra.clone().into_iter().collect();
        }
    }
    Ok(stored)
}

impl StoredConversation {
    /// Apply the stored overrides on top of `defaults`, field by field.
    pub fn settings_over(&self, defaults: &GenerationSettings) -> GenerationSettings {
        let mut settings = defaults.clone();
        if let Some(t) = self.temperature {
            settings.temperature = t;
        }
        if let Some(max) = self.max_response_tokens {
            settings.max_response_tokens = max;
        }
        for (key, value) in &self.extra {
            settings.extra.insert(key.clone(), value.clone());
        }
        settings
    }
}

/// Adapt an append reply: `{ success, savedMessage? }`.
pub fn parse_append_receipt(value: &Value) -> ParseResult<AppendReceipt> {
    parse_append_receipt_inner(value).into()
}

fn parse_append_receipt_inner(value: &Value) -> Result<AppendReceipt, String> {
    let obj = as_object(value, "append result")?;
    let success = obj
        .get("success")
        .and_then(Value::as_bool)
        .ok_or("append result.success must be a boolean")?;
    let saved_message = match field(obj, "savedMessage", "saved_message") {
        Some(raw) => Some(parse_message_inner(raw, Utc::now())?),
        None => None,
    };
    Ok(AppendReceipt {
        success,
        saved_message,
    })
}

/// Adapt collection statistics: `{ sizeBytes, pointCount }`.
pub fn parse_collection_stats(value: &Value) -> ParseResult<CollectionStats> {
    parse_collection_stats_inner(value).into()
}

fn parse_collection_stats_inner(value: &Value) -> Result<CollectionStats, String> {
    let obj = as_object(value, "collection stats")?;
    let size_bytes = match field(obj, "sizeBytes", "size_bytes") {
        Some(v) => as_count(v, "sizeBytes")?,
        None => 0,
    };
    let point_count = match field(obj, "pointCount", "point_count") {
        Some(v) => as_count(v, "pointCount")?,
        None => 0,
    };
    Ok(CollectionStats {
        size_bytes,
        point_count,
    })
}

/// Adapt a similarity-query reply: `{ sources: [{content, relevanceScore}], confidence? }`.
pub fn parse_query_result(value: &Value) -> ParseResult<QueryPayload> {
    parse_query_result_inner(value).into()
}

fn parse_query_result_inner(value: &Value) -> Result<QueryPayload, String> {
    let obj = as_object(value, "query result")?;
    let raw_sources = match obj.get("sources") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Null) | None => &[][..],
        Some(_) => return Err("query result.sources must be an array".to_string()),
    };

    let mut sources = Vec::with_capacity(raw_sources.len());
    for (index, raw) in raw_sources.iter().enumerate() {
        let src = as_object(raw, "source")?;
        let content = src
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("source {index}: content must be a string"))?;
        let score = field(src, "relevanceScore", "relevance_score")
            .or_else(|| src.get("score"))
            .and_then(Value::as_f64)
            .ok_or_else(|| format!("source {index}: relevanceScore must be a number"))?;
        sources.push(DocumentSource {
            content: content.to_string(),
            relevance_score: clamp_unit(score),
        });
    }

    let confidence = obj.get("confidence").and_then(Value::as_f64).map(clamp_unit);
    Ok(QueryPayload {
        sources,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_message_with_coercions() {
        let raw = json!({
            "id": "legacy-42",
            "role": "Assistant",
            "content": "Hi there",
            "created_at": 1_700_000_000_000i64,
            "model_info": {"name": "llama3.2", "provider": "ollama"}
        });
        let ParseResult::Parsed(msg) = parse_message(&raw, Utc::now()) else {
            panic!("expected parsed message");
        };
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.metadata["source_id"], json!("legacy-42"));
        assert_eq!(msg.timestamp.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(msg.model_info.unwrap().name, "llama3.2");
    }

    #[test]
    fn test_model_info_dropped_for_user_messages() {
        let raw = json!({
            "role": "user",
            "content": "hello",
            "modelInfo": {"name": "x", "provider": "y"}
        });
        let msg = parse_message(&raw, Utc::now()).into_result().unwrap();
        assert!(msg.model_info.is_none());
    }

    #[test]
    fn test_malformed_messages() {
        let fallback = Utc::now();
        assert!(matches!(
            parse_message(&json!({"role": "tool", "content": "x"}), fallback),
            ParseResult::Malformed { .. }
        ));
        assert!(matches!(
            parse_message(&json!({"role": "user", "content": 5}), fallback),
            ParseResult::Malformed { .. }
        ));
        assert!(matches!(
            parse_message(&json!("just text"), fallback),
            ParseResult::Malformed { .. }
        ));
    }

    #[test]
    fn test_conversation_inherits_missing_timestamps() {
        let raw = json!({
            "messages": [
                {"role": "user", "content": "a", "timestamp": "2024-05-01T10:00:00Z"},
                {"role": "assistant", "content": "b"}
            ],
            "systemPrompt": "Be brief",
            "generationSettings": {"temperature": 0.1, "maxResponseTokens": 64},
            "maxContextMessages": 10
        });
        let stored = parse_conversation(&raw).into_result().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[0].timestamp, stored.messages[1].timestamp);
        assert_eq!(stored.system_prompt.as_deref(), Some("Be brief"));
        assert_eq!(stored.max_context_messages, Some(10));

        let settings = stored.settings_over(&GenerationSettings::default());
        assert_eq!(settings.temperature, 0.1);
        assert_eq!(settings.max_response_tokens, 64);
    }

    #[test]
    fn test_conversation_as_bare_array() {
        let raw = json!([{"role": "user", "content": "a"}]);
        let stored = parse_conversation(&raw).into_result().unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert!(stored.system_prompt.is_none());
    }

    #[test]
    fn test_conversation_error_names_message_index() {
        let raw = json!({"messages": [{"role": "user", "content": "a"}, {"role": "user"}]});
        let reason = parse_conversation(&raw).into_result().unwrap_err();
        assert!(reason.starts_with("message 1:"), "{reason}");
    }

    #[test]
    fn test_query_result_clamps_scores() {
        let raw = json!({
            "sources": [
                {"content": "a", "relevanceScore": 1.7},
                {"content": "b", "relevance_score": -0.2}
            ],
            "confidence": 3.0
        });
        let payload = parse_query_result(&raw).into_result().unwrap();
        assert_eq!(payload.sources[0].relevance_score, 1.0);
        assert_eq!(payload.sources[1].relevance_score, 0.0);
        assert_eq!(payload.confidence, Some(1.0));
    }

    #[test]
    fn test_collection_stats_defaults_to_zero() {
        let stats = parse_collection_stats(&json!({})).into_result().unwrap();
        assert!(stats.is_empty());
        let stats = parse_collection_stats(&json!({"size_bytes": 2048, "pointCount": 3}))
            .into_result()
            .unwrap();
        assert_eq!(stats.point_count, 3);
        assert!(matches!(
            parse_collection_stats(&json!({"pointCount": -1})),
            ParseResult::Malformed { .. }
        ));
    }

    #[test]
    fn test_append_receipt() {
        let raw = json!({"success": true, "savedMessage": {"role": "user", "content": "x"}});
        let receipt = parse_append_receipt(&raw).into_result().unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.saved_message.unwrap().content, "x");
        assert!(matches!(
            parse_append_receipt(&json!({"ok": 1})),
            ParseResult::Malformed { .. }
        ));
    }
}
