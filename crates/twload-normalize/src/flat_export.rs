//! Flat, store-free rendition of a raw post for downstream analysis.
//!
//! A repost is replaced by its original's content, keeping the wrapper's ids. Entity
//! objects collapse into scalar lists and empty values are stripped.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Top-level fields removed from every flattened post.
pub const FLAT_EXPORT_DROPPED_FIELDS: &[&str] = &[
    "annotations",
    "contributors",
    "user",
    "filter_level",
    "id",
    "in_reply_to_status_id",
    "in_reply_to_user_id",
    "scopes",
    "source",
    "truncated",
    "possibly_sensitive",
    "withheld_copyright",
    "withheld_in_countries",
    "withheld_scope",
    "witheld_copyright",
    "witheld_in_countries",
    "witheld_scope",
    "place",
    "favorited",
    "current_user_retweet",
    "retweeted",
];

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("expected a JSON object, found {found}")]
    NotAnObject { found: &'static str },
    #[error("malformed document: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn flatten_line(line: &str) -> Result<Map<String, JsonValue>, ExportError> {
    let value: JsonValue = serde_json::from_str(line)?;
    flatten_post(&value)
}

/// Flatten one post.
///
/// A repost's original id and original author id land in `retweeted_id` and
/// `retweeted_user_id`; `id_str` and `user_id_str` always describe the wrapper.
pub fn flatten_post(value: &JsonValue) -> Result<Map<String, JsonValue>, ExportError> {
    let wrapper = value.as_object().ok_or(ExportError::NotAnObject {
        found: kind_of(value),
    })?;

    let user_id = nested_str(wrapper, "user", "id_str");
    let post_id = present(wrapper, "id_str");

    let (content, repost_ids) = match wrapper.get("retweeted_status") {
        Some(JsonValue::Object(original)) => (
            original,
            Some((
                present(original, "id_str"),
                nested_str(original, "user", "id_str"),
            )),
        ),
        _ => (wrapper, None),
    };

    let mut flat: Map<String, JsonValue> = content
        .iter()
        .filter(|(key, _)| !FLAT_EXPORT_DROPPED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if let Some(entities) = flat.remove("entities") {
        let lists = [
            ("urls", "urls", "expanded_url"),
            ("mention_ids", "user_mentions", "id_str"),
            ("hashtags", "hashtags", "text"),
            ("symbols", "symbols", "text"),
        ];
        for (target, category, field) in lists {
            let values = scalar_list(&entities, category, field);
            if !values.is_empty() {
                flat.insert(target.to_string(), JsonValue::Array(values));
            }
        }
    }

    flat.retain(|_, value| !is_empty_value(value));
    flat.remove("id_str");

    if let Some(user_id) = user_id {
        flat.insert("user_id_str".to_string(), user_id);
    }
    if let Some(post_id) = post_id {
        flat.insert("id_str".to_string(), post_id);
    }
    if let Some((repost_id, repost_user_id)) = repost_ids {
        if let Some(repost_id) = repost_id {
            flat.insert("retweeted_id".to_string(), repost_id);
        }
        if let Some(repost_user_id) = repost_user_id {
            flat.insert("retweeted_user_id".to_string(), repost_user_id);
        }
    }
    Ok(flat)
}

fn present(object: &Map<String, JsonValue>, key: &str) -> Option<JsonValue> {
    object.get(key).filter(|value| !value.is_null()).cloned()
}

fn nested_str(object: &Map<String, JsonValue>, outer: &str, inner: &str) -> Option<JsonValue> {
    object
        .get(outer)
        .and_then(|value| value.get(inner))
        .filter(|value| !value.is_null())
        .cloned()
}

fn scalar_list(entities: &JsonValue, category: &str, field: &str) -> Vec<JsonValue> {
    entities
        .get(category)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field))
                .filter(|value| !value.is_null())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
