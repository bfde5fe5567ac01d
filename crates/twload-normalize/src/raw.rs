//! Wire shapes of raw platform documents.
//!
//! Every field is optional: the stream mixes API generations and partially populated
//! objects. Fields the normalizer does not interpret land in the flattened `extra` maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPost {
    pub id_str: Option<String>,
    pub created_at: Option<String>,
    pub text: Option<String>,
    pub lang: Option<String>,
    pub source: Option<String>,
    pub possibly_sensitive: Option<bool>,
    pub truncated: Option<bool>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub retweet_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub favorite_count: Option<u64>,
    pub user: Option<RawAuthor>,
    pub contributors: Option<Vec<RawAuthor>>,
    pub coordinates: Option<JsonValue>,
    pub geo: Option<JsonValue>,
    pub in_reply_to_status_id_str: Option<String>,
    pub in_reply_to_user_id_str: Option<String>,
    pub place: Option<RawPlace>,
    pub entities: Option<RawEntities>,
    pub extended_entities: Option<RawEntities>,
    /// Either a full embedded post or, in trimmed feeds, a bare id string.
    pub retweeted_status: Option<JsonValue>,
    /// Same shapes as `retweeted_status`.
    pub quoted_status: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Author-shaped object: post author, contributor or mention.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAuthor {
    pub id_str: Option<String>,
    pub screen_name: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub url: Option<String>,
    pub lang: Option<String>,
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub followers_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub friends_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub statuses_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub favourites_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub listed_count: Option<u64>,
    pub verified: Option<bool>,
    pub protected: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEntities {
    pub urls: Option<Vec<RawUrl>>,
    pub hashtags: Option<Vec<RawTag>>,
    pub symbols: Option<Vec<RawTag>>,
    pub media: Option<Vec<RawMedia>>,
    pub user_mentions: Option<Vec<RawAuthor>>,
    #[serde(flatten)]
    pub other: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUrl {
    pub url: Option<String>,
    pub expanded_url: Option<String>,
    pub display_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTag {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMedia {
    pub id_str: Option<String>,
    pub media_url: Option<String>,
    pub media_url_https: Option<String>,
    pub url: Option<String>,
    pub display_url: Option<String>,
    pub expanded_url: Option<String>,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub sizes: Option<BTreeMap<String, RawMediaSize>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMediaSize {
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub resize: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPlace {
    pub id: Option<String>,
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub place_type: Option<String>,
    pub url: Option<String>,
    pub bounding_box: Option<JsonValue>,
}

/// Counts arrive as numbers, as `null`, and in old payloads as strings like `"100+"`.
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(count_value))
}

pub(crate) fn count_value(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().trim_end_matches('+').parse().ok(),
        _ => None,
    }
}
