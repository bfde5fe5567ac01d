//! Normalization of raw platform posts into deduplicated, reference-linked records.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use twload_core::{is_newer, parse_platform_time, EntityRef, Extra, Post, TimestampError};
use twload_storage::{StoreError, StoreSet};

mod author;
mod entities;
mod flat_export;
pub mod place;
pub mod raw;

pub use author::AuthorNormalizer;
pub use entities::{normalize_hashtag, normalize_symbol, EntityExtractor, ExtractedEntities};
pub use flat_export::{flatten_line, flatten_post, ExportError, FLAT_EXPORT_DROPPED_FIELDS};
pub use raw::RawPost;

pub const CRATE_NAME: &str = "twload-normalize";

/// Post fields with no persisted equivalent.
pub const DISCARDED_POST_FIELDS: &[&str] = &[
    "annotations",
    "id",
    "favorited",
    "retweeted",
    "current_user_retweet",
    "scopes",
    "in_reply_to_status_id",
    "in_reply_to_user_id",
    "in_reply_to_screen_name",
];

/// Author fields that are either redundant or relative to the viewing account.
pub const DISCARDED_AUTHOR_FIELDS: &[&str] =
    &["id", "indices", "following", "follow_request_sent", "notifications"];

pub const DEFAULT_MAX_REPOST_DEPTH: usize = 2;

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    PostWithoutId,
    AuthorWithoutId,
    ContributorWithoutId,
    MentionWithoutId,
    MediaWithoutId,
    PlaceWithoutId,
    LinkWithoutUrl,
    AuthorTimestamp,
    RepostTooDeep,
}

impl Anomaly {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostWithoutId => "post_without_id",
            Self::AuthorWithoutId => "author_without_id",
            Self::ContributorWithoutId => "contributor_without_id",
            Self::MentionWithoutId => "mention_without_id",
            Self::MediaWithoutId => "media_without_id",
            Self::PlaceWithoutId => "place_without_id",
            Self::LinkWithoutUrl => "link_without_url",
            Self::AuthorTimestamp => "author_timestamp",
            Self::RepostTooDeep => "repost_too_deep",
        }
    }
}

/// Counts of recoverable data problems. Each one is logged as it is recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyLog {
    counts: BTreeMap<Anomaly, u64>,
}

impl AnomalyLog {
    pub fn record(&mut self, anomaly: Anomaly, context: &str) {
        warn!(anomaly = anomaly.as_str(), context, "dropping malformed data");
        *self.counts.entry(anomaly).or_default() += 1;
    }

    pub fn count(&self, anomaly: Anomaly) -> u64 {
        self.counts.get(&anomaly).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Anomaly, u64)> + '_ {
        self.counts.iter().map(|(anomaly, count)| (*anomaly, *count))
    }

    pub fn merge(&mut self, other: &AnomalyLog) {
        for (anomaly, count) in other.iter() {
            *self.counts.entry(anomaly).or_default() += count;
        }
    }
}

/// Optional rules file extending the built-in discard lists.
///
/// ```yaml
/// version: 1
/// discard_post_fields: [filter_level, matching_rules]
/// discard_author_fields: [profile_background_tile]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NormalizeRules {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub discard_post_fields: Vec<String>,
    #[serde(default)]
    pub discard_author_fields: Vec<String>,
}

impl NormalizeRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing normalize rules")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn discards_post_field(&self, name: &str) -> bool {
        DISCARDED_POST_FIELDS.contains(&name) || self.discard_post_fields.iter().any(|f| f == name)
    }

    pub fn discards_author_field(&self, name: &str) -> bool {
        DISCARDED_AUTHOR_FIELDS.contains(&name)
            || self.discard_author_fields.iter().any(|f| f == name)
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub rules: NormalizeRules,
    /// Embedded originals nested deeper than this are referenced but not normalized.
    pub max_repost_depth: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            rules: NormalizeRules::default(),
            max_repost_depth: DEFAULT_MAX_REPOST_DEPTH,
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {source}")]
    Timestamp {
        field: &'static str,
        #[source]
        source: TimestampError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeOutcome {
    Stored { id_str: String },
    /// The stored version is at least as new; nothing was written.
    NotNewer { id_str: String },
    MissingId,
}

/// Turns raw posts into stored records, one document at a time.
pub struct PostNormalizer<'s> {
    stores: StoreSet<'s>,
    options: NormalizeOptions,
    anomalies: AnomalyLog,
}

impl<'s> PostNormalizer<'s> {
    pub fn new(stores: StoreSet<'s>, options: NormalizeOptions) -> Self {
        Self {
            stores,
            options,
            anomalies: AnomalyLog::default(),
        }
    }

    pub fn stores(&self) -> &StoreSet<'s> {
        &self.stores
    }

    pub fn anomalies(&self) -> &AnomalyLog {
        &self.anomalies
    }

    /// Hand over the anomalies recorded so far and start a fresh log.
    pub fn take_anomalies(&mut self) -> AnomalyLog {
        std::mem::take(&mut self.anomalies)
    }

    pub fn normalize_line(&mut self, line: &str) -> Result<NormalizeOutcome, NormalizeError> {
        let raw: RawPost = serde_json::from_str(line)?;
        self.normalize(raw)
    }

    pub fn normalize(&mut self, raw: RawPost) -> Result<NormalizeOutcome, NormalizeError> {
        self.normalize_at_depth(raw, 0)
    }

    fn normalize_at_depth(
        &mut self,
        raw: RawPost,
        depth: usize,
    ) -> Result<NormalizeOutcome, NormalizeError> {
        let created_at = raw
            .created_at
            .as_deref()
            .map(parse_platform_time)
            .transpose()
            .map_err(|source| NormalizeError::Timestamp {
                field: "created_at",
                source,
            })?;

        let RawPost {
            id_str,
            created_at: _,
            text,
            lang,
            source,
            possibly_sensitive,
            truncated,
            retweet_count,
            favorite_count,
            user,
            contributors,
            coordinates,
            geo,
            in_reply_to_status_id_str,
            in_reply_to_user_id_str,
            place,
            entities,
            extended_entities,
            retweeted_status,
            quoted_status,
            extra,
        } = raw;

        let Some(id_str) = non_empty(id_str) else {
            self.anomalies
                .record(Anomaly::PostWithoutId, text.as_deref().unwrap_or_default());
            return Ok(NormalizeOutcome::MissingId);
        };

        let existing = self.stores.posts.get(&id_str)?;
        if !is_newer(created_at, existing.as_ref()) {
            debug!(id_str = %id_str, depth, "stored post is at least as new");
            return Ok(NormalizeOutcome::NotNewer { id_str });
        }

        let mut contributor_refs: Vec<EntityRef> = Vec::new();
        for contributor in contributors.unwrap_or_default() {
            let label = contributor.screen_name.clone().unwrap_or_default();
            let reduced = AuthorNormalizer::new(&self.options.rules).reduce(
                &mut *self.stores.authors,
                contributor,
                created_at,
                &mut self.anomalies,
            )?;
            match reduced {
                Some(reference) if !contributor_refs.contains(&reference) => {
                    contributor_refs.push(reference)
                }
                Some(_) => {}
                None => self.anomalies.record(Anomaly::ContributorWithoutId, &label),
            }
        }

        let point = place::extract_point(coordinates.as_ref(), geo.as_ref());
        let in_reply_to_status = non_empty(in_reply_to_status_id_str).map(EntityRef::new);
        let in_reply_to_user = non_empty(in_reply_to_user_id_str).map(EntityRef::new);

        let place_ref =
            place::resolve(&mut *self.stores.places, place, point, &mut self.anomalies)?;

        let extracted = EntityExtractor::new(&self.options.rules).extract(
            &mut self.stores,
            entities,
            extended_entities,
            created_at,
            &mut self.anomalies,
        )?;

        let repost_ref = self.resolve_embedded(retweeted_status, depth)?;
        let quote_ref = self.resolve_embedded(quoted_status, depth)?;

        let user_ref = match user {
            Some(author) => {
                let reduced = AuthorNormalizer::new(&self.options.rules).reduce(
                    &mut *self.stores.authors,
                    author,
                    created_at,
                    &mut self.anomalies,
                )?;
                if reduced.is_none() {
                    self.anomalies.record(Anomaly::AuthorWithoutId, &id_str);
                }
                reduced
            }
            None => None,
        };

        let mut kept: Extra = extra
            .into_iter()
            .filter(|(key, value)| {
                !value.is_null()
                    && !Post::FIELDS.contains(&key.as_str())
                    && !self.options.rules.discards_post_field(key)
            })
            .collect();
        for (category, value) in extracted.passthrough {
            if !Post::FIELDS.contains(&category.as_str()) {
                kept.entry(category).or_insert(value);
            }
        }

        let post = Post {
            id_str: id_str.clone(),
            text,
            created_at,
            lang,
            source,
            possibly_sensitive,
            truncated,
            retweet_count,
            favorite_count,
            coordinates: point,
            user: user_ref,
            retweeted_status: repost_ref,
            quoted_status: quote_ref,
            in_reply_to_status,
            in_reply_to_user,
            contributors: contributor_refs,
            hashtags: extracted.hashtags,
            symbols: extracted.symbols,
            urls: extracted.urls,
            media: extracted.media,
            user_mentions: extracted.user_mentions,
            place: place_ref,
            last_modified: created_at,
            extra: kept,
        };
        self.stores.posts.upsert(post)?;
        debug!(id_str = %id_str, depth, "stored post");
        Ok(NormalizeOutcome::Stored { id_str })
    }

    /// Normalize an embedded original (within the depth guard), then reference it only if a
    /// post with its id is now stored. Used for both reposts and quotes.
    fn resolve_embedded(
        &mut self,
        value: Option<JsonValue>,
        depth: usize,
    ) -> Result<Option<EntityRef>, NormalizeError> {
        let original_id = match value {
            None | Some(JsonValue::Null) => return Ok(None),
            Some(JsonValue::String(id_str)) => non_empty(Some(id_str)),
            Some(value @ JsonValue::Object(_)) => {
                let original: RawPost = serde_json::from_value(value)?;
                let id_str = non_empty(original.id_str.clone());
                if depth >= self.options.max_repost_depth {
                    self.anomalies
                        .record(Anomaly::RepostTooDeep, id_str.as_deref().unwrap_or_default());
                } else {
                    self.normalize_at_depth(original, depth + 1)?;
                }
                id_str
            }
            Some(_) => None,
        };

        let Some(id_str) = original_id else {
            return Ok(None);
        };
        Ok(self
            .stores
            .posts
            .get(&id_str)?
            .map(|_| EntityRef::new(id_str)))
    }
}
