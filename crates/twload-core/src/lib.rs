//! Core entity model, platform timestamp handling and the recency gate for twload.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "twload-core";

/// Layout of platform timestamps, e.g. `Mon Jan 01 00:00:00 +0000 2024`.
pub const PLATFORM_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Platform fields carried through to storage without interpretation.
pub type Extra = BTreeMap<String, JsonValue>;

/// `[longitude, latitude]`, GeoJSON order.
pub type Coordinates = [f64; 2];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized timestamp {value:?}")]
pub struct TimestampError {
    pub value: String,
}

/// Parse a platform timestamp into a UTC instant. RFC 3339 input is accepted as well so
/// already-normalized records can be replayed.
pub fn parse_platform_time(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = value.trim();
    DateTime::parse_from_str(trimmed, PLATFORM_TIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed))
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| TimestampError {
            value: value.to_string(),
        })
}

/// A record that lives in its own keyed collection.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + 'static {
    const COLLECTION: &'static str;

    fn key(&self) -> &str;
}

/// A record whose overwrites are gated on `last_modified`.
pub trait Versioned {
    fn last_modified(&self) -> Option<DateTime<Utc>>;
}

/// Recency gate: may a candidate stamped `candidate` overwrite `existing`?
///
/// An absent record, or a stored record without a timestamp, always loses. A candidate
/// without a timestamp never replaces a stamped record. Otherwise the candidate must be
/// strictly newer, so replaying the same version is a no-op.
pub fn is_newer<T: Versioned + ?Sized>(candidate: Option<DateTime<Utc>>, existing: Option<&T>) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    match (candidate, existing.last_modified()) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(candidate), Some(stored)) => candidate > stored,
    }
}

/// The later of two optional instants.
pub fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Bare reference to a post or author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub id_str: String,
}

impl EntityRef {
    pub fn new(id_str: impl Into<String>) -> Self {
        Self {
            id_str: id_str.into(),
        }
    }
}

/// Bare reference to a place. Places are keyed by their string `id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceRef {
    pub id: String,
}

/// Normalized post. Every nested object is reduced to a reference.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Post {
    pub id_str: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possibly_sensitive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retweet_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retweeted_status: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quoted_status: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_status: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to_user: Option<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashtags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_mentions: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place: Option<PlaceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Post {
    /// Keys written by the struct itself. Pass-through `extra` must never repeat them.
    pub const FIELDS: &'static [&'static str] = &[
        "id_str",
        "text",
        "created_at",
        "lang",
        "source",
        "possibly_sensitive",
        "truncated",
        "retweet_count",
        "favorite_count",
        "coordinates",
        "user",
        "retweeted_status",
        "quoted_status",
        "in_reply_to_status",
        "in_reply_to_user",
        "contributors",
        "hashtags",
        "symbols",
        "urls",
        "media",
        "user_mentions",
        "place",
        "last_modified",
    ];
}

impl Entity for Post {
    const COLLECTION: &'static str = "posts";

    fn key(&self) -> &str {
        &self.id_str
    }
}

impl Versioned for Post {
    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }
}

/// Stored author profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Author {
    pub id_str: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friends_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favourites_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listed_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Extra,
}

impl Author {
    /// Keys written by the struct itself. Pass-through `extra` must never repeat them.
    pub const FIELDS: &'static [&'static str] = &[
        "id_str",
        "screen_name",
        "name",
        "description",
        "location",
        "url",
        "lang",
        "created_at",
        "followers_count",
        "friends_count",
        "statuses_count",
        "favourites_count",
        "listed_count",
        "verified",
        "protected",
        "last_modified",
    ];

    /// Fold a newer version of the same author into this one. Fields the newer version
    /// carries win; fields it lacks keep their stored value.
    pub fn absorb(&mut self, newer: Author) {
        macro_rules! take_present {
            ($($field:ident),+ $(,)?) => {
                $(if newer.$field.is_some() {
                    self.$field = newer.$field;
                })+
            };
        }

        take_present!(
            screen_name,
            name,
            description,
            location,
            url,
            lang,
            created_at,
            followers_count,
            friends_count,
            statuses_count,
            favourites_count,
            listed_count,
            verified,
            protected,
        );
        self.last_modified = latest(self.last_modified, newer.last_modified);
        self.extra.extend(newer.extra);
    }
}

impl Entity for Author {
    const COLLECTION: &'static str = "authors";

    fn key(&self) -> &str {
        &self.id_str
    }
}

impl Versioned for Author {
    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }
}

/// Shortened link minted by the platform, keyed by its short form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
}

impl Entity for Link {
    const COLLECTION: &'static str = "links";

    fn key(&self) -> &str {
        &self.url
    }
}

/// One rendition of a media item (`thumb`, `small`, `medium`, `large`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaSize {
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<String>,
}

/// Uploaded media. Sizes are owned and replaced together with the item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaItem {
    pub id_str: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expanded_url: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sizes: Vec<MediaSize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Entity for MediaItem {
    const COLLECTION: &'static str = "media";

    fn key(&self) -> &str {
        &self.id_str
    }
}

impl Versioned for MediaItem {
    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hashtag {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Entity for Hashtag {
    const COLLECTION: &'static str = "hashtags";

    fn key(&self) -> &str {
        &self.text
    }
}

impl Versioned for Hashtag {
    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }
}

/// Cashtag such as `$AAPL`, stored without the sigil.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Symbol {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl Entity for Symbol {
    const COLLECTION: &'static str = "symbols";

    fn key(&self) -> &str {
        &self.text
    }
}

impl Versioned for Symbol {
    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }
}

/// Named place with a flattened bounding polygon (at most four corners).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bounding_box: Vec<Coordinates>,
}

pub const MAX_BOUNDING_BOX_CORNERS: usize = 4;

impl Place {
    /// `(min_lon, min_lat, max_lon, max_lat)` of the bounding box, if it has any corner.
    pub fn extent(&self) -> Option<(f64, f64, f64, f64)> {
        let mut corners = self.bounding_box.iter();
        let first = corners.next()?;
        let init = (first[0], first[1], first[0], first[1]);
        Some(corners.fold(init, |(min_lon, min_lat, max_lon, max_lat), [lon, lat]| {
            (min_lon.min(*lon), min_lat.min(*lat), max_lon.max(*lon), max_lat.max(*lat))
        }))
    }

    pub fn contains(&self, [lon, lat]: Coordinates) -> bool {
        self.extent()
            .map(|(min_lon, min_lat, max_lon, max_lat)| {
                (min_lon..=max_lon).contains(&lon) && (min_lat..=max_lat).contains(&lat)
            })
            .unwrap_or(false)
    }

    pub fn area(&self) -> Option<f64> {
        self.extent()
            .map(|(min_lon, min_lat, max_lon, max_lat)| (max_lon - min_lon) * (max_lat - min_lat))
    }
}

impl Entity for Place {
    const COLLECTION: &'static str = "places";

    fn key(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().unwrap()
    }

    fn author_at(id: &str, last_modified: Option<DateTime<Utc>>) -> Author {
        Author {
            id_str: id.to_string(),
            last_modified,
            ..Default::default()
        }
    }

    #[test]
    fn platform_time_parses_to_utc() {
        let parsed = parse_platform_time("Mon Jan 01 00:00:00 +0000 2024").unwrap();
        assert_eq!(parsed, ts(1));

        let shifted = parse_platform_time("Tue Jan 02 02:30:00 +0200 2024").unwrap();
        assert_eq!(shifted, Utc.with_ymd_and_hms(2024, 1, 2, 0, 30, 0).single().unwrap());
    }

    #[test]
    fn rfc3339_is_accepted_and_garbage_is_rejected() {
        assert_eq!(parse_platform_time("2024-01-03T00:00:00Z").unwrap(), ts(3));
        let err = parse_platform_time("yesterday").unwrap_err();
        assert_eq!(err.value, "yesterday");
    }

    #[test]
    fn absent_record_always_loses() {
        assert!(is_newer::<Author>(Some(ts(1)), None));
        assert!(is_newer::<Author>(None, None));
    }

    #[test]
    fn unstamped_record_always_loses() {
        let stored = author_at("u1", None);
        assert!(is_newer(Some(ts(1)), Some(&stored)));
        assert!(is_newer(None, Some(&stored)));
    }

    #[test]
    fn candidate_must_be_strictly_newer() {
        let stored = author_at("u1", Some(ts(2)));
        assert!(is_newer(Some(ts(3)), Some(&stored)));
        assert!(!is_newer(Some(ts(2)), Some(&stored)));
        assert!(!is_newer(Some(ts(1)), Some(&stored)));
        assert!(!is_newer(None, Some(&stored)));
    }

    #[test]
    fn absorb_keeps_stored_fields_the_newer_version_lacks() {
        let mut stored = Author {
            id_str: "u1".into(),
            screen_name: Some("old".into()),
            description: Some("bio".into()),
            followers_count: Some(10),
            last_modified: Some(ts(1)),
            ..Default::default()
        };
        let newer = Author {
            id_str: "u1".into(),
            screen_name: Some("new".into()),
            last_modified: Some(ts(2)),
            ..Default::default()
        };

        stored.absorb(newer);
        assert_eq!(stored.screen_name.as_deref(), Some("new"));
        assert_eq!(stored.description.as_deref(), Some("bio"));
        assert_eq!(stored.followers_count, Some(10));
        assert_eq!(stored.last_modified, Some(ts(2)));
    }

    #[test]
    fn place_containment_uses_bounding_extent() {
        let place = Place {
            id: "p1".into(),
            bounding_box: vec![[-1.0, 50.0], [1.0, 50.0], [1.0, 52.0], [-1.0, 52.0]],
            ..Default::default()
        };
        assert!(place.contains([0.0, 51.0]));
        assert!(place.contains([1.0, 52.0]));
        assert!(!place.contains([2.0, 51.0]));
        assert_eq!(place.area(), Some(4.0));
        assert!(!Place::default().contains([0.0, 0.0]));
    }

    #[test]
    fn post_serialization_omits_empty_fields() {
        let post = Post {
            id_str: "1".into(),
            text: Some("hello".into()),
            user: Some(EntityRef::new("u1")),
            last_modified: Some(ts(1)),
            ..Default::default()
        };
        let value = serde_json::to_value(&post).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id_str": "1",
                "text": "hello",
                "user": { "id_str": "u1" },
                "last_modified": "2024-01-01T00:00:00Z",
            })
        );
        let back: Post = serde_json::from_value(value).unwrap();
        assert_eq!(back, post);
    }

    #[test]
    fn field_lists_cover_every_serialized_key() {
        let post = Post {
            id_str: "1".into(),
            text: Some("t".into()),
            created_at: Some(ts(1)),
            lang: Some("en".into()),
            source: Some("web".into()),
            possibly_sensitive: Some(false),
            truncated: Some(false),
            retweet_count: Some(1),
            favorite_count: Some(1),
            coordinates: Some([1.0, 2.0]),
            user: Some(EntityRef::new("u1")),
            retweeted_status: Some(EntityRef::new("2")),
            quoted_status: Some(EntityRef::new("3")),
            in_reply_to_status: Some(EntityRef::new("4")),
            in_reply_to_user: Some(EntityRef::new("u2")),
            contributors: vec![EntityRef::new("u3")],
            hashtags: vec!["rust".into()],
            symbols: vec!["AAPL".into()],
            urls: vec!["https://t.co/x".into()],
            media: vec!["9".into()],
            user_mentions: vec![EntityRef::new("u4")],
            place: Some(PlaceRef { id: "p".into() }),
            last_modified: Some(ts(1)),
            extra: Extra::new(),
        };
        let value = serde_json::to_value(&post).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), Post::FIELDS.len());
        assert!(keys.iter().all(|key| Post::FIELDS.contains(key)));

        let author = Author {
            id_str: "u1".into(),
            screen_name: Some("a".into()),
            name: Some("A".into()),
            description: Some("d".into()),
            location: Some("l".into()),
            url: Some("https://a.example".into()),
            lang: Some("en".into()),
            created_at: Some(ts(1)),
            followers_count: Some(1),
            friends_count: Some(1),
            statuses_count: Some(1),
            favourites_count: Some(1),
            listed_count: Some(1),
            verified: Some(false),
            protected: Some(false),
            last_modified: Some(ts(1)),
            extra: Extra::new(),
        };
        let value = serde_json::to_value(&author).unwrap();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(keys.len(), Author::FIELDS.len());
        assert!(keys.iter().all(|key| Author::FIELDS.contains(key)));
    }
}
