//! Reduction of embedded author objects to stored profiles plus bare references.

use chrono::{DateTime, Utc};
use twload_core::{is_newer, parse_platform_time, Author, EntityRef};
use twload_storage::{EntityStore, StoreError};

use crate::raw::RawAuthor;
use crate::{non_empty, Anomaly, AnomalyLog, NormalizeRules};

pub struct AuthorNormalizer<'r> {
    rules: &'r NormalizeRules,
}

impl<'r> AuthorNormalizer<'r> {
    pub fn new(rules: &'r NormalizeRules) -> Self {
        Self { rules }
    }

    /// Build the stored form of an embedded author, stamped with the containing post's
    /// timestamp. Returns `None` when the object has no usable `id_str`.
    pub fn to_record(
        &self,
        raw: RawAuthor,
        stamp: Option<DateTime<Utc>>,
        anomalies: &mut AnomalyLog,
    ) -> Option<Author> {
        let RawAuthor {
            id_str,
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
            extra,
        } = raw;
        let id_str = non_empty(id_str)?;

        let created_at = match created_at.as_deref().map(parse_platform_time).transpose() {
            Ok(created_at) => created_at,
            Err(err) => {
                anomalies.record(Anomaly::AuthorTimestamp, &format!("{id_str}: {err}"));
                None
            }
        };

        Some(Author {
            id_str,
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
            last_modified: stamp,
            extra: extra
                .into_iter()
                .filter(|(key, value)| {
                    !value.is_null()
                        && !Author::FIELDS.contains(&key.as_str())
                        && !self.rules.discards_author_field(key)
                })
                .collect(),
        })
    }

    /// Upsert the author when `stamp` beats the stored version, merging over what is
    /// stored, and hand back the `{id_str}` reference either way.
    pub fn reduce(
        &self,
        authors: &mut dyn EntityStore<Author>,
        raw: RawAuthor,
        stamp: Option<DateTime<Utc>>,
        anomalies: &mut AnomalyLog,
    ) -> Result<Option<EntityRef>, StoreError> {
        let Some(candidate) = self.to_record(raw, stamp, anomalies) else {
            return Ok(None);
        };
        let reference = EntityRef::new(candidate.id_str.clone());

        let existing = authors.get(&candidate.id_str)?;
        if is_newer(stamp, existing.as_ref()) {
            let record = match existing {
                Some(mut stored) => {
                    stored.absorb(candidate);
                    stored
                }
                None => candidate,
            };
            authors.upsert(record)?;
        }
        Ok(Some(reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use twload_storage::MemoryStore;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().unwrap()
    }

    fn raw(json: &str) -> RawAuthor {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn first_sighting_is_stored_and_reduced() {
        let rules = NormalizeRules::default();
        let normalizer = AuthorNormalizer::new(&rules);
        let mut store = MemoryStore::<Author>::new();
        let mut anomalies = AnomalyLog::default();

        let reference = normalizer
            .reduce(
                &mut store,
                raw(r#"{"id_str":"u1","id":1,"screen_name":"a","following":true,"profile_text_color":"333333"}"#),
                Some(ts(1)),
                &mut anomalies,
            )
            .unwrap();

        assert_eq!(reference, Some(EntityRef::new("u1")));
        let stored = store.get("u1").unwrap().unwrap();
        assert_eq!(stored.screen_name.as_deref(), Some("a"));
        assert_eq!(stored.last_modified, Some(ts(1)));
        assert!(!stored.extra.contains_key("id"));
        assert!(!stored.extra.contains_key("following"));
        assert_eq!(stored.extra["profile_text_color"], "333333");
    }

    #[test]
    fn stale_payload_keeps_newer_profile_but_still_references() {
        let rules = NormalizeRules::default();
        let normalizer = AuthorNormalizer::new(&rules);
        let mut store = MemoryStore::<Author>::new();
        let mut anomalies = AnomalyLog::default();

        normalizer
            .reduce(&mut store, raw(r#"{"id_str":"u1","screen_name":"new"}"#), Some(ts(3)), &mut anomalies)
            .unwrap();
        let reference = normalizer
            .reduce(&mut store, raw(r#"{"id_str":"u1","screen_name":"old"}"#), Some(ts(2)), &mut anomalies)
            .unwrap();

        assert_eq!(reference, Some(EntityRef::new("u1")));
        let stored = store.get("u1").unwrap().unwrap();
        assert_eq!(stored.screen_name.as_deref(), Some("new"));
        assert_eq!(stored.last_modified, Some(ts(3)));
    }

    #[test]
    fn newer_mention_payload_merges_over_full_profile() {
        let rules = NormalizeRules::default();
        let normalizer = AuthorNormalizer::new(&rules);
        let mut store = MemoryStore::<Author>::new();
        let mut anomalies = AnomalyLog::default();

        normalizer
            .reduce(
                &mut store,
                raw(r#"{"id_str":"u1","screen_name":"a","description":"bio","followers_count":7}"#),
                Some(ts(1)),
                &mut anomalies,
            )
            .unwrap();
        normalizer
            .reduce(
                &mut store,
                raw(r#"{"id_str":"u1","screen_name":"renamed","indices":[0,5]}"#),
                Some(ts(2)),
                &mut anomalies,
            )
            .unwrap();

        let stored = store.get("u1").unwrap().unwrap();
        assert_eq!(stored.screen_name.as_deref(), Some("renamed"));
        assert_eq!(stored.description.as_deref(), Some("bio"));
        assert_eq!(stored.followers_count, Some(7));
        assert!(!stored.extra.contains_key("indices"));
        assert_eq!(stored.last_modified, Some(ts(2)));
    }

    #[test]
    fn missing_id_yields_no_reference_and_no_write() {
        let rules = NormalizeRules::default();
        let normalizer = AuthorNormalizer::new(&rules);
        let mut store = MemoryStore::<Author>::new();
        let mut anomalies = AnomalyLog::default();

        let reference = normalizer
            .reduce(&mut store, raw(r#"{"screen_name":"ghost"}"#), Some(ts(1)), &mut anomalies)
            .unwrap();
        assert_eq!(reference, None);
        assert!(store.is_empty());
    }

    #[test]
    fn bad_profile_timestamp_is_dropped_not_fatal() {
        let rules = NormalizeRules::default();
        let normalizer = AuthorNormalizer::new(&rules);
        let mut anomalies = AnomalyLog::default();

        let author = normalizer
            .to_record(
                raw(r#"{"id_str":"u1","created_at":"not a date"}"#),
                Some(ts(1)),
                &mut anomalies,
            )
            .unwrap();
        assert_eq!(author.created_at, None);
        assert_eq!(anomalies.count(Anomaly::AuthorTimestamp), 1);
    }
}
