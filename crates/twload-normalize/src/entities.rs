//! Extraction of the entity block (links, tags, media, mentions) into stored records and
//! per-post reference lists.

use chrono::{DateTime, Utc};
use twload_core::{
    is_newer, latest, Author, Entity, EntityRef, Extra, Hashtag, Link, MediaItem, MediaSize,
    Symbol, Versioned,
};
use twload_storage::{EntityStore, StoreError, StoreSet};

use crate::author::AuthorNormalizer;
use crate::raw::{RawAuthor, RawEntities, RawMedia, RawTag, RawUrl};
use crate::{non_empty, Anomaly, AnomalyLog, NormalizeRules};

/// Reference lists produced for one post.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedEntities {
    pub urls: Vec<String>,
    pub hashtags: Vec<String>,
    pub symbols: Vec<String>,
    pub media: Vec<String>,
    pub user_mentions: Vec<EntityRef>,
    /// Categories without reference reduction, carried onto the post as-is.
    pub passthrough: Extra,
}

pub struct EntityExtractor<'r> {
    authors: AuthorNormalizer<'r>,
}

impl<'r> EntityExtractor<'r> {
    pub fn new(rules: &'r NormalizeRules) -> Self {
        Self {
            authors: AuthorNormalizer::new(rules),
        }
    }

    pub fn extract(
        &self,
        stores: &mut StoreSet<'_>,
        entities: Option<RawEntities>,
        extended: Option<RawEntities>,
        stamp: Option<DateTime<Utc>>,
        anomalies: &mut AnomalyLog,
    ) -> Result<ExtractedEntities, StoreError> {
        let mut out = ExtractedEntities::default();
        let mut media = Vec::new();

        if let Some(entities) = entities {
            let RawEntities {
                urls,
                hashtags,
                symbols,
                media: listed_media,
                user_mentions,
                other,
            } = entities;

            out.urls = extract_links(&mut *stores.links, urls.unwrap_or_default(), anomalies)?;
            out.hashtags = touch_tags(
                &mut *stores.hashtags,
                hashtags.unwrap_or_default(),
                stamp,
                normalize_hashtag,
                |text, last_modified| Hashtag {
                    text,
                    last_modified,
                },
            )?;
            out.symbols = touch_tags(
                &mut *stores.symbols,
                symbols.unwrap_or_default(),
                stamp,
                normalize_symbol,
                |text, last_modified| Symbol {
                    text,
                    last_modified,
                },
            )?;
            out.user_mentions = self.extract_mentions(
                &mut *stores.authors,
                user_mentions.unwrap_or_default(),
                stamp,
                anomalies,
            )?;
            media.extend(listed_media.into_iter().flatten());
            out.passthrough = other.into_iter().collect();
        }

        if let Some(extended) = extended {
            media.extend(extended.media.into_iter().flatten());
        }
        out.media = extract_media(&mut *stores.media, media, stamp, anomalies)?;

        Ok(out)
    }

    fn extract_mentions(
        &self,
        authors: &mut dyn EntityStore<Author>,
        mentions: Vec<RawAuthor>,
        stamp: Option<DateTime<Utc>>,
        anomalies: &mut AnomalyLog,
    ) -> Result<Vec<EntityRef>, StoreError> {
        let mut references = Vec::new();
        for mention in mentions {
            let screen_name = mention.screen_name.clone().unwrap_or_default();
            match self.authors.reduce(authors, mention, stamp, anomalies)? {
                Some(reference) => push_unique(&mut references, reference),
                None => anomalies.record(Anomaly::MentionWithoutId, &screen_name),
            }
        }
        Ok(references)
    }
}

/// Links are minted once by the platform, so the latest delivery simply wins.
fn extract_links(
    links: &mut dyn EntityStore<Link>,
    urls: Vec<RawUrl>,
    anomalies: &mut AnomalyLog,
) -> Result<Vec<String>, StoreError> {
    let mut keys = Vec::new();
    for raw in urls {
        let Some(url) = non_empty(raw.url) else {
            anomalies.record(
                Anomaly::LinkWithoutUrl,
                raw.expanded_url.as_deref().unwrap_or_default(),
            );
            continue;
        };
        links.upsert(Link {
            url: url.clone(),
            expanded_url: raw.expanded_url,
            display_url: raw.display_url,
        })?;
        push_unique(&mut keys, url);
    }
    Ok(keys)
}

/// Tags carry no payload beyond their text; upserts only ever move `last_modified` forward.
fn touch_tags<T, F>(
    store: &mut dyn EntityStore<T>,
    tags: Vec<RawTag>,
    stamp: Option<DateTime<Utc>>,
    normalize: fn(&str) -> Option<String>,
    build: F,
) -> Result<Vec<String>, StoreError>
where
    T: Entity + Versioned,
    F: Fn(String, Option<DateTime<Utc>>) -> T,
{
    let mut keys = Vec::new();
    for tag in tags {
        let Some(text) = tag.text.as_deref().and_then(normalize) else {
            continue;
        };
        let stored = store.get(&text)?.and_then(|existing| existing.last_modified());
        store.upsert(build(text.clone(), latest(stored, stamp)))?;
        push_unique(&mut keys, text);
    }
    Ok(keys)
}

fn extract_media(
    store: &mut dyn EntityStore<MediaItem>,
    media: Vec<RawMedia>,
    stamp: Option<DateTime<Utc>>,
    anomalies: &mut AnomalyLog,
) -> Result<Vec<String>, StoreError> {
    let mut ids = Vec::new();
    for raw in media {
        let url = raw.url.clone().unwrap_or_default();
        let Some(item) = media_record(raw, stamp) else {
            anomalies.record(Anomaly::MediaWithoutId, &url);
            continue;
        };
        let existing = store.get(&item.id_str)?;
        let id = item.id_str.clone();
        if is_newer(stamp, existing.as_ref()) {
            store.upsert(item)?;
        }
        push_unique(&mut ids, id);
    }
    Ok(ids)
}

fn media_record(raw: RawMedia, stamp: Option<DateTime<Utc>>) -> Option<MediaItem> {
    let id_str = non_empty(raw.id_str)?;
    let sizes = raw
        .sizes
        .unwrap_or_default()
        .into_iter()
        .map(|(size, rendition)| MediaSize {
            size,
            w: rendition.w,
            h: rendition.h,
            resize: rendition.resize,
        })
        .collect();
    Some(MediaItem {
        id_str,
        media_url: raw.media_url.or(raw.media_url_https),
        url: raw.url,
        display_url: raw.display_url,
        expanded_url: raw.expanded_url,
        media_type: raw.media_type,
        sizes,
        last_modified: stamp,
    })
}

/// Hashtags compare case-insensitively on the platform; stored lowercased without `#`.
pub fn normalize_hashtag(text: &str) -> Option<String> {
    let text = text.trim().trim_start_matches(|c: char| c == '#' || c == '＃').trim();
    (!text.is_empty()).then(|| text.to_lowercase())
}

/// Cashtags are stored uppercased without `$`.
pub fn normalize_symbol(text: &str) -> Option<String> {
    let text = text.trim().trim_start_matches('$').trim();
    (!text.is_empty()).then(|| text.to_uppercase())
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}
