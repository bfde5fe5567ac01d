//! Entity store contract, in-memory collections and atomic JSONL snapshots for twload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use twload_core::{Author, Entity, Hashtag, Link, MediaItem, Place, Post, Symbol};
use uuid::Uuid;

pub const CRATE_NAME: &str = "twload-storage";

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{collection} store rejected {operation} of {key:?}: {message}")]
    Rejected {
        collection: &'static str,
        operation: &'static str,
        key: String,
        message: String,
    },
    #[error("{collection} store unavailable: {message}")]
    Unavailable {
        collection: &'static str,
        message: String,
    },
}

/// Per-collection store collaborator. `upsert` must be visible to the next `get` issued by
/// the same pipeline run.
pub trait EntityStore<T: Entity> {
    fn get(&self, key: &str) -> Result<Option<T>, StoreError>;

    fn upsert(&mut self, record: T) -> Result<(), StoreError>;

    /// Full scan returning owned copies.
    fn records(&self) -> Result<Vec<T>, StoreError>;

    /// Borrowing scan, used for place derivation. Stores that can lend records should
    /// override the cloning default.
    fn scan(&self, visit: &mut dyn FnMut(&T)) -> Result<(), StoreError> {
        for record in self.records()? {
            visit(&record);
        }
        Ok(())
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct MemoryStore<T> {
    records: BTreeMap<String, T>,
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<T: Entity> MemoryStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.values()
    }
}

impl<T: Entity> FromIterator<T> for MemoryStore<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            records: iter
                .into_iter()
                .map(|record| (record.key().to_string(), record))
                .collect(),
        }
    }
}

impl<T: Entity> EntityStore<T> for MemoryStore<T> {
    fn get(&self, key: &str) -> Result<Option<T>, StoreError> {
        Ok(self.records.get(key).cloned())
    }

    fn upsert(&mut self, record: T) -> Result<(), StoreError> {
        if record.key().is_empty() {
            return Err(StoreError::Rejected {
                collection: T::COLLECTION,
                operation: "upsert",
                key: String::new(),
                message: "empty primary key".to_string(),
            });
        }
        self.records.insert(record.key().to_string(), record);
        Ok(())
    }

    fn records(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.records.values().cloned().collect())
    }

    fn scan(&self, visit: &mut dyn FnMut(&T)) -> Result<(), StoreError> {
        self.records.values().for_each(visit);
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Store handles for one pipeline run, one per entity type.
pub struct StoreSet<'a> {
    pub posts: &'a mut dyn EntityStore<Post>,
    pub authors: &'a mut dyn EntityStore<Author>,
    pub links: &'a mut dyn EntityStore<Link>,
    pub media: &'a mut dyn EntityStore<MediaItem>,
    pub hashtags: &'a mut dyn EntityStore<Hashtag>,
    pub symbols: &'a mut dyn EntityStore<Symbol>,
    pub places: &'a mut dyn EntityStore<Place>,
}

impl StoreSet<'_> {
    pub fn counts(&self) -> CollectionCounts {
        CollectionCounts {
            posts: self.posts.len(),
            authors: self.authors.len(),
            links: self.links.len(),
            media: self.media.len(),
            hashtags: self.hashtags.len(),
            symbols: self.symbols.len(),
            places: self.places.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCounts {
    pub posts: usize,
    pub authors: usize,
    pub links: usize,
    pub media: usize,
    pub hashtags: usize,
    pub symbols: usize,
    pub places: usize,
}

impl CollectionCounts {
    pub fn as_pairs(&self) -> [(&'static str, usize); 7] {
        [
            (Post::COLLECTION, self.posts),
            (Author::COLLECTION, self.authors),
            (Link::COLLECTION, self.links),
            (MediaItem::COLLECTION, self.media),
            (Hashtag::COLLECTION, self.hashtags),
            (Symbol::COLLECTION, self.symbols),
            (Place::COLLECTION, self.places),
        ]
    }
}

/// In-memory collections backing a load run.
#[derive(Debug, Clone, Default)]
pub struct Collections {
    pub posts: MemoryStore<Post>,
    pub authors: MemoryStore<Author>,
    pub links: MemoryStore<Link>,
    pub media: MemoryStore<MediaItem>,
    pub hashtags: MemoryStore<Hashtag>,
    pub symbols: MemoryStore<Symbol>,
    pub places: MemoryStore<Place>,
}

impl Collections {
    pub fn handles(&mut self) -> StoreSet<'_> {
        StoreSet {
            posts: &mut self.posts,
            authors: &mut self.authors,
            links: &mut self.links,
            media: &mut self.media,
            hashtags: &mut self.hashtags,
            symbols: &mut self.symbols,
            places: &mut self.places,
        }
    }

    pub fn counts(&self) -> CollectionCounts {
        CollectionCounts {
            posts: self.posts.len(),
            authors: self.authors.len(),
            links: self.links.len(),
            media: self.media.len(),
            hashtags: self.hashtags.len(),
            symbols: self.symbols.len(),
            places: self.places.len(),
        }
    }

    /// Load every collection present in the snapshot; missing files yield empty collections.
    pub async fn load(snapshots: &SnapshotStore) -> anyhow::Result<Self> {
        snapshots.verify().await?;
        Ok(Self {
            posts: snapshots.read_collection().await?,
            authors: snapshots.read_collection().await?,
            links: snapshots.read_collection().await?,
            media: snapshots.read_collection().await?,
            hashtags: snapshots.read_collection().await?,
            symbols: snapshots.read_collection().await?,
            places: snapshots.read_collection().await?,
        })
    }

    pub async fn flush(&self, snapshots: &SnapshotStore) -> anyhow::Result<SnapshotManifest> {
        let files = vec![
            snapshots.write_collection(&self.posts).await?,
            snapshots.write_collection(&self.authors).await?,
            snapshots.write_collection(&self.links).await?,
            snapshots.write_collection(&self.media).await?,
            snapshots.write_collection(&self.hashtags).await?,
            snapshots.write_collection(&self.symbols).await?,
            snapshots.write_collection(&self.places).await?,
        ];
        let manifest = SnapshotManifest {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            written_at: Utc::now(),
            files,
        };
        snapshots.write_manifest(&manifest).await?;
        Ok(manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub written_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub records: usize,
}

/// Directory of one JSONL file per collection plus a hash manifest.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn collection_file_name(collection: &str) -> String {
        format!("{collection}.jsonl")
    }

    /// Replace `file_name` under the root via a temp file and rename, so readers never see
    /// a half-written snapshot.
    pub async fn write_atomic(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating snapshot directory {}", self.root.display()))?;

        let final_path = self.root.join(file_name);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            });
        }
        Ok(final_path)
    }

    pub async fn write_collection<T: Entity>(
        &self,
        store: &MemoryStore<T>,
    ) -> anyhow::Result<ManifestEntry> {
        let mut bytes = Vec::new();
        for record in store.iter() {
            serde_json::to_writer(&mut bytes, record)
                .with_context(|| format!("serializing {} record {}", T::COLLECTION, record.key()))?;
            bytes.push(b'\n');
        }

        let file_name = Self::collection_file_name(T::COLLECTION);
        self.write_atomic(&file_name, &bytes).await?;
        debug!(
            collection = T::COLLECTION,
            records = store.len(),
            bytes = bytes.len(),
            "collection snapshot written"
        );

        Ok(ManifestEntry {
            name: T::COLLECTION.to_string(),
            path: file_name,
            sha256: Self::sha256_hex(&bytes),
            bytes: bytes.len() as u64,
            records: store.len(),
        })
    }

    pub async fn read_collection<T: Entity>(&self) -> anyhow::Result<MemoryStore<T>> {
        let path = self.root.join(Self::collection_file_name(T::COLLECTION));
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?
        {
            return Ok(MemoryStore::new());
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str::<T>(line)
                    .with_context(|| format!("parsing {} line {}", path.display(), index + 1))
            })
            .collect()
    }

    pub async fn write_manifest(&self, manifest: &SnapshotManifest) -> anyhow::Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(manifest).context("serializing snapshot manifest")?;
        self.write_atomic(MANIFEST_FILE, &bytes).await
    }

    pub async fn read_manifest(&self) -> anyhow::Result<Option<SnapshotManifest>> {
        let path = self.root.join(MANIFEST_FILE);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking manifest path {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let manifest =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Check every file listed in the manifest against its recorded hash.
    pub async fn verify(&self) -> anyhow::Result<Option<SnapshotManifest>> {
        let Some(manifest) = self.read_manifest().await? else {
            return Ok(None);
        };
        for entry in &manifest.files {
            let path = self.root.join(&entry.path);
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let actual = Self::sha256_hex(&bytes);
            if actual != entry.sha256 {
                bail!(
                    "snapshot file {} does not match manifest (expected {}, found {})",
                    path.display(),
                    entry.sha256,
                    actual
                );
            }
        }
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use twload_core::EntityRef;

    fn sample_collections() -> Collections {
        let stamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let mut collections = Collections::default();
        let mut stores = collections.handles();
        stores
            .posts
            .upsert(Post {
                id_str: "1".into(),
                text: Some("hello".into()),
                user: Some(EntityRef::new("u1")),
                last_modified: Some(stamp),
                ..Default::default()
            })
            .unwrap();
        stores
            .authors
            .upsert(Author {
                id_str: "u1".into(),
                screen_name: Some("a".into()),
                last_modified: Some(stamp),
                ..Default::default()
            })
            .unwrap();
        stores
            .hashtags
            .upsert(Hashtag {
                text: "rust".into(),
                last_modified: Some(stamp),
            })
            .unwrap();
        collections
    }

    #[test]
    fn memory_store_upsert_is_visible_and_replaces() {
        let mut store = MemoryStore::<Link>::new();
        store
            .upsert(Link {
                url: "https://t.co/a".into(),
                expanded_url: Some("https://example.com/1".into()),
                display_url: None,
            })
            .unwrap();
        store
            .upsert(Link {
                url: "https://t.co/a".into(),
                expanded_url: Some("https://example.com/2".into()),
                display_url: None,
            })
            .unwrap();

        assert_eq!(store.len(), 1);
        let link = store.get("https://t.co/a").unwrap().unwrap();
        assert_eq!(link.expanded_url.as_deref(), Some("https://example.com/2"));
        assert!(store.get("https://t.co/b").unwrap().is_none());
    }

    #[test]
    fn memory_store_rejects_empty_keys() {
        let mut store = MemoryStore::<Post>::new();
        let err = store.upsert(Post::default()).unwrap_err();
        assert!(matches!(err, StoreError::Rejected { collection: "posts", .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn flush_then_load_restores_collections() {
        let dir = tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path().join("data"));
        let collections = sample_collections();

        let manifest = collections.flush(&snapshots).await.expect("flush");
        assert_eq!(manifest.files.len(), 7);
        let posts_entry = manifest.files.iter().find(|f| f.name == "posts").unwrap();
        assert_eq!(posts_entry.records, 1);
        let bytes = std::fs::read(dir.path().join("data").join("posts.jsonl")).unwrap();
        assert_eq!(posts_entry.sha256, SnapshotStore::sha256_hex(&bytes));

        let restored = Collections::load(&snapshots).await.expect("load");
        assert_eq!(restored.counts(), collections.counts());
        assert_eq!(
            restored.posts.get("1").unwrap(),
            collections.posts.get("1").unwrap()
        );
        assert_eq!(
            restored.authors.get("u1").unwrap(),
            collections.authors.get("u1").unwrap()
        );
    }

    #[tokio::test]
    async fn load_from_empty_directory_yields_empty_collections() {
        let dir = tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path());
        let restored = Collections::load(&snapshots).await.expect("load");
        assert_eq!(restored.counts(), CollectionCounts::default());
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_verification() {
        let dir = tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path());
        sample_collections().flush(&snapshots).await.expect("flush");

        std::fs::write(dir.path().join("authors.jsonl"), b"{\"id_str\":\"x\"}\n").unwrap();
        let err = Collections::load(&snapshots).await.unwrap_err();
        assert!(err.to_string().contains("does not match manifest"));
    }

    #[tokio::test]
    async fn atomic_write_replaces_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let snapshots = SnapshotStore::new(dir.path());
        snapshots.write_atomic("x.jsonl", b"first").await.unwrap();
        let path = snapshots.write_atomic("x.jsonl", b"second").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
