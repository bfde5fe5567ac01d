use std::path::PathBuf;

use twload_core::EntityRef;
use twload_ingest::{
    extract_post_ids, extract_unique_user_ids, run_export, ExportFormat, LoadConfig, LoadPipeline,
};
use twload_normalize::Anomaly;
use twload_storage::{Collections, EntityStore, SnapshotStore};

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

fn config(data_dir: &std::path::Path) -> LoadConfig {
    LoadConfig {
        data_dir: data_dir.to_path_buf(),
        rules_path: Some(fixtures().join("rules.yaml")),
        ..Default::default()
    }
}

#[tokio::test]
async fn sample_streams_load_into_linked_collections() {
    let data = tempfile::tempdir().unwrap();
    let mut pipeline = LoadPipeline::open(config(data.path())).await.unwrap();
    pipeline.load_dir(&fixtures().join("sample")).await.unwrap();

    let collections = pipeline.collections();
    let alice = collections.authors.get("u1").unwrap().unwrap();
    assert_eq!(alice.screen_name.as_deref(), Some("alice_b"));
    assert_eq!(alice.followers_count, Some(150));
    assert!(!alice.extra.contains_key("profile_text_color"));

    let original = collections.posts.get("100").unwrap().unwrap();
    assert_eq!(original.hashtags, vec!["rust".to_string(), "paris".to_string()]);
    assert_eq!(original.urls, vec!["https://t.co/abc".to_string()]);
    assert_eq!(original.user_mentions, vec![EntityRef::new("u2")]);
    assert_eq!(original.retweet_count, Some(0));
    assert_eq!(original.coordinates, Some([2.34, 48.86]));
    assert!(!original.extra.contains_key("filter_level"));

    let repost = collections.posts.get("101").unwrap().unwrap();
    assert_eq!(repost.retweeted_status, Some(EntityRef::new("100")));
    let bare_repost = collections.posts.get("105").unwrap().unwrap();
    assert_eq!(bare_repost.retweeted_status, Some(EntityRef::new("100")));

    let reply = collections.posts.get("102").unwrap().unwrap();
    assert_eq!(reply.in_reply_to_status, Some(EntityRef::new("100")));
    assert_eq!(reply.in_reply_to_user, Some(EntityRef::new("u1")));
    assert_eq!(reply.coordinates, Some([2.35, 48.85]));
    assert_eq!(reply.place.as_ref().map(|p| p.id.as_str()), Some("p-paris"));
    assert_eq!(reply.media, vec!["900".to_string()]);
    let media = collections.media.get("900").unwrap().unwrap();
    assert_eq!(media.sizes.len(), 2);

    let summary = pipeline.finish().await.unwrap();
    assert_eq!(summary.files.len(), 2);
    assert_eq!(summary.report.lines, 9);
    assert_eq!(summary.report.stored, 5);
    assert_eq!(summary.report.not_newer, 1);
    assert_eq!(summary.report.errors, 1);
    assert_eq!(summary.report.discarded, 1);
    assert_eq!(summary.report.anomalies.count(Anomaly::PostWithoutId), 1);
    assert_eq!(summary.report.anomalies.count(Anomaly::AuthorTimestamp), 1);

    let counts = summary.counts;
    assert_eq!(
        (counts.posts, counts.authors, counts.links, counts.media),
        (5, 3, 1, 1)
    );
    assert_eq!((counts.hashtags, counts.symbols, counts.places), (2, 1, 1));
}

#[tokio::test]
async fn snapshot_roundtrip_matches_manifest() {
    let data = tempfile::tempdir().unwrap();
    let mut pipeline = LoadPipeline::open(config(data.path())).await.unwrap();
    pipeline.load_dir(&fixtures().join("sample")).await.unwrap();
    let summary = pipeline.finish().await.unwrap();

    let snapshots = SnapshotStore::new(data.path());
    let manifest = snapshots.verify().await.unwrap().unwrap();
    assert_eq!(manifest.files.len(), 7);
    let posts = manifest.files.iter().find(|f| f.name == "posts").unwrap();
    assert_eq!(posts.records, 5);

    let reloaded = Collections::load(&snapshots).await.unwrap();
    assert_eq!(reloaded.counts(), summary.counts);
    let alice = reloaded.authors.get("u1").unwrap().unwrap();
    assert_eq!(alice.screen_name.as_deref(), Some("alice_b"));
    let reply = reloaded.posts.get("102").unwrap().unwrap();
    assert_eq!(reply.media, vec!["900".to_string()]);

    let mut rerun = LoadPipeline::open(config(data.path())).await.unwrap();
    let report = rerun.load_dir(&fixtures().join("sample")).await.unwrap();
    assert_eq!(report.stored, 0);
    assert_eq!(report.not_newer, 6);
}

#[tokio::test]
async fn flat_export_and_id_listings() {
    let dir = tempfile::tempdir().unwrap();
    let input = fixtures().join("sample").join("stream_2024-03-01.jsonl");
    let flat = dir.path().join("flat.jsonl");

    let report = run_export(&input, Some(flat.as_path()), ExportFormat::Jsonl).await.unwrap();
    assert_eq!(report.exported, 4);
    assert_eq!(report.errors, 1);

    let text = std::fs::read_to_string(&flat).unwrap();
    let rows: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows[1]["id_str"], "101");
    assert_eq!(rows[1]["retweeted_id"], "100");
    assert_eq!(rows[1]["retweeted_user_id"], "u1");
    assert_eq!(rows[1]["mention_ids"], serde_json::json!(["u2"]));
    assert!(rows[1].get("user").is_none());
    assert!(rows[1].get("place").is_none());

    let mut ids = Vec::new();
    let file = tokio::fs::File::open(&input).await.unwrap();
    let written = extract_post_ids(tokio::io::BufReader::new(file), &mut ids)
        .await
        .unwrap();
    assert_eq!(written, 3);
    assert_eq!(String::from_utf8(ids).unwrap(), "100\n101\n102\n");

    let mut users = Vec::new();
    let file = tokio::fs::File::open(&flat).await.unwrap();
    extract_unique_user_ids(tokio::io::BufReader::new(file), &mut users)
        .await
        .unwrap();
    assert_eq!(String::from_utf8(users).unwrap(), "u1\nu2\nu3\nu9\n");
}

#[tokio::test]
async fn replayed_normalized_records_keep_the_data_dir_loadable() {
    let data = tempfile::tempdir().unwrap();
    let input = data.path().join("replay.jsonl");
    std::fs::write(
        &input,
        concat!(
            r#"{"id_str":"1","created_at":"2024-01-01T00:00:00Z","text":"hello","last_modified":"2024-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"id_str":"2","created_at":"2024-01-02T00:00:00Z","hashtags":["rust"],"user_mentions":[{"id_str":"u2"}],"user":{"id_str":"u1","last_modified":"2024-01-02T00:00:00Z"}}"#,
            "\n",
        ),
    )
    .unwrap();

    let mut pipeline = LoadPipeline::open(config(data.path())).await.unwrap();
    let report = pipeline.load_file(&input).await.unwrap();
    assert_eq!((report.stored, report.errors), (2, 0));
    pipeline.finish().await.unwrap();

    let reopened = LoadPipeline::open(config(data.path())).await.unwrap();
    let post = reopened.collections().posts.get("2").unwrap().unwrap();
    assert!(post.extra.is_empty());
    assert_eq!(reopened.collections().counts().posts, 2);
}
