//! Bin lifecycle across the public API: live -> binned -> live / purged.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;

use sitekeeper::bin::{BinManager, BINNED_AT};
use sitekeeper::clock::ManualClock;
use sitekeeper::config::ContentConfig;
use sitekeeper::error::CmsError;
use sitekeeper::frontmatter;
use sitekeeper::models::ContentKind;
use sitekeeper::store::{MemoryStore, StoreOp};

const POST: &str = "---\ntitle: Hello\ntags: [a, b]\ndraft: false\n---\nFirst paragraph.\n\nSecond.\n";

fn setup() -> (BinManager, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap(),
    ));
    let bin = BinManager::new(store.clone(), clock.clone(), &ContentConfig::default());
    (bin, store, clock)
}

#[tokio::test]
async fn test_round_trip_preserves_fields_and_body() {
    let (bin, store, _) = setup();
    let sha = store.insert("_posts/2025-03-01-hello.md", POST);

    let moved = bin
        .move_to_bin("2025-03-01-hello.md", Some(&sha), ContentKind::Post)
        .await
        .unwrap();
    assert_eq!(moved.bin_path, "_bin/2025-03-01-hello.md");
    assert!(!moved.renamed);

    let binned = store.content("_bin/2025-03-01-hello.md").unwrap();
    let (fm, _) = frontmatter::parse(&binned);
    assert_eq!(fm.get_str(BINNED_AT), Some("2025-03-14T09:26:53Z"));

    let restored = bin.restore("2025-03-01-hello.md", None, None).await.unwrap();
    assert_eq!(restored.path, "_posts/2025-03-01-hello.md");

    let text = store.content("_posts/2025-03-01-hello.md").unwrap();
    let (before, before_body) = frontmatter::parse(POST);
    let (after, after_body) = frontmatter::parse(&text);
    assert_eq!(after, before);
    assert_eq!(after_body, before_body);
    assert!(store.content("_bin/2025-03-01-hello.md").is_none());
}

#[tokio::test]
async fn test_stale_client_token_still_moves() {
    let (bin, store, _) = setup();
    store.insert("_pages/about.md", "---\ntitle: About\n---\nHi\n");
    bin.move_to_bin("about.md", Some("stale-sha"), ContentKind::Page)
        .await
        .unwrap();
    assert!(store.content("_pages/about.md").is_none());
    assert!(store.content("_bin/about.md").is_some());
}

#[tokio::test]
async fn test_restore_onto_existing_item_conflicts_without_writes() {
    let (bin, store, _) = setup();
    store.insert("_pages/about.md", "---\ntitle: New about\n---\n");
    store.insert("_bin/about.md", "---\ntitle: Old about\nbinned_at: 2025-01-01T00:00:00Z\n---\n");
    let commits = store.commit_count();

    let err = bin.restore("about.md", None, None).await.unwrap_err();
    assert!(matches!(err, CmsError::Conflict(_)));
    assert_eq!(store.commit_count(), commits);
    assert!(store.content("_bin/about.md").is_some());
    assert!(store.content("_pages/about.md").unwrap().contains("New about"));
}

#[tokio::test]
async fn test_restore_kind_override() {
    let (bin, store, _) = setup();
    store.insert("_bin/2024-12-25-xmas.md", "---\ntitle: Xmas\nbinned_at: 2025-01-01T00:00:00Z\n---\n");
    let out = bin
        .restore("2024-12-25-xmas.md", None, Some(ContentKind::Page))
        .await
        .unwrap();
    assert_eq!(out.path, "_pages/2024-12-25-xmas.md");
}

#[tokio::test]
async fn test_collision_names_are_timestamped() {
    let (bin, store, clock) = setup();
    store.insert("_bin/about.md", "---\ntitle: Earlier\n---\n");
    store.insert("_pages/about.md", "---\ntitle: About\n---\n");

    let moved = bin.move_to_bin("about.md", None, ContentKind::Page).await.unwrap();
    assert!(moved.renamed);
    assert_eq!(moved.bin_path, "_bin/about-2025-03-14T09-26-53.md");

    clock.advance(Duration::seconds(1));
    store.insert("_pages/about.md", "---\ntitle: About again\n---\n");
    let moved = bin.move_to_bin("about.md", None, ContentKind::Page).await.unwrap();
    assert_eq!(moved.bin_path, "_bin/about-2025-03-14T09-26-54.md");
}

#[tokio::test]
async fn test_failed_source_delete_surfaces_error() {
    let (bin, store, _) = setup();
    store.insert("_pages/about.md", "---\ntitle: About\n---\n");
    store.fail(StoreOp::Delete, "_pages/about.md");

    assert!(bin.move_to_bin("about.md", None, ContentKind::Page).await.is_err());
    // The copy is already committed; the source is still live.
    assert!(store.content("_bin/about.md").is_some());
    assert!(store.content("_pages/about.md").is_some());
}

#[tokio::test]
async fn test_purge_then_list() {
    let (bin, store, clock) = setup();
    store.insert("_pages/a.md", "---\ntitle: A\n---\n");
    store.insert("_pages/b.md", "---\ntitle: B\n---\n");
    bin.move_to_bin("a.md", None, ContentKind::Page).await.unwrap();
    clock.advance(Duration::minutes(5));
    bin.move_to_bin("b.md", None, ContentKind::Page).await.unwrap();
    store.insert("_bin/notes.txt", "not content");

    let names: Vec<String> = bin.list().await.unwrap().into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["b.md", "a.md"]);

    let sha = store.sha("_bin/a.md").unwrap();
    let err = bin.purge("a.md", "wrong").await.unwrap_err();
    assert!(matches!(err, CmsError::Conflict(_)));
    bin.purge("a.md", &sha).await.unwrap();

    let items = bin.list().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].name, "b.md");
}

#[tokio::test]
async fn test_unreadable_bin_entry_sorts_last() {
    let (bin, store, _) = setup();
    store.insert("_bin/a.md", "---\ntitle: A\nbinned_at: 2025-01-01T00:00:00Z\n---\n");
    store.insert("_bin/b.md", "---\ntitle: B\nbinned_at: 2025-02-01T00:00:00Z\n---\n");
    store.insert("_bin/c.md", "---\ntitle: C\nbinned_at: 2025-03-01T00:00:00Z\n---\n");
    store.fail(StoreOp::Get, "_bin/c.md");

    let items = bin.list().await.unwrap();
    let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["b.md", "a.md", "c.md"]);
    assert!(items[2].binned_at.is_none());
}

#[tokio::test]
async fn test_failed_bin_write_leaves_source_alone() {
    let (bin, store, _) = setup();
    store.insert("_pages/about.md", "---\ntitle: About\n---\nHi\n");
    let commits = store.commit_count();
    store.fail(StoreOp::Put, "_bin/about.md");

    assert!(bin.move_to_bin("about.md", None, ContentKind::Page).await.is_err());
    assert_eq!(store.content("_pages/about.md").unwrap(), "---\ntitle: About\n---\nHi\n");
    assert!(store.paths().iter().all(|p| !p.starts_with("_bin/")));
    assert_eq!(store.commit_count(), commits);
}

#[tokio::test]
async fn test_failed_restore_write_keeps_bin_entry() {
    let (bin, store, _) = setup();
    let binned = "---\ntitle: About\nbinned_at: 2025-01-01T00:00:00Z\n---\n";
    let sha = store.insert("_bin/about.md", binned);
    store.fail(StoreOp::Put, "_pages/about.md");

    assert!(bin.restore("about.md", None, None).await.is_err());
    assert!(store.content("_pages/about.md").is_none());
    assert_eq!(store.content("_bin/about.md").unwrap(), binned);
    assert_eq!(store.sha("_bin/about.md").unwrap(), sha);
}

#[tokio::test]
async fn test_failed_bin_delete_after_restore_surfaces_error() {
    let (bin, store, _) = setup();
    store.insert("_bin/about.md", "---\ntitle: About\nbinned_at: 2025-01-01T00:00:00Z\n---\n");
    store.fail(StoreOp::Delete, "_bin/about.md");

    let err = bin.restore("about.md", None, None).await.unwrap_err();
    assert!(matches!(err, CmsError::Upstream { .. }));
    // The live copy is committed and the bin still holds a duplicate.
    let live = store.content("_pages/about.md").unwrap();
    assert!(live.contains("title: About"));
    assert!(!live.contains(BINNED_AT));
    assert!(store.content("_bin/about.md").is_some());
}
