//! Integration tests for the composite cache.
//!
//! Covers:
//! - Grouping member rows into objects, finalized once each
//! - Skipping unresolvable members, stubs and parents
//! - Per-parent loads that only fetch one parent's objects
//! - Parent resolution before the composite load
//! - Failure handling and per-parent invalidation

mod common;

use common::{EntityMapper, KeyMapper, MockSession, attr_row, entity_row, key_row, row};
use metacache_core::{
    CacheError, CompositeCache, LoadState, MetadataCache, Result, StructLookupCache,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn owner() -> String {
    "S".to_string()
}

struct Fixture {
    entities: Arc<StructLookupCache<EntityMapper>>,
    keys: CompositeCache<KeyMapper>,
    finalized: Arc<AtomicUsize>,
}

fn fixture() -> Fixture {
    let entities = Arc::new(StructLookupCache::new(EntityMapper));
    let mapper = KeyMapper::default();
    let finalized = Arc::clone(&mapper.finalized);
    let keys = CompositeCache::new(mapper, Arc::clone(&entities));
    Fixture {
        entities,
        keys,
        finalized,
    }
}

fn schema(keys: Vec<metacache_core::Row>) -> MockSession {
    MockSession::new()
        .on_lookup(
            "FROM entities",
            "name",
            vec![entity_row("T", 1), entity_row("U", 1)],
        )
        .on_lookup(
            "FROM attrs",
            "entity",
            vec![
                attr_row("T", "a"),
                attr_row("T", "b"),
                attr_row("T", "c"),
                attr_row("T", "d"),
                attr_row("U", "id"),
            ],
        )
        .on_lookup("FROM keys", "entity", keys)
}

fn two_keys() -> Vec<metacache_core::Row> {
    vec![
        key_row("T", "PK1", "a"),
        key_row("T", "PK1", "b"),
        key_row("T", "PK1", "c"),
        key_row("T", "PK2", "d"),
        key_row("T", "PK2", "a"),
    ]
}

// =============================================================================
// Grouping
// =============================================================================

#[tokio::test]
async fn test_rows_grouped_into_objects() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();

    let keys = fx.keys.get_objects(&session, &owner()).await?;
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].name, "PK1");
    assert_eq!(keys[0].parts, vec!["a", "b", "c"]);
    assert_eq!(keys[1].name, "PK2");
    assert_eq!(keys[1].parts, vec!["d", "a"]);

    // Each object is finalized exactly once
    assert_eq!(fx.finalized.load(Ordering::SeqCst), 2);
    assert!(keys.iter().all(|k| k.finalized == 1));
    assert_eq!(fx.keys.load_state(), LoadState::Full);
    assert_eq!(session.count("FROM keys"), 1);
    Ok(())
}

#[tokio::test]
async fn test_parents_and_children_resolved_first() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();

    fx.keys.get_objects(&session, &owner()).await?;
    assert!(fx.entities.is_fully_cached());
    assert!(fx.entities.is_children_fully_cached());

    let order: Vec<String> = session.executed().iter().map(|q| q.sql.clone()).collect();
    assert_eq!(order.len(), 3);
    assert!(order[0].contains("FROM entities"));
    assert!(order[1].contains("FROM attrs"));
    assert!(order[2].contains("FROM keys"));
    Ok(())
}

#[tokio::test]
async fn test_repeated_reads_issue_one_query() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();

    let first = fx.keys.get_objects(&session, &owner()).await?;
    let second = fx.keys.get_objects(&session, &owner()).await?;
    assert!(Arc::ptr_eq(&first[0], &second[0]));
    assert_eq!(session.executed().len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_member_is_skipped() -> Result<()> {
    let session = schema(vec![
        key_row("T", "PK1", "a"),
        key_row("T", "PK1", "missing"),
        key_row("T", "PK1", "c"),
        key_row("T", "PK2", "d"),
    ]);
    let fx = fixture();

    let keys = fx.keys.get_objects(&session, &owner()).await?;
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].parts, vec!["a", "c"]);
    assert_eq!(fx.keys.stats().rows_skipped, 1);
    assert!(fx.keys.is_fully_cached());
    Ok(())
}

#[tokio::test]
async fn test_unresolvable_stub_skips_all_rows_of_object() -> Result<()> {
    let session = schema(vec![
        row(&[
            ("entity", json!("T")),
            ("key_name", json!("BAD")),
            ("attr", json!("a")),
            ("unresolvable", json!(true)),
        ]),
        key_row("T", "BAD", "b"),
        key_row("T", "PK1", "a"),
    ]);
    let fx = fixture();

    let keys = fx.keys.get_objects(&session, &owner()).await?;
    let names: Vec<&str> = keys.iter().map(|k| k.name.as_str()).collect();
    assert_eq!(names, vec!["PK1"]);
    assert_eq!(fx.keys.stats().rows_skipped, 2);
    assert_eq!(fx.finalized.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_rows_of_unknown_parents_are_skipped() -> Result<()> {
    let session = schema(vec![
        key_row("T", "PK1", "a"),
        key_row("X", "PKX", "a"),
        row(&[("key_name", json!("ORPHAN")), ("attr", json!("a"))]),
        row(&[("entity", json!("T")), ("attr", json!("a"))]),
    ]);
    let fx = fixture();

    let keys = fx.keys.get_objects(&session, &owner()).await?;
    assert_eq!(keys.len(), 1);
    assert_eq!(fx.keys.stats().rows_skipped, 3);
    Ok(())
}

#[tokio::test]
async fn test_keys_spread_over_parents() -> Result<()> {
    let session = schema(vec![
        key_row("T", "PK1", "a"),
        key_row("U", "PK1", "id"),
    ]);
    let fx = fixture();

    let keys = fx.keys.get_objects(&session, &owner()).await?;
    // Same name under two parents is two objects
    assert_eq!(keys.len(), 2);
    assert_eq!(fx.keys.cached_objects_for("T").map(|v| v.len()), Some(1));
    assert_eq!(
        fx.keys.cached_objects_for("U").map(|v| v[0].entity.clone()),
        Some("U".to_string())
    );
    Ok(())
}

// =============================================================================
// Per-parent loads
// =============================================================================

#[tokio::test]
async fn test_per_parent_load_fetches_one_parent() -> Result<()> {
    let session = schema(vec![
        key_row("T", "PK1", "a"),
        key_row("U", "PKU", "id"),
    ]);
    let fx = fixture();
    let t = fx.entities.get_object(&session, &owner(), "T").await?.unwrap();

    let keys = fx.keys.get_objects_for(&session, &owner(), &t).await?;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].name, "PK1");
    assert_eq!(keys[0].parts, vec!["a"]);

    let scoped: Vec<_> = session
        .executed()
        .into_iter()
        .filter(|q| q.sql.contains("FROM keys"))
        .collect();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].params, vec![json!("T")]);

    // Only that parent's children were needed
    assert_eq!(session.count("FROM attrs WHERE entity = ?"), 1);
    assert!(!fx.entities.is_children_fully_cached());
    // Per-parent loads never make the cache partial
    assert_eq!(fx.keys.load_state(), LoadState::Empty);
    assert!(fx.keys.cached_objects_for("U").is_none());
    Ok(())
}

#[tokio::test]
async fn test_per_parent_results_are_cached() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();
    let u = fx.entities.get_object(&session, &owner(), "U").await?.unwrap();

    assert!(fx.keys.get_objects_for(&session, &owner(), &u).await?.is_empty());
    assert!(fx.keys.get_objects_for(&session, &owner(), &u).await?.is_empty());
    assert_eq!(session.count("FROM keys"), 1);
    Ok(())
}

#[tokio::test]
async fn test_get_object_by_parent_and_name() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();
    let t = fx.entities.get_object(&session, &owner(), "T").await?.unwrap();

    let pk2 = fx.keys.get_object(&session, &owner(), &t, "PK2").await?;
    assert_eq!(pk2.map(|k| k.parts.clone()), Some(vec!["d".to_string(), "a".to_string()]));
    assert!(fx.keys.get_object(&session, &owner(), &t, "PK9").await?.is_none());
    assert_eq!(session.count("FROM keys"), 1);
    Ok(())
}

#[tokio::test]
async fn test_full_cache_answers_per_parent_reads() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();
    fx.keys.get_objects(&session, &owner()).await?;

    let u = fx.entities.cached_object("U").unwrap();
    assert!(fx.keys.get_objects_for(&session, &owner(), &u).await?.is_empty());
    // A parent unknown to the load is still answered as empty
    assert_eq!(fx.keys.cached_objects_for("nobody"), Some(Vec::new()));
    assert_eq!(session.count("FROM keys"), 1);
    Ok(())
}

// =============================================================================
// Failure and invalidation
// =============================================================================

#[tokio::test]
async fn test_query_failure_leaves_cache_unloaded() -> Result<()> {
    let session = schema(two_keys());
    session.set_failure("FROM keys", "syntax error");
    let fx = fixture();

    let result = fx.keys.get_objects(&session, &owner()).await;
    assert!(matches!(result, Err(CacheError::QueryExecution { .. })));
    assert_eq!(fx.keys.load_state(), LoadState::Empty);
    assert!(fx.keys.cached_objects().is_empty());
    assert_eq!(fx.finalized.load(Ordering::SeqCst), 0);
    // Parent caches keep what they loaded
    assert!(fx.entities.is_fully_cached());
    Ok(())
}

#[tokio::test]
async fn test_parent_failure_aborts_before_composite_query() -> Result<()> {
    let session = schema(two_keys());
    session.set_failure("FROM attrs", "permission denied");
    let fx = fixture();

    assert!(fx.keys.get_objects(&session, &owner()).await.is_err());
    assert_eq!(session.count("FROM keys"), 0);
    assert_eq!(fx.keys.load_state(), LoadState::Empty);
    Ok(())
}

#[tokio::test]
async fn test_clear_object_cache_for_one_parent() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();
    fx.keys.get_objects(&session, &owner()).await?;

    fx.keys.clear_object_cache("T");
    assert_eq!(fx.keys.load_state(), LoadState::Empty);
    assert!(fx.keys.cached_objects_for("T").is_none());
    assert_eq!(fx.keys.cached_objects_for("U"), Some(Vec::new()));

    let t = fx.entities.cached_object("T").unwrap();
    let keys = fx.keys.get_objects_for(&session, &owner(), &t).await?;
    assert_eq!(keys.len(), 2);
    assert_eq!(session.count("FROM keys"), 2);
    Ok(())
}

#[tokio::test]
async fn test_clear_cache_resets_to_empty() -> Result<()> {
    let session = schema(two_keys());
    let fx = fixture();
    fx.keys.get_objects(&session, &owner()).await?;

    fx.keys.clear_cache();
    assert_eq!(fx.keys.load_state(), LoadState::Empty);
    assert_eq!(fx.keys.cached_len(), 0);

    fx.keys.get_objects(&session, &owner()).await?;
    assert_eq!(session.count("FROM keys"), 2);
    // Parents were not cleared and are not queried again
    assert_eq!(session.count("FROM entities"), 1);
    Ok(())
}
