use kos_cache::{EmbeddingCache, InsertOutcome, RequestScopeCache};
use kos_core::{CacheKey, CacheSettings, EmbeddingVector};
use std::sync::Arc;

#[test]
fn test_keys_sharing_a_prefix_collide() {
    let cache = EmbeddingCache::from_settings(&CacheSettings {
        key_max_chars: 8,
        max_entries: 100,
    });
    let key = cache.key_for("abcdefgh-first").unwrap();
    cache.insert_if_absent(key, EmbeddingVector::new(vec![0.5]));

    // Same 8-char prefix resolves to the same entry
    let hit = cache.get_text("ABCDEFGH-second").unwrap();
    assert_eq!(hit.as_slice(), &[0.5]);
}

#[test]
fn test_whitespace_text_has_no_key() {
    let cache = EmbeddingCache::default();
    assert!(cache.key_for("   \n\t").is_none());
    assert!(cache.get_text("").is_none());
    // Lookups without a key do not count as misses
    assert_eq!(cache.stats().misses, 0);
}

#[test]
fn test_concurrent_inserts_converge_on_first_value() {
    let cache = EmbeddingCache::new(0, 500);
    let key = CacheKey::with_default_len("shared").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = cache.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                cache.insert_if_absent(key, EmbeddingVector::new(vec![i as f32]))
            })
        })
        .collect();

    let inserted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|o| *o == InsertOutcome::Inserted)
        .count();

    assert_eq!(inserted, 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().insertions, 1);
}

#[test]
fn test_cache_clones_share_storage() {
    let cache = EmbeddingCache::default();
    let other = cache.clone();
    let key = cache.key_for("q").unwrap();
    other.insert_if_absent(key.clone(), EmbeddingVector::new(vec![1.0]));
    assert!(cache.contains(&key));
    assert_eq!(cache.clear(), 1);
    assert!(other.is_empty());
}

#[test]
fn test_hit_rate_reflects_lookups() {
    let cache = EmbeddingCache::default();
    let key = cache.key_for("q").unwrap();
    cache.insert_if_absent(key.clone(), EmbeddingVector::new(vec![1.0]));
    cache.get(&key);
    cache.get(&key);
    cache.get(&key);
    cache.get_text("missing");

    let stats = cache.stats();
    assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
    assert!((stats.miss_rate() - 0.25).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_request_scopes_from_many_tasks() {
    let scopes = Arc::new(RequestScopeCache::new());
    let mut handles = Vec::new();
    for i in 0..16 {
        let scopes = Arc::clone(&scopes);
        handles.push(tokio::spawn(async move {
            let id = format!("req-{}", i);
            scopes.begin(&id);
            let key = CacheKey::with_default_len("same text").unwrap();
            scopes.insert(&id, key.clone(), EmbeddingVector::new(vec![i as f32]));
            tokio::task::yield_now().await;
            let seen = scopes.get(&id, &key).unwrap();
            scopes.end(&id);
            seen.as_slice()[0] as usize
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i);
    }
    assert_eq!(scopes.active_scopes(), 0);
}
