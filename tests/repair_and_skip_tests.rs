//! Recovery paths: chunk-boundary repair and out-of-order-chunk skipping.

mod support;

use support::*;

use strata::block::{BlockId, IndexHealthStats};
use strata::compactor::{CompactorConfig, DefaultGrouper};

use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn own_all() -> Arc<SelectiveOracle> {
    Arc::new(SelectiveOracle { owned_keys: None })
}

fn issue_347() -> IndexHealthStats {
    IndexHealthStats {
        issue_347_outside_chunks: 3,
        ..Default::default()
    }
}

fn out_of_order() -> IndexHealthStats {
    IndexHealthStats {
        out_of_order_chunks: 2,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_repairable_block_is_rewritten_and_compaction_converges() {
    let store = in_memory_store();
    let merger = MockMerger::new();
    let tmp = TempDir::new().unwrap();

    let broken = make_meta(&[("tenant", "a")], 0, 1000, 100);
    let healthy = make_meta(&[("tenant", "a")], 1000, 2000, 100);
    seed_block(&store, &broken).await;
    seed_block(&store, &healthy).await;
    merger.set_health(broken.id, issue_347());

    let compactor = build_compactor(
        &store,
        &merger,
        Arc::new(DefaultGrouper),
        own_all(),
        test_config(&tmp),
    );
    compactor.compact(&CancellationToken::new()).await.unwrap();

    // The broken block was replaced by a rewrite and the rewrite merged
    // with its sibling on the following pass.
    assert!(is_marked_for_deletion(&store, broken.id).await);
    let live = live_blocks(&store).await;
    assert_eq!(live.len(), 1);
    let merged = &live[0];
    assert_eq!(merged.compaction.level, 2);
    let sources: BTreeSet<BlockId> = merged.compaction.sources.iter().copied().collect();
    assert_eq!(sources, BTreeSet::from([broken.id, healthy.id]));
    assert_eq!(merger.compact_calls(), 1);
}

#[tokio::test]
async fn test_failed_repair_propagates_original_error() {
    let store = in_memory_store();
    let merger = MockMerger::new();
    merger.fail_write();
    let tmp = TempDir::new().unwrap();

    let broken = make_meta(&[("tenant", "a")], 0, 1000, 100);
    let healthy = make_meta(&[("tenant", "a")], 1000, 2000, 100);
    seed_block(&store, &broken).await;
    seed_block(&store, &healthy).await;
    merger.set_health(broken.id, issue_347());

    let compactor = build_compactor(
        &store,
        &merger,
        Arc::new(DefaultGrouper),
        own_all(),
        test_config(&tmp),
    );
    let err = compactor
        .compact(&CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.issue347_block(), Some(broken.id));
    assert!(!is_marked_for_deletion(&store, broken.id).await);
    assert_eq!(live_blocks(&store).await.len(), 2);
}

#[tokio::test]
async fn test_out_of_order_block_is_skipped_when_configured() {
    let store = in_memory_store();
    let merger = MockMerger::new();
    let tmp = TempDir::new().unwrap();

    let good = make_meta(&[("tenant", "a")], 0, 1000, 100);
    let bad = make_meta(&[("tenant", "a")], 1000, 2000, 100);
    seed_block(&store, &good).await;
    seed_block(&store, &bad).await;
    merger.set_health(bad.id, out_of_order());

    let config = CompactorConfig {
        skip_blocks_with_out_of_order_chunks: true,
        ..test_config(&tmp)
    };
    let compactor = build_compactor(
        &store,
        &merger,
        Arc::new(DefaultGrouper),
        own_all(),
        config,
    );
    compactor.compact(&CancellationToken::new()).await.unwrap();

    assert!(is_marked_no_compact(&store, bad.id).await);
    assert!(!is_marked_for_deletion(&store, bad.id).await);
    // With the bad block excluded the group is down to one block, so no
    // merge ever runs.
    assert_eq!(merger.compact_calls(), 0);
    assert_eq!(live_blocks(&store).await.len(), 2);
}

#[tokio::test]
async fn test_out_of_order_block_fails_job_when_skip_disabled() {
    let store = in_memory_store();
    let merger = MockMerger::new();
    let tmp = TempDir::new().unwrap();

    let good = make_meta(&[("tenant", "a")], 0, 1000, 100);
    let bad = make_meta(&[("tenant", "a")], 1000, 2000, 100);
    seed_block(&store, &good).await;
    seed_block(&store, &bad).await;
    merger.set_health(bad.id, out_of_order());

    let compactor = build_compactor(
        &store,
        &merger,
        Arc::new(DefaultGrouper),
        own_all(),
        test_config(&tmp),
    );
    let err = compactor
        .compact(&CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.out_of_order_block(), Some(bad.id));
    assert!(!err.is_halt());
    assert!(!is_marked_no_compact(&store, bad.id).await);
}

#[tokio::test]
async fn test_unhealthy_index_halts_whole_run() {
    let store = in_memory_store();
    let merger = MockMerger::new();
    let tmp = TempDir::new().unwrap();

    let good = make_meta(&[("tenant", "a")], 0, 1000, 100);
    let corrupt = make_meta(&[("tenant", "a")], 1000, 2000, 100);
    seed_block(&store, &good).await;
    seed_block(&store, &corrupt).await;
    merger.set_health(
        corrupt.id,
        IndexHealthStats {
            out_of_order_series: 1,
            ..Default::default()
        },
    );

    let compactor = build_compactor(
        &store,
        &merger,
        Arc::new(DefaultGrouper),
        own_all(),
        test_config(&tmp),
    );
    let err = compactor
        .compact(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_halt());
    assert!(!is_marked_for_deletion(&store, good.id).await);
    assert!(!is_marked_for_deletion(&store, corrupt.id).await);
}
