//! Compactor telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct CompactorInstruments {
    runs_started: Counter<u64>,
    runs_completed: Counter<u64>,
    runs_failed: Counter<u64>,
    group_compactions: Counter<u64>,
    garbage_collections: Counter<u64>,
    garbage_collection_failures: Counter<u64>,
    garbage_collection_duration_seconds: Histogram<f64>,
    garbage_collected_blocks: Counter<u64>,
    blocks_marked_for_deletion: Counter<u64>,
    blocks_marked_no_compact: Counter<u64>,
    blocks_uploaded: Counter<u64>,
}

fn instruments() -> &'static CompactorInstruments {
    static INSTRUMENTS: OnceLock<CompactorInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("strata.compactor");
        CompactorInstruments {
            runs_started: meter
                .u64_counter("strata.compactor.runs.started")
                .with_description("Group compaction attempts")
                .init(),
            runs_completed: meter
                .u64_counter("strata.compactor.runs.completed")
                .with_description("Completed group compaction runs, including runs that planned no work")
                .init(),
            runs_failed: meter
                .u64_counter("strata.compactor.runs.failed")
                .with_description("Failed group compaction runs")
                .init(),
            group_compactions: meter
                .u64_counter("strata.compactor.group_compactions")
                .with_description("Group compaction runs that produced new block(s)")
                .init(),
            garbage_collections: meter
                .u64_counter("strata.compactor.gc.runs")
                .with_description("Garbage collection passes")
                .init(),
            garbage_collection_failures: meter
                .u64_counter("strata.compactor.gc.failures")
                .with_description("Failed garbage collection passes")
                .init(),
            garbage_collection_duration_seconds: meter
                .f64_histogram("strata.compactor.gc.duration")
                .with_description("Garbage collection pass duration")
                .with_unit("s")
                .init(),
            garbage_collected_blocks: meter
                .u64_counter("strata.compactor.blocks.garbage_collected")
                .with_description("Blocks retired because their data is covered by a higher-level block")
                .init(),
            blocks_marked_for_deletion: meter
                .u64_counter("strata.compactor.blocks.marked_for_deletion")
                .with_description("Deletion marks written")
                .init(),
            blocks_marked_no_compact: meter
                .u64_counter("strata.compactor.blocks.marked_no_compact")
                .with_description("No-compact marks written")
                .init(),
            blocks_uploaded: meter
                .u64_counter("strata.compactor.blocks.uploaded")
                .with_description("New blocks uploaded to the bucket")
                .init(),
        }
    })
}

pub fn record_run_started() {
    instruments().runs_started.add(1, &[]);
}

pub fn record_run_completed() {
    instruments().runs_completed.add(1, &[]);
}

pub fn record_run_failed() {
    instruments().runs_failed.add(1, &[]);
}

pub fn record_group_compaction() {
    instruments().group_compactions.add(1, &[]);
}

pub fn record_garbage_collection(duration_seconds: f64) {
    let i = instruments();
    i.garbage_collections.add(1, &[]);
    i.garbage_collection_duration_seconds
        .record(duration_seconds, &[]);
}

pub fn record_garbage_collection_failure() {
    instruments().garbage_collection_failures.add(1, &[]);
}

pub fn record_garbage_collected_block() {
    instruments().garbage_collected_blocks.add(1, &[]);
}

pub fn record_block_marked_for_deletion() {
    instruments().blocks_marked_for_deletion.add(1, &[]);
}

pub fn record_block_marked_no_compact(reason: &str) {
    instruments()
        .blocks_marked_no_compact
        .add(1, &[KeyValue::new("reason", reason.to_string())]);
}

pub fn record_block_uploaded() {
    instruments().blocks_uploaded.add(1, &[]);
}
