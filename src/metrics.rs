//! Typed metric emission (`spec.md` section 4.7 / section 6).
//!
//! Each non-internal execution node emits, per schema it produces, a
//! counter of events/bytes forwarded (`spec.md` section 4.5). Metric
//! emitters are per-schema and reject records of a mismatched schema.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::diagnostic::SourceId;
use crate::schema::SchemaFingerprint;

/// One forwarded-batch measurement, labeled by the operator that produced
/// it.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub pipeline_id: SourceId,
    pub operator_index: usize,
    pub schema: SchemaFingerprint,
    pub events: u64,
    pub bytes: u64,
}

/// The interface any metric receiver must implement (`spec.md` section 6).
/// One per executor run; the engine only consumes this.
pub trait MetricReceiver: Send + Sync {
    fn record(&self, record: MetricRecord);
}

/// A per-schema emitter handed out by [`MetricSink::for_schema`]. Bound to
/// one fingerprint; `emit` panics in debug builds if given a mismatched
/// fingerprint, since that would indicate a core invariant violation
/// rather than a recoverable condition (`spec.md` section 7).
pub struct MetricEmitter {
    schema: SchemaFingerprint,
    pipeline_id: SourceId,
    operator_index: usize,
    events: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    receiver: Arc<dyn MetricReceiver>,
}

impl MetricEmitter {
    pub fn emit(&self, schema: SchemaFingerprint, events: u64, bytes: u64) {
        debug_assert_eq!(
            schema, self.schema,
            "metric emitter for {:?} given a record for {:?}",
            self.schema, schema
        );
        self.events.fetch_add(events, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.receiver.record(MetricRecord {
            pipeline_id: self.pipeline_id,
            operator_index: self.operator_index,
            schema,
            events,
            bytes,
        });
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.events.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

/// Hands out per-schema [`MetricEmitter`]s for one execution node,
/// deduplicating repeated calls for the same schema.
pub struct MetricSink {
    pipeline_id: SourceId,
    operator_index: usize,
    receiver: Arc<dyn MetricReceiver>,
    emitters: DashMap<SchemaFingerprint, Arc<MetricEmitter>>,
}

impl MetricSink {
    pub fn new(pipeline_id: SourceId, operator_index: usize, receiver: Arc<dyn MetricReceiver>) -> Self {
        Self {
            pipeline_id,
            operator_index,
            receiver,
            emitters: DashMap::new(),
        }
    }

    pub fn for_schema(&self, schema: SchemaFingerprint) -> Arc<MetricEmitter> {
        self.emitters
            .entry(schema)
            .or_insert_with(|| {
                Arc::new(MetricEmitter {
                    schema,
                    pipeline_id: self.pipeline_id,
                    operator_index: self.operator_index,
                    events: Arc::new(AtomicU64::new(0)),
                    bytes: Arc::new(AtomicU64::new(0)),
                    receiver: self.receiver.clone(),
                })
            })
            .clone()
    }
}

/// An in-process metric receiver that simply accumulates every record, for
/// tests and for standalone executor runs (`SPEC_FULL.md` section 6).
#[derive(Default)]
pub struct CollectingMetricReceiver {
    records: parking_lot::Mutex<Vec<MetricRecord>>,
}

impl MetricReceiver for CollectingMetricReceiver {
    fn record(&self, record: MetricRecord) {
        self.records.lock().push(record);
    }
}

impl CollectingMetricReceiver {
    pub fn snapshot(&self) -> Vec<MetricRecord> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_schema_reuses_the_same_emitter_totals() {
        let receiver = Arc::new(CollectingMetricReceiver::default());
        let sink = MetricSink::new(SourceId(1), 0, receiver.clone());
        let fp = SchemaFingerprint(42);
        let emitter = sink.for_schema(fp);
        emitter.emit(fp, 3, 30);
        let emitter2 = sink.for_schema(fp);
        emitter2.emit(fp, 2, 20);
        assert_eq!(emitter.totals(), (5, 50));
        assert_eq!(receiver.snapshot().len(), 2);
    }
}
