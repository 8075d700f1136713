//! The batch & element-type model (component C1).
//!
//! An edge between two operators carries batches of exactly one of three
//! element types: [`Void`](ElementType::Void), [`Bytes`](ElementType::Bytes)
//! or [`Events`](ElementType::Events). This module defines the closed
//! enumeration, the three concrete batch types and the type-erased
//! [`AnyBatch`] used at actor boundaries where the static element type isn't
//! visible to the caller.

use std::sync::Arc;

use crate::schema::Schema;

/// The statically known kind of batches flowing across one edge of a
/// pipeline.
///
/// This is a closed enumeration by design (`spec.md` section 3): the engine
/// never needs a fourth kind, and exhaustive matches on it are meant to stay
/// exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// The empty placeholder element type; used by sources that consume
    /// nothing and sinks that produce nothing.
    Void,
    /// An immutable, reference-counted byte buffer.
    Bytes,
    /// A columnar record batch with a schema.
    Events,
}

impl ElementType {
    /// The runtime id used for logs and type-mismatch diagnostics. Stable
    /// across versions; never renumber these.
    pub const fn id(self) -> u8 {
        match self {
            ElementType::Void => 0,
            ElementType::Bytes => 1,
            ElementType::Events => 2,
        }
    }

    /// The human-readable name, e.g. for diagnostic messages.
    pub const fn name(self) -> &'static str {
        match self {
            ElementType::Void => "void",
            ElementType::Bytes => "bytes",
            ElementType::Events => "events",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The empty placeholder batch. Used as a keep-alive/tick on `void` edges;
/// carries no data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoidBatch;

impl VoidBatch {
    pub const fn size(&self) -> usize {
        0
    }
}

/// An immutable, reference-counted byte buffer.
///
/// Invariant (`spec.md` section 3): either the handle is empty (`None`,
/// meaning "no bytes this tick") or the buffer length is `>= 0` -- a `None`
/// handle is semantically equivalent to "nothing produced, but the operator
/// is alive", i.e. a tick.
#[derive(Debug, Clone, Default)]
pub struct BytesBatch {
    data: Option<Arc<[u8]>>,
}

impl BytesBatch {
    /// A tick: no bytes produced this round, operator still alive.
    pub fn tick() -> Self {
        Self { data: None }
    }

    /// A batch carrying `data`. An empty slice is legal and is semantically
    /// equivalent to a tick.
    pub fn new(data: Arc<[u8]>) -> Self {
        Self { data: Some(data) }
    }

    pub fn is_tick(&self) -> bool {
        self.data.is_none()
    }

    pub fn size(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub fn bytes(&self) -> Option<&Arc<[u8]>> {
        self.data.as_ref()
    }
}

/// An immutable columnar record batch.
///
/// Invariants (`spec.md` section 3): all columns have the same length,
/// equal to `row_count`; the schema's flattened leaf count equals the
/// column count. Empty batches (`row_count == 0`) are legal and
/// semantically equivalent to a `void` tick.
#[derive(Debug, Clone)]
pub struct EventsBatch {
    schema: Arc<Schema>,
    columns: Arc<Vec<arrow::array::ArrayRef>>,
    row_count: usize,
    /// Set by the pipeline at the ingest boundary; monotonic within a
    /// single source. Measured in nanoseconds since an arbitrary epoch
    /// fixed for the lifetime of one source.
    import_timestamp: i64,
}

impl EventsBatch {
    /// Builds a new batch, checking the integrity invariants described in
    /// `spec.md` section 3 / 8 (invariant 2). Returns an
    /// [`InternalInvariant`](crate::error::PipelineError::InternalInvariant)
    /// error if either invariant is violated; callers inside the engine
    /// should treat that as fatal and never attempt recovery (section 7).
    pub fn try_new(
        schema: Arc<Schema>,
        columns: Vec<arrow::array::ArrayRef>,
        row_count: usize,
        import_timestamp: i64,
    ) -> Result<Self, crate::error::PipelineError> {
        use arrow::array::Array;

        if columns.len() != schema.leaf_count() {
            return Err(crate::error::PipelineError::InternalInvariant {
                message: format!(
                    "schema has {} leaves but batch has {} columns",
                    schema.leaf_count(),
                    columns.len()
                ),
            });
        }
        for (i, col) in columns.iter().enumerate() {
            if col.len() != row_count {
                return Err(crate::error::PipelineError::InternalInvariant {
                    message: format!(
                        "column {i} has length {} but batch row count is {row_count}",
                        col.len()
                    ),
                });
            }
        }
        Ok(Self {
            schema,
            columns: Arc::new(columns),
            row_count,
            import_timestamp,
        })
    }

    /// An empty batch of the given schema. Semantically equivalent to a
    /// `void` tick; legal as a suspension point.
    pub fn empty(schema: Arc<Schema>) -> Self {
        let columns = schema
            .leaf_types()
            .iter()
            .map(|t| t.empty_array())
            .collect();
        Self {
            schema,
            columns: Arc::new(columns),
            row_count: 0,
            import_timestamp: 0,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn columns(&self) -> &[arrow::array::ArrayRef] {
        &self.columns
    }

    pub fn import_timestamp(&self) -> i64 {
        self.import_timestamp
    }

    pub fn is_tick(&self) -> bool {
        self.row_count == 0
    }

    /// Total heap size of this batch's columns, in bytes, used for the
    /// per-schema byte counter a non-hidden execution node reports
    /// (`spec.md` section 4.5).
    pub fn byte_size(&self) -> usize {
        use arrow::array::Array;
        self.columns.iter().map(Array::get_array_memory_size).sum()
    }
}

/// A type-erased runtime batch, used at actor boundaries (execution nodes,
/// mailboxes, the network bridge) where the static element type isn't
/// visible to the caller.
#[derive(Debug, Clone)]
pub enum AnyBatch {
    Void(VoidBatch),
    Bytes(BytesBatch),
    Events(EventsBatch),
}

impl AnyBatch {
    pub fn element_type(&self) -> ElementType {
        match self {
            AnyBatch::Void(_) => ElementType::Void,
            AnyBatch::Bytes(_) => ElementType::Bytes,
            AnyBatch::Events(_) => ElementType::Events,
        }
    }

    /// `size(batch)` from the element-type registry contract: `0` for
    /// void, the buffer length for bytes, the row count for events.
    pub fn size(&self) -> usize {
        match self {
            AnyBatch::Void(b) => b.size(),
            AnyBatch::Bytes(b) => b.size(),
            AnyBatch::Events(b) => b.row_count(),
        }
    }

    /// `schema(batch)` from the element-type registry contract: `None`
    /// (bottom) for void and bytes, the batch's schema for events.
    pub fn schema(&self) -> Option<&Arc<Schema>> {
        match self {
            AnyBatch::Events(b) => Some(b.schema()),
            _ => None,
        }
    }

    /// A tick (empty yield) is a liveness signal that carries no data; it
    /// does not count against the in-flight back-pressure bound (section 5).
    pub fn is_tick(&self) -> bool {
        match self {
            AnyBatch::Void(_) => true,
            AnyBatch::Bytes(b) => b.is_tick(),
            AnyBatch::Events(b) => b.is_tick(),
        }
    }
}

impl From<VoidBatch> for AnyBatch {
    fn from(b: VoidBatch) -> Self {
        AnyBatch::Void(b)
    }
}

impl From<BytesBatch> for AnyBatch {
    fn from(b: BytesBatch) -> Self {
        AnyBatch::Bytes(b)
    }
}

impl From<EventsBatch> for AnyBatch {
    fn from(b: EventsBatch) -> Self {
        AnyBatch::Events(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, LeafType, Schema};

    #[test]
    fn void_batch_is_always_empty() {
        let b = VoidBatch;
        assert_eq!(b.size(), 0);
        let any: AnyBatch = b.into();
        assert!(any.is_tick());
        assert!(any.schema().is_none());
    }

    #[test]
    fn bytes_batch_tick_vs_data() {
        let tick = BytesBatch::tick();
        assert!(tick.is_tick());
        assert_eq!(tick.size(), 0);

        let data = BytesBatch::new(Arc::from(vec![1u8, 2, 3]));
        assert!(!data.is_tick());
        assert_eq!(data.size(), 3);
    }

    #[test]
    fn events_batch_rejects_column_count_mismatch() {
        let schema = Arc::new(Schema::new(
            "t",
            vec![Field::new("x", LeafType::Int64)],
        ));
        let err = EventsBatch::try_new(schema, vec![], 0, 0).unwrap_err();
        assert!(matches!(
            err,
            crate::error::PipelineError::InternalInvariant { .. }
        ));
    }

    #[test]
    fn events_batch_empty_is_a_tick() {
        let schema = Arc::new(Schema::new(
            "t",
            vec![Field::new("x", LeafType::Int64)],
        ));
        let batch = EventsBatch::empty(schema);
        assert!(batch.is_tick());
        assert_eq!(batch.row_count(), 0);
    }
}
