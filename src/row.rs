//! Row-oriented convenience helpers on top of the columnar batch model
//! (`spec.md` section 3 / section 4.1).
//!
//! The engine itself only ever sees whole `events` batches with Arrow
//! columns; this module exists so tests and simple reference operators
//! (`operator::testing`) can build and inspect batches in terms of typed
//! Rust values instead of hand-rolling Arrow array builders at every call
//! site.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, Float64Array, Int64Array, StringArray, UInt64Array,
};
use ordered_float::OrderedFloat;

use crate::element::EventsBatch;
use crate::error::PipelineError;
use crate::schema::{LeafType, Schema};

/// A single scalar cell value, covering the leaf types that have an
/// obvious flat Rust representation. Nested leaves (`list`, `record`,
/// `enum`, `address`, `subnet`, `pattern`) are out of scope for this
/// convenience layer; build those columns directly with `arrow` when
/// needed.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int64(i64),
    UInt64(u64),
    Double(OrderedFloat<f64>),
    String(String),
    Blob(Vec<u8>),
}

/// Builds an [`EventsBatch`] from row-major scalar data. Every row must
/// supply exactly one [`Scalar`] per top-level field of `schema`, in
/// field order; `schema` must therefore be built only from the leaf types
/// [`Scalar`] covers (no nested records).
pub fn events_batch_from_rows(
    schema: Arc<Schema>,
    rows: Vec<Vec<Scalar>>,
    import_timestamp: i64,
) -> Result<EventsBatch, PipelineError> {
    let row_count = rows.len();
    let field_count = schema.fields().len();
    let mut columns: Vec<Vec<Scalar>> = vec![Vec::with_capacity(row_count); field_count];
    for row in rows {
        if row.len() != field_count {
            return Err(PipelineError::InternalInvariant {
                message: format!(
                    "row has {} cells but schema '{}' declares {field_count} fields",
                    row.len(),
                    schema.name()
                ),
            });
        }
        for (i, cell) in row.into_iter().enumerate() {
            columns[i].push(cell);
        }
    }

    let arrays: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .zip(columns)
        .map(|(field, cells)| build_array(&field.ty, cells))
        .collect::<Result<_, _>>()?;

    EventsBatch::try_new(schema, arrays, row_count, import_timestamp)
}

fn build_array(ty: &LeafType, cells: Vec<Scalar>) -> Result<ArrayRef, PipelineError> {
    match ty {
        LeafType::Int64 => {
            let values = cells
                .into_iter()
                .map(|c| expect_int64(c))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(Int64Array::from(values)))
        }
        LeafType::UInt64 => {
            let values = cells
                .into_iter()
                .map(expect_uint64)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(UInt64Array::from(values)))
        }
        LeafType::Double => {
            let values = cells
                .into_iter()
                .map(expect_double)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(Float64Array::from(values)))
        }
        LeafType::String => {
            let values = cells
                .into_iter()
                .map(expect_string)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Arc::new(StringArray::from(values)))
        }
        LeafType::Blob => {
            let values = cells
                .into_iter()
                .map(expect_blob)
                .collect::<Result<Vec<_>, _>>()?;
            let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
            Ok(Arc::new(BinaryArray::from(refs)))
        }
        other => Err(PipelineError::InternalInvariant {
            message: format!("row::build_array does not support leaf type {other:?}"),
        }),
    }
}

fn expect_int64(cell: Scalar) -> Result<i64, PipelineError> {
    match cell {
        Scalar::Int64(v) => Ok(v),
        other => Err(type_error("int64", &other)),
    }
}

fn expect_uint64(cell: Scalar) -> Result<u64, PipelineError> {
    match cell {
        Scalar::UInt64(v) => Ok(v),
        other => Err(type_error("uint64", &other)),
    }
}

fn expect_double(cell: Scalar) -> Result<f64, PipelineError> {
    match cell {
        Scalar::Double(v) => Ok(v.into_inner()),
        other => Err(type_error("double", &other)),
    }
}

fn expect_string(cell: Scalar) -> Result<String, PipelineError> {
    match cell {
        Scalar::String(v) => Ok(v),
        other => Err(type_error("string", &other)),
    }
}

fn expect_blob(cell: Scalar) -> Result<Vec<u8>, PipelineError> {
    match cell {
        Scalar::Blob(v) => Ok(v),
        other => Err(type_error("blob", &other)),
    }
}

fn type_error(expected: &str, found: &Scalar) -> PipelineError {
    PipelineError::InternalInvariant {
        message: format!("row cell mismatch: expected {expected}, found {found:?}"),
    }
}

/// Reads the first row's `Int64` value out of the named column, for
/// reference-operator predicates (`operator::testing::Where`) that only
/// ever see single-row batches in tests.
pub fn first_row_int64(batch: &EventsBatch, field_name: &str) -> Option<i64> {
    let idx = batch.schema().fields().iter().position(|f| f.name == field_name)?;
    let column = batch.columns().get(idx)?;
    let array = column.as_any().downcast_ref::<Int64Array>()?;
    if array.is_empty() || array.is_null(0) {
        None
    } else {
        Some(array.value(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    #[test]
    fn builds_int64_column_from_rows() {
        let schema = Arc::new(Schema::new("t", vec![Field::new("x", LeafType::Int64)]));
        let batch = events_batch_from_rows(
            schema,
            vec![vec![Scalar::Int64(1)], vec![Scalar::Int64(2)]],
            0,
        )
        .unwrap();
        assert_eq!(batch.row_count(), 2);
        assert_eq!(first_row_int64(&batch, "x"), Some(1));
    }

    #[test]
    fn rejects_row_with_wrong_field_count() {
        let schema = Arc::new(Schema::new("t", vec![Field::new("x", LeafType::Int64)]));
        let err = events_batch_from_rows(schema, vec![vec![]], 0).unwrap_err();
        assert!(matches!(err, PipelineError::InternalInvariant { .. }));
    }
}
