use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::{ArrayValue, FirestoreValue, ValueKind};

/// A server-side field transform carried by a transform mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Result shown locally before the server has seen the write.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => {
                FirestoreValue::from_array(coerce_array(previous).union(elements).values().to_vec())
            }
            TransformOperation::ArrayRemove(elements) => FirestoreValue::from_array(
                coerce_array(previous).remove_all(elements).values().to_vec(),
            ),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                add_numbers(&base, operand)
            }
        }
    }

    /// Result once the server acknowledged the write.
    ///
    /// The server only returns values for timestamp and increment transforms;
    /// array transforms are recomputed from the previous value. A missing
    /// server value falls back to local computation at `commit_time`.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: Option<&FirestoreValue>,
        commit_time: Timestamp,
    ) -> FirestoreValue {
        match (self, server_result) {
            (TransformOperation::ServerTimestamp, Some(value))
            | (TransformOperation::NumericIncrement(_), Some(value)) => value.clone(),
            _ => self.apply_to_local_view(previous, commit_time),
        }
    }

    /// Value that must be captured before the write so that repeated local
    /// application stays stable. Only increments need one.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

fn coerce_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn add_numbers(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(left), ValueKind::Integer(right)) => {
            FirestoreValue::from_integer(left.saturating_add(*right))
        }
        (ValueKind::Integer(left), ValueKind::Double(right)) => {
            FirestoreValue::from_double(*left as f64 + right)
        }
        (ValueKind::Double(left), ValueKind::Integer(right)) => {
            FirestoreValue::from_double(left + *right as f64)
        }
        (ValueKind::Double(left), ValueKind::Double(right)) => {
            FirestoreValue::from_double(left + right)
        }
        _ => operand.clone(),
    }
}
