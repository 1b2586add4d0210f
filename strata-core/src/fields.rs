// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Storage schema for metric records.
//!
//! Records describe their own storage layout through [`ToStorageFields`] and
//! [`FromStorageFields`]. Storage backends only ever see a [`StorageFields`] map of named,
//! typed columns.

use std::{collections::BTreeMap, error::Error, fmt};

use crate::{accumulate::BucketCounts, identity::MetricId};

/// A single typed column value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Integer column
    Long(i64),
    /// Floating point column
    Double(f64),
    /// Free-form text column
    Text(String),
    /// Bucketed distribution column, as `(bucket key, count)` pairs
    Buckets(Vec<(u64, u64)>),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            FieldValue::Long(_) => "long",
            FieldValue::Double(_) => "double",
            FieldValue::Text(_) => "text",
            FieldValue::Buckets(_) => "buckets",
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Long(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&BucketCounts> for FieldValue {
    fn from(value: &BucketCounts) -> Self {
        FieldValue::Buckets(value.iter().collect())
    }
}

/// Error decoding a record from [`StorageFields`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// A required column is absent
    Missing(String),
    /// A column holds a value of the wrong type
    TypeMismatch {
        /// Column name
        field: String,
        /// Type the decoder expected
        expected: &'static str,
        /// Type actually found
        found: &'static str,
    },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldError::Missing(field) => write!(f, "missing field `{field}`"),
            FieldError::TypeMismatch {
                field,
                expected,
                found,
            } => write!(f, "field `{field}` is {found}, expected {expected}"),
        }
    }
}

impl Error for FieldError {}

/// Named columns of one stored record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageFields {
    fields: BTreeMap<String, FieldValue>,
}

impl StorageFields {
    /// An empty set of columns.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Self::insert`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a column, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Look up a column.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Read an integer column.
    pub fn long(&self, name: &str) -> Result<i64, FieldError> {
        match self.required(name)? {
            FieldValue::Long(value) => Ok(*value),
            other => Err(mismatch(name, "long", other)),
        }
    }

    /// Read a floating point column. Integer columns are widened.
    pub fn double(&self, name: &str) -> Result<f64, FieldError> {
        match self.required(name)? {
            FieldValue::Double(value) => Ok(*value),
            FieldValue::Long(value) => Ok(*value as f64),
            other => Err(mismatch(name, "double", other)),
        }
    }

    /// Read a text column.
    pub fn text(&self, name: &str) -> Result<&str, FieldError> {
        match self.required(name)? {
            FieldValue::Text(value) => Ok(value),
            other => Err(mismatch(name, "text", other)),
        }
    }

    /// Read a bucketed distribution column.
    pub fn buckets(&self, name: &str) -> Result<BucketCounts, FieldError> {
        match self.required(name)? {
            FieldValue::Buckets(pairs) => {
                let mut counts = BucketCounts::default();
                for (bucket, count) in pairs {
                    counts.add_bucket(*bucket, *count);
                }
                Ok(counts)
            }
            other => Err(mismatch(name, "buckets", other)),
        }
    }

    /// Iterate over columns in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no columns.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn required(&self, name: &str) -> Result<&FieldValue, FieldError> {
        self.fields
            .get(name)
            .ok_or_else(|| FieldError::Missing(name.to_owned()))
    }
}

fn mismatch(field: &str, expected: &'static str, found: &FieldValue) -> FieldError {
    FieldError::TypeMismatch {
        field: field.to_owned(),
        expected,
        found: found.kind(),
    }
}

/// Encode a record into storage columns.
pub trait ToStorageFields {
    /// The columns to persist. The identity is persisted separately by the storage layer.
    fn to_storage_fields(&self) -> StorageFields;
}

/// Decode a record from storage columns.
pub trait FromStorageFields: Sized {
    /// Rebuild a record with identity `id` from its stored columns.
    fn from_storage_fields(id: MetricId, fields: &StorageFields) -> Result<Self, FieldError>;
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn typed_access() {
        let fields = StorageFields::new()
            .with("total", 12_i64)
            .with("value", 1.5_f64)
            .with("label", "x".to_owned());
        check!(fields.long("total") == Ok(12));
        check!(fields.double("total") == Ok(12.0));
        check!(fields.text("label") == Ok("x"));
        check!(fields.long("missing") == Err(FieldError::Missing("missing".into())));
        check!(
            fields.long("value")
                == Err(FieldError::TypeMismatch {
                    field: "value".into(),
                    expected: "long",
                    found: "double",
                })
        );
    }
}
