// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prepared storage write requests.

use std::fmt;

use strata_core::{MetricId, Model, StorageFields};

/// Whether a request creates a row or overwrites an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Create a new row
    Insert,
    /// Overwrite an existing row
    Update,
}

/// Notified once the storage layer knows the outcome of a request.
pub trait WriteCallback: Send {
    /// The write was executed by the backend.
    fn on_success(self: Box<Self>);

    /// The write failed or was never executed.
    fn on_failure(self: Box<Self>);
}

/// A storage write ready to be executed by a [`BatchDao`](crate::dao::BatchDao).
///
/// The executor must call [`PrepareRequest::confirm`] only after the write is actually executed,
/// and [`PrepareRequest::reject`] when it fails. A request dropped without either counts as
/// rejected.
pub struct PrepareRequest {
    kind: RequestKind,
    model: Model,
    id: MetricId,
    fields: StorageFields,
    callback: Option<Box<dyn WriteCallback>>,
}

impl PrepareRequest {
    /// A request without a callback.
    pub fn new(kind: RequestKind, model: Model, id: MetricId, fields: StorageFields) -> Self {
        Self {
            kind,
            model,
            id,
            fields,
            callback: None,
        }
    }

    /// Attach the callback to run once the outcome is known.
    pub fn with_callback(mut self, callback: impl WriteCallback + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Insert or update.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Target model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Target row.
    pub fn id(&self) -> &MetricId {
        &self.id
    }

    /// Columns to write.
    pub fn fields(&self) -> &StorageFields {
        &self.fields
    }

    /// Report that the write was executed.
    pub fn confirm(mut self) {
        if let Some(callback) = self.callback.take() {
            callback.on_success();
        }
    }

    /// Report that the write failed.
    pub fn reject(mut self) {
        if let Some(callback) = self.callback.take() {
            callback.on_failure();
        }
    }
}

impl Drop for PrepareRequest {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback.on_failure();
        }
    }
}

impl fmt::Debug for PrepareRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrepareRequest")
            .field("kind", &self.kind)
            .field("model", &self.model.storage_name())
            .field("id", &self.id.storage_id())
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}
