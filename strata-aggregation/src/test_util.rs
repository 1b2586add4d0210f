// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory storage and consumers for tests.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use strata_core::{MetricId, Metrics, Model, StorageFields};

use crate::{
    dao::{BatchDao, MetricsDao, StorageError},
    export::{EventKind, MetricsConsumer},
    request::{PrepareRequest, RequestKind},
};

/// A request [`MemoryStorage`] executed.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutedRequest {
    /// Insert or update
    pub kind: RequestKind,
    /// Storage name of the target model
    pub model: String,
    /// Target row
    pub id: MetricId,
    /// Written columns
    pub fields: StorageFields,
}

/// Storage backed by a map, usable as both [`MetricsDao`] and [`BatchDao`].
///
/// Behaves like a table with a primary key: an insert of an existing row and an update of a
/// missing row are rejected. Requests are confirmed only once applied.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: Mutex<BTreeMap<(String, MetricId), StorageFields>>,
    executed: Mutex<Vec<ExecutedRequest>>,
    loads: AtomicUsize,
    fail_loads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following load fail with [`StorageError::Unavailable`].
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Relaxed);
    }

    /// Make every following flush fail, rejecting all of its requests.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Store a row directly, as if written by an earlier process.
    pub fn seed(&self, model: &Model, metrics: &impl Metrics) {
        self.lock_rows()
            .insert((model.storage_name(), metrics.id().clone()), metrics.to_storage_fields());
    }

    /// Delete a row, as storage retention would.
    pub fn delete(&self, model: &Model, id: &MetricId) -> bool {
        self.lock_rows().remove(&(model.storage_name(), id.clone())).is_some()
    }

    /// The stored columns of a row.
    pub fn row(&self, model: &Model, id: &MetricId) -> Option<StorageFields> {
        self.lock_rows().get(&(model.storage_name(), id.clone())).cloned()
    }

    /// Number of stored rows across all models.
    pub fn rows(&self) -> usize {
        self.lock_rows().len()
    }

    /// Every executed request so far, in execution order.
    pub fn executed(&self) -> Vec<ExecutedRequest> {
        self.executed.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Executed requests since the last call.
    pub fn take_executed(&self) -> Vec<ExecutedRequest> {
        std::mem::take(&mut *self.executed.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Number of [`MetricsDao::multi_get`] calls so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    fn lock_rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, MetricId), StorageFields>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, request: &PrepareRequest) -> bool {
        let key = (request.model().storage_name(), request.id().clone());
        let mut rows = self.lock_rows();
        let exists = rows.contains_key(&key);
        match (request.kind(), exists) {
            (RequestKind::Insert, false) | (RequestKind::Update, true) => {
                rows.insert(key, request.fields().clone());
                true
            }
            _ => false,
        }
    }
}

impl<M: Metrics> MetricsDao<M> for MemoryStorage {
    fn multi_get(&self, model: &Model, ids: &[MetricId]) -> Result<Vec<M>, StorageError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if self.fail_loads.load(Ordering::Relaxed) {
            return Err(StorageError::Unavailable("injected load failure".into()));
        }
        let rows = self.lock_rows();
        let name = model.storage_name();
        ids.iter()
            .filter_map(|id| {
                rows.get(&(name.clone(), id.clone()))
                    .map(|fields| M::from_storage_fields(id.clone(), fields).map_err(StorageError::from))
            })
            .collect()
    }
}

impl BatchDao for MemoryStorage {
    fn flush(&self, requests: Vec<PrepareRequest>) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            for request in requests {
                request.reject();
            }
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        for request in requests {
            if self.apply(&request) {
                self.executed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(ExecutedRequest {
                        kind: request.kind(),
                        model: request.model().storage_name(),
                        id: request.id().clone(),
                        fields: request.fields().clone(),
                    });
                request.confirm();
            } else {
                request.reject();
            }
        }
        Ok(())
    }
}

/// Captures every record dispatched to it.
#[derive(Debug)]
pub struct RecordingConsumer<M> {
    events: Mutex<Vec<(M, EventKind)>>,
    only: Option<EventKind>,
}

impl<M> Default for RecordingConsumer<M> {
    fn default() -> Self {
        Self {
            events: Mutex::new(vec![]),
            only: None,
        }
    }
}

impl<M: Clone> RecordingConsumer<M> {
    /// Records events of both kinds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records only events of `kind`, like an alarm consumer taking totals.
    pub fn only(kind: EventKind) -> Self {
        Self {
            events: Mutex::new(vec![]),
            only: Some(kind),
        }
    }

    /// Every captured event, in dispatch order.
    pub fn events(&self) -> Vec<(M, EventKind)> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Captured records of `kind`.
    pub fn of_kind(&self, kind: EventKind) -> Vec<M> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, k)| *k == kind)
            .map(|(m, _)| m.clone())
            .collect()
    }
}

impl<M: Clone + Send> MetricsConsumer<M> for RecordingConsumer<M> {
    fn accept(&self, metrics: &M, kind: EventKind) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((metrics.clone(), kind));
    }

    fn interested_in(&self, kind: EventKind) -> bool {
        self.only.is_none_or(|only| only == kind)
    }
}
