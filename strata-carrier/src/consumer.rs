// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The consumer side of a [`Carrier`](crate::Carrier).

use std::{
    any::Any,
    error::Error,
    fmt,
    panic::{self, AssertUnwindSafe},
    time::Duration,
};

/// Processes batches of items drained from a carrier.
///
/// A consumer attached to a multi-channel carrier may be called from several pool threads at
/// once, one per channel.
pub trait Consumer<T>: Send + Sync + 'static {
    /// Process a batch. Items left in `batch` on return are discarded.
    ///
    /// Returning an error, or panicking, hands the batch to [`Consumer::on_error`] and the pool
    /// thread moves on to the next batch.
    fn consume(&self, batch: &mut Vec<T>) -> Result<(), ConsumeError>;

    /// Called with whatever was left in a batch that failed. The failure has already been logged
    /// and counted by the pool.
    fn on_error(&self, _batch: &[T], _error: &ConsumeError) {}

    /// Called when a pool thread found all of its channels of this carrier empty, before it parks.
    fn nothing_to_consume(&self) {}

    /// Called once, after the pool has drained and stopped.
    fn on_exit(&self) {}
}

/// Failure of [`Consumer::consume`].
#[derive(Debug)]
pub enum ConsumeError {
    /// The consumer reported an error
    Failed(Box<dyn Error + Send + Sync>),
    /// The consumer panicked; holds the panic message
    Panicked(String),
}

impl ConsumeError {
    /// Wrap any error.
    pub fn failed(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        ConsumeError::Failed(err.into())
    }
}

impl fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumeError::Failed(err) => write!(f, "consumer failed: {err}"),
            ConsumeError::Panicked(message) => write!(f, "consumer panicked: {message}"),
        }
    }
}

impl Error for ConsumeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConsumeError::Failed(err) => Some(&**err),
            ConsumeError::Panicked(_) => None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Run one batch through `consumer`, isolating failures. Returns the batch size and leaves
/// `batch` empty.
pub(crate) fn run_batch<T: 'static>(consumer: &dyn Consumer<T>, batch: &mut Vec<T>, carrier: &str) -> usize {
    let size = batch.len();
    let result = panic::catch_unwind(AssertUnwindSafe(|| consumer.consume(batch)))
        .unwrap_or_else(|payload| Err(ConsumeError::Panicked(panic_message(&*payload))));
    if let Err(err) = result {
        metrics_024::counter!("strata_consumer_errors", "carrier" => carrier.to_owned()).increment(1);
        crate::rate_limited!(
            Duration::from_secs(1),
            tracing::error!(carrier, size, %err, "consumer failed to process batch")
        );
        consumer.on_error(batch, &err);
    }
    batch.clear();
    size
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert2::check;

    use super::*;

    #[derive(Default)]
    struct Flaky {
        failed_with: Mutex<Vec<(usize, String)>>,
    }

    impl Consumer<i32> for Flaky {
        fn consume(&self, batch: &mut Vec<i32>) -> Result<(), ConsumeError> {
            match batch.first() {
                Some(0) => panic!("boom"),
                Some(1) => Err(ConsumeError::failed("storage unavailable")),
                _ => {
                    batch.clear();
                    Ok(())
                }
            }
        }

        fn on_error(&self, batch: &[i32], error: &ConsumeError) {
            self.failed_with
                .lock()
                .unwrap()
                .push((batch.len(), error.to_string()));
        }
    }

    #[test]
    fn failures_are_isolated() {
        let consumer = Flaky::default();
        for first in [0, 1, 2] {
            let mut batch = vec![first, 10, 11];
            check!(run_batch(&consumer, &mut batch, "test") == 3);
            check!(batch.is_empty());
        }
        let failed = consumer.failed_with.lock().unwrap();
        check!(failed.len() == 2);
        check!(failed[0] == (3, "consumer panicked: boom".to_owned()));
        check!(failed[1] == (3, "consumer failed: storage unavailable".to_owned()));
    }
}
