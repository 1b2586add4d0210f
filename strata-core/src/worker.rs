// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The stage interface shared by every pipeline worker.

use std::sync::Arc;

/// A pipeline stage that accepts inputs of type `I`.
///
/// `accept` is called from producer threads and must not block on downstream work. Stages that
/// need to do slow work hand the input to a queue and return.
pub trait Worker<I>: Send + Sync {
    /// Hand one input to this stage.
    fn accept(&self, input: I);
}

impl<I, W: Worker<I> + ?Sized> Worker<I> for Arc<W> {
    fn accept(&self, input: I) {
        (**self).accept(input)
    }
}

impl<I, W: Worker<I> + ?Sized> Worker<I> for Box<W> {
    fn accept(&self, input: I) {
        (**self).accept(input)
    }
}
