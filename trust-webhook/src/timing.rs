// Copyright (c) 2024 The Trust Webhook Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, log_enabled, Level};

/// Durations of the steps of one admission request.
#[derive(Debug, Default)]
pub struct Timings {
    entries: Mutex<Vec<(String, Duration)>>,
}

impl Timings {
    pub fn record(&self, label: impl Into<String>, elapsed: Duration) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((label.into(), elapsed));
    }

    /// Await `future` and record how long it took.
    pub async fn time<F: Future>(&self, label: impl Into<String>, future: F) -> F::Output {
        let start = Instant::now();
        let output = future.await;
        self.record(label, start.elapsed());
        output
    }

    pub fn entries(&self) -> Vec<(String, Duration)> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn log(&self, uid: &str) {
        if !log_enabled!(Level::Debug) {
            return;
        }
        for (label, elapsed) in self.entries() {
            debug!("request {uid}: {label}: {:2.6} sec", elapsed.as_secs_f64());
        }
    }
}
