// SPDX-License-Identifier: (MIT OR Apache-2.0)
#![allow(dead_code)]
//! Shared integration test utilities.

use std::sync::{Arc, Once};

use parking_lot::Mutex;

static INIT_LOGGING: Once = Once::new();

/// Route runtime traces to the test writer. Safe to call from every test.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Event log shared between tasks.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entries joined by single spaces.
    pub fn line(&self) -> String {
        self.0.lock().join(" ")
    }
}
