//! In-crate publisher double. The richer mock used by the binaries lives in
//! `ntcb-devkit`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::bus::{BusError, Publisher};

#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    attempts: AtomicUsize,
    fail_first: usize,
}

impl RecordingPublisher {
    /// Rejects the first `n` publishes with [`BusError::Closed`].
    pub fn failing_first(n: usize) -> Self {
        Self { fail_first: n, ..Self::default() }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn on_topic(&self, topic: &str) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _retained: bool) -> Result<(), BusError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(BusError::Closed);
        }
        self.sent.lock().push((topic.to_string(), payload));
        Ok(())
    }
}
