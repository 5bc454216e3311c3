use std::collections::VecDeque;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// FIFO of display units (chars) waiting to be released by the pacer.
#[derive(Debug, Clone, Default)]
pub struct ChunkQueue {
    units: VecDeque<char>,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, text: &str) {
        self.units.extend(text.chars());
    }

    /// Takes up to `min_batch` units from the front (at least one).
    pub fn release(&mut self, min_batch: usize) -> String {
        let count = min_batch.max(1).min(self.units.len());
        self.units.drain(..count).collect()
    }

    pub fn drain_all(&mut self) -> String {
        self.units.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Periodic release task. Aborted when dropped.
#[derive(Debug)]
pub struct PacerHandle {
    task: JoinHandle<()>,
}

impl PacerHandle {
    /// Calls `tick` every `interval` until it returns false. Must be called
    /// from within a tokio runtime.
    pub fn spawn<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !tick() {
                    break;
                }
            }
        });
        Self { task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PacerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
