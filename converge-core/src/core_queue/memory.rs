/*
    memory.rs - In-process queue backend

    Default backend for single-process deployments and tests. Keeps one
    FIFO per stream plus at most one in-flight delivery per stream, with
    expiry-based redelivery standing in for a crashed consumer.
*/

use super::{stream_key, Delivery, EventQueue, QueueError, QueueResult, QueueStats, Receipt};
use crate::model::SyncEvent;
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

struct InFlight {
    seq: u64,
    event: SyncEvent,
    consumer: String,
    deadline: Instant,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: VecDeque<(u64, SyncEvent)>,
    in_flight: Option<InFlight>,
}

/// In-memory event queue with visibility-timeout redelivery
pub struct MemoryQueue {
    streams: Mutex<BTreeMap<String, StreamState>>,
    notify: Notify,
    visibility_timeout: Duration,
    max_stream_length: usize,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration, max_stream_length: usize) -> Self {
        MemoryQueue {
            streams: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            visibility_timeout,
            max_stream_length,
        }
    }

    /// Pick the next deliverable event: an expired in-flight entry is
    /// redelivered first, otherwise the head of a stream with nothing in
    /// flight. Streams with a live in-flight delivery are skipped, which
    /// is what serializes processing per stream.
    fn try_take(
        &self,
        streams: &mut BTreeMap<String, StreamState>,
        consumer_id: &str,
        now: Instant,
    ) -> Option<Delivery> {
        for (name, state) in streams.iter_mut() {
            if let Some(in_flight) = &mut state.in_flight {
                if in_flight.deadline <= now {
                    debug!(stream = %name, seq = in_flight.seq, "redelivering expired event");
                    in_flight.consumer = consumer_id.to_string();
                    in_flight.deadline = now + self.visibility_timeout;
                    return Some(Delivery {
                        event: in_flight.event.clone(),
                        receipt: Receipt { stream: name.clone(), seq: in_flight.seq },
                    });
                }
                continue;
            }

            if let Some((seq, event)) = state.entries.pop_front() {
                state.in_flight = Some(InFlight {
                    seq,
                    event: event.clone(),
                    consumer: consumer_id.to_string(),
                    deadline: now + self.visibility_timeout,
                });
                return Some(Delivery {
                    event,
                    receipt: Receipt { stream: name.clone(), seq },
                });
            }
        }
        None
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn publish(&self, event: &SyncEvent) -> QueueResult<()> {
        let key = stream_key(&event.source, &event.target);
        let mut streams = self.streams.lock().await;
        let state = streams.entry(key.clone()).or_default();

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push_back((seq, event.clone()));

        // Cap the backlog: oldest queued entries are trimmed first.
        while state.entries.len() > self.max_stream_length {
            if let Some((dropped, _)) = state.entries.pop_front() {
                debug!(stream = %key, seq = dropped, "trimmed oldest queued event");
            }
        }

        drop(streams);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, consumer_id: &str, timeout: Duration) -> QueueResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut streams = self.streams.lock().await;
                if let Some(delivery) = self.try_take(&mut streams, consumer_id, Instant::now()) {
                    return Ok(Some(delivery));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Wake on publish, but poll at least every 100ms so expired
            // visibility deadlines are noticed without a reaper task.
            let wait = std::cmp::min(deadline - now, Duration::from_millis(100));
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn ack(&self, consumer_id: &str, receipt: &Receipt) -> QueueResult<()> {
        let mut streams = self.streams.lock().await;

        let state = streams
            .get_mut(&receipt.stream)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.stream.clone()))?;

        match &state.in_flight {
            Some(in_flight) if in_flight.seq == receipt.seq && in_flight.consumer == consumer_id => {
                state.in_flight = None;
                drop(streams);
                // The stream head is free again; wake a blocked consumer.
                self.notify.notify_waiters();
                Ok(())
            }
            _ => Err(QueueError::UnknownReceipt(format!(
                "{}#{}",
                receipt.stream, receipt.seq
            ))),
        }
    }

    async fn get_pending(&self, consumer_id: &str) -> QueueResult<Vec<SyncEvent>> {
        let streams = self.streams.lock().await;
        Ok(streams
            .values()
            .filter_map(|s| s.in_flight.as_ref())
            .filter(|f| f.consumer == consumer_id)
            .map(|f| f.event.clone())
            .collect())
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let streams = self.streams.lock().await;
        let mut stats = QueueStats {
            streams: streams.len(),
            ..Default::default()
        };
        for state in streams.values() {
            stats.queued += state.entries.len();
            if let Some(f) = &state.in_flight {
                stats.in_flight += 1;
                *stats.pending_by_consumer.entry(f.consumer.clone()).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    async fn clear(&self) -> QueueResult<()> {
        self.streams.lock().await.clear();
        Ok(())
    }
}
