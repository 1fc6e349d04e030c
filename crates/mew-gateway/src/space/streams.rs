//! Stream coordinator state
//!
//! Streams are gateway-brokered byte channels identified by `stream-<n>`
//! with a per-space monotonic counter. The table records who opened each
//! stream; only the owner's `#<id>#` data frames are forwarded. Records
//! disappear on `stream/close` and when the owner disconnects.

use std::collections::HashMap;

/// One active stream.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    /// Id of the `stream/request` envelope that opened the stream.
    pub request_id: String,
    /// Participant allowed to write data frames.
    pub owner: String,
    /// Declared direction (`payload.direction`), `"unknown"` when absent.
    pub direction: String,
    /// Stamp from the opening request.
    pub created_at: String,
}

/// Table of active streams keyed by stream id.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<String, StreamRecord>,
    next_stream: u64,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next stream id and record the stream.
    pub fn open(&mut self, request_id: &str, owner: &str, direction: Option<&str>) -> String {
        self.next_stream += 1;
        let stream_id = format!("stream-{}", self.next_stream);
        self.streams.insert(
            stream_id.clone(),
            StreamRecord {
                request_id: request_id.to_string(),
                owner: owner.to_string(),
                direction: direction.unwrap_or("unknown").to_string(),
                created_at: mew_core::envelope::now_ts(),
            },
        );
        stream_id
    }

    pub fn get(&self, stream_id: &str) -> Option<&StreamRecord> {
        self.streams.get(stream_id)
    }

    /// True iff the stream exists and is owned by `sender`. Data frames for
    /// anything else are dropped.
    pub fn owner_may_write(&self, stream_id: &str, sender: &str) -> bool {
        self.streams
            .get(stream_id)
            .is_some_and(|record| record.owner == sender)
    }

    /// Remove one stream, returning its record.
    pub fn close(&mut self, stream_id: &str) -> Option<StreamRecord> {
        self.streams.remove(stream_id)
    }

    /// Remove every stream owned by a disconnecting participant, returning
    /// the abandoned `(stream_id, record)` pairs.
    pub fn close_owned_by(&mut self, owner: &str) -> Vec<(String, StreamRecord)> {
        let abandoned: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, record)| record.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        abandoned
            .into_iter()
            .filter_map(|id| self.streams.remove(&id).map(|record| (id, record)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
