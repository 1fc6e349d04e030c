//! Participant registry
//!
//! The authoritative table of joined participants: channel binding, static
//! capability patterns, and runtime grants keyed by grant id. The registry
//! is plain data owned by the space core task; it is never shared across
//! tasks.

use crate::space::channel::{ChannelHandle, ChannelId};
use mew_core::capability::{CapabilityPattern, dedup_patterns};
use std::collections::HashMap;

/// One joined participant.
#[derive(Debug)]
pub struct ParticipantRecord {
    /// Write-side handle of the participant's current channel.
    pub channel: ChannelHandle,
    /// Configured patterns merged with the implicit baseline at join.
    pub static_capabilities: Vec<CapabilityPattern>,
    /// Runtime grants: grant id (the grant envelope's id) to the patterns
    /// it conferred. Purged wholesale on disconnect.
    pub runtime_grants: HashMap<String, Vec<CapabilityPattern>>,
}

impl ParticipantRecord {
    /// Static capabilities plus all runtime grants, deduped canonically.
    pub fn effective_capabilities(&self) -> Vec<CapabilityPattern> {
        let mut all = self.static_capabilities.clone();
        for patterns in self.runtime_grants.values() {
            all.extend(patterns.iter().cloned());
        }
        dedup_patterns(all)
    }
}

/// Registry mapping participant ids to their records, with a reverse index
/// from channel id to participant id for inbound dispatch.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: HashMap<String, ParticipantRecord>,
    by_channel: HashMap<ChannelId, String>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a participant after a successful join. Static capabilities
    /// are deduped here so duplicated config entries collapse.
    ///
    /// Returns the previous record when the id was already joined
    /// (duplicate join: the caller closes the old channel).
    pub fn join(
        &mut self,
        participant_id: &str,
        channel: ChannelHandle,
        static_capabilities: Vec<CapabilityPattern>,
    ) -> Option<ParticipantRecord> {
        let previous = self.remove(participant_id);
        self.by_channel
            .insert(channel.id(), participant_id.to_string());
        self.participants.insert(
            participant_id.to_string(),
            ParticipantRecord {
                channel,
                static_capabilities: dedup_patterns(static_capabilities),
                runtime_grants: HashMap::new(),
            },
        );
        previous
    }

    /// Remove a participant and its channel index entry, returning the
    /// record (with its grants, for cleanup).
    pub fn remove(&mut self, participant_id: &str) -> Option<ParticipantRecord> {
        let record = self.participants.remove(participant_id)?;
        self.by_channel.remove(&record.channel.id());
        Some(record)
    }

    /// Participant id bound to a channel, if the channel has joined.
    pub fn participant_for_channel(&self, channel_id: ChannelId) -> Option<&str> {
        self.by_channel.get(&channel_id).map(String::as_str)
    }

    pub fn get(&self, participant_id: &str) -> Option<&ParticipantRecord> {
        self.participants.get(participant_id)
    }

    pub fn get_mut(&mut self, participant_id: &str) -> Option<&mut ParticipantRecord> {
        self.participants.get_mut(participant_id)
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.participants.contains_key(participant_id)
    }

    /// Iterate `(id, record)` over all joined participants.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParticipantRecord)> {
        self.participants.iter()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Merge additional static capabilities into a participant
    /// (`system/register`). The effective set is unchanged when every
    /// pattern is already held.
    pub fn merge_static_capabilities(
        &mut self,
        participant_id: &str,
        additional: Vec<CapabilityPattern>,
    ) -> bool {
        let Some(record) = self.participants.get_mut(participant_id) else {
            return false;
        };
        let mut merged = record.static_capabilities.clone();
        merged.extend(additional);
        record.static_capabilities = dedup_patterns(merged);
        true
    }

    /// Record a runtime grant for a recipient. Re-sent grants create
    /// independent records because each grant envelope has a fresh id.
    pub fn add_grant(
        &mut self,
        recipient_id: &str,
        grant_id: &str,
        patterns: Vec<CapabilityPattern>,
    ) -> bool {
        let Some(record) = self.participants.get_mut(recipient_id) else {
            return false;
        };
        record
            .runtime_grants
            .insert(grant_id.to_string(), patterns);
        true
    }

    /// Remove one grant record by id. No-op when recipient or grant is
    /// unknown.
    pub fn revoke_grant_by_id(&mut self, recipient_id: &str, grant_id: &str) {
        if let Some(record) = self.participants.get_mut(recipient_id) {
            record.runtime_grants.remove(grant_id);
        }
    }

    /// Remove every granted pattern whose canonical form equals any of the
    /// given patterns, dropping grant records that become empty.
    pub fn revoke_grants_by_patterns(
        &mut self,
        recipient_id: &str,
        patterns: &[CapabilityPattern],
    ) {
        let Some(record) = self.participants.get_mut(recipient_id) else {
            return;
        };
        let revoked: std::collections::HashSet<String> =
            patterns.iter().map(CapabilityPattern::canonical).collect();
        record.runtime_grants.retain(|_, granted| {
            granted.retain(|p| !revoked.contains(&p.canonical()));
            !granted.is_empty()
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
