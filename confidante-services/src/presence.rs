use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Instant;

use tracing::debug;

use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::{Presence, PresenceType};

struct PresenceRecord {
    priority: i8,
    available: bool,
    updated_at: Instant,
}

/// Presence records, the subscription table, and directed-presence
/// bookkeeping, `spec.md` §3/§4.10. Concurrent maps in the same style as
/// `session_index::SessionIndex` — there is no teacher precedent for this
/// subsystem, so the concurrency discipline is carried over rather than
/// the data shape itself.
#[derive(Default)]
pub struct PresenceManager {
    records: RwLock<HashMap<Jid, PresenceRecord>>,
    subscribers: RwLock<HashMap<Jid, HashSet<Jid>>>,
    directed: RwLock<HashMap<Jid, HashSet<Jid>>>,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, full_jid: Jid, presence: &Presence) {
        let available = !matches!(presence.kind, PresenceType::Unavailable);
        self.records
            .write()
            .expect("presence lock poisoned")
            .insert(
                full_jid,
                PresenceRecord {
                    priority: presence.priority(),
                    available,
                    updated_at: Instant::now(),
                },
            );
    }

    pub fn remove(&self, full_jid: &Jid) {
        self.records
            .write()
            .expect("presence lock poisoned")
            .remove(full_jid);
    }

    /// Whether `full_jid` currently has an `available` presence record —
    /// used to decide whether a closing session owes subscribers and
    /// directed-presence targets an `unavailable` broadcast.
    pub fn is_available(&self, full_jid: &Jid) -> bool {
        self.records
            .read()
            .expect("presence lock poisoned")
            .get(full_jid)
            .is_some_and(|record| record.available)
    }

    /// Picks the resource that should receive bare-JID-addressed
    /// `chat`/`normal` stanzas: the single highest-priority available
    /// resource, ties broken by most recent presence update. A negative
    /// maximum priority is still selected — negative priority only means
    /// "not preferred over a higher one", never "excluded" (decided in
    /// `DESIGN.md`, resolving `spec.md` §9's open question).
    pub fn best_resource(&self, bare_jid: &Jid, candidates: &[String]) -> Option<String> {
        let records = self.records.read().expect("presence lock poisoned");

        candidates
            .iter()
            .filter_map(|resource| {
                let full = bare_jid.bind(resource.clone());
                records
                    .get(&full)
                    .filter(|record| record.available)
                    .map(|record| (resource.clone(), record.priority, record.updated_at))
            })
            .max_by(|(_, priority_a, updated_a), (_, priority_b, updated_b)| {
                priority_a
                    .cmp(priority_b)
                    .then(updated_a.cmp(updated_b))
            })
            .map(|(resource, ..)| resource)
    }

    pub fn add_subscriber(&self, target_bare: Jid, subscriber: Jid) {
        self.subscribers
            .write()
            .expect("presence lock poisoned")
            .entry(target_bare)
            .or_default()
            .insert(subscriber);
    }

    pub fn remove_subscriber(&self, target_bare: &Jid, subscriber: &Jid) {
        if let Some(set) = self
            .subscribers
            .write()
            .expect("presence lock poisoned")
            .get_mut(target_bare)
        {
            set.remove(subscriber);
        }
    }

    pub fn subscribers_of(&self, target_bare: &Jid) -> Vec<Jid> {
        self.subscribers
            .read()
            .expect("presence lock poisoned")
            .get(target_bare)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_directed(&self, from_bare: Jid, to: Jid) {
        self.directed
            .write()
            .expect("presence lock poisoned")
            .entry(from_bare)
            .or_default()
            .insert(to);
    }

    /// Forgets one directed-presence target, e.g. when the sender directs
    /// an explicit `unavailable` at it (RFC 6121 §4.6.2).
    pub fn remove_directed_target(&self, from_bare: &Jid, to: &Jid) {
        if let Some(set) = self
            .directed
            .write()
            .expect("presence lock poisoned")
            .get_mut(from_bare)
        {
            set.remove(to);
        }
    }

    pub fn directed_targets(&self, from_bare: &Jid) -> Vec<Jid> {
        self.directed
            .read()
            .expect("presence lock poisoned")
            .get(from_bare)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_directed(&self, from_bare: &Jid) {
        self.directed
            .write()
            .expect("presence lock poisoned")
            .remove(from_bare);
    }

    /// Drops any presence record whose full JID is not in `live` (the
    /// session index's current registrations). A connection that dies
    /// without sending `unavailable` presence or reaching the router's
    /// own unregister path would otherwise leave a stale "available"
    /// record behind forever, which `best_resource` would keep handing
    /// out to a dead connection. Called from the periodic sweeper in
    /// place of a dedicated monitoring actor (`spec.md` §9).
    pub fn retain_live(&self, live: &HashSet<Jid>) {
        let mut records = self.records.write().expect("presence lock poisoned");
        records.retain(|full_jid, _| {
            let keep = live.contains(full_jid);
            if !keep {
                debug!(%full_jid, "sweeping orphaned presence record");
            }
            keep
        });
    }
}
