use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tokio::sync::mpsc::Sender;

use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;

/// The full-JID → connection-handle and bare-JID → resource-set indices,
/// `spec.md` §3 and §5. Kept as plain concurrent maps rather than a
/// mailbox actor: neither map does anything on its own besides being read
/// and written, so a dedicated task would only add a hop with no benefit
/// (`spec.md` §9's own critique of "actors that only held maps").
#[derive(Default)]
pub struct SessionIndex {
    connections: RwLock<HashMap<Jid, Sender<Stanza>>>,
    resources: RwLock<HashMap<Jid, HashSet<String>>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `full_jid` (which must carry a resource) as deliverable
    /// through `sender`, and adds its resource to the bare JID's resource
    /// set. Both maps are updated before either lock is released elsewhere,
    /// so "resource is in the resource set" and "full JID has a sender"
    /// are always consistent with each other.
    pub fn register(&self, full_jid: Jid, sender: Sender<Stanza>) {
        let resource = full_jid
            .resource()
            .expect("register requires a full JID")
            .to_string();
        let bare = full_jid.to_bare();

        self.connections
            .write()
            .expect("session index lock poisoned")
            .insert(full_jid, sender);
        self.resources
            .write()
            .expect("session index lock poisoned")
            .entry(bare)
            .or_default()
            .insert(resource);
    }

    pub fn unregister(&self, full_jid: &Jid) {
        self.connections
            .write()
            .expect("session index lock poisoned")
            .remove(full_jid);

        let bare = full_jid.to_bare();
        let mut resources = self.resources.write().expect("session index lock poisoned");
        if let Some(set) = resources.get_mut(&bare) {
            if let Some(resource) = full_jid.resource() {
                set.remove(resource);
            }
            if set.is_empty() {
                resources.remove(&bare);
            }
        }
    }

    pub fn sender_for(&self, full_jid: &Jid) -> Option<Sender<Stanza>> {
        self.connections
            .read()
            .expect("session index lock poisoned")
            .get(full_jid)
            .cloned()
    }

    pub fn resources_of(&self, bare_jid: &Jid) -> Vec<String> {
        self.resources
            .read()
            .expect("session index lock poisoned")
            .get(bare_jid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, bare_jid: &Jid) -> bool {
        self.resources
            .read()
            .expect("session index lock poisoned")
            .get(bare_jid)
            .is_some_and(|set| !set.is_empty())
    }

    pub fn resource_is_taken(&self, bare_jid: &Jid, resource: &str) -> bool {
        self.resources
            .read()
            .expect("session index lock poisoned")
            .get(bare_jid)
            .is_some_and(|set| set.contains(resource))
    }

    /// Every full JID with a registered sender right now. Used by the
    /// periodic sweeper to find presence records whose owning connection
    /// is gone without having unregistered cleanly (a panicked connection
    /// task, for instance).
    pub fn registered_full_jids(&self) -> Vec<Jid> {
        self.connections
            .read()
            .expect("session index lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}
