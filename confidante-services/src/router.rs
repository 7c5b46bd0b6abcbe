use std::sync::Arc;

use anyhow::Error;

use confidante_core::xml::Element;
use confidante_core::xmpp::error::{stanza_error, StanzaErrorCondition};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::{MessageType, Presence, PresenceType, Stanza};
use tracing::debug;

use crate::iq::IqHandler;
use crate::presence::PresenceManager;
use crate::session_index::SessionIndex;

/// The stanza router, `spec.md` §4.8: addressing rules, bare/full JID
/// lookup, priority-based resource selection, and bounce synthesis. Runs
/// on the calling connection task against the shared `SessionIndex`/
/// `PresenceManager` rather than funneling every stanza through a single
/// mailbox actor — the same "data behind locks, not an actor that only
/// holds maps" reasoning as `session_index::SessionIndex`. `Clone` is
/// cheap: every field is an `Arc` or a small value type.
#[derive(Clone)]
pub struct Router {
    domain: Jid,
    session_index: Arc<SessionIndex>,
    presence: Arc<PresenceManager>,
    iq_handler: Arc<IqHandler>,
}

impl Router {
    pub fn new(domain: Jid, session_index: Arc<SessionIndex>, presence: Arc<PresenceManager>) -> Self {
        let iq_handler = Arc::new(IqHandler::new(domain.clone()));
        Self {
            domain,
            session_index,
            presence,
            iq_handler,
        }
    }

    pub fn domain(&self) -> &Jid {
        &self.domain
    }

    pub fn session_index(&self) -> &Arc<SessionIndex> {
        &self.session_index
    }

    pub fn presence(&self) -> &Arc<PresenceManager> {
        &self.presence
    }

    /// Tears down a closing session: broadcasts `unavailable` to every
    /// authorized subscriber and directed-presence target the session
    /// accrued (RFC 6121 §4.5.2/§4.6.2) *before* dropping it from the
    /// session index and presence table, then forgets its directed-presence
    /// targets once no resource of the bare JID is left online.
    pub async fn unregister(&self, full_jid: &Jid) {
        let bare = full_jid.to_bare();

        if self.presence.is_available(full_jid) {
            let unavailable = unavailable_presence(full_jid);
            for subscriber in self.presence.subscribers_of(&bare) {
                self.deliver_to(&subscriber, &unavailable).await;
            }
            for target in self.presence.directed_targets(&bare) {
                self.deliver_to(&target, &unavailable).await;
            }
        }

        self.session_index.unregister(full_jid);
        self.presence.remove(full_jid);

        if self.session_index.resources_of(&bare).is_empty() {
            self.presence.clear_directed(&bare);
        }
    }

    /// Routes one addressed stanza. `from` is the authenticated full JID
    /// of the sender, stamped onto the outgoing copy regardless of
    /// whatever the client put in its own `from` attribute (RFC 6120
    /// §8.1.2.1).
    pub async fn route(&self, from: Jid, stanza: Stanza) -> Result<Option<Stanza>, Error> {
        let Some(to) = stanza.to().cloned() else {
            return self.route_no_destination(from, stanza).await;
        };

        if to.is_bare() && (to == self.domain || to == from.to_bare()) {
            if let Stanza::Iq(_) = &stanza {
                return Ok(self.iq_handler.handle(&stanza, &from));
            }
        }

        // Directed presence (RFC 6121 §4.6): an explicitly addressed
        // available/unavailable presence is remembered against the
        // sender's bare JID so future own-presence changes and the
        // close-time `unavailable` broadcast also reach it.
        if let Stanza::Presence(presence) = &stanza {
            match presence.kind {
                PresenceType::Available => self.presence.record_directed(from.to_bare(), to.clone()),
                PresenceType::Unavailable => {
                    self.presence.remove_directed_target(&from.to_bare(), &to)
                }
                _ => {}
            }
        }

        let stamped = stanza.with_addressing(Some(&from), Some(&to));

        if to.is_bare() {
            self.route_to_bare(from, to, stamped).await
        } else {
            self.route_to_full(from, to, stamped).await
        }
    }

    /// A stanza with no `to` is addressed to the server itself (RFC 6120
    /// §10): IQs are handled locally, and presence with no destination is
    /// the client announcing its own availability to its roster rather
    /// than directing a stanza anywhere, per RFC 6121 §4.2/§4.4.
    async fn route_no_destination(&self, from: Jid, stanza: Stanza) -> Result<Option<Stanza>, Error> {
        match &stanza {
            Stanza::Iq(_) => Ok(self.iq_handler.handle(&stanza, &from)),
            Stanza::Presence(presence) => {
                let presence = presence.clone();
                self.broadcast_own_presence(from, presence).await;
                Ok(None)
            }
            Stanza::Message(_) => Ok(Some(
                stanza.to_error_bounce(stanza_error(StanzaErrorCondition::BadRequest, None)),
            )),
        }
    }

    /// Records the sender's own presence (so `best_resource` has something
    /// to pick from) and fans it out to everyone subscribed to them, plus
    /// every directed-presence target recorded for this bare JID (RFC 6121
    /// §4.6.2: directed presence is included in subsequent own-presence
    /// broadcasts, not just the one update that established it).
    async fn broadcast_own_presence(&self, from: Jid, presence: Presence) {
        match presence.kind {
            PresenceType::Available => self.presence.update(from.clone(), &presence),
            PresenceType::Unavailable => self.presence.remove(&from),
            _ => return,
        }

        let stamped = Stanza::Presence(presence).with_addressing(Some(&from), None);
        let bare = from.to_bare();

        for subscriber in self.presence.subscribers_of(&bare) {
            self.deliver_to(&subscriber, &stamped).await;
        }
        for target in self.presence.directed_targets(&bare) {
            self.deliver_to(&target, &stamped).await;
        }
    }

    /// Delivers `stanza` to `target`: every online resource if `target` is
    /// bare, or the single connection if it is a full JID. Directed-presence
    /// targets and subscribers can be either.
    async fn deliver_to(&self, target: &Jid, stanza: &Stanza) {
        if target.is_bare() {
            let resources = self.session_index.resources_of(target);
            self.broadcast(target, &resources, stanza.clone()).await;
        } else if let Some(sender) = self.session_index.sender_for(target) {
            let _ = sender.send(stanza.clone()).await;
        }
    }

    async fn route_to_full(
        &self,
        from: Jid,
        to: Jid,
        stanza: Stanza,
    ) -> Result<Option<Stanza>, Error> {
        match self.session_index.sender_for(&to) {
            Some(sender) => {
                let _ = sender.send(stanza).await;
                Ok(None)
            }
            None => Ok(self.bounce_unavailable(from, stanza)),
        }
    }

    async fn route_to_bare(
        &self,
        from: Jid,
        to: Jid,
        stanza: Stanza,
    ) -> Result<Option<Stanza>, Error> {
        match &stanza {
            Stanza::Message(message) => {
                // `groupchat` only makes sense addressed to an occupant's
                // full (room) JID; a bare-JID `groupchat` has nowhere to
                // land, per RFC 6121 §5.2.3.
                if message.kind == MessageType::Groupchat {
                    return Ok(self.bounce_unavailable(from, stanza));
                }

                let resources = self.session_index.resources_of(&to);

                if message.kind == MessageType::Headline {
                    self.broadcast(&to, &resources, stanza).await;
                    return Ok(None);
                }

                if resources.is_empty() {
                    return Ok(self.bounce_unavailable(from, stanza));
                }

                match self.presence.best_resource(&to, &resources) {
                    Some(resource) => {
                        let full = to.bind(resource);
                        if let Some(sender) = self.session_index.sender_for(&full) {
                            let _ = sender.send(stanza).await;
                        }
                    }
                    None => self.broadcast(&to, &resources, stanza).await,
                }

                Ok(None)
            }
            Stanza::Presence(presence) => {
                if presence.kind == PresenceType::Probe {
                    self.answer_probe(&from, &to).await;
                    return Ok(None);
                }

                if presence.kind.is_subscription() {
                    self.handle_subscription(from, to.clone(), presence.kind);
                }

                let resources = self.session_index.resources_of(&to);
                self.broadcast(&to, &resources, stanza.clone()).await;
                Ok(None)
            }
            Stanza::Iq(_) => {
                let resources = self.session_index.resources_of(&to);
                match self.presence.best_resource(&to, &resources) {
                    Some(resource) => {
                        let full = to.bind(resource);
                        if let Some(sender) = self.session_index.sender_for(&full) {
                            let _ = sender.send(stanza).await;
                        }
                        Ok(None)
                    }
                    None => Ok(self.bounce_unavailable(from, stanza)),
                }
            }
        }
    }

    /// Answers a `probe` itself rather than forwarding it, per RFC 6121
    /// §4.3.2: only an authorized subscriber gets an answer, and it is
    /// either the target's current presence from each available resource
    /// or a single synthetic `unavailable` if nobody is online.
    async fn answer_probe(&self, prober: &Jid, target: &Jid) {
        if !self
            .presence
            .subscribers_of(target)
            .contains(&prober.to_bare())
        {
            return;
        }

        let Some(sender) = self.session_index.sender_for(prober) else {
            return;
        };

        let resources = self.session_index.resources_of(target);
        let available: Vec<Jid> = resources
            .into_iter()
            .map(|resource| target.bind(resource))
            .filter(|full| self.presence.is_available(full))
            .collect();

        if available.is_empty() {
            let _ = sender.send(unavailable_presence(target)).await;
            return;
        }

        for full in available {
            let _ = sender.send(available_presence(&full)).await;
        }
    }

    fn handle_subscription(&self, from: Jid, to: Jid, kind: PresenceType) {
        let from_bare = from.to_bare();
        match kind {
            PresenceType::Subscribe | PresenceType::Subscribed => {
                self.presence.add_subscriber(to, from_bare);
            }
            PresenceType::Unsubscribe | PresenceType::Unsubscribed => {
                self.presence.remove_subscriber(&to, &from_bare);
            }
            _ => {}
        }
    }

    async fn broadcast(&self, bare: &Jid, resources: &[String], stanza: Stanza) {
        for resource in resources {
            if let Some(sender) = self.session_index.sender_for(&bare.bind(resource.clone())) {
                let _ = sender.send(stanza.clone()).await;
            }
        }
    }

    /// Not every unreachable destination is the same failure: a message
    /// with nobody home is `service-unavailable`, per RFC 6121 §5.2.1. A
    /// `type='error'` stanza that itself fails to deliver is dropped
    /// silently instead, per RFC 6120 §8: bouncing an error with another
    /// error risks a delivery loop between two servers.
    fn bounce_unavailable(&self, from: Jid, stanza: Stanza) -> Option<Stanza> {
        if let Stanza::Message(message) = &stanza {
            if message.kind == MessageType::Error {
                return None;
            }
        }

        let condition = match &stanza {
            Stanza::Message(_) | Stanza::Iq(_) => StanzaErrorCondition::ServiceUnavailable,
            Stanza::Presence(_) => return None,
        };
        debug!(%from, to = ?stanza.to(), "bouncing stanza to unreachable destination");
        Some(stanza.to_error_bounce(stanza_error(condition, None)))
    }
}

/// A synthetic `unavailable` presence stamped with `from`, used for the
/// close-time broadcast and for answering a probe when nobody is online.
fn unavailable_presence(from: &Jid) -> Stanza {
    let mut element = Element::new("presence", None);
    element.set_attribute("from", None, from.to_string());
    element.set_attribute("type", None, "unavailable".to_string());
    Stanza::from_element(element).expect("well-formed synthetic presence")
}

/// A synthetic `available` presence stamped with `from`, used to answer a
/// probe with the target's current presence.
fn available_presence(from: &Jid) -> Stanza {
    let mut element = Element::new("presence", None);
    element.set_attribute("from", None, from.to_string());
    Stanza::from_element(element).expect("well-formed synthetic presence")
}

#[cfg(test)]
mod tests {
    use super::*;
    use confidante_core::xml::Element;
    use tokio::sync::mpsc;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn message(to: &str) -> Stanza {
        let mut element = Element::new("message", None);
        element.set_attribute("to", None, to.to_string());
        element.set_attribute("id", None, "1".to_string());
        Stanza::from_element(element).unwrap()
    }

    fn router() -> Router {
        Router::new(
            jid("localhost"),
            Arc::new(SessionIndex::new()),
            Arc::new(PresenceManager::new()),
        )
    }

    #[tokio::test]
    async fn bounces_message_to_offline_bare_jid() {
        let router = router();
        let from = jid("bob@localhost/phone");
        let result = router
            .route(from, message("alice@localhost"))
            .await
            .unwrap();
        assert!(matches!(result, Some(Stanza::Message(_))));
    }

    #[tokio::test]
    async fn delivers_message_to_online_full_jid() {
        let router = router();
        let (tx, mut rx) = mpsc::channel(1);
        router.session_index().register(jid("alice@localhost/home"), tx);

        let from = jid("bob@localhost/phone");
        let result = router
            .route(from, message("alice@localhost/home"))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn undirected_presence_updates_own_record_and_reaches_subscribers() {
        let router = router();
        let (tx, mut rx) = mpsc::channel(1);
        router
            .session_index()
            .register(jid("bob@localhost/phone"), tx);
        router
            .presence()
            .add_subscriber(jid("alice@localhost"), jid("bob@localhost"));

        let mut element = Element::new("presence", None);
        element.with_child("priority", None, |p| p.add_text("1".to_string()));
        let presence = Stanza::from_element(element).unwrap();

        let from = jid("alice@localhost/home");
        let result = router.route(from.clone(), presence).await.unwrap();

        assert!(result.is_none());
        assert!(rx.try_recv().is_ok());

        let best = router
            .presence()
            .best_resource(&jid("alice@localhost"), &["home".to_string()]);
        assert_eq!(best.as_deref(), Some("home"));
    }

    #[tokio::test]
    async fn groupchat_message_to_bare_jid_is_bounced_unavailable() {
        let router = router();
        let mut element = Element::new("message", None);
        element.set_attribute("to", None, "alice@localhost".to_string());
        element.set_attribute("id", None, "1".to_string());
        element.set_attribute("type", None, "groupchat".to_string());
        let stanza = Stanza::from_element(element).unwrap();

        let result = router
            .route(jid("bob@localhost/phone"), stanza)
            .await
            .unwrap();
        assert!(matches!(result, Some(Stanza::Message(_))));
    }

    #[tokio::test]
    async fn error_message_that_fails_to_deliver_is_dropped_silently() {
        let router = router();
        let mut element = Element::new("message", None);
        element.set_attribute("to", None, "alice@localhost/home".to_string());
        element.set_attribute("id", None, "1".to_string());
        element.set_attribute("type", None, "error".to_string());
        let stanza = Stanza::from_element(element).unwrap();

        let result = router
            .route(jid("bob@localhost/phone"), stanza)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn probe_from_authorized_subscriber_gets_current_presence() {
        let router = router();
        let (alice_tx, mut alice_rx) = mpsc::channel(4);
        let (bob_tx, mut bob_rx) = mpsc::channel(4);
        router
            .session_index()
            .register(jid("alice@localhost/home"), alice_tx);
        router
            .session_index()
            .register(jid("bob@localhost/phone"), bob_tx);
        router
            .presence()
            .add_subscriber(jid("alice@localhost"), jid("bob@localhost"));

        let available = Stanza::from_element(Element::new("presence", None)).unwrap();
        router
            .route(jid("alice@localhost/home"), available)
            .await
            .unwrap();
        alice_rx.try_recv().ok();

        let mut probe = Element::new("presence", None);
        probe.set_attribute("to", None, "alice@localhost".to_string());
        probe.set_attribute("type", None, "probe".to_string());
        let probe = Stanza::from_element(probe).unwrap();

        let result = router
            .route(jid("bob@localhost/phone"), probe)
            .await
            .unwrap();
        assert!(result.is_none());
        let received = bob_rx.try_recv().unwrap();
        assert!(matches!(received, Stanza::Presence(p) if p.kind == PresenceType::Available));
    }

    #[tokio::test]
    async fn probe_from_unauthorized_sender_gets_no_reply() {
        let router = router();
        let (_alice_tx, _alice_rx) = mpsc::channel::<Stanza>(1);
        let (bob_tx, mut bob_rx) = mpsc::channel(1);
        router
            .session_index()
            .register(jid("bob@localhost/phone"), bob_tx);

        let mut probe = Element::new("presence", None);
        probe.set_attribute("to", None, "alice@localhost".to_string());
        probe.set_attribute("type", None, "probe".to_string());
        let probe = Stanza::from_element(probe).unwrap();

        router
            .route(jid("bob@localhost/phone"), probe)
            .await
            .unwrap();
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn directed_presence_target_receives_close_time_unavailable() {
        let router = router();
        let (carol_tx, mut carol_rx) = mpsc::channel(4);
        router
            .session_index()
            .register(jid("carol@localhost/home"), carol_tx);

        let available = Stanza::from_element(Element::new("presence", None)).unwrap();
        router
            .route(jid("alice@localhost/home"), available)
            .await
            .unwrap();

        let mut directed = Element::new("presence", None);
        directed.set_attribute("to", None, "carol@localhost".to_string());
        let directed = Stanza::from_element(directed).unwrap();
        router
            .route(jid("alice@localhost/home"), directed)
            .await
            .unwrap();
        carol_rx.try_recv().ok();

        router.unregister(&jid("alice@localhost/home")).await;

        let received = carol_rx.try_recv().unwrap();
        assert!(matches!(
            received,
            Stanza::Presence(p) if p.kind == PresenceType::Unavailable
        ));
    }
}
