use confidante_core::xml::{namespaces, Element};
use confidante_core::xmpp::error::{stanza_error, StanzaErrorCondition};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::{iq_result, IqType, Stanza};

/// Replies to IQs addressed to the server itself (the bound domain, or a
/// user's own bare JID): `urn:xmpp:ping`, `jabber:iq:version`,
/// `disco#info`/`disco#items`, and a minimal `jabber:iq:roster`. Anything
/// else gets a `feature-not-implemented` bounce rather than silence,
/// per RFC 6120 §8.3.2.
pub struct IqHandler {
    domain: Jid,
}

const FEATURES: &[&str] = &[
    namespaces::DISCO_INFO,
    namespaces::DISCO_ITEMS,
    namespaces::PING,
    namespaces::IQ_VERSION,
    namespaces::XMPP_BIND,
    namespaces::XMPP_SESSION,
];

impl IqHandler {
    pub fn new(domain: Jid) -> Self {
        Self { domain }
    }

    /// Handles one IQ addressed to the server or to the sender's own bare
    /// JID. Returns `None` for `result`/`error` IQs, which need no reply.
    pub fn handle(&self, stanza: &Stanza, from: &Jid) -> Option<Stanza> {
        let Stanza::Iq(request) = stanza else {
            return None;
        };

        if !request.kind.is_request() {
            return None;
        }

        if request.id.is_none() {
            return Some(self.bounce(stanza, StanzaErrorCondition::BadRequest));
        }

        let element = request.element();
        let Some(query) = element.children().next() else {
            return Some(self.bounce(stanza, StanzaErrorCondition::BadRequest));
        };

        let reply = match query.namespace() {
            Some(namespaces::PING) => iq_result(request, None),
            Some(namespaces::IQ_VERSION) => iq_result(request, Some(self.version_payload())),
            Some(namespaces::DISCO_INFO) => iq_result(request, Some(self.disco_info_payload())),
            Some(namespaces::DISCO_ITEMS) => {
                iq_result(request, Some(Element::new("query", Some(namespaces::DISCO_ITEMS))))
            }
            Some(namespaces::IQ_ROSTER) if request.kind == IqType::Get => {
                iq_result(request, Some(self.empty_roster_payload()))
            }
            Some(namespaces::IQ_ROSTER) => {
                return Some(self.bounce(stanza, StanzaErrorCondition::FeatureNotImplemented))
            }
            Some(namespaces::XMPP_BIND) | Some(namespaces::XMPP_SESSION) => {
                return Some(self.bounce(stanza, StanzaErrorCondition::BadRequest))
            }
            _ => return Some(self.bounce(stanza, StanzaErrorCondition::FeatureNotImplemented)),
        };

        let _ = from;
        Some(Stanza::Iq(reply))
    }

    fn version_payload(&self) -> Element {
        let mut query = Element::new("query", Some(namespaces::IQ_VERSION));
        query.with_child("name", None, |e| e.add_text("confidante".to_string()));
        query.with_child("version", None, |e| e.add_text(env!("CARGO_PKG_VERSION").to_string()));
        query
    }

    fn disco_info_payload(&self) -> Element {
        let mut query = Element::new("query", Some(namespaces::DISCO_INFO));
        query.with_child("identity", None, |identity| {
            identity.set_attribute("category", None, "server".to_string());
            identity.set_attribute("type", None, "im".to_string());
            identity.set_attribute("name", None, self.domain.to_string());
        });
        for feature in FEATURES {
            query.with_child("feature", None, |e| {
                e.set_attribute("var", None, feature.to_string());
            });
        }
        query
    }

    fn empty_roster_payload(&self) -> Element {
        Element::new("query", Some(namespaces::IQ_ROSTER))
    }

    fn bounce(&self, stanza: &Stanza, condition: StanzaErrorCondition) -> Stanza {
        stanza.to_error_bounce(stanza_error(condition, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn ping_request() -> Stanza {
        let mut element = Element::new("iq", None);
        element.set_attribute("id", None, "1".to_string());
        element.set_attribute("type", None, "get".to_string());
        element.add_child(Element::new("ping", Some(namespaces::PING)));
        Stanza::from_element(element).unwrap()
    }

    #[test]
    fn answers_ping() {
        let handler = IqHandler::new(jid("localhost"));
        let reply = handler
            .handle(&ping_request(), &jid("alice@localhost/home"))
            .unwrap();
        let Stanza::Iq(iq) = reply else { panic!("expected iq reply") };
        assert_eq!(iq.kind, IqType::Result);
    }

    #[test]
    fn bounces_unknown_query() {
        let handler = IqHandler::new(jid("localhost"));
        let mut element = Element::new("iq", None);
        element.set_attribute("id", None, "1".to_string());
        element.set_attribute("type", None, "get".to_string());
        element.add_child(Element::new("query", Some("urn:unknown")));
        let stanza = Stanza::from_element(element).unwrap();

        let reply = handler.handle(&stanza, &jid("alice@localhost/home")).unwrap();
        let Stanza::Iq(iq) = reply else { panic!("expected iq reply") };
        assert_eq!(iq.kind, IqType::Error);
    }

    #[test]
    fn bounces_roster_set_as_feature_not_implemented() {
        let handler = IqHandler::new(jid("localhost"));
        let mut element = Element::new("iq", None);
        element.set_attribute("id", None, "1".to_string());
        element.set_attribute("type", None, "set".to_string());
        element.add_child(Element::new("query", Some(namespaces::IQ_ROSTER)));
        let stanza = Stanza::from_element(element).unwrap();

        let reply = handler.handle(&stanza, &jid("alice@localhost/home")).unwrap();
        let Stanza::Iq(iq) = reply else { panic!("expected iq reply") };
        assert_eq!(iq.kind, IqType::Error);
        assert!(iq.element().find_child("error", None).unwrap()
            .find_child("feature-not-implemented", Some(namespaces::XMPP_STANZAS))
            .is_some());
    }

    #[test]
    fn bounces_bind_and_session_iqs_as_bad_request() {
        let handler = IqHandler::new(jid("localhost"));
        for ns in [namespaces::XMPP_BIND, namespaces::XMPP_SESSION] {
            let mut element = Element::new("iq", None);
            element.set_attribute("id", None, "1".to_string());
            element.set_attribute("type", None, "set".to_string());
            element.add_child(Element::new(
                if ns == namespaces::XMPP_BIND { "bind" } else { "session" },
                Some(ns),
            ));
            let stanza = Stanza::from_element(element).unwrap();

            let reply = handler.handle(&stanza, &jid("alice@localhost/home")).unwrap();
            let Stanza::Iq(iq) = reply else { panic!("expected iq reply") };
            assert!(iq.element().find_child("error", None).unwrap()
                .find_child("bad-request", Some(namespaces::XMPP_STANZAS))
                .is_some());
        }
    }

    #[test]
    fn bounces_iq_with_missing_id_as_bad_request_without_killing_stream() {
        let handler = IqHandler::new(jid("localhost"));
        let mut element = Element::new("iq", None);
        element.set_attribute("type", None, "get".to_string());
        element.add_child(Element::new("ping", Some(namespaces::PING)));
        let stanza = Stanza::from_element(element).unwrap();

        let reply = handler.handle(&stanza, &jid("alice@localhost/home")).unwrap();
        let Stanza::Iq(iq) = reply else { panic!("expected iq reply") };
        assert!(iq.element().find_child("error", None).unwrap()
            .find_child("bad-request", Some(namespaces::XMPP_STANZAS))
            .is_some());
    }
}
