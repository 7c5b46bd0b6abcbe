use anyhow::{bail, Error};

use crate::xml::{namespaces, Element};

use super::jid::Jid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Error,
    Groupchat,
    Headline,
    Normal,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Error => "error",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Normal => "normal",
        }
    }

    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("chat") => MessageType::Chat,
            Some("error") => MessageType::Error,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            _ => MessageType::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    fn as_str(self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
        }
    }

    fn parse(s: Option<&str>) -> Result<Self, Error> {
        Ok(match s {
            None => PresenceType::Available,
            Some("unavailable") => PresenceType::Unavailable,
            Some("subscribe") => PresenceType::Subscribe,
            Some("subscribed") => PresenceType::Subscribed,
            Some("unsubscribe") => PresenceType::Unsubscribe,
            Some("unsubscribed") => PresenceType::Unsubscribed,
            Some("probe") => PresenceType::Probe,
            Some("error") => PresenceType::Error,
            Some(other) => bail!("unknown presence type: \"{other}\""),
        })
    }

    /// True for subscription-management types, which route to the
    /// presence/roster subsystem rather than a specific resource.
    pub fn is_subscription(self) -> bool {
        matches!(
            self,
            PresenceType::Subscribe
                | PresenceType::Subscribed
                | PresenceType::Unsubscribe
                | PresenceType::Unsubscribed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    fn parse(s: Option<&str>) -> Result<Self, Error> {
        Ok(match s {
            Some("get") => IqType::Get,
            Some("set") => IqType::Set,
            Some("result") => IqType::Result,
            Some("error") => IqType::Error,
            other => bail!("invalid or missing iq type: {other:?}"),
        })
    }

    pub fn is_request(self) -> bool {
        matches!(self, IqType::Get | IqType::Set)
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    element: Element,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    pub kind: MessageType,
}

#[derive(Debug, Clone)]
pub struct Presence {
    element: Element,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    pub kind: PresenceType,
}

#[derive(Debug, Clone)]
pub struct Iq {
    element: Element,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    /// `None` when the peer sent an `<iq/>` with no `id` attribute — RFC
    /// 6120 §8.2.3 requires one, but a missing `id` bounces `bad-request`
    /// rather than killing the stream, so parsing still has to succeed.
    pub id: Option<String>,
    pub kind: IqType,
}

/// A client-to-server stanza: `<message/>`, `<presence/>`, or `<iq/>`.
///
/// Wraps the underlying `Element` rather than re-parsing it — addressing
/// and type are cheap to extract up front, the payload stays as `Element`
/// for the IQ handler and router to inspect.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

fn parse_jid_attribute(element: &Element, name: &str) -> Result<Option<Jid>, Error> {
    element
        .attribute(name, None)
        .map(|s| s.parse::<Jid>())
        .transpose()
}

impl Stanza {
    pub fn from_element(element: Element) -> Result<Self, Error> {
        match element.name() {
            "message" => {
                let from = parse_jid_attribute(&element, "from")?;
                let to = parse_jid_attribute(&element, "to")?;
                let id = element.attribute("id", None).map(str::to_string);
                let kind = MessageType::parse(element.attribute("type", None));
                Ok(Stanza::Message(Message {
                    element,
                    from,
                    to,
                    id,
                    kind,
                }))
            }
            "presence" => {
                let from = parse_jid_attribute(&element, "from")?;
                let to = parse_jid_attribute(&element, "to")?;
                let id = element.attribute("id", None).map(str::to_string);
                let kind = PresenceType::parse(element.attribute("type", None))?;
                Ok(Stanza::Presence(Presence {
                    element,
                    from,
                    to,
                    id,
                    kind,
                }))
            }
            "iq" => {
                let from = parse_jid_attribute(&element, "from")?;
                let to = parse_jid_attribute(&element, "to")?;
                let id = element.attribute("id", None).map(str::to_string);
                let kind = IqType::parse(element.attribute("type", None))?;
                Ok(Stanza::Iq(Iq {
                    element,
                    from,
                    to,
                    id,
                    kind,
                }))
            }
            other => bail!("not a stanza: <{other}>"),
        }
    }

    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Presence(p) => p.id.as_deref(),
            Stanza::Iq(iq) => iq.id.as_deref(),
        }
    }

    pub fn element(&self) -> &Element {
        match self {
            Stanza::Message(m) => &m.element,
            Stanza::Presence(p) => &p.element,
            Stanza::Iq(iq) => &iq.element,
        }
    }

    pub fn into_element(self) -> Element {
        match self {
            Stanza::Message(m) => m.element,
            Stanza::Presence(p) => p.element,
            Stanza::Iq(iq) => iq.element,
        }
    }

    /// Returns a copy of this stanza stamped with `from` and, if present,
    /// addressed `to` the given JID — used when delivering inbound
    /// stanzas or bouncing errors back to the sender.
    pub fn with_addressing(&self, from: Option<&Jid>, to: Option<&Jid>) -> Stanza {
        let mut element = self.element().clone();
        match from {
            Some(from) => element.set_attribute("from", None, from.to_string()),
            None => element.remove_attribute("from", None),
        }
        match to {
            Some(to) => element.set_attribute("to", None, to.to_string()),
            None => element.remove_attribute("to", None),
        }
        // Reparsing is infallible here: we only ever changed `from`/`to`
        // attributes on an element that already parsed successfully once.
        Stanza::from_element(element).expect("re-stamped stanza must still parse")
    }

    /// Builds an `<iq type='error'>` (or `message`/`presence` `type='error'`)
    /// bounce addressed back to the original sender, per RFC 6120 §8.3.1.
    pub fn to_error_bounce(&self, error: Element) -> Stanza {
        let mut element = Element::new(self.element().name(), self.element().namespace());
        if let Some(id) = self.id() {
            element.set_attribute("id", None, id.to_string());
        }
        if let Some(from) = self.to() {
            element.set_attribute("from", None, from.to_string());
        }
        if let Some(to) = self.from() {
            element.set_attribute("to", None, to.to_string());
        }
        element.set_attribute("type", None, "error".to_string());
        element.add_child(error);

        // Bounces are always well-formed stanzas of the same kind as the
        // original, so re-parsing cannot fail.
        Stanza::from_element(element).expect("bounce stanza must parse")
    }
}

/// Builds a minimal `<iq type='result'/>` reply, copying `id`/addressing
/// from the request.
pub fn iq_result(request: &Iq, payload: Option<Element>) -> Iq {
    let mut element = Element::new("iq", Some(namespaces::XMPP_CLIENT));
    if let Some(id) = &request.id {
        element.set_attribute("id", None, id.clone());
    }
    element.set_attribute("type", None, IqType::Result.as_str().to_string());
    if let Some(from) = &request.to {
        element.set_attribute("from", None, from.to_string());
    }
    if let Some(to) = &request.from {
        element.set_attribute("to", None, to.to_string());
    }
    if let Some(payload) = payload {
        element.add_child(payload);
    }
    Iq {
        element,
        from: request.to.clone(),
        to: request.from.clone(),
        id: request.id.clone(),
        kind: IqType::Result,
    }
}

impl Message {
    pub fn element(&self) -> &Element {
        &self.element
    }
}

impl Presence {
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Priority from the `<priority/>` child element, defaulting to 0 per
    /// RFC 6121 §4.7.2.3.
    pub fn priority(&self) -> i8 {
        self.element
            .find_child("priority", None)
            .map(|p| p.text())
            .and_then(|text| text.trim().parse::<i8>().ok())
            .unwrap_or(0)
    }
}

impl Iq {
    pub fn element(&self) -> &Element {
        &self.element
    }
}
