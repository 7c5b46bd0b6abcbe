use anyhow::{bail, Error};
use tokio::io::ReadHalf;

use confidante_core::xml::{namespaces, Element};
use confidante_core::xml::stream_parser::StreamParser;
use confidante_core::xmpp::error::{stanza_error, StanzaErrorCondition};
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stream::{Connection, XmppStream};
use confidante_services::resources::ResourceManager;

pub struct ResourceBindingNegotiator {
    _private: (),
}

impl ResourceBindingNegotiator {
    pub fn advertise_feature() -> Element {
        let mut bind = Element::new("bind", Some(namespaces::XMPP_BIND));
        bind.set_attribute("xmlns", None, namespaces::XMPP_BIND.to_string());

        bind
    }

    /// Binds a resource for `entity`, the already-authenticated bare JID.
    /// A second bind attempt on the same stream (`entity` already carries a
    /// resource) is rejected with `not-allowed` rather than silently
    /// rebinding: RFC 6120 §7 gives a stream exactly one bound resource.
    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        entity: &Option<Jid>,
        resources: &ResourceManager,
    ) -> Result<Jid, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !element.validate("iq", Some(namespaces::XMPP_CLIENT)) {
            bail!("expected IQ stanza");
        }

        if element.attribute("type", None) != Some("set") {
            bail!("IQ stanza is not of type set");
        };

        let Some(request_id) = element.attribute("id", None) else {
            bail!("IQ stanza does not have an id");
        };

        let Some(bind_request) = element.find_child("bind", Some(namespaces::XMPP_BIND)) else {
            bail!("IQ stanza does not contain a bind request");
        };

        let Some(entity) = entity else {
            bail!("entity to bind is unknown");
        };

        if entity.resource().is_some() {
            let mut reply = Element::new("iq", None);
            reply.set_attribute("id", None, request_id.to_string());
            reply.set_attribute("type", None, "error".to_string());
            reply.add_child(stanza_error(StanzaErrorCondition::NotAllowed, None));
            stream.writer().write_xml_element(&reply).await?;
            return Ok(entity.clone());
        }

        let requested = bind_request
            .find_child("resource", Some(namespaces::XMPP_BIND))
            .map(|requested_resource| requested_resource.text());

        let resource = resources.resolve(entity, requested);
        let bound_entity = entity.clone().bind(resource);

        let mut bind_response = Element::new("iq", None);
        bind_response.set_attribute("id", None, request_id.to_string());
        bind_response.set_attribute("type", None, "result".to_string());
        bind_response.with_child("bind", Some(namespaces::XMPP_BIND), |bind| {
            bind.set_attribute("xmlns", None, namespaces::XMPP_BIND.to_string());
            bind.with_child("jid", None, |jid| {
                jid.add_text(format!("{}", bound_entity));
            });
        });

        stream.writer().write_xml_element(&bind_response).await?;

        Ok(bound_entity)
    }
}
