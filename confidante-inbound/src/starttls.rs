use anyhow::{bail, Error};
use tokio::io::ReadHalf;

use confidante_core::xml::{namespaces, Element};
use confidante_core::xml::stream_parser::StreamParser;
use confidante_core::xmpp::stream::{Connection, XmppStream};

pub(super) struct StarttlsNegotiator {
    _private: (),
}

impl StarttlsNegotiator {
    pub fn advertise_feature() -> Element {
        let mut starttls = Element::new("starttls", Some(namespaces::XMPP_STARTTLS));
        starttls.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS.to_string());

        starttls
    }

    pub async fn negotiate_feature<C, P>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
    ) -> Result<(), Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
    {
        if !element.validate("starttls", Some(namespaces::XMPP_STARTTLS)) {
            bail!("expected starttls element");
        }

        if stream.is_secure() {
            bail!("stream is already secured, rejecting repeated starttls");
        }

        let mut starttls_proceed = Element::new("proceed", Some(namespaces::XMPP_STARTTLS));
        starttls_proceed.set_attribute("xmlns", None, namespaces::XMPP_STARTTLS.to_string());

        stream.writer().write_xml_element(&starttls_proceed).await?;
        stream.upgrade_to_tls().await?;

        Ok(())
    }
}
