use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use anyhow::{Error, bail};
use base64::prelude::*;
use sha1::Sha1;
use sha2::Sha256;
use tokio::io::ReadHalf;
use tokio_stream::StreamExt;

use confidante_core::{
    xml::{
        Element, namespaces,
        stream_parser::{Frame, StreamParser},
    },
    xmpp::{
        jid::Jid,
        stream::{Connection, XmppStream},
    },
};

use crate::sasl::plain::PlainNegotiator;
use crate::sasl::scram::ScramNegotiator;

pub use self::plain::StoredPasswordArgon2;
pub use self::scram::StoredPasswordScram;

mod common;
mod plain;
mod scram;

pub trait StoredPassword: FromStr + Display {
    fn new(plaintext: &str) -> Result<Self, Error>;
}

pub trait StoredPasswordLookup: Clone + Debug {
    fn get_stored_password_argon2(
        &self,
        jid: Jid,
    ) -> impl std::future::Future<Output = Result<String, Error>> + Send;
    fn get_stored_password_scram_sha1(
        &self,
        jid: Jid,
    ) -> impl std::future::Future<Output = Result<String, Error>> + Send;
    fn get_stored_password_scram_sha256(
        &self,
        jid: Jid,
    ) -> impl std::future::Future<Output = Result<String, Error>> + Send;
}

pub(super) struct SaslNegotiator {
    _private: (),
}

impl SaslNegotiator {
    pub fn advertise_feature(secure: bool, authenticated: bool) -> Element {
        let mut mechanisms = Element::new("mechanisms", Some(namespaces::XMPP_SASL));
        mechanisms.set_attribute("xmlns", None, namespaces::XMPP_SASL.to_string());

        for mechanism in [Mechanism::ScramSha256, Mechanism::ScramSha1, Mechanism::Plain] {
            if Self::mechanism_available(mechanism, secure, authenticated) {
                mechanisms.add_child(mechanism.into());
            }
        }

        mechanisms
    }

    pub async fn negotiate_feature<C, P, S>(
        stream: &mut XmppStream<C, P>,
        element: &Element,
        domain: &str,
        store: S,
    ) -> Result<Jid, Error>
    where
        C: Connection,
        P: StreamParser<ReadHalf<C>>,
        S: StoredPasswordLookup + Send + Sync,
    {
        if !element.validate("auth", Some(namespaces::XMPP_SASL)) {
            bail!("expected auth element");
        }

        let Some(mechanism) = element.attribute("mechanism", None) else {
            bail!("auth element is missing mechanism attribute");
        };
        let mechanism = Mechanism::try_from(mechanism)?;

        let mut negotiator = mechanism.negotiator(domain.to_string(), store);
        let mut payload = BASE64_STANDARD
            .decode(element.text())
            .map_err(|err| Error::new(err).context("malformed base64 in SASL payload"))?;

        loop {
            let result = negotiator.process(payload).await;

            match result {
                MechanismNegotiatorResult::Challenge(challenge) => {
                    let mut xml = Element::new("challenge", Some(namespaces::XMPP_SASL));
                    xml.set_attribute("xmlns", None, namespaces::XMPP_SASL.to_string());
                    xml.add_text(BASE64_STANDARD.encode(challenge));
                    stream.writer().write_xml_element(&xml).await?;
                }
                MechanismNegotiatorResult::Success(additional_data) => {
                    let authentication_id = negotiator.authentication_id().await?;
                    let jid = Jid::new(Some(authentication_id), domain.to_string(), None);

                    let mut xml = Element::new("success", Some(namespaces::XMPP_SASL));
                    xml.set_attribute("xmlns", None, namespaces::XMPP_SASL.to_string());
                    if let Some(additional_data) = additional_data {
                        xml.add_text(BASE64_STANDARD.encode(additional_data));
                    }
                    stream.writer().write_xml_element(&xml).await?;

                    return Ok(jid);
                }
                MechanismNegotiatorResult::Failure(err) => {
                    tracing::debug!(?err, "SASL negotiation step failed");

                    let mut xml = Element::new("failure", Some(namespaces::XMPP_SASL));
                    xml.set_attribute("xmlns", None, namespaces::XMPP_SASL.to_string());
                    xml.add_child(Element::new("not-authorized", Some(namespaces::XMPP_SASL)));
                    stream.writer().write_xml_element(&xml).await?;

                    bail!("authentication failed");
                }
            }

            let Some(Ok(Frame::XmlFragment(response))) = stream.reader().next().await else {
                bail!("expected xml fragment");
            };

            if response.validate("response", Some(namespaces::XMPP_SASL)) {
                payload = BASE64_STANDARD
                    .decode(response.text())
                    .map_err(|err| Error::new(err).context("malformed base64 in SASL response"))?;
            } else if response.validate("abort", Some(namespaces::XMPP_SASL)) {
                bail!("authentication aborted");
            } else {
                bail!("unexpected element during SASL negotiation");
            }
        }
    }

    fn mechanism_available(mechanism: Mechanism, secure: bool, _authenticated: bool) -> bool {
        match mechanism {
            Mechanism::Plain => secure,
            Mechanism::ScramSha1 => true,
            Mechanism::ScramSha256 => true,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(super) enum SaslError {
    #[error("the SASL mechanism `{0}` is not supported")]
    UnsupportedMechanism(String),
}

#[derive(Debug, Clone, Copy)]
enum Mechanism {
    Plain,
    ScramSha1,
    ScramSha256,
}

impl Mechanism {
    fn negotiator<S>(&self, domain: String, store: S) -> MechanismNegotiator<S>
    where
        S: StoredPasswordLookup + Send + Sync,
    {
        match self {
            Mechanism::Plain => MechanismNegotiator::Plain(PlainNegotiator::new(domain, store)),
            Mechanism::ScramSha1 => {
                MechanismNegotiator::ScramSha1(ScramNegotiator::<S, Sha1>::new(domain, false, store))
            }
            Mechanism::ScramSha256 => MechanismNegotiator::ScramSha256(ScramNegotiator::<
                S,
                Sha256,
            >::new(domain, false, store)),
        }
    }
}

impl TryFrom<&str> for Mechanism {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PLAIN" => Ok(Mechanism::Plain),
            "SCRAM-SHA-1" => Ok(Mechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(Mechanism::ScramSha256),
            _ => bail!(SaslError::UnsupportedMechanism(value.into())),
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Plain => write!(f, "PLAIN"),
            Mechanism::ScramSha1 => write!(f, "SCRAM-SHA-1"),
            Mechanism::ScramSha256 => write!(f, "SCRAM-SHA-256"),
        }
    }
}

impl From<Mechanism> for Element {
    fn from(mechanism: Mechanism) -> Self {
        let mut element = Element::new("mechanism", Some(namespaces::XMPP_SASL));
        element.add_text(mechanism.to_string());
        element
    }
}

/// Result of a single SASL negotiation step, shared by every mechanism.
/// `Success` only carries additional server data for the final
/// `<success/>` element — the authenticated identity is fetched
/// separately through `authentication_id`, since PLAIN knows it
/// immediately while SCRAM only learns it once the `rsasl` state machine
/// has finished.
pub(crate) enum MechanismNegotiatorResult {
    Challenge(Vec<u8>),
    Success(Option<Vec<u8>>),
    Failure(Error),
}

enum MechanismNegotiator<S> {
    Plain(PlainNegotiator<S>),
    ScramSha1(ScramNegotiator<S, Sha1>),
    ScramSha256(ScramNegotiator<S, Sha256>),
}

impl<S> MechanismNegotiator<S>
where
    S: StoredPasswordLookup + Send + Sync,
{
    async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        match self {
            MechanismNegotiator::Plain(negotiator) => negotiator.process(payload).await,
            MechanismNegotiator::ScramSha1(negotiator) => negotiator.process(payload).await,
            MechanismNegotiator::ScramSha256(negotiator) => negotiator.process(payload).await,
        }
    }

    async fn authentication_id(self) -> Result<String, Error> {
        match self {
            MechanismNegotiator::Plain(negotiator) => negotiator.authentication_id().await,
            MechanismNegotiator::ScramSha1(negotiator) => negotiator.authentication_id().await,
            MechanismNegotiator::ScramSha256(negotiator) => negotiator.authentication_id().await,
        }
    }
}
