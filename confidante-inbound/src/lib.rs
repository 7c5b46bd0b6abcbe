use std::collections::HashSet;
use std::time::Duration;

use anyhow::{anyhow, bail, Error};
use sasl::StoredPasswordLookup;
use tokio::io::ReadHalf;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use confidante_core::xml::stream_parser::StreamParser;
use confidante_core::xml::stream_parser::ParseError;
use confidante_core::xml::{namespaces, stream_parser::Frame, Element};
use confidante_core::xmpp::error::StreamErrorCondition;
use confidante_core::xmpp::jid::Jid;
use confidante_core::xmpp::stanza::Stanza;
use confidante_core::xmpp::stream::Connection;
use confidante_core::xmpp::stream::StreamId;
use confidante_core::xmpp::stream::XmppStream;
use confidante_core::xmpp::stream_header::LanguageTag;
use confidante_core::xmpp::stream_header::StreamHeader;
use confidante_services::resources::ResourceManager;
use confidante_services::router::Router;

use self::sasl::SaslNegotiator;
use bind::ResourceBindingNegotiator;
use starttls::StarttlsNegotiator;

mod bind;
pub mod connection;
pub mod sasl;
mod starttls;

/// Bails out of the connection after this many failed SASL attempts on a
/// single stream, per `spec.md` §4.5's brute-force guard.
const MAX_SASL_FAILURES: u32 = 5;

/// Distinguishes "too many failed SASL attempts" from every other
/// authentication failure, so the select loop can close the stream with
/// `policy-violation` instead of `internal-server-error` without
/// string-sniffing the error message.
#[derive(thiserror::Error, Debug)]
#[error("too many failed SASL attempts")]
struct SaslAttemptsExceeded(#[source] Error);

#[derive(Clone, Copy)]
pub enum ConnectionType {
    Client,
    Server,
}

#[derive(Debug, Hash, Eq, PartialEq)]
enum StreamFeatures {
    Tls,
    Authentication,
    ResourceBinding,
}

struct StreamInfo {
    stream_id: StreamId,
    jid: Option<Jid>,
    peer_jid: Option<Jid>,
    peer_language: Option<LanguageTag>,
    connection_type: Option<ConnectionType>,
    features: HashSet<StreamFeatures>,
    sasl_failures: u32,
}

impl Default for StreamInfo {
    fn default() -> Self {
        StreamInfo {
            stream_id: StreamId::new(),
            jid: None,
            peer_jid: None,
            peer_language: None,
            connection_type: None,
            features: HashSet::new(),
            sasl_failures: 0,
        }
    }
}

pub struct InboundStreamSettings {
    pub connection_type: ConnectionType,
    pub domain: Jid,
    pub tls_required: bool,
    /// `spec.md` `limits.inbound_mailbox`: capacity of the channel other
    /// connections' routed stanzas arrive on.
    pub stanza_channel_capacity: usize,
    /// `spec.md` `limits.idle_seconds`: how long the stream may go
    /// without a frame from the peer before it is closed with
    /// `connection-timeout`.
    pub idle_timeout: Duration,
}

pub struct InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    stream: XmppStream<C, P>,
    info: StreamInfo,
    router: Router,
    resources: ResourceManager,
    stanza_tx: Sender<Stanza>,
    stanza_rx: Receiver<Stanza>,
    store: S,
    settings: InboundStreamSettings,
}

impl<C, P, S> InboundStream<C, P, S>
where
    C: Connection,
    P: StreamParser<ReadHalf<C>>,
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(
        connection: C,
        router: Router,
        store: S,
        settings: InboundStreamSettings,
    ) -> Self {
        let stream = XmppStream::new(connection);
        let info = StreamInfo::default();
        let (stanza_tx, stanza_rx) = mpsc::channel(settings.stanza_channel_capacity);
        let resources = ResourceManager::new(router.session_index().clone());

        InboundStream {
            stream,
            info,
            router,
            resources,
            stanza_tx,
            stanza_rx,
            store,
            settings,
        }
    }

    pub async fn handle(&mut self) {
        if let Err((error, condition)) = self.inner_handle().await {
            let _ = self.handle_unrecoverable_error(error, condition).await;
        }

        if let Some(peer_jid) = self.info.peer_jid.take() {
            self.router.unregister(&peer_jid).await;
        }
    }

    /// Drives the stream to completion, reporting at most one failure
    /// along with the stream-error condition it should be reported under
    /// — `handle` is the single place that actually emits `<stream:error>`
    /// and closes the stream, so nothing here writes on the error path
    /// except `send_stream_header`, which the peer is owed regardless of
    /// how negotiation ends.
    async fn inner_handle(&mut self) -> Result<(), (Error, StreamErrorCondition)> {
        self.exchange_stream_headers().await?;
        self.advertise_features()
            .await
            .map_err(|err| (err, StreamErrorCondition::InternalServerError))?;

        loop {
            select! {
                frame = self.stream.reader().next() => {
                    match frame {
                        Some(Ok(Frame::XmlFragment(element))) => {
                            if let Err(err) = self.process_element(element).await {
                                let condition = if err.downcast_ref::<SaslAttemptsExceeded>().is_some() {
                                    StreamErrorCondition::PolicyViolation
                                } else {
                                    StreamErrorCondition::InternalServerError
                                };
                                return Err((err, condition));
                            }
                        }
                        Some(Ok(Frame::StreamStart(_))) => {
                            return Err((
                                anyhow!("unexpected stream restart from peer"),
                                StreamErrorCondition::InvalidNamespace,
                            ));
                        }
                        Some(Err(err)) => {
                            let condition = if err.downcast_ref::<ParseError>().is_some() {
                                StreamErrorCondition::PolicyViolation
                            } else {
                                StreamErrorCondition::NotWellFormed
                            };
                            return Err((err, condition));
                        }
                        None => {
                            let _ = self.stream.writer().write_stream_close().await;
                            return Ok(());
                        }
                    }
                }
                Some(stanza) = self.stanza_rx.recv() => {
                    self.stream
                        .writer()
                        .write_xml_element(stanza.element())
                        .await
                        .map_err(|err| (err, StreamErrorCondition::InternalServerError))?;
                }
                () = sleep(self.settings.idle_timeout) => {
                    return Err((
                        anyhow!("connection idle for {:?}", self.settings.idle_timeout),
                        StreamErrorCondition::ConnectionTimeout,
                    ));
                }
            }
        }
    }

    /// Classifies the element by shape before acting on it, rather than
    /// trying each negotiator in turn and falling through on error: a
    /// rejected SASL attempt must not be reinterpreted as a stanza, it
    /// must leave the stream open for the client to retry (RFC 6120
    /// §6.4.3).
    async fn process_element(&mut self, element: Element) -> Result<(), Error> {
        let negotiable = self.negotiable_features();

        if negotiable.contains(&StreamFeatures::Tls)
            && element.validate("starttls", Some(namespaces::XMPP_STARTTLS))
        {
            return self.negotiate_tls(&element).await;
        }

        if negotiable.contains(&StreamFeatures::Authentication)
            && element.validate("auth", Some(namespaces::XMPP_SASL))
        {
            return self.negotiate_authentication(&element).await;
        }

        if negotiable.contains(&StreamFeatures::ResourceBinding)
            && element.validate("iq", Some(namespaces::XMPP_CLIENT))
            && element
                .find_child("bind", Some(namespaces::XMPP_BIND))
                .is_some()
        {
            return self.negotiate_resource_binding(&element).await;
        }

        let stanza = Stanza::from_element(element)?;

        let Some(from) = self.info.peer_jid.clone() else {
            bail!("received a stanza before the stream was authenticated");
        };

        if let Some(bounce) = self.router.route(from, stanza).await? {
            self.stream
                .writer()
                .write_xml_element(bounce.element())
                .await?;
        }

        Ok(())
    }

    fn negotiable_features(&self) -> Vec<StreamFeatures> {
        let mut features = vec![];

        if self.stream.is_starttls_allowed() && !self.info.features.contains(&StreamFeatures::Tls) {
            features.push(StreamFeatures::Tls);
        }

        if (!self.settings.tls_required || self.info.features.contains(&StreamFeatures::Tls))
            && !self.info.features.contains(&StreamFeatures::Authentication)
        {
            features.push(StreamFeatures::Authentication);
        }

        if let Some(ConnectionType::Client) = self.info.connection_type
            && self.info.features.contains(&StreamFeatures::Authentication)
            && !self
                .info
                .features
                .contains(&StreamFeatures::ResourceBinding)
        {
            features.push(StreamFeatures::ResourceBinding);
        }

        features
    }

    async fn negotiate_tls(&mut self, element: &Element) -> Result<(), Error> {
        StarttlsNegotiator::negotiate_feature(&mut self.stream, element).await?;
        self.info.features.insert(StreamFeatures::Tls);
        self.stream.reset();
        self.exchange_stream_headers()
            .await
            .map_err(|(err, _)| err)?;
        self.advertise_features().await
    }

    /// A failed SASL attempt does not close the stream: it sends
    /// `<failure/>` and lets the client retry, up to `MAX_SASL_FAILURES`
    /// times, per `spec.md` §4.5.
    async fn negotiate_authentication(&mut self, element: &Element) -> Result<(), Error> {
        let domain = self.settings.domain.to_string();
        let result = SaslNegotiator::negotiate_feature(
            &mut self.stream,
            element,
            &domain,
            self.store.clone(),
        )
        .await;

        let peer_jid = match result {
            Ok(jid) => jid,
            Err(err) => {
                self.info.sasl_failures += 1;
                if self.info.sasl_failures >= MAX_SASL_FAILURES {
                    return Err(SaslAttemptsExceeded(err).into());
                }
                return Ok(());
            }
        };

        debug!(%peer_jid, "stream authenticated");
        self.register_peer_jid(Some(peer_jid)).await;
        self.info.features.insert(StreamFeatures::Authentication);
        self.stream.reset();
        self.exchange_stream_headers()
            .await
            .map_err(|(err, _)| err)?;
        self.advertise_features().await
    }

    async fn negotiate_resource_binding(&mut self, element: &Element) -> Result<(), Error> {
        let peer_jid = ResourceBindingNegotiator::negotiate_feature(
            &mut self.stream,
            element,
            &self.info.peer_jid,
            &self.resources,
        )
        .await?;
        self.register_peer_jid(Some(peer_jid)).await;
        self.info.features.insert(StreamFeatures::ResourceBinding);
        Ok(())
    }

    async fn register_peer_jid(&mut self, peer_jid: Option<Jid>) {
        if let Some(entity) = self.info.peer_jid.take() {
            if entity.resource().is_some() {
                self.router.unregister(&entity).await;
            }
        }

        self.info.peer_jid = peer_jid;

        if let Some(entity) = self.info.peer_jid.clone() {
            if entity.resource().is_some() {
                self.router
                    .session_index()
                    .register(entity, self.stanza_tx.clone());
            }
        }
    }

    async fn advertise_features(&mut self) -> Result<(), Error> {
        let mut features = Element::new("features", Some(namespaces::XMPP_STREAMS));
        for feature in self.negotiable_features() {
            let feature = match feature {
                StreamFeatures::Tls => StarttlsNegotiator::advertise_feature(),
                StreamFeatures::Authentication => SaslNegotiator::advertise_feature(
                    self.stream.is_secure(),
                    self.stream.is_authenticated(),
                ),
                StreamFeatures::ResourceBinding => ResourceBindingNegotiator::advertise_feature(),
            };
            features.add_child(feature);
        }

        self.stream.writer().write_xml_element(&features).await
    }

    async fn exchange_stream_headers(&mut self) -> Result<(), (Error, StreamErrorCondition)> {
        let Some(frame) = self.stream.reader().next().await else {
            // Peer disconnected before sending anything: nothing was
            // negotiated, nothing to report back to.
            return Ok(());
        };

        let internal_error = |err: Error| (err, StreamErrorCondition::InternalServerError);

        let Ok(frame) = frame else {
            self.send_stream_header(None).await.map_err(internal_error)?;
            return Err((
                anyhow!("expected xml frame"),
                StreamErrorCondition::NotWellFormed,
            ));
        };

        let Frame::StreamStart(inbound_header) = frame else {
            self.send_stream_header(None).await.map_err(internal_error)?;
            return Err((
                anyhow!("expected stream header"),
                StreamErrorCondition::BadFormat,
            ));
        };

        if !inbound_header.is_version_1_0() {
            self.send_stream_header(None).await.map_err(internal_error)?;
            return Err((
                anyhow!("unsupported stream version"),
                StreamErrorCondition::UnsupportedVersion,
            ));
        }

        if let Some(to) = &inbound_header.to {
            if to.domain() != self.settings.domain.domain() {
                self.send_stream_header(None).await.map_err(internal_error)?;
                return Err((
                    anyhow!("stream requested unknown host {to}"),
                    StreamErrorCondition::HostUnknown,
                ));
            }
        }

        self.info.jid = inbound_header.to;
        self.info.peer_language = inbound_header.lang;
        self.info.connection_type = Some(self.settings.connection_type);

        self.send_stream_header(self.info.peer_jid.clone())
            .await
            .map_err(internal_error)
    }

    async fn send_stream_header(&mut self, to: Option<Jid>) -> Result<(), Error> {
        let outbound_header = StreamHeader {
            from: Some(self.settings.domain.clone()),
            to,
            id: Some(self.info.stream_id.clone()),
            version: Some("1.0".to_string()),
            lang: None,
        };

        self.stream
            .writer()
            .write_stream_header(&outbound_header, true)
            .await
    }

    async fn handle_unrecoverable_error(
        &mut self,
        error: Error,
        condition: StreamErrorCondition,
    ) -> Result<(), Error> {
        warn!(%error, "closing stream after unrecoverable error");

        let stream_error: Element = condition.into();

        self.stream.writer().write_xml_element(&stream_error).await?;
        self.stream.writer().write_stream_close().await
    }
}

/// `spec.md` §8's literal S1-S6 scenarios, run end-to-end over an
/// in-memory `tokio::io::duplex` pair in place of a real socket — the
/// same "fake `Connection` that turns `upgrade` into a no-op" shape as
/// `confidante_core::xmpp::stream`'s own `DummyConnection` test.
#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::time::timeout;

    use confidante_services::presence::PresenceManager;
    use confidante_services::session_index::SessionIndex;

    use crate::sasl::StoredPassword;
    use crate::sasl::StoredPasswordArgon2;

    use super::*;

    /// A fake socket that hands back a fresh in-memory connection on
    /// `upgrade()` instead of doing a real TLS handshake, same fake as
    /// `confidante_core::xmpp::stream::tests::DummyConnection`.
    struct FakeSocket {
        inner: DuplexStream,
        starttls_allowed: bool,
        secure: bool,
    }

    impl AsyncRead for FakeSocket {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FakeSocket {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    impl Connection for FakeSocket {
        type Upgrade = std::future::Ready<Result<Self, Error>>;

        fn upgrade(mut self) -> Result<Self::Upgrade, Error> {
            self.secure = true;
            Ok(std::future::ready(Ok(self)))
        }

        fn is_starttls_allowed(&self) -> bool {
            self.starttls_allowed
        }

        fn is_secure(&self) -> bool {
            self.secure
        }

        fn is_authenticated(&self) -> bool {
            false
        }
    }

    #[derive(Clone, Debug)]
    struct FakeStore {
        argon2: String,
    }

    impl StoredPasswordLookup for FakeStore {
        fn get_stored_password_argon2(
            &self,
            _jid: Jid,
        ) -> impl std::future::Future<Output = Result<String, Error>> + Send {
            let hash = self.argon2.clone();
            async move { Ok(hash) }
        }

        fn get_stored_password_scram_sha1(
            &self,
            _jid: Jid,
        ) -> impl std::future::Future<Output = Result<String, Error>> + Send {
            async move { Err(anyhow!("scram-sha-1 not configured in this fake")) }
        }

        fn get_stored_password_scram_sha256(
            &self,
            _jid: Jid,
        ) -> impl std::future::Future<Output = Result<String, Error>> + Send {
            async move { Err(anyhow!("scram-sha-256 not configured in this fake")) }
        }
    }

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn domain() -> Jid {
        jid("localhost")
    }

    fn fake_store() -> FakeStore {
        FakeStore {
            argon2: StoredPasswordArgon2::new("s3cr3t").unwrap().to_string(),
        }
    }

    fn settings(tls_required: bool) -> InboundStreamSettings {
        InboundStreamSettings {
            connection_type: ConnectionType::Client,
            domain: domain(),
            tls_required,
            stanza_channel_capacity: 8,
            idle_timeout: Duration::from_secs(60),
        }
    }

    fn spawn_stream(
        tls_required: bool,
        starttls_allowed: bool,
        router: Router,
        store: FakeStore,
    ) -> (DuplexStream, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let connection = FakeSocket {
            inner: server,
            starttls_allowed,
            secure: false,
        };
        let mut stream = InboundStream::<_, confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser<_>, _>::new(
            connection,
            router,
            store,
            settings(tls_required),
        );
        let handle = tokio::spawn(async move {
            stream.handle().await;
        });
        (client, handle)
    }

    fn fresh_router() -> Router {
        Router::new(
            domain(),
            Arc::new(SessionIndex::new()),
            Arc::new(PresenceManager::new()),
        )
    }

    async fn send(client: &mut DuplexStream, xml: &str) {
        client.write_all(xml.as_bytes()).await.unwrap();
    }

    /// Accumulates bytes from `client` until `needle` shows up, since a
    /// single `read` call may only return the first of several writes
    /// the server made (stream header, then features, as two frames).
    async fn read_until(client: &mut DuplexStream, needle: &str) -> String {
        let mut acc = String::new();
        let mut buf = [0u8; 4096];
        loop {
            if acc.contains(needle) {
                return acc;
            }
            let n = timeout(Duration::from_secs(2), client.read(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got: {acc}"))
                .unwrap();
            assert!(n > 0, "connection closed while waiting for {needle:?}, got: {acc}");
            acc.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    const OPEN_STREAM: &str = "<?xml version='1.0'?><stream:stream to='localhost' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    #[tokio::test]
    async fn stream_to_unknown_host_is_rejected() {
        let (mut client, _handle) = spawn_stream(true, true, fresh_router(), fake_store());

        send(
            &mut client,
            "<?xml version='1.0'?><stream:stream to='not-this-server.example' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
        )
        .await;

        let reply = read_until(&mut client, "</stream:stream>").await;
        assert!(reply.contains("host-unknown"));
    }

    #[tokio::test]
    async fn s1_happy_path_bind_advertises_required_starttls() {
        let (mut client, _handle) = spawn_stream(true, true, fresh_router(), fake_store());

        send(&mut client, OPEN_STREAM).await;

        let reply = read_until(&mut client, "</stream:features>").await;
        assert!(reply.contains("<stream:stream"));
        assert!(reply.contains("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'>")
            || reply.contains("<starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\">"));
        assert!(reply.contains("required"));
    }

    #[tokio::test]
    async fn s2_starttls_proceed_then_reoffers_sasl_mechanisms() {
        let (mut client, _handle) = spawn_stream(true, true, fresh_router(), fake_store());

        send(&mut client, OPEN_STREAM).await;
        read_until(&mut client, "</stream:features>").await;

        send(&mut client, "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
        let proceed = read_until(&mut client, "<proceed").await;
        assert!(proceed.contains("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            || proceed.contains("<proceed xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>"));

        // Stream restart is client-initiated (RFC 6120 §5.4.3.3): the
        // client doesn't wait for anything further, it just resends its
        // opening tag on the now-upgraded stream.
        send(&mut client, OPEN_STREAM).await;
        let reply = read_until(&mut client, "</stream:features>").await;

        assert!(reply.contains("<stream:stream"));
        assert!(reply.contains("PLAIN"));
        assert!(reply.contains("SCRAM-SHA-1"));
        assert!(reply.contains("SCRAM-SHA-256"));
    }

    /// Drives a connection through S1-S4 in sequence and returns the
    /// client half, bound as `alice@localhost/home`.
    async fn negotiate_to_bound_alice(router: Router) -> DuplexStream {
        let (mut client, _handle) = spawn_stream(true, true, router, fake_store());

        send(&mut client, OPEN_STREAM).await;
        read_until(&mut client, "</stream:features>").await;

        send(&mut client, "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
        read_until(&mut client, "<proceed").await;
        send(&mut client, OPEN_STREAM).await;
        read_until(&mut client, "</stream:features>").await;

        send(
            &mut client,
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGFsaWNlAHMzY3IzdA==</auth>",
        )
        .await;
        let success = read_until(&mut client, "<success").await;
        assert!(success.contains("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            || success.contains("<success xmlns=\"urn:ietf:params:xml:ns:xmpp-sasl\"/>"));

        send(&mut client, OPEN_STREAM).await;
        read_until(&mut client, "</stream:features>").await;

        send(
            &mut client,
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>home</resource></bind></iq>",
        )
        .await;
        let reply = read_until(&mut client, "</iq>").await;
        assert!(reply.contains("alice@localhost/home"));
        assert!(reply.contains("id='b1'") || reply.contains("id=\"b1\""));
        assert!(reply.contains("type='result'") || reply.contains("type=\"result\""));

        client
    }

    #[tokio::test]
    async fn s3_and_s4_plain_auth_then_resource_bind() {
        let router = fresh_router();
        let _client = negotiate_to_bound_alice(router.clone()).await;

        assert!(
            router
                .session_index()
                .sender_for(&jid("alice@localhost/home"))
                .is_some()
        );
    }

    #[tokio::test]
    async fn s5_message_routing_delivers_to_highest_priority_resource() {
        let router = fresh_router();
        let mut alice = negotiate_to_bound_alice(router.clone()).await;

        let (bob_tx, mut bob_rx) = tokio::sync::mpsc::channel(8);
        router
            .session_index()
            .register(jid("bob@localhost/phone"), bob_tx.clone());
        router.presence().update(
            jid("bob@localhost/phone"),
            &available_presence("bob@localhost/phone"),
        );
        router.presence().update(
            jid("alice@localhost/home"),
            &available_presence("alice@localhost/home"),
        );

        send(
            &mut alice,
            "<message to='bob@localhost' type='chat' id='m1'><body>hi</body></message>",
        )
        .await;

        let delivered = timeout(Duration::from_secs(2), bob_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Stanza::Message(message) = delivered else {
            panic!("expected a message stanza");
        };
        assert_eq!(message.to.as_ref(), Some(&jid("bob@localhost/phone")));
        assert_eq!(message.from.as_ref(), Some(&jid("alice@localhost/home")));
    }

    #[tokio::test]
    async fn s5_message_routing_bounces_when_offline() {
        let router = fresh_router();
        let mut alice = negotiate_to_bound_alice(router.clone()).await;

        send(
            &mut alice,
            "<message to='bob@localhost' type='chat' id='m1'><body>hi</body></message>",
        )
        .await;

        let reply = read_until(&mut alice, "</message>").await;
        assert!(reply.contains("type='error'") || reply.contains("type=\"error\""));
        assert!(reply.contains("service-unavailable"));
        assert!(reply.contains("id='m1'") || reply.contains("id=\"m1\""));
    }

    #[tokio::test]
    async fn s6_malformed_xml_closes_stream_with_not_well_formed() {
        let (mut client, _handle) = spawn_stream(false, false, fresh_router(), fake_store());

        send(&mut client, OPEN_STREAM).await;
        read_until(&mut client, "</stream:features>").await;

        // A mismatched closing tag: well-formedness-breaking input the
        // underlying SAX parser rejects the moment it sees it, rather
        // than relying on the EOF-mid-stanza path (which only fires once
        // a `<stream:stream>` root has already been seen).
        send(&mut client, "<bad></mismatch>").await;

        let reply = read_until(&mut client, "</stream:stream>").await;
        assert!(reply.contains("not-well-formed"));

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "server should have closed the connection");
    }

    #[tokio::test]
    async fn exhausting_sasl_attempts_closes_with_policy_violation() {
        let (mut client, _handle) = spawn_stream(true, true, fresh_router(), fake_store());

        send(&mut client, OPEN_STREAM).await;
        read_until(&mut client, "</stream:features>").await;

        send(&mut client, "<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;
        read_until(&mut client, "<proceed").await;
        send(&mut client, OPEN_STREAM).await;
        read_until(&mut client, "</stream:features>").await;

        for _ in 0..MAX_SASL_FAILURES - 1 {
            send(
                &mut client,
                "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGFsaWNlAHdyb25n</auth>",
            )
            .await;
            let reply = read_until(&mut client, "<failure").await;
            assert!(reply.contains("<failure"));
        }

        send(
            &mut client,
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGFsaWNlAHdyb25n</auth>",
        )
        .await;
        let reply = read_until(&mut client, "</stream:stream>").await;
        assert!(reply.contains("policy-violation"));
    }

    fn available_presence(from: &str) -> confidante_core::xmpp::stanza::Presence {
        let mut element = confidante_core::xml::Element::new("presence", None);
        element.set_attribute("from", None, from.to_string());
        let Stanza::Presence(presence) = Stanza::from_element(element).unwrap() else {
            unreachable!()
        };
        presence
    }
}
