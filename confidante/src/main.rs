use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use confidante_backend::settings::Settings;
use confidante_backend::store::{SqliteStoreBackend, StoreHandle};
use confidante_core::xml::stream_parser::rusty_xml::RustyXmlStreamParser;
use confidante_core::xmpp::jid::Jid;
use confidante_inbound::connection::debug::DebugConnection;
use confidante_inbound::connection::tcp::TcpConnection;
use confidante_inbound::{ConnectionType, InboundStreamSettings};
use confidante_inbound::{
    InboundStream,
    sasl::{StoredPassword, StoredPasswordArgon2, StoredPasswordScram},
};
use confidante_services::presence::PresenceManager;
use confidante_services::router::Router;
use confidante_services::session_index::SessionIndex;
use confidante_services::supervisor::{HealthRegistry, supervise};
use sha1::Sha1;
use sha2::Sha256;

type Error = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    AddUser { bare_jid: String, password: String },
    RemoveUser { bare_jid: String },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::init()?;

    let store_backend = SqliteStoreBackend::new(&settings).await?;
    let store = StoreHandle::new(store_backend);

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::AddUser { bare_jid, password }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            let stored_password_argon2 = StoredPasswordArgon2::new(&password)?.to_string();
            let stored_password_scram_sha1 =
                StoredPasswordScram::<Sha1>::new(&password)?.to_string();
            let stored_password_scram_sha256 =
                StoredPasswordScram::<Sha256>::new(&password)?.to_string();
            store
                .add_user(
                    bare_jid,
                    stored_password_argon2,
                    stored_password_scram_sha1,
                    stored_password_scram_sha256,
                )
                .await?;
        }
        Some(Commands::RemoveUser { bare_jid }) => {
            let bare_jid = bare_jid.parse::<Jid>()?.to_bare();
            store.remove_user(bare_jid).await?;
        }
        None => {
            let addr = format!("0.0.0.0:{}", settings.bind.port);
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, domain = %settings.domain, "listening for c2s connections");

            let session_index = Arc::new(SessionIndex::new());
            let presence = Arc::new(PresenceManager::new());
            let router = Router::new(settings.domain.clone(), session_index, presence);

            {
                let session_index = router.session_index().clone();
                let presence = router.presence().clone();
                let health = HealthRegistry::new();
                let interval = Duration::from_secs(settings.supervision.health_check_seconds);

                tokio::spawn(supervise("presence-sweeper", interval, move || {
                    let session_index = session_index.clone();
                    let presence = presence.clone();
                    let health = health.clone();
                    async move {
                        let live = session_index.registered_full_jids().into_iter().collect();
                        presence.retain_live(&live);
                        health.record_progress(
                            i64::try_from(
                                std::time::SystemTime::now()
                                    .duration_since(std::time::UNIX_EPOCH)
                                    .unwrap_or_default()
                                    .as_millis(),
                            )
                            .unwrap_or(i64::MAX),
                        );
                        Ok(())
                    }
                }));
            }

            loop {
                let (connection, peer_addr) = listener.accept().await?;

                let settings = settings.clone();
                let router = router.clone();
                let store = store.clone();

                tokio::spawn(async move {
                    let connection =
                        TcpConnection::new(connection, settings.tls.server_config.clone());
                    let connection = match DebugConnection::new(connection).await {
                        Ok(connection) => connection,
                        Err(error) => {
                            warn!(%error, %peer_addr, "failed to set up connection recorder");
                            return;
                        }
                    };
                    info!(%peer_addr, connection_id = %connection.id(), "accepted connection");

                    let stream_settings = InboundStreamSettings {
                        connection_type: ConnectionType::Client,
                        domain: settings.domain.clone(),
                        tls_required: settings.tls.required_for_clients,
                        stanza_channel_capacity: settings.limits.inbound_mailbox,
                        idle_timeout: Duration::from_secs(settings.limits.idle_seconds),
                    };
                    let mut stream = InboundStream::<_, RustyXmlStreamParser<_>, _>::new(
                        connection,
                        router,
                        store,
                        stream_settings,
                    );
                    stream.handle().await;
                });
            }
        }
    }

    Ok(())
}
