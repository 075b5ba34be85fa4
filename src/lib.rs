pub mod api;
pub mod config;
pub mod hostname;
pub mod identity;
pub mod monitor;
pub mod observer;
pub mod peer;
pub mod signaling;
pub mod statistics;
pub mod useragent;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::mpsc::unbounded_channel, time::Instant};

use broker::{
    domains::{BrokerOptions, DomainBroker},
    exec::{ExecChannel, RemoteShell, ShellExec},
};
use service::session::{SessionManager, SessionManagerOptions};

use self::{
    config::Config,
    identity::IdentityStore,
    monitor::MonitorHub,
    observer::Observer,
    peer::PeerTable,
    signaling::dispatcher::Dispatcher,
    statistics::Statistics,
};

#[rustfmt::skip]
pub static SOFTWARE: &str = concat!(
    "openlink-server.",
    env!("CARGO_PKG_VERSION")
);

/// Everything the http and duplex surfaces share.
pub struct App {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub broker: Arc<DomainBroker<ShellExec>>,
    pub monitor: Arc<MonitorHub>,
    pub uptime: Instant,
}

/// In order to let the integration test directly use the server crate and
/// start the server, a function is opened to replace the main function to
/// directly start the server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let app = compose(config.clone())?;

    // Reap peers that have gone silent past the ping window.
    {
        let dispatcher = app.dispatcher.clone();
        let timeout_ms = config.server.ping_timeout * 1000;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                for id in dispatcher.peers.idle(timeout_ms) {
                    log::info!("evicting silent peer: id={id}");
                    dispatcher.peers.close(&id);
                }
            }
        });
    }

    let router = api::router(app.clone());

    let Some(listener) = bind_acceptor(&config, app.broker.clone()).await else {
        // Client-only fallback: no acceptor could be bound anywhere; stay
        // alive so outbound work and the reapers keep running.
        log::error!("no acceptor available, running without a listener");
        std::future::pending::<()>().await;
        unreachable!();
    };

    log::info!("server listening={}", listener.local_addr()?);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    shutdown(&app).await;
    Ok(())
}

fn compose(config: Arc<Config>) -> anyhow::Result<Arc<App>> {
    let statistics = Statistics::default();
    let peers = Arc::new(PeerTable::default());
    let identities = Arc::new(IdentityStore::load());

    let (domain_gc, mut domain_rx) = unbounded_channel::<String>();

    let sessions = SessionManager::new(SessionManagerOptions {
        session_ttl: Duration::from_secs(config.server.session_ttl),
        handler: Observer::new(peers.clone(), domain_gc),
    });

    let exec = Arc::new(ShellExec::new(
        config.exec.sudo_secret.clone(),
        config.exec.remote.as_ref().map(|it| RemoteShell {
            host: it.host.clone(),
            port: it.port,
            user: it.user.clone(),
            key_file: it.key_file.clone(),
        }),
    ));

    let broker = DomainBroker::new(
        BrokerOptions {
            base_domains: config.domains.base_domains.clone(),
            port_range: config.domains.port_range,
            max_domain_life: Duration::from_secs(config.domains.max_domain_life),
            max_permit_duration: Duration::from_secs(config.domains.max_permit_duration),
            temp_url_ttl: Duration::from_secs(config.domains.temp_url_ttl),
            cleanup_interval: Duration::from_secs(config.domains.cleanup_interval),
            local_conf: config.domains.local_conf.clone(),
            remote_conf: config.domains.remote_conf.clone(),
            remote_upstream_host: config.domains.lan_ip.clone(),
        },
        exec,
    );

    broker.spawn_gc();

    // Domains attached to destroyed sessions drain through here; the
    // registry reaper cannot reach the exec channel itself.
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(domain_id) = domain_rx.recv().await {
                if let Err(error) = broker.release_domain(&domain_id).await {
                    log::warn!("session domain release failed: id={domain_id}, error={error}");
                }
            }
        });
    }

    let monitor = MonitorHub::new();
    monitor.spawn_sweeper();

    let dispatcher = Arc::new(Dispatcher {
        config: config.clone(),
        peers,
        sessions,
        statistics,
        identities,
    });

    Ok(Arc::new(App {
        config,
        dispatcher,
        broker,
        monitor,
        uptime: Instant::now(),
    }))
}

/// Bind the single acceptor port, with the recovery ladder for a port that
/// is already taken: terminate the holder and retry, then try the next
/// port, then give up on accepting. Never exits silently.
async fn bind_acceptor(
    config: &Config,
    broker: Arc<DomainBroker<ShellExec>>,
) -> Option<TcpListener> {
    let bind = config.server.bind;

    match TcpListener::bind(bind).await {
        Ok(listener) => return Some(listener),
        Err(error) if error.kind() == std::io::ErrorKind::AddrInUse => {
            log::warn!("bind address in use, terminating the holder: addr={bind}");

            let _ = broker
                .exec()
                .exec_local(&format!("fuser -k {}/tcp", bind.port()))
                .await;
            tokio::time::sleep(Duration::from_secs(1)).await;

            if let Ok(listener) = TcpListener::bind(bind).await {
                return Some(listener);
            }
        }
        Err(error) => {
            log::error!("bind failed: addr={bind}, error={error}");
        }
    }

    // Fall over to the next port.
    let next = SocketAddr::new(bind.ip(), bind.port().wrapping_add(1));
    log::warn!("falling back to the next port: addr={next}");

    TcpListener::bind(next).await.ok()
}

async fn shutdown(app: &Arc<App>) {
    log::info!("shutting down");

    // Duplex channels first, then one last broker sweep.
    for peer in app.dispatcher.peers.list() {
        app.dispatcher.peers.close(&peer.id);
    }

    app.broker.gc().await;
}
