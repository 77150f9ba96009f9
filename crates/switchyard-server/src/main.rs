//! switchyard process entry point.
//!
//! A process is either a gateway or a backend (`cluster.role`). In local
//! mode the coordination store, bus and user table live in memory and each
//! watched service type gets an in-process echo backend, so one process
//! serves the full client → backend round trip. In redis mode they are
//! shared through a Redis server and every gateway and backend is its own
//! process.
//!
//! Run with: `cargo run -p switchyard-server -- --listen 127.0.0.1:3250`
//! or, for a backend: `cargo run -p switchyard-server -- --role backend
//! --service game --identity game-1 --redis-url redis://127.0.0.1/`
//!
//! `SIGHUP` re-reads `config.ron` and applies a changed log level.

mod handlers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use switchyard_config::{CliArgs, ClusterMode, Config, DiscoveryConfig, GatewayConfig, Role};
use switchyard_discovery::{
    CoordinationStore, MemoryStore, RedisStore, Register, RegisterOptions, Resolver,
    ResolverBuilder, ResolverOptions, ServiceRecord,
};
use switchyard_gateway::{ConnectionManager, GatewayOptions, InstanceSelector, SelectPolicy};
use switchyard_log::LogHandle;
use switchyard_protocol::RouteDictionary;
use switchyard_transport::{
    Bus, Dispatcher, MemoryBus, MemoryUserLocator, PushFanout, RedisBus, RedisUserLocator,
    TransportClient, UserLocator,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Scheme of resolver targets built by this process.
const RESOLVER_SCHEME: &str = "switchyard";

/// Shared infrastructure, in memory or on Redis.
struct Cluster {
    store: Arc<dyn CoordinationStore>,
    bus: Arc<dyn Bus>,
    locator: Arc<dyn UserLocator>,
    reaper: Option<JoinHandle<()>>,
}

impl Cluster {
    async fn connect(config: &Config) -> anyhow::Result<Self> {
        match config.cluster.mode {
            ClusterMode::Local => {
                let store = MemoryStore::new();
                let reaper = store.spawn_reaper(Duration::from_secs(1));
                Ok(Self {
                    store: Arc::new(store),
                    bus: Arc::new(MemoryBus::new()),
                    locator: Arc::new(MemoryUserLocator::new()),
                    reaper: Some(reaper),
                })
            }
            ClusterMode::Redis => {
                let url = &config.cluster.redis_url;
                let namespace = &config.cluster.namespace;
                let store = RedisStore::connect(url, namespace)
                    .await
                    .context("connecting to the redis coordination store")?;
                let bus = RedisBus::new(url, namespace, config.transport.queue_capacity)?;
                let locator = RedisUserLocator::new(url, namespace)?;
                Ok(Self {
                    store: Arc::new(store),
                    bus: Arc::new(bus),
                    locator: Arc::new(locator),
                    reaper: None,
                })
            }
        }
    }

    fn close(&self) {
        if let Some(reaper) = &self.reaper {
            reaper.abort();
        }
    }
}

/// A registered backend serving one service type.
struct Backend {
    transport: Arc<TransportClient>,
    register: Arc<Register>,
    dispatcher: JoinHandle<()>,
}

impl Backend {
    async fn close(&self) {
        self.transport.close();
        self.register.close().await;
        self.dispatcher.abort();
    }
}

fn register_options(discovery: &DiscoveryConfig) -> RegisterOptions {
    RegisterOptions {
        dial_timeout: discovery.dial_timeout(),
        retry_interval: discovery.retry_interval(),
    }
}

fn gateway_options(gateway: &GatewayConfig) -> GatewayOptions {
    GatewayOptions {
        heartbeat_interval: gateway.heartbeat_interval(),
        read_deadline: gateway.read_deadline(),
        handshake_timeout: gateway.handshake_timeout(),
        max_connections: gateway.max_connections,
        inbound_queue_capacity: gateway.inbound_queue_capacity,
        outbound_queue_capacity: gateway.outbound_queue_capacity,
        pool_capacity: gateway.pool_capacity,
        compress_threshold: gateway.compress_threshold,
        ..GatewayOptions::default()
    }
}

fn record(discovery: &DiscoveryConfig, name: &str, address: &str) -> ServiceRecord {
    ServiceRecord {
        name: name.to_string(),
        address: address.to_string(),
        weight: discovery.weight,
        version: discovery.version.clone().unwrap_or_default(),
        ttl: discovery.ttl_secs,
    }
}

/// Identity of the in-process backend for `service` in local mode.
fn local_backend_identity(service: &str) -> String {
    format!("{service}-backend-1")
}

async fn start_backend(
    service: &str,
    identity: &str,
    config: &Config,
    cluster: &Cluster,
) -> anyhow::Result<Backend> {
    let transport = Arc::new(TransportClient::new(
        identity,
        Arc::clone(&cluster.bus),
        config.transport.queue_capacity,
    ));
    let inbound = transport.run()?;

    let handlers = handlers::echo_handlers(service)?;
    let fanout = Arc::new(PushFanout::new(
        Arc::clone(&transport),
        Arc::clone(&cluster.locator),
    ));
    let dispatcher =
        Dispatcher::new(Arc::clone(&transport), Arc::new(handlers)).with_fanout(fanout);
    let dispatcher = tokio::spawn(async move { dispatcher.run(inbound).await });

    let register = Register::new(
        Arc::clone(&cluster.store),
        record(&config.discovery, service, identity),
        register_options(&config.discovery),
    );
    register
        .start()
        .await
        .with_context(|| format!("registering backend {identity}"))?;
    info!(service, identity, "backend started");
    Ok(Backend {
        transport,
        register,
        dispatcher,
    })
}

async fn resolve(
    config: &Config,
    store: Arc<dyn CoordinationStore>,
    selector: &InstanceSelector,
) -> anyhow::Result<Vec<Resolver>> {
    let builder = ResolverBuilder::new(
        RESOLVER_SCHEME,
        store,
        ResolverOptions {
            dial_timeout: config.discovery.dial_timeout(),
            resync_interval: config.discovery.resync_interval(),
        },
    );
    let mut resolvers = Vec::new();
    for service in &config.discovery.watch {
        let target = match &config.discovery.version {
            Some(version) => format!("{}:///{service}/{version}", builder.scheme()),
            None => format!("{}:///{service}", builder.scheme()),
        };
        let resolver = builder
            .build(&target)
            .await
            .with_context(|| format!("resolving {target}"))?;
        selector.add_service(service.clone(), resolver.subscribe());
        resolvers.push(resolver);
    }
    Ok(resolvers)
}

/// Wait for Ctrl-C, or for `server` to end first.
async fn wait_for_shutdown(server: Option<&mut JoinHandle<anyhow::Result<()>>>) {
    let server = async {
        match server {
            Some(server) => match server.await {
                Ok(Ok(())) => info!("accept loop finished"),
                Ok(Err(e)) => error!("gateway failed: {e:#}"),
                Err(e) => error!("gateway task failed: {e}"),
            },
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        () = server => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("failed to listen for shutdown signal: {e}");
            }
            info!("shutdown requested");
        }
    }
}

/// Re-read the config on every `SIGHUP`.
#[cfg(unix)]
fn spawn_reload_listener(config_dir: PathBuf, mut current: Config, log: LogHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(e) => {
            warn!("config reload on SIGHUP unavailable: {e}");
            return;
        }
    };
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match current.reload(&config_dir) {
                Ok(Some(next)) => {
                    apply_reload(&current, &next, &log);
                    current = next;
                }
                Ok(None) => info!("config unchanged"),
                Err(e) => warn!("config reload rejected: {e}"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_listener(_config_dir: PathBuf, _current: Config, _log: LogHandle) {}

/// Apply what can change while running and report the rest.
fn apply_reload(current: &Config, next: &Config, log: &LogHandle) {
    if current.debug != next.debug {
        match log.apply_config(next) {
            Ok(true) => info!(level = %next.debug.log_level, "log level changed"),
            Ok(false) => info!("log level pinned by RUST_LOG"),
            Err(e) => warn!("log level not changed: {e}"),
        }
    }
    let pending = current.restart_required(next);
    if !pending.is_empty() {
        warn!(sections = ?pending, "config changes take effect after a restart");
    }
}

async fn run_gateway(config: &Config, cluster: &Cluster) -> anyhow::Result<()> {
    let mut backends = Vec::new();
    if config.cluster.mode == ClusterMode::Local {
        for service in &config.discovery.watch {
            let identity = local_backend_identity(service);
            backends.push(start_backend(service, &identity, config, cluster).await?);
        }
    }

    let register = Register::new(
        Arc::clone(&cluster.store),
        record(
            &config.discovery,
            &config.discovery.service_name,
            &config.discovery.address,
        ),
        register_options(&config.discovery),
    );
    if config.discovery.address != config.transport.identity {
        warn!(
            address = %config.discovery.address,
            identity = %config.transport.identity,
            "registered address differs from the bus identity"
        );
    }
    register.start().await.context("registering gateway")?;

    let selector = InstanceSelector::new(SelectPolicy::RoundRobin);
    let resolvers = resolve(config, Arc::clone(&cluster.store), &selector).await?;

    let dictionary = Arc::new(RouteDictionary::new());
    dictionary
        .register_all(config.gateway.routes.iter().map(|(route, code)| (route.as_str(), *code)))
        .context("invalid route dictionary")?;
    let handlers = handlers::entry_handlers(&config.discovery.service_name)?;
    let transport = Arc::new(TransportClient::new(
        config.transport.identity.clone(),
        Arc::clone(&cluster.bus),
        config.transport.queue_capacity,
    ));
    let manager = ConnectionManager::new(
        gateway_options(&config.gateway),
        dictionary,
        Arc::new(handlers),
        Arc::new(selector),
        transport,
        Arc::clone(&cluster.locator),
    )?;
    manager.start()?;

    let addr: SocketAddr = config
        .gateway
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.gateway.listen_addr))?;
    let accept = Arc::clone(&manager);
    let mut server = tokio::spawn(async move { accept.run(addr).await.map_err(anyhow::Error::from) });

    wait_for_shutdown(Some(&mut server)).await;

    manager.close();
    server.abort();
    register.close().await;
    for resolver in &resolvers {
        resolver.close().await;
    }
    for backend in &backends {
        backend.close().await;
    }
    Ok(())
}

async fn run_backend(config: &Config, cluster: &Cluster) -> anyhow::Result<()> {
    let backend = start_backend(
        &config.discovery.service_name,
        &config.transport.identity,
        config,
        cluster,
    )
    .await?;
    wait_for_shutdown(None).await;
    backend.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => dir,
        None => dirs::config_dir()
            .context("failed to resolve config directory")?
            .join("switchyard"),
    };
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    config.validate()?;

    let log_dir = config_dir.join("logs");
    let log = switchyard_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));
    info!(
        identity = %config.transport.identity,
        service = %config.discovery.service_name,
        role = ?config.cluster.role,
        mode = ?config.cluster.mode,
        "starting switchyard"
    );
    spawn_reload_listener(config_dir, config.clone(), log);

    let cluster = Cluster::connect(&config).await?;
    let result = match config.cluster.role {
        Role::Gateway => run_gateway(&config, &cluster).await,
        Role::Backend => run_backend(&config, &cluster).await,
    };
    cluster.close();
    match &result {
        Ok(()) => info!("switchyard stopped"),
        Err(e) => error!("switchyard failed: {e:#}"),
    }
    result
}
