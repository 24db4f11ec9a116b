//! Runtime - configuration-driven assembly and process lifecycle
//!
//! The runtime is responsible for:
//! - Building the rule engine, registry and cache from configuration
//! - Binding the listener (fatal on failure)
//! - Toggling the system proxy around the process lifetime
//! - Background tasks: cache sweep and stats reporting

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::cache::TtlCache;
use crate::common::{Address, Result};
use crate::config::Config;
use crate::geoip::{CountryLookup, GeoIpClassifier};
use crate::resolver::{HostResolver, SystemResolver};
use crate::router::RuleEngine;
use crate::sysproxy::{self, NoopSystemProxy, SystemProxy};
use crate::transport::{Listener, TcpTransport, Transport};

use super::supervisor::Supervisor;

/// Grace delay between disabling the system proxy and returning
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Stats report interval
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Runtime manages the proxy lifecycle
pub struct Runtime {
    listen: SocketAddr,
    bypass: Vec<String>,
    manage_system_proxy: bool,
    system_proxy: Box<dyn SystemProxy>,
    transport: Arc<dyn Transport>,
    supervisor: Arc<Supervisor>,
    cache: Arc<TtlCache<IpAddr, String>>,
    sweep_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Build runtime from configuration, resolving hosts through the OS
    pub fn from_config(config: &Config, geoip: Arc<dyn CountryLookup>) -> Result<Self> {
        Self::with_resolver(config, geoip, Arc::new(SystemResolver))
    }

    /// Build runtime from configuration with an explicit host resolver
    pub fn with_resolver(
        config: &Config,
        geoip: Arc<dyn CountryLookup>,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());

        let rules = config.build_rules()?;
        let registry = config.build_registry(Arc::clone(&transport))?;
        for action in rules.actions() {
            if !registry.knows(action) {
                warn!("Rule action [{}] names no proxy or group", action);
            }
        }
        info!(
            "Loaded {} upstreams, {} groups, {} rules",
            registry.upstream_count(),
            registry.group_count(),
            rules.len()
        );

        let cache = Arc::new(TtlCache::new(config.cache.default_ttl()));
        let classifier = GeoIpClassifier::new(
            resolver,
            geoip,
            Arc::clone(&cache),
            config.cache.geoip_ttl(),
        );
        let engine = RuleEngine::new(rules).with_geo(Arc::new(classifier));
        let supervisor = Supervisor::new(Arc::new(engine), Arc::new(registry));

        let system_proxy: Box<dyn SystemProxy> = if config.general.system_proxy {
            sysproxy::platform_default()
        } else {
            Box::new(NoopSystemProxy)
        };

        Ok(Self {
            listen: config.listen_addr(),
            bypass: config.bypass_list(),
            manage_system_proxy: config.general.system_proxy,
            system_proxy,
            transport,
            supervisor: Arc::new(supervisor),
            cache,
            sweep_interval: config.cache.sweep_interval(),
            shutdown_tx,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn cache(&self) -> &Arc<TtlCache<IpAddr, String>> {
        &self.cache
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<Box<dyn Listener>> {
        self.transport.bind(&Address::Socket(self.listen)).await
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        info!("Listening on {}", listener.local_addr()?);

        if self.manage_system_proxy {
            sysproxy::enable_logged(self.system_proxy.as_ref(), &self.bypass, self.listen).await;
        }

        let sweeper = self.cache.spawn_sweeper(self.sweep_interval);
        let stats_handle = tokio::spawn(stats_reporter(
            Arc::clone(&self.supervisor),
            self.shutdown_tx.subscribe(),
        ));

        tokio::select! {
            result = self.serve(listener) => result?,
            _ = shutdown_signal() => {}
        }

        info!("Shutting down...");
        self.log_stats();
        let _ = self.shutdown_tx.send(());

        if self.manage_system_proxy {
            if let Err(e) = self.system_proxy.disable().await {
                warn!("Failed to disable system proxy: {}", e);
            }
        }

        // In-flight connections are abandoned after the grace delay
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        sweeper.abort();
        let _ = stats_handle.await;
        Ok(())
    }

    /// Accept loop: one task per connection until [`Runtime::shutdown`]
    pub async fn serve(&self, listener: Box<dyn Listener>) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut conn_count: u64 = 0;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            conn_count += 1;
                            let conn_id = conn_count;
                            debug!("New connection #{} from {}", conn_id, peer);

                            let supervisor = Arc::clone(&self.supervisor);
                            tokio::spawn(async move {
                                // Failures are already logged by the supervisor
                                if let Err(e) = supervisor.handle(stream, peer).await {
                                    trace!("Connection #{} ended: {}", conn_id, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Listener stopped (handled {} connections)", conn_count);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stop [`Runtime::serve`] loops and the stats reporter
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn log_stats(&self) {
        log_stats(&self.supervisor);
    }
}

fn log_stats(supervisor: &Supervisor) {
    supervisor.stats().log();
    supervisor.engine().log_stats();
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Logs stats periodically and on SIGUSR1
#[cfg(unix)]
async fn stats_reporter(supervisor: Arc<Supervisor>, mut shutdown_rx: broadcast::Receiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately
    interval.tick().await;

    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(sig) => Some(sig),
        Err(e) => {
            warn!("Cannot listen for SIGUSR1: {}", e);
            None
        }
    };

    loop {
        tokio::select! {
            _ = interval.tick() => log_stats(&supervisor),
            Some(_) = async { sigusr1.as_mut()?.recv().await } => {
                info!("Received SIGUSR1, printing statistics...");
                log_stats(&supervisor);
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Logs stats periodically (non-Unix)
#[cfg(not(unix))]
async fn stats_reporter(supervisor: Arc<Supervisor>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => log_stats(&supervisor),
            _ = shutdown_rx.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::GeoIpDatabase;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Counts resolutions so tests can tell whether GeoIP ran
    #[derive(Default)]
    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HostResolver for CountingResolver {
        async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            SystemResolver.resolve(host).await
        }
    }

    fn runtime(config: &str, resolver: Arc<CountingResolver>) -> Arc<Runtime> {
        let config = Config::from_json(config).unwrap();
        Arc::new(Runtime::with_resolver(&config, Arc::new(GeoIpDatabase::new()), resolver).unwrap())
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    /// Start serving on an ephemeral port
    async fn start(runtime: &Arc<Runtime>) -> SocketAddr {
        let listener = runtime
            .transport
            .bind(&Address::from(("127.0.0.1", 0)))
            .await
            .unwrap();
        let local = listener.local_addr().unwrap().as_socket().unwrap();
        let rt = Arc::clone(runtime);
        tokio::spawn(async move { rt.serve(listener).await });
        local
    }

    async fn socks5_connect(proxy: SocketAddr, host: &str, port: u16) -> (TcpStream, [u8; 10]) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let mut request = vec![5, 1, 0, 3, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_socks5_domain_suffix_direct() {
        let echo_port = echo_server().await;
        let resolver = Arc::new(CountingResolver::default());
        let runtime = runtime(
            r#"{
                "proxies": { "Block": { "type": "reject" } },
                "rules": ["DOMAIN-SUFFIX,localhost,DIRECT", "GEOIP,ZZ,block", "FINAL,block"]
            }"#,
            resolver.clone(),
        );
        let proxy = start(&runtime).await;

        let (mut stream, reply) = socks5_connect(proxy, "localhost", echo_port).await;
        assert_eq!(reply[..2], [5, 0]);

        stream.write_all(b"over the relay").await.unwrap();
        let mut echoed = [0u8; 14];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"over the relay");

        // GeoIP is consulted first, but with an empty database it never decides
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
        let engine = runtime.supervisor().engine();
        assert_eq!(engine.hit_count(crate::router::RuleCategory::DomainSuffix), 1);

        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_final_reject_end_to_end() {
        let runtime = runtime(
            r#"{ "rules": ["FINAL,reject"] }"#,
            Arc::new(CountingResolver::default()),
        );
        let proxy = start(&runtime).await;

        let (mut stream, reply) = socks5_connect(proxy, "example.com", 80).await;
        assert_eq!(reply[1], 0x02);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_closing_either_side_closes_both() {
        // Upstream that closes right after greeting
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        let upstream_task = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
            // Dropping closes the upstream side
        });

        let runtime = runtime(r#"{}"#, Arc::new(CountingResolver::default()));
        let proxy = start(&runtime).await;

        let (mut stream, reply) = socks5_connect(proxy, "127.0.0.1", upstream_port).await;
        assert_eq!(reply[1], 0);
        upstream_task.await.unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"bye");

        // Client side closed as well: the relay is done and counted once
        let stats = runtime.supervisor().stats();
        for _ in 0..50 {
            if stats.snapshot().relayed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.relayed, 1);
        assert_eq!(snapshot.active, 0);
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_http_forward_end_to_end() {
        let echo_port = echo_server().await;
        let runtime = runtime(r#"{}"#, Arc::new(CountingResolver::default()));
        let proxy = start(&runtime).await;

        let request = format!(
            "GET http://127.0.0.1:{}/hello HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
            echo_port
        );
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        // The echo server returns the original request byte for byte
        let mut echoed = vec![0u8; request.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, request.as_bytes());
        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_geoip_with_oversized_ttl() {
        let runtime = runtime(
            r#"{
                "cache": { "geoip_ttl_secs": 18446744073709551615 },
                "rules": ["GEOIP,CN,reject"]
            }"#,
            Arc::new(CountingResolver::default()),
        );
        let decision = runtime.supervisor().engine().decide("127.0.0.1").await;
        assert_eq!(decision.action, "direct");

        // The unknown answer was cached without overflowing its expiry
        assert_eq!(runtime.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let runtime = runtime(
            &format!(r#"{{"general": {{"interface": "127.0.0.1", "socks_port": {}}}}}"#, port),
            Arc::new(CountingResolver::default()),
        );
        assert!(runtime.run().await.is_err());
    }
}
