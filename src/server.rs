use crate::config::Config;
use crate::dns::{build_spf_server, Dns, HickoryDns};
use crate::handlers::HandlerRegistry;
use crate::metrics::{serve_metrics, MetricsCollector};
use crate::milter::MilterConnection;
use crate::pipeline::Pipeline;
use crate::smtp::SmtpProxyConnection;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};

/// Shared pieces every connection worker gets a handle to.
struct Shared {
    config: Arc<Config>,
    registry: Arc<HandlerRegistry>,
    collector: Arc<MetricsCollector>,
    dns: Arc<dyn Dns>,
    spf_server: Arc<mail_auth::Resolver>,
}

impl Shared {
    /// A fresh pipeline with the built-in object factories registered.
    /// The resolver and SPF engine are shared across workers; the store
    /// hands out clones lazily.
    fn pipeline(&self) -> anyhow::Result<Pipeline> {
        let mut pipeline = Pipeline::new(
            self.config.clone(),
            self.registry.clone(),
            self.collector.worker(),
        )?;
        let dns = self.dns.clone();
        pipeline
            .ctx
            .objects
            .register_factory("resolver", false, move || Ok(Box::new(dns.clone())));
        let spf = self.spf_server.clone();
        pipeline
            .ctx
            .objects
            .register_factory("spf_server", false, move || Ok(Box::new(spf.clone())));
        Ok(pipeline)
    }
}

/// Bring up the configured listeners and serve until shut down.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let registry = Arc::new(HandlerRegistry::build(
        &config,
        config.external_callback_processor.as_hook(),
    )?);
    log::info!(
        "loaded handlers: {}",
        registry.handler_names().join(", ")
    );

    let collector = Arc::new(MetricsCollector::new());
    Pipeline::register_base_metrics(&collector);
    registry.register_metrics(&collector);

    let shared = Arc::new(Shared {
        dns: Arc::new(HickoryDns::from_config(&config)?),
        spf_server: Arc::new(build_spf_server(&config)?),
        config: config.clone(),
        registry,
        collector: collector.clone(),
    });

    if let Some(port) = config.metrics_port {
        let registry = collector.registry();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(port, registry).await {
                log::error!("metrics endpoint failed: {e}");
            }
        });
    }

    install_shutdown_handler(&config.socket_path)?;

    let mut tasks = Vec::new();
    if let Some(listen) = config.proxy_listen.clone() {
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_proxy_listener(&listen, shared).await {
                log::error!("smtp proxy listener failed: {e}");
            }
        }));
    }
    {
        let shared = shared.clone();
        let socket_path = config.socket_path.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_milter_listener(&socket_path, shared).await {
                log::error!("milter listener failed: {e}");
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

fn install_shutdown_handler(socket_path: &str) -> anyhow::Result<()> {
    let socket_path = socket_path.to_string();
    ctrlc::set_handler(move || {
        log::info!("shutting down");
        if Path::new(&socket_path).exists() {
            if let Err(e) = std::fs::remove_file(&socket_path) {
                log::error!("failed to remove socket file: {e}");
            }
        }
        std::process::exit(0);
    })
    .map_err(|e| anyhow::anyhow!("failed to install signal handler: {e}"))
}

/// A `host:port` socket_path binds TCP; anything else is a unix socket
/// path.
fn is_tcp_endpoint(socket_path: &str) -> bool {
    socket_path.parse::<std::net::SocketAddr>().is_ok()
}

async fn run_milter_listener(socket_path: &str, shared: Arc<Shared>) -> anyhow::Result<()> {
    if is_tcp_endpoint(socket_path) {
        let listener = TcpListener::bind(socket_path).await?;
        log::info!("milter listening on tcp {socket_path}");
        loop {
            let (stream, peer) = listener.accept().await?;
            log::debug!("milter connection from {peer}");
            spawn_milter_worker(stream, shared.clone());
        }
    } else {
        if Path::new(socket_path).exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = Path::new(socket_path).parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let listener = UnixListener::bind(socket_path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(socket_path)?.permissions();
            perms.set_mode(0o660);
            std::fs::set_permissions(socket_path, perms)?;
        }
        log::info!("milter listening on unix socket {socket_path}");
        loop {
            let (stream, _) = listener.accept().await?;
            log::debug!("milter connection on unix socket");
            spawn_milter_worker(stream, shared.clone());
        }
    }
}

fn spawn_milter_worker<S>(stream: S, shared: Arc<Shared>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let pipeline = match shared.pipeline() {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::error!("failed to set up pipeline: {e}");
                return;
            }
        };
        let budget = shared.config.session_budget();
        let mut connection = MilterConnection::new(stream, pipeline);
        match connection.handle(budget).await {
            Ok(true) => log::warn!("worker recycling after callback failure"),
            Ok(false) => {}
            Err(e) => log::error!("milter connection error: {e}"),
        }
    });
}

async fn run_proxy_listener(listen: &str, shared: Arc<Shared>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    log::info!("smtp proxy listening on {listen}");
    let downstream = shared.config.proxy_downstream.clone();
    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug!("smtp proxy connection from {peer}");
        let shared = shared.clone();
        let downstream = downstream.clone();
        tokio::spawn(async move {
            let pipeline = match shared.pipeline() {
                Ok(pipeline) => pipeline,
                Err(e) => {
                    log::error!("failed to set up pipeline: {e}");
                    return;
                }
            };
            let budget = shared.config.session_budget();
            let peer_ip: IpAddr = peer.ip();
            let mut connection =
                SmtpProxyConnection::new(stream, peer_ip, pipeline, downstream);
            match connection.handle(budget).await {
                Ok(true) => log::warn!("worker recycling after callback failure"),
                Ok(false) => {}
                Err(e) => log::error!("smtp proxy connection error: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_endpoints_are_recognized() {
        assert!(is_tcp_endpoint("127.0.0.1:8893"));
        assert!(is_tcp_endpoint("[::1]:8893"));
        assert!(!is_tcp_endpoint("/var/run/auth-milter.sock"));
    }
}
