use crate::config::Config;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("lookup timed out")]
    Timeout,
    #[error("no records found")]
    NotFound,
    #[error("lookup failed: {0}")]
    Lookup(String),
}

impl From<ResolveError> for DnsError {
    fn from(e: ResolveError) -> Self {
        match e.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
            ResolveErrorKind::Timeout => DnsError::Timeout,
            _ => DnsError::Lookup(e.to_string()),
        }
    }
}

/// The lookups handlers perform directly. A trait so tests can register a
/// scripted client through the object-store factory.
#[async_trait]
pub trait Dns: Send + Sync {
    async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError>;
    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError>;
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError>;
}

/// Resolver configuration shared by the direct client and the SPF/DKIM
/// engine: configured nameservers or the system settings, with the
/// configured query timeout and retry count.
fn resolver_parts(config: &Config) -> anyhow::Result<(ResolverConfig, ResolverOpts)> {
    let (resolver_config, mut opts) = if config.dns_resolvers.is_empty() {
        read_system_conf()?
    } else {
        let mut rc = ResolverConfig::new();
        for server in &config.dns_resolvers {
            let addr: SocketAddr = if server.contains(':') && server.parse::<IpAddr>().is_err() {
                server
                    .parse()
                    .map_err(|e| anyhow::anyhow!("bad dns_resolvers entry {server:?}: {e}"))?
            } else {
                let ip: IpAddr = server
                    .parse()
                    .map_err(|e| anyhow::anyhow!("bad dns_resolvers entry {server:?}: {e}"))?;
                SocketAddr::new(ip, 53)
            };
            rc.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
            rc.add_name_server(NameServerConfig::new(addr, Protocol::Tcp));
        }
        (rc, ResolverOpts::default())
    };
    opts.timeout = Duration::from_secs(config.dns_timeout.max(1));
    opts.attempts = config.dns_retry.max(1);
    opts.edns0 = true;
    Ok((resolver_config, opts))
}

/// Hickory-backed production client.
pub struct HickoryDns {
    resolver: TokioAsyncResolver,
}

impl HickoryDns {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let (rc, opts) = resolver_parts(config)?;
        Ok(Self {
            resolver: TokioAsyncResolver::tokio(rc, opts),
        })
    }
}

#[async_trait]
impl Dns for HickoryDns {
    async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let response = self.resolver.reverse_lookup(ip).await?;
        Ok(response
            .iter()
            .map(|name| name.0.to_string().trim_end_matches('.').to_string())
            .collect())
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let response = self.resolver.ipv4_lookup(name).await?;
        Ok(response.iter().map(|a| a.0).collect())
    }

    async fn aaaa(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let response = self.resolver.ipv6_lookup(name).await?;
        Ok(response.iter().map(|aaaa| aaaa.0).collect())
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let response = self.resolver.txt_lookup(name).await?;
        Ok(response.iter().map(|txt| txt.to_string()).collect())
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let response = self.resolver.mx_lookup(name).await?;
        Ok(response
            .iter()
            .map(|mx| mx.exchange().to_string().trim_end_matches('.').to_string())
            .collect())
    }
}

/// The mail-auth engine used for SPF, DKIM and DMARC verification. Shares
/// the nameserver and timeout settings with the direct client.
pub fn build_spf_server(config: &Config) -> anyhow::Result<mail_auth::Resolver> {
    let (rc, opts) = resolver_parts(config)?;
    mail_auth::Resolver::with_capacities(rc, opts, 128, 128, 128, 128, 128)
        .map_err(|e| anyhow::anyhow!("failed to build mail-auth resolver: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_nameservers_parse() {
        let config = Config {
            dns_resolvers: vec!["192.0.2.53".to_string(), "192.0.2.54:5353".to_string()],
            ..Config::default()
        };
        let (rc, opts) = resolver_parts(&config).unwrap();
        // One UDP and one TCP entry per server.
        assert_eq!(rc.name_servers().len(), 4);
        assert_eq!(opts.timeout, Duration::from_secs(8));
        assert_eq!(opts.attempts, 2);
    }

    #[test]
    fn bad_nameserver_is_rejected() {
        let config = Config {
            dns_resolvers: vec!["not-an-ip".to_string()],
            ..Config::default()
        };
        assert!(resolver_parts(&config).is_err());
    }
}
