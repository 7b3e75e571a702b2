use super::{section_config, CallbackStage, Handler};
use crate::dns::{Dns, DnsError};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::ipmap::{IpPrefix, Overlap};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn default_true() -> bool {
    true
}

fn default_lookup_timeout() -> u64 {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IPrevConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Budget for the whole PTR + forward-confirm scope, seconds.
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout: u64,
}

impl Default for IPrevConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookup_timeout: default_lookup_timeout(),
        }
    }
}

enum IprevOutcome {
    Pass(String),
    Fail(String),
    TempError(String),
}

/// Forward-confirmed reverse DNS: PTR the peer, then confirm one returned
/// name resolves back to the same address.
pub struct IPrevHandler {
    config: IPrevConfig,
}

impl IPrevHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }

    async fn check(&self, dns: Arc<dyn Dns>, ip: IpAddr) -> IprevOutcome {
        let names = match dns.ptr(ip).await {
            Ok(names) if !names.is_empty() => names,
            Ok(_) | Err(DnsError::NotFound) => return IprevOutcome::Fail("NOT FOUND".to_string()),
            Err(e) => return IprevOutcome::TempError(e.to_string()),
        };

        let target = IpPrefix::from_ip(ip);
        for name in &names {
            let mut forward: Vec<IpAddr> = match dns.a(name).await {
                Ok(addrs) => addrs.into_iter().map(IpAddr::V4).collect(),
                Err(_) => Vec::new(),
            };
            if forward.is_empty() {
                forward = match dns.aaaa(name).await {
                    Ok(addrs) => addrs.into_iter().map(IpAddr::V6).collect(),
                    Err(_) => Vec::new(),
                };
            }
            if forward
                .iter()
                .any(|addr| IpPrefix::from_ip(*addr).overlap(&target) == Overlap::Identical)
            {
                return IprevOutcome::Pass(name.clone());
            }
        }
        IprevOutcome::Fail(names[0].clone())
    }
}

#[async_trait]
impl Handler for IPrevHandler {
    fn name(&self) -> &'static str {
        "IPrev"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Connect]
    }

    async fn connect(
        &self,
        ctx: &mut ConnectionContext,
        _hostname: &str,
        ip: IpAddr,
    ) -> Result<(), PipelineError> {
        if !self.config.enabled {
            return Ok(());
        }
        if ctx.is_local() || ctx.is_trusted() || ctx.is_authenticated() {
            ctx.logdebug("iprev", "skipped for local/trusted/authenticated peer");
            return Ok(());
        }

        let dns = ctx.dns()?;
        ctx.timer
            .arm_handler(Duration::from_secs(self.config.lookup_timeout));
        let outcome = self.check(dns, ip).await;
        ctx.timer.reset_to_outer("iprev")?;

        let (result, domain) = match outcome {
            IprevOutcome::Pass(domain) => {
                ctx.set_state("IPrev", &domain);
                ("pass", domain)
            }
            IprevOutcome::Fail(domain) => ("fail", domain),
            IprevOutcome::TempError(detail) => {
                ctx.logdebug("iprev", &format!("lookup problem: {detail}"));
                ("temperror", detail)
            }
        };
        ctx.add_c_auth_header(AuthFragment::Structured(
            AuthEntry::new("iprev", result).with_prop_comment(
                "policy.iprev",
                &ip.to_string(),
                &domain,
            ),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderStyle;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[derive(Default)]
    struct MockDns {
        ptr: HashMap<IpAddr, Vec<String>>,
        a: HashMap<String, Vec<Ipv4Addr>>,
    }

    #[async_trait]
    impl Dns for MockDns {
        async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
            self.ptr.get(&ip).cloned().ok_or(DnsError::NotFound)
        }

        async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
            self.a.get(name).cloned().ok_or(DnsError::NotFound)
        }

        async fn aaaa(&self, _name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
            Err(DnsError::NotFound)
        }

        async fn txt(&self, _name: &str) -> Result<Vec<String>, DnsError> {
            Err(DnsError::NotFound)
        }

        async fn mx(&self, _name: &str) -> Result<Vec<String>, DnsError> {
            Err(DnsError::NotFound)
        }
    }

    fn ctx_with(dns: MockDns) -> ConnectionContext {
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        let shared: Arc<dyn Dns> = Arc::new(dns);
        ctx.objects.set_object("resolver", shared, false);
        ctx
    }

    fn rendered(ctx: &ConnectionContext) -> String {
        ctx.headers
            .serialize_auth_results("mx.example.com", &HeaderStyle::default(), &|_, _, _| None)
    }

    #[tokio::test]
    async fn confirmed_ptr_passes_and_records_domain() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let mut dns = MockDns::default();
        dns.ptr.insert(ip, vec!["mail.example.com".to_string()]);
        dns.a.insert(
            "mail.example.com".to_string(),
            vec!["192.0.2.10".parse().unwrap()],
        );
        let mut ctx = ctx_with(dns);
        let handler = IPrevHandler::from_config(serde_yaml::Value::Null).unwrap();
        handler.connect(&mut ctx, "unknown", ip).await.unwrap();
        assert_eq!(ctx.get_state("IPrev"), Some("mail.example.com"));
        assert!(rendered(&ctx)
            .contains("iprev=pass policy.iprev=192.0.2.10 (mail.example.com)"));
    }

    #[tokio::test]
    async fn mismatched_forward_fails() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let mut dns = MockDns::default();
        dns.ptr.insert(ip, vec!["mail.example.com".to_string()]);
        dns.a.insert(
            "mail.example.com".to_string(),
            vec!["198.51.100.1".parse().unwrap()],
        );
        let mut ctx = ctx_with(dns);
        let handler = IPrevHandler::from_config(serde_yaml::Value::Null).unwrap();
        handler.connect(&mut ctx, "unknown", ip).await.unwrap();
        assert_eq!(ctx.get_state("IPrev"), None);
        assert!(rendered(&ctx).contains("iprev=fail policy.iprev=192.0.2.10 (mail.example.com)"));
    }

    #[tokio::test]
    async fn missing_ptr_fails_with_not_found() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let mut ctx = ctx_with(MockDns::default());
        let handler = IPrevHandler::from_config(serde_yaml::Value::Null).unwrap();
        handler.connect(&mut ctx, "unknown", ip).await.unwrap();
        assert!(rendered(&ctx).contains("iprev=fail policy.iprev=192.0.2.10 (NOT FOUND)"));
    }

    #[tokio::test]
    async fn local_peer_is_skipped() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let mut ctx = ctx_with(MockDns::default());
        ctx.set_state("LocalIP", "yes");
        let handler = IPrevHandler::from_config(serde_yaml::Value::Null).unwrap();
        handler.connect(&mut ctx, "unknown", ip).await.unwrap();
        assert!(rendered(&ctx).ends_with("none"));
    }
}
