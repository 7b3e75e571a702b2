use super::{section_config, CallbackStage, Handler};
use crate::addr;
use crate::dns::{Dns, DnsError};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ReturnOkConfig {
    /// Also check recipient domains, not just the return path.
    pub check_recipients: bool,
}

/// Advisory check that the return path (and optionally each recipient
/// domain) can actually receive mail: MX first, then A as fallback.
pub struct ReturnOkHandler {
    config: ReturnOkConfig,
}

impl ReturnOkHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }

    async fn probe(dns: Arc<dyn Dns>, domain: &str) -> &'static str {
        match dns.mx(domain).await {
            Ok(hosts) if !hosts.is_empty() => return "pass",
            Ok(_) | Err(DnsError::NotFound) => {}
            Err(_) => return "temperror",
        }
        match dns.a(domain).await {
            Ok(addrs) if !addrs.is_empty() => "warn",
            Ok(_) | Err(DnsError::NotFound) => "fail",
            Err(_) => "temperror",
        }
    }

    async fn check_domain(
        &self,
        ctx: &mut ConnectionContext,
        raw_addr: &str,
    ) -> Result<(), PipelineError> {
        let domain = addr::get_domain_from(raw_addr);
        if domain == addr::NULL_DOMAIN {
            return Ok(());
        }
        let dns = ctx.dns()?;
        let result = Self::probe(dns, &domain).await;
        ctx.add_auth_header(AuthFragment::Structured(
            AuthEntry::new("x-return-mx", result).with_prop("policy.return", &domain),
        ));
        Ok(())
    }
}

#[async_trait]
impl Handler for ReturnOkHandler {
    fn name(&self) -> &'static str {
        "ReturnOK"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::EnvFrom, CallbackStage::EnvRcpt]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, from: &str) -> Result<(), PipelineError> {
        self.check_domain(ctx, from).await
    }

    async fn envrcpt(&self, ctx: &mut ConnectionContext, rcpt: &str) -> Result<(), PipelineError> {
        if !self.config.check_recipients {
            return Ok(());
        }
        self.check_domain(ctx, rcpt).await
    }
}
