use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::ipmap::IpPrefix;
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TrustedIpConfig {
    /// CIDR prefixes of relays whose mail is taken on trust.
    pub trusted_ip_list: Vec<String>,
    pub add_header: bool,
}

/// Matches the peer against the configured trusted relay list.
pub struct TrustedIpHandler {
    config: TrustedIpConfig,
    prefixes: Vec<IpPrefix>,
}

impl TrustedIpHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        let config: TrustedIpConfig = section_config(section)?;
        let prefixes = config
            .trusted_ip_list
            .iter()
            .map(|entry| {
                IpPrefix::parse(entry)
                    .map_err(|e| anyhow::anyhow!("bad trusted_ip_list entry {entry:?}: {e}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self { config, prefixes })
    }
}

#[async_trait]
impl Handler for TrustedIpHandler {
    fn name(&self) -> &'static str {
        "TrustedIP"
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
        if !self.prefixes.iter().any(|prefix| prefix.contains(ip)) {
            return Ok(());
        }
        ctx.set_state("TrustedIP", "yes");
        ctx.logdebug("trusted_ip", &format!("{ip} matched trusted_ip_list"));
        if self.config.add_header {
            ctx.add_c_auth_header(AuthFragment::Structured(
                AuthEntry::new("x-trusted-ip", "pass").with_prop("policy.trusted", &ip.to_string()),
            ));
        }
        Ok(())
    }
}
