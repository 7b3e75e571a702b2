use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LocalIpConfig {
    /// Also announce the classification as a connection fragment.
    pub add_header: bool,
}

/// Classifies loopback, link-local and RFC 1918 peers so later handlers
/// can skip checks that make no sense for local traffic.
pub struct LocalIpHandler {
    config: LocalIpConfig,
}

impl LocalIpHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }
}

fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local, fe80::/10 link-local
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[async_trait]
impl Handler for LocalIpHandler {
    fn name(&self) -> &'static str {
        "LocalIP"
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
        if !is_local_ip(ip) {
            return Ok(());
        }
        ctx.set_state("LocalIP", "yes");
        ctx.logdebug("local_ip", &format!("{ip} classified as local"));
        if self.config.add_header {
            ctx.add_c_auth_header(AuthFragment::Structured(
                AuthEntry::new("x-local-ip", "pass").with_prop("policy.local", &ip.to_string()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_and_private_are_local() {
        let handler = LocalIpHandler::from_config(serde_yaml::Value::Null).unwrap();
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        handler
            .connect(&mut ctx, "localhost", "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert!(ctx.is_local());

        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        handler
            .connect(&mut ctx, "lan", "10.1.2.3".parse().unwrap())
            .await
            .unwrap();
        assert!(ctx.is_local());
    }

    #[tokio::test]
    async fn public_peer_is_not_local() {
        let handler = LocalIpHandler::from_config(serde_yaml::Value::Null).unwrap();
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        handler
            .connect(&mut ctx, "remote", "192.0.2.10".parse().unwrap())
            .await
            .unwrap();
        assert!(!ctx.is_local());
    }

    #[test]
    fn v6_unique_local_is_local() {
        assert!(is_local_ip("fd00::1".parse().unwrap()));
        assert!(is_local_ip("fe80::1".parse().unwrap()));
        assert!(!is_local_ip("2001:db8::1".parse().unwrap()));
    }
}
