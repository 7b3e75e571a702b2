use super::{section_config, CallbackStage, Handler};
use crate::addr;
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use mail_auth::SpfResult;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SpfConfig {
    /// Reject outright on an SPF hard fail.
    pub hard_reject: bool,
    /// Suppress the fragment when the domain publishes no record.
    pub hide_none: bool,
}

pub fn spf_result_str(result: SpfResult) -> &'static str {
    match result {
        SpfResult::Pass => "pass",
        SpfResult::Fail => "fail",
        SpfResult::SoftFail => "softfail",
        SpfResult::Neutral => "neutral",
        SpfResult::TempError => "temperror",
        SpfResult::PermError => "permerror",
        SpfResult::None => "none",
    }
}

/// Checks the envelope sender against the sending address via the SPF
/// engine. Falls back to the HELO identity for the null sender. The raw
/// output is parked in the object store for DMARC.
pub struct SpfHandler {
    config: SpfConfig,
}

impl SpfHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for SpfHandler {
    fn name(&self) -> &'static str {
        "SPF"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, from: &str) -> Result<(), PipelineError> {
        if ctx.is_local() || ctx.is_trusted() || ctx.is_authenticated() {
            ctx.logdebug("spf", "skipped for local/trusted/authenticated peer");
            return Ok(());
        }
        let Some(ip) = ctx.ip else {
            return Ok(());
        };
        let helo = ctx.helo_name.clone().unwrap_or_default();
        let hostname = ctx.hostname.clone();
        let sender = addr::parse_addresses(from)
            .into_iter()
            .next()
            .unwrap_or_default();

        let spf = ctx.spf_server()?;
        let output = if sender.is_empty() {
            spf.verify_spf_helo(ip, &helo, &hostname).await
        } else {
            spf.verify_spf_sender(ip, &helo, &hostname, &sender).await
        };
        let result = output.result();

        if !(matches!(result, SpfResult::None) && self.config.hide_none) {
            let entry = if sender.is_empty() {
                AuthEntry::new("spf", spf_result_str(result)).with_prop("smtp.helo", &helo)
            } else {
                AuthEntry::new("spf", spf_result_str(result)).with_prop("smtp.mailfrom", &sender)
            };
            ctx.add_auth_header(AuthFragment::Structured(entry));
        }
        if matches!(result, SpfResult::Fail) && self.config.hard_reject {
            ctx.reject_mail("550 5.7.1 SPF hardfail");
        }
        ctx.objects.set_object("spf_output", output, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_strings_are_rfc_values() {
        assert_eq!(spf_result_str(SpfResult::Pass), "pass");
        assert_eq!(spf_result_str(SpfResult::SoftFail), "softfail");
        assert_eq!(spf_result_str(SpfResult::TempError), "temperror");
        assert_eq!(spf_result_str(SpfResult::None), "none");
    }

    #[tokio::test]
    async fn trusted_peer_is_skipped() {
        let handler = SpfHandler::from_config(serde_yaml::Value::Null).unwrap();
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        ctx.ip = Some("192.0.2.10".parse().unwrap());
        ctx.set_state("TrustedIP", "yes");
        // No spf_server factory registered: the skip path must not need it.
        handler.envfrom(&mut ctx, "alice@example.com").await.unwrap();
        assert!(!ctx.objects.contains("spf_output"));
    }
}
