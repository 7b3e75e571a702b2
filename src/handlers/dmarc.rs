use super::{section_config, CallbackStage, Handler};
use crate::addr;
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use mail_auth::{dmarc, AuthenticatedMessage, DmarcResult, SpfOutput};
use serde::Deserialize;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DmarcConfig {
    /// Reject when the published policy is reject and the check fails.
    pub hard_reject: bool,
    /// Quarantine instead of passing failures through.
    #[serde(default = "default_true")]
    pub use_quarantine: bool,
}

impl Default for DmarcConfig {
    fn default() -> Self {
        Self {
            hard_reject: false,
            use_quarantine: true,
        }
    }
}

pub fn dmarc_result_str(result: &DmarcResult) -> &'static str {
    match result {
        DmarcResult::Pass => "pass",
        DmarcResult::Fail(_) => "fail",
        DmarcResult::TempError(_) => "temperror",
        DmarcResult::PermError(_) => "permerror",
        DmarcResult::None => "none",
    }
}

fn policy_str(policy: dmarc::Policy) -> &'static str {
    match policy {
        dmarc::Policy::Reject => "reject",
        dmarc::Policy::Quarantine => "quarantine",
        _ => "none",
    }
}

/// Evaluates the published DMARC policy for the aligned From domain,
/// combining the stored SPF output with a DKIM verification of the
/// buffered message. Requires SPF and DKIM earlier in the chain.
pub struct DmarcHandler {
    config: DmarcConfig,
}

impl DmarcHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for DmarcHandler {
    fn name(&self) -> &'static str {
        "DMARC"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        if ctx.is_local() || ctx.is_trusted() || ctx.is_authenticated() {
            return Ok(());
        }
        let (raw, env_from) = match ctx.message.as_ref() {
            Some(message) if !message.raw_message.is_empty() => {
                (message.raw_message.clone(), message.env_from.clone())
            }
            _ => return Ok(()),
        };
        let Some(parsed) = AuthenticatedMessage::parse(&raw) else {
            return Ok(());
        };

        let sender = addr::parse_addresses(&env_from)
            .into_iter()
            .next()
            .unwrap_or_default();
        let domain = if sender.is_empty() {
            ctx.helo_name.clone().unwrap_or_default()
        } else {
            addr::get_domain_from(&sender)
        };

        if !ctx.objects.contains("spf_output") {
            ctx.logdebug("dmarc", "no SPF result available, skipping");
            return Ok(());
        }
        let spf_server = ctx.spf_server()?;
        let dkim_outputs = spf_server.verify_dkim(&parsed).await;
        let Some(spf_output) = ctx
            .objects
            .get_ref::<SpfOutput>("spf_output")
            .map_err(|e| PipelineError::Config(e.to_string()))?
        else {
            return Ok(());
        };
        let output = spf_server
            .verify_dmarc(&parsed, &dkim_outputs, &domain, spf_output)
            .await;

        let result = if matches!(output.spf_result(), DmarcResult::Pass)
            || matches!(output.dkim_result(), DmarcResult::Pass)
        {
            "pass"
        } else if !matches!(output.spf_result(), DmarcResult::None) {
            dmarc_result_str(output.spf_result())
        } else {
            dmarc_result_str(output.dkim_result())
        };
        let policy = output.policy();

        let from_domain = addr::get_domain_from(parsed.from());
        ctx.add_auth_header(AuthFragment::Structured(
            AuthEntry::new("dmarc", result)
                .with_prop("header.from", &from_domain)
                .with_prop("policy.dmarc", policy_str(policy)),
        ));

        if result != "pass" {
            if matches!(policy, dmarc::Policy::Reject) && self.config.hard_reject {
                ctx.reject_mail("550 5.7.1 DMARC policy violation");
            } else if matches!(policy, dmarc::Policy::Reject | dmarc::Policy::Quarantine)
                && self.config.use_quarantine
            {
                ctx.quarantine_mail("DMARC policy");
            }
        }
        Ok(())
    }
}
