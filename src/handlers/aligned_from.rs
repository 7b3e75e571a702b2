use super::dkim::DkimVerdict;
use super::{section_config, CallbackStage, Handler};
use crate::addr;
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use mail_auth::{SpfOutput, SpfResult};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AlignedFromConfig {}

/// Compares the From header identity against the envelope sender (and any
/// passing DKIM domain) once the whole message is in.
pub struct AlignedFromHandler {
    _config: AlignedFromConfig,
}

impl AlignedFromHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            _config: section_config(section)?,
        })
    }
}

fn alignment(header_from: &str, env_from: &str) -> &'static str {
    if header_from.is_empty() || env_from.is_empty() {
        return "fail";
    }
    let header_from = header_from.to_lowercase();
    let env_from = env_from.to_lowercase();
    if header_from == env_from {
        return "pass";
    }
    let header_domain = addr::get_domain_from(&header_from);
    let env_domain = addr::get_domain_from(&env_from);
    if header_domain == env_domain {
        return "domain_pass";
    }
    if addr::org_domain(&header_domain) == addr::org_domain(&env_domain) {
        return "orgdomain_pass";
    }
    "fail"
}

#[async_trait]
impl Handler for AlignedFromHandler {
    fn name(&self) -> &'static str {
        "AlignedFrom"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        let (header_from, env_from) = match ctx.message.as_ref() {
            Some(message) => {
                let header_from = message
                    .headers
                    .iter()
                    .find(|(name, _)| name == "from")
                    .and_then(|(_, value)| addr::parse_addresses(value).into_iter().next())
                    .unwrap_or_default();
                let env_from = addr::parse_addresses(&message.env_from)
                    .into_iter()
                    .next()
                    .unwrap_or_default();
                (header_from, env_from)
            }
            None => return Ok(()),
        };

        let mut result = alignment(&header_from, &env_from);
        if result == "fail" && !header_from.is_empty() {
            // A passing DKIM signature or SPF identity for the From domain
            // still aligns it.
            let header_domain = addr::get_domain_from(&header_from);
            let dkim_aligned = ctx
                .objects
                .get_ref::<Vec<DkimVerdict>>("dkim_verdicts")
                .ok()
                .flatten()
                .map(|verdicts| {
                    verdicts.iter().any(|v| {
                        v.result == "pass" && v.domain.to_lowercase() == header_domain
                    })
                })
                .unwrap_or(false);
            if dkim_aligned {
                result = "dkim_pass";
            } else {
                let spf_aligned = ctx
                    .objects
                    .get_ref::<SpfOutput>("spf_output")
                    .ok()
                    .flatten()
                    .map(|output| {
                        matches!(output.result(), SpfResult::Pass)
                            && output.domain().eq_ignore_ascii_case(&header_domain)
                    })
                    .unwrap_or(false);
                if spf_aligned {
                    result = "spf_pass";
                }
            }
        }

        let mut entry = AuthEntry::new("x-aligned-from", result);
        if !header_from.is_empty() {
            entry = entry.with_prop("header.from", &header_from);
        }
        if !env_from.is_empty() {
            entry = entry.with_prop("smtp.mailfrom", &env_from);
        }
        ctx.add_auth_header(AuthFragment::Structured(entry));
        Ok(())
    }
}
