use super::{section_config, CallbackStage, Handler};
use super::spf::spf_result_str;
use crate::addr;
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SenderIdConfig {}

// PRA precedence per RFC 4407.
const PRA_HEADERS: [&str; 4] = ["resent-sender", "resent-from", "sender", "from"];

/// Legacy Sender ID check: evaluates the purported responsible address
/// through the SPF engine once the headers are in.
pub struct SenderIdHandler {
    _config: SenderIdConfig,
}

impl SenderIdHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            _config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for SenderIdHandler {
    fn name(&self) -> &'static str {
        "SenderID"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eoh]
    }

    async fn eoh(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        if ctx.is_local() || ctx.is_trusted() || ctx.is_authenticated() {
            return Ok(());
        }
        let Some(ip) = ctx.ip else {
            return Ok(());
        };
        let pra = ctx.message.as_ref().and_then(|message| {
            PRA_HEADERS.iter().find_map(|name| {
                message
                    .headers
                    .iter()
                    .find(|(header, _)| header == name)
                    .and_then(|(_, value)| addr::parse_addresses(value).into_iter().next())
                    .filter(|address| !address.is_empty())
            })
        });
        let Some(pra) = pra else {
            return Ok(());
        };

        let helo = ctx.helo_name.clone().unwrap_or_default();
        let hostname = ctx.hostname.clone();
        let spf = ctx.spf_server()?;
        let output = spf.verify_spf_sender(ip, &helo, &hostname, &pra).await;
        ctx.add_auth_header(AuthFragment::Structured(
            AuthEntry::new("senderid", spf_result_str(output.result()))
                .with_prop("header.pra", &pra),
        ));
        Ok(())
    }
}
