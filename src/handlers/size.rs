use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SizeConfig {
    /// Reject bodies above this many bytes.
    pub max_size: Option<u64>,
}

/// Reports the final body size and optionally enforces a ceiling.
pub struct SizeHandler {
    config: SizeConfig,
}

impl SizeHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for SizeHandler {
    fn name(&self) -> &'static str {
        "Size"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        let Some(bytes) = ctx.message.as_ref().map(|message| message.body_bytes) else {
            return Ok(());
        };
        ctx.add_auth_header(AuthFragment::Structured(
            AuthEntry::new("x-size", &bytes.to_string()).with_prop("policy.size", "body"),
        ));
        if let Some(max) = self.config.max_size {
            if bytes > max {
                ctx.loginfo("size", &format!("body of {bytes} bytes exceeds {max}"));
                ctx.reject_mail("552 5.3.4 Message too big");
            }
        }
        Ok(())
    }
}
