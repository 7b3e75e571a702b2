use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PtrConfig {}

/// Compares the verified reverse name recorded by IPrev against the HELO
/// hostname.
pub struct PtrHandler {
    _config: PtrConfig,
}

impl PtrHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            _config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for PtrHandler {
    fn name(&self) -> &'static str {
        "PTR"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Helo]
    }

    async fn helo(&self, ctx: &mut ConnectionContext, helo: &str) -> Result<(), PipelineError> {
        let matched = ctx
            .get_state("IPrev")
            .map(|verified| verified.eq_ignore_ascii_case(helo.trim_end_matches('.')))
            .unwrap_or(false);
        let result = if matched { "pass" } else { "fail" };
        ctx.add_c_auth_header(AuthFragment::Structured(
            AuthEntry::new("x-ptr", result).with_prop("policy.ptr", helo),
        ));
        Ok(())
    }
}
