use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AddIdConfig {}

/// Appends the product marker header to every message.
pub struct AddIdHandler {
    _config: AddIdConfig,
}

impl AddIdHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            _config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for AddIdHandler {
    fn name(&self) -> &'static str {
        "AddID"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        ctx.headers.append_header(
            "X-Authentication-Milter",
            "Header added by Authentication Milter",
        );
        Ok(())
    }
}
