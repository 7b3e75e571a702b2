use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {}

/// Reports the transport security of the inbound hop, from the TLS macros
/// the MTA supplies at MAIL FROM.
pub struct TlsHandler {
    _config: TlsConfig,
}

impl TlsHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            _config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for TlsHandler {
    fn name(&self) -> &'static str {
        "TLS"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, _from: &str) -> Result<(), PipelineError> {
        let version = match ctx.symbols.get_symbol("tls_version") {
            Some(version) if !version.is_empty() => version.to_string(),
            _ => return Ok(()),
        };
        // The TLS layer holds for the whole connection; record it once.
        if ctx.get_state("TLS").is_some() {
            return Ok(());
        }
        ctx.set_state("TLS", &version);
        let mut entry = AuthEntry::new("x-tls", "pass").with_prop("smtp.tls-version", &version);
        if let Some(cipher) = ctx.symbols.get_symbol("cipher") {
            let cipher = cipher.to_string();
            entry = entry.with_prop("smtp.cipher", &cipher);
        }
        if let Some(bits) = ctx.symbols.get_symbol("cipher_bits") {
            let bits = bits.to_string();
            entry = entry.with_prop("smtp.cipher-bits", &bits);
        }
        ctx.add_c_auth_header(AuthFragment::Structured(entry));
        Ok(())
    }
}
