use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Suppress the auth=pass fragment and only record the classification.
    pub hide_result: bool,
}

/// Records SMTP AUTH, read from the `auth_authen` macro the MTA supplies
/// at MAIL FROM.
pub struct AuthHandler {
    config: AuthConfig,
}

impl AuthHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }
}

#[async_trait]
impl Handler for AuthHandler {
    fn name(&self) -> &'static str {
        "Auth"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, _from: &str) -> Result<(), PipelineError> {
        let user = match ctx.symbols.get_symbol("auth_authen") {
            Some(user) if !user.is_empty() => user.to_string(),
            _ => return Ok(()),
        };
        // Authentication holds for the whole connection; record it once.
        if ctx.get_state("Auth") == Some(user.as_str()) {
            return Ok(());
        }
        ctx.set_state("Auth", &user);
        ctx.logdebug("auth", &format!("authenticated as {user}"));
        if !self.config.hide_result {
            ctx.add_c_auth_header(AuthFragment::Structured(
                AuthEntry::new("auth", "pass").with_prop("smtp.auth", &user),
            ));
        }
        Ok(())
    }
}
