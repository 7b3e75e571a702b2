use super::{section_config, CallbackStage, Handler};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SanitizeConfig {
    /// Extra AuthServIDs to strip, on top of the global hosts_to_remove.
    pub remove_hosts: Vec<String>,
}

/// Blanks inbound Authentication-Results headers claiming to be from us
/// (or any configured AuthServID) so upstream forgeries cannot survive
/// into delivery.
pub struct SanitizeHandler {
    hosts: Vec<String>,
}

impl SanitizeHandler {
    pub fn from_config(config: &Config, section: serde_yaml::Value) -> anyhow::Result<Self> {
        let local: SanitizeConfig = section_config(section)?;
        let mut hosts: Vec<String> = config
            .hosts_to_remove
            .iter()
            .chain(local.remove_hosts.iter())
            .map(|h| h.to_lowercase())
            .collect();
        hosts.push(config.authserv_id().to_lowercase());
        hosts.dedup();
        Ok(Self { hosts })
    }
}

/// The AuthServID is the first token of the header value, up to the first
/// semicolon.
fn authserv_id(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[async_trait]
impl Handler for SanitizeHandler {
    fn name(&self) -> &'static str {
        "Sanitize"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Header]
    }

    async fn header(
        &self,
        ctx: &mut ConnectionContext,
        name: &str,
        value: &str,
    ) -> Result<(), PipelineError> {
        if !name.eq_ignore_ascii_case("Authentication-Results") {
            return Ok(());
        }
        let id = authserv_id(value);
        if !self.hosts.contains(&id) {
            return Ok(());
        }
        let occurrence = ctx
            .message
            .as_ref()
            .and_then(|message| message.header_count.get("authentication-results"))
            .copied()
            .unwrap_or(1);
        ctx.loginfo(
            "sanitize",
            &format!("removing forged Authentication-Results claiming {id}"),
        );
        ctx.headers
            .change_header("Authentication-Results", occurrence, "");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderOp;
    use crate::pipeline::MessageContext;

    fn handler_for(host: &str) -> SanitizeHandler {
        let config = Config {
            hostname: Some(host.to_string()),
            ..Config::default()
        };
        SanitizeHandler::from_config(&config, serde_yaml::Value::Null).unwrap()
    }

    fn ctx_with_count(count: u32) -> ConnectionContext {
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        let mut message = MessageContext::default();
        message
            .header_count
            .insert("authentication-results".to_string(), count);
        ctx.message = Some(message);
        ctx
    }

    #[tokio::test]
    async fn forged_header_is_blanked() {
        let handler = handler_for("mx.example.com");
        let mut ctx = ctx_with_count(2);
        handler
            .header(
                &mut ctx,
                "Authentication-Results",
                "mx.example.com; spf=pass",
            )
            .await
            .unwrap();
        let ops = ctx.headers.emit_ops(
            "mx.example.com",
            &crate::headers::HeaderStyle::default(),
            None,
            &|_, _, _| None,
        );
        assert!(ops.contains(&HeaderOp::Change {
            name: "Authentication-Results".to_string(),
            occurrence: 2,
            value: String::new(),
        }));
    }

    #[tokio::test]
    async fn foreign_results_are_left_alone() {
        let handler = handler_for("mx.example.com");
        let mut ctx = ctx_with_count(1);
        handler
            .header(
                &mut ctx,
                "Authentication-Results",
                "other.example.net; spf=pass",
            )
            .await
            .unwrap();
        let ops = ctx.headers.emit_ops(
            "mx.example.com",
            &crate::headers::HeaderStyle::default(),
            None,
            &|_, _, _| None,
        );
        assert!(!ops
            .iter()
            .any(|op| matches!(op, HeaderOp::Change { .. })));
    }

    #[test]
    fn authserv_id_extraction() {
        assert_eq!(authserv_id("MX.Example.Com; spf=pass"), "mx.example.com");
        assert_eq!(authserv_id("  mx.example.com (comment); x"), "mx.example.com");
        assert_eq!(authserv_id(""), "");
    }
}
