use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use mail_auth::common::verify::VerifySignature;
use mail_auth::{AuthenticatedMessage, DkimResult};
use serde::Deserialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DkimConfig {
    /// Suppress the dkim=none fragment for unsigned mail.
    pub hide_none: bool,
}

/// Owned per-signature verdict, parked in the object store for the
/// handlers that align identities after verification.
#[derive(Debug, Clone)]
pub struct DkimVerdict {
    pub result: String,
    pub domain: String,
    pub selector: String,
}

pub fn dkim_result_parts(result: &DkimResult) -> (&'static str, Option<String>) {
    match result {
        DkimResult::Pass => ("pass", None),
        DkimResult::Neutral(err) => ("neutral", Some(err.to_string())),
        DkimResult::Fail(err) => ("fail", Some(err.to_string())),
        DkimResult::PermError(err) => ("permerror", Some(err.to_string())),
        DkimResult::TempError(err) => ("temperror", Some(err.to_string())),
        DkimResult::None => ("none", None),
    }
}

/// Verifies the DKIM signatures of the buffered message at end of message,
/// one fragment per signature.
pub struct DkimHandler {
    config: DkimConfig,
}

impl DkimHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }

    fn emit_none(&self, ctx: &mut ConnectionContext) {
        if !self.config.hide_none {
            ctx.add_auth_header(AuthFragment::Structured(AuthEntry::new("dkim", "none")));
        }
    }
}

#[async_trait]
impl Handler for DkimHandler {
    fn name(&self) -> &'static str {
        "DKIM"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    fn can_sort_header(&self, key: &str) -> bool {
        key == "dkim"
    }

    /// Passing signatures sort ahead of failures; ties stay lexical.
    fn header_sort(&self, a: &str, b: &str) -> Ordering {
        let rank = |s: &str| usize::from(!s.starts_with("dkim=pass"));
        rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        let raw = match ctx.message.as_ref() {
            Some(message) if !message.raw_message.is_empty() => message.raw_message.clone(),
            _ => {
                self.emit_none(ctx);
                return Ok(());
            }
        };
        let Some(parsed) = AuthenticatedMessage::parse(&raw) else {
            ctx.logdebug("dkim", "message failed to parse");
            ctx.add_auth_header(AuthFragment::Structured(
                AuthEntry::new("dkim", "permerror").with_comment("message parse failed"),
            ));
            return Ok(());
        };

        let spf_server = ctx.spf_server()?;
        let outputs = spf_server.verify_dkim(&parsed).await;
        if outputs.is_empty() {
            self.emit_none(ctx);
            return Ok(());
        }

        let mut verdicts = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let (result, detail) = dkim_result_parts(output.result());
            let mut entry = AuthEntry::new("dkim", result);
            if let Some(detail) = &detail {
                entry = entry.with_comment(detail);
            }
            let (domain, selector) = match output.signature() {
                Some(signature) => {
                    entry = entry
                        .with_prop("header.d", signature.domain())
                        .with_prop("header.s", signature.selector());
                    (
                        signature.domain().to_string(),
                        signature.selector().to_string(),
                    )
                }
                None => (String::new(), String::new()),
            };
            ctx.add_auth_header(AuthFragment::Structured(entry));
            verdicts.push(DkimVerdict {
                result: result.to_string(),
                domain,
                selector,
            });
        }
        ctx.objects.set_object("dkim_verdicts", verdicts, true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_mapping_carries_detail() {
        let (result, detail) = dkim_result_parts(&DkimResult::Pass);
        assert_eq!(result, "pass");
        assert!(detail.is_none());
        let (result, detail) =
            dkim_result_parts(&DkimResult::Fail(mail_auth::Error::SignatureExpired));
        assert_eq!(result, "fail");
        assert!(detail.is_some());
    }

    #[test]
    fn sort_puts_passes_first() {
        let handler = DkimHandler::from_config(serde_yaml::Value::Null).unwrap();
        assert!(handler.can_sort_header("dkim"));
        assert!(!handler.can_sort_header("spf"));
        assert_eq!(
            handler.header_sort(
                "dkim=fail header.d=a.example",
                "dkim=pass header.d=z.example"
            ),
            Ordering::Greater
        );
    }

    #[tokio::test]
    async fn unsigned_empty_message_yields_none() {
        let handler = DkimHandler::from_config(serde_yaml::Value::Null).unwrap();
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        handler.eom(&mut ctx).await.unwrap();
        let value = ctx.headers.serialize_auth_results(
            "mx.example.com",
            &crate::headers::HeaderStyle::default(),
            &|_, _, _| None,
        );
        assert!(value.contains("dkim=none"));
    }

    #[tokio::test]
    async fn hide_none_suppresses_fragment() {
        let section = serde_yaml::from_str("hide_none: true").unwrap();
        let handler = DkimHandler::from_config(section).unwrap();
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        handler.eom(&mut ctx).await.unwrap();
        let value = ctx.headers.serialize_auth_results(
            "mx.example.com",
            &crate::headers::HeaderStyle::default(),
            &|_, _, _| None,
        );
        assert!(value.ends_with("none"));
        assert!(!value.contains("dkim="));
    }
}
