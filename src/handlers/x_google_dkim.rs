use super::dkim::dkim_result_parts;
use super::{section_config, CallbackStage, Handler};
use crate::errors::PipelineError;
use crate::headers::{AuthEntry, AuthFragment};
use crate::pipeline::ConnectionContext;
use async_trait::async_trait;
use mail_auth::common::verify::VerifySignature;
use mail_auth::AuthenticatedMessage;
use serde::Deserialize;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct XGoogleDkimConfig {
    #[serde(default = "default_true")]
    pub hide_none: bool,
}

impl Default for XGoogleDkimConfig {
    fn default() -> Self {
        Self { hide_none: true }
    }
}

const GOOGLE_HEADER: &str = "x-google-dkim-signature";

/// Verifies X-Google-DKIM-Signature headers by renaming them to
/// DKIM-Signature in a copy of the message and running the normal engine
/// over it.
pub struct XGoogleDkimHandler {
    config: XGoogleDkimConfig,
}

impl XGoogleDkimHandler {
    pub fn from_config(section: serde_yaml::Value) -> anyhow::Result<Self> {
        Ok(Self {
            config: section_config(section)?,
        })
    }
}

/// Rewrite `X-Google-DKIM-Signature:` header lines to `DKIM-Signature:`,
/// leaving folded continuation lines and the body untouched.
fn rename_google_headers(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = match text.split_once("\r\n\r\n") {
        Some((head, body)) => (head, Some(body)),
        None => (text.as_ref(), None),
    };
    let mut out = String::with_capacity(text.len());
    for line in head.split("\r\n") {
        let renamed = line
            .split_once(':')
            .filter(|(name, _)| name.trim().eq_ignore_ascii_case(GOOGLE_HEADER))
            .map(|(_, value)| format!("DKIM-Signature:{value}"));
        out.push_str(renamed.as_deref().unwrap_or(line));
        out.push_str("\r\n");
    }
    if let Some(body) = body {
        out.push_str("\r\n");
        out.push_str(body);
    }
    out.into_bytes()
}

#[async_trait]
impl Handler for XGoogleDkimHandler {
    fn name(&self) -> &'static str {
        "XGoogleDKIM"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        let raw = match ctx.message.as_ref() {
            Some(message)
                if message
                    .headers
                    .iter()
                    .any(|(name, _)| name == GOOGLE_HEADER) =>
            {
                message.raw_message.clone()
            }
            _ => {
                if !self.config.hide_none {
                    ctx.add_auth_header(AuthFragment::Structured(AuthEntry::new(
                        "x-google-dkim",
                        "none",
                    )));
                }
                return Ok(());
            }
        };

        let renamed = rename_google_headers(&raw);
        let Some(parsed) = AuthenticatedMessage::parse(&renamed) else {
            return Ok(());
        };
        let spf_server = ctx.spf_server()?;
        let outputs = spf_server.verify_dkim(&parsed).await;
        for output in &outputs {
            let (result, detail) = dkim_result_parts(output.result());
            let mut entry = AuthEntry::new("x-google-dkim", result);
            if let Some(detail) = &detail {
                entry = entry.with_comment(detail);
            }
            if let Some(signature) = output.signature() {
                entry = entry
                    .with_prop("header.d", signature.domain())
                    .with_prop("header.s", signature.selector());
            }
            ctx.add_auth_header(AuthFragment::Structured(entry));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rename_touches_only_the_google_header() {
        let raw = b"From: a@example.com\r\nX-Google-DKIM-Signature: v=1; a=rsa-sha256;\r\n\td=example.com\r\nSubject: hi\r\n\r\nX-Google-DKIM-Signature: in body stays\r\n";
        let renamed = String::from_utf8(rename_google_headers(raw)).unwrap();
        assert!(renamed.contains("DKIM-Signature: v=1; a=rsa-sha256;\r\n\td=example.com"));
        assert!(renamed.contains("From: a@example.com"));
        assert!(renamed.contains("X-Google-DKIM-Signature: in body stays"));
    }

    #[tokio::test]
    async fn message_without_google_signature_is_silent_by_default() {
        let handler = XGoogleDkimHandler::from_config(serde_yaml::Value::Null).unwrap();
        let mut ctx = ConnectionContext::new("mx.example.com".to_string());
        handler.eom(&mut ctx).await.unwrap();
        let value = ctx.headers.serialize_auth_results(
            "mx.example.com",
            &crate::headers::HeaderStyle::default(),
            &|_, _, _| None,
        );
        assert!(value.ends_with("none"));
    }
}
