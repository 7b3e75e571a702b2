use crate::config::Config;
use crate::errors::PipelineError;
use crate::metrics::MetricsCollector;
use crate::pipeline::ConnectionContext;
use crate::timeout::TimeoutClass;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;

pub mod add_id;
pub mod aligned_from;
pub mod auth;
pub mod dkim;
pub mod dmarc;
pub mod iprev;
pub mod local_ip;
pub mod ptr;
pub mod return_ok;
pub mod sanitize;
pub mod sender_id;
pub mod size;
pub mod spf;
pub mod tls;
pub mod trusted_ip;
pub mod x_google_dkim;

/// The callbacks a handler may expose, in MTA event order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackStage {
    Setup,
    Connect,
    Helo,
    EnvFrom,
    EnvRcpt,
    Header,
    Eoh,
    Body,
    Eom,
    Abort,
    Close,
    AddHeader,
}

pub const ALL_STAGES: [CallbackStage; 12] = [
    CallbackStage::Setup,
    CallbackStage::Connect,
    CallbackStage::Helo,
    CallbackStage::EnvFrom,
    CallbackStage::EnvRcpt,
    CallbackStage::Header,
    CallbackStage::Eoh,
    CallbackStage::Body,
    CallbackStage::Eom,
    CallbackStage::Abort,
    CallbackStage::Close,
    CallbackStage::AddHeader,
];

impl CallbackStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStage::Setup => "setup",
            CallbackStage::Connect => "connect",
            CallbackStage::Helo => "helo",
            CallbackStage::EnvFrom => "envfrom",
            CallbackStage::EnvRcpt => "envrcpt",
            CallbackStage::Header => "header",
            CallbackStage::Eoh => "eoh",
            CallbackStage::Body => "body",
            CallbackStage::Eom => "eom",
            CallbackStage::Abort => "abort",
            CallbackStage::Close => "close",
            CallbackStage::AddHeader => "addheader",
        }
    }

    /// Which section timeout budget governs this callback.
    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            CallbackStage::Connect => TimeoutClass::Connect,
            CallbackStage::Setup
            | CallbackStage::Helo
            | CallbackStage::EnvFrom
            | CallbackStage::EnvRcpt
            | CallbackStage::Abort
            | CallbackStage::Close => TimeoutClass::Command,
            CallbackStage::Header
            | CallbackStage::Eoh
            | CallbackStage::Body
            | CallbackStage::Eom => TimeoutClass::Content,
            CallbackStage::AddHeader => TimeoutClass::AddHeader,
        }
    }
}

/// Contract every authentication handler implements. All callbacks default
/// to no-ops; a handler also declares which stages it wants via
/// `callbacks()` so the registry can precompute the dispatch lists.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn callbacks(&self) -> &'static [CallbackStage];

    fn register_metrics(&self, _collector: &MetricsCollector) {}

    /// Claim sorting authority over fragments with this key.
    fn can_sort_header(&self, _key: &str) -> bool {
        false
    }

    fn header_sort(&self, _a: &str, _b: &str) -> Ordering {
        Ordering::Equal
    }

    async fn setup(&self, _ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn connect(
        &self,
        _ctx: &mut ConnectionContext,
        _hostname: &str,
        _ip: IpAddr,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn helo(&self, _ctx: &mut ConnectionContext, _helo: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn envfrom(&self, _ctx: &mut ConnectionContext, _from: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn envrcpt(&self, _ctx: &mut ConnectionContext, _rcpt: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn header(
        &self,
        _ctx: &mut ConnectionContext,
        _name: &str,
        _value: &str,
    ) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn eoh(&self, _ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn body(&self, _ctx: &mut ConnectionContext, _chunk: &[u8]) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn eom(&self, _ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn abort(&self, _ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn close(&self, _ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn addheader(&self, _ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Mutator applied to a copy of each handler's configuration section
/// before the handler reads it.
pub type ConfigHook = dyn Fn(&str, &mut serde_yaml::Value) + Send + Sync;

/// Handlers named by a chain that must already be loaded, earlier in the
/// configured order.
fn required_before(name: &str) -> &'static [&'static str] {
    match name {
        "DMARC" => &["SPF", "DKIM"],
        "PTR" => &["IPrev"],
        _ => &[],
    }
}

/// Holds the loaded handlers in configured order and the precomputed
/// per-stage dispatch lists. The registry never re-orders: the configured
/// order is the dependency order and is fixed for the worker's lifetime.
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn Handler>>,
    by_stage: HashMap<CallbackStage, Vec<usize>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("by_stage", &self.by_stage)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn build(config: &Config, hook: Option<&ConfigHook>) -> anyhow::Result<Self> {
        let mut handlers: Vec<Box<dyn Handler>> = Vec::new();
        let mut loaded: Vec<&str> = Vec::new();
        for name in &config.load_handlers {
            for dep in required_before(name) {
                if !loaded.contains(dep) {
                    anyhow::bail!("handler {name} requires {dep} earlier in load_handlers");
                }
            }
            let mut section = config
                .handler_section(name)
                .cloned()
                .unwrap_or(serde_yaml::Value::Null);
            if let Some(hook) = hook {
                hook(name, &mut section);
            }
            handlers.push(construct(name, config, section)?);
            loaded.push(name);
        }

        let mut by_stage: HashMap<CallbackStage, Vec<usize>> = HashMap::new();
        for stage in ALL_STAGES {
            let list: Vec<usize> = handlers
                .iter()
                .enumerate()
                .filter(|(_, h)| h.callbacks().contains(&stage))
                .map(|(idx, _)| idx)
                .collect();
            by_stage.insert(stage, list);
        }
        Ok(Self { handlers, by_stage })
    }

    /// Register a handler assembled outside the configuration path. Used
    /// by tests to splice in scripted handlers.
    pub fn push_handler(&mut self, handler: Box<dyn Handler>) {
        let idx = self.handlers.len();
        for stage in ALL_STAGES {
            if handler.callbacks().contains(&stage) {
                self.by_stage.entry(stage).or_default().push(idx);
            }
        }
        self.handlers.push(handler);
    }

    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
            by_stage: HashMap::new(),
        }
    }

    /// Handlers exposing a stage, in configured order.
    pub fn get_callbacks(&self, stage: CallbackStage) -> Vec<&dyn Handler> {
        self.by_stage
            .get(&stage)
            .map(|list| list.iter().map(|&idx| self.handlers[idx].as_ref()).collect())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.handlers.iter().any(|h| h.name() == name)
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// First loaded handler claiming a fragment key decides the order.
    pub fn sort_fragments(&self, key: &str, a: &str, b: &str) -> Option<Ordering> {
        self.handlers
            .iter()
            .find(|h| h.can_sort_header(key))
            .map(|h| h.header_sort(a, b))
    }

    pub fn register_metrics(&self, collector: &MetricsCollector) {
        for handler in &self.handlers {
            handler.register_metrics(collector);
        }
    }
}

fn construct(
    name: &str,
    config: &Config,
    section: serde_yaml::Value,
) -> anyhow::Result<Box<dyn Handler>> {
    Ok(match name {
        "LocalIP" => Box::new(local_ip::LocalIpHandler::from_config(section)?),
        "TrustedIP" => Box::new(trusted_ip::TrustedIpHandler::from_config(section)?),
        "Auth" => Box::new(auth::AuthHandler::from_config(section)?),
        "TLS" => Box::new(tls::TlsHandler::from_config(section)?),
        "IPrev" => Box::new(iprev::IPrevHandler::from_config(section)?),
        "PTR" => Box::new(ptr::PtrHandler::from_config(section)?),
        "SPF" => Box::new(spf::SpfHandler::from_config(section)?),
        "DKIM" => Box::new(dkim::DkimHandler::from_config(section)?),
        "DMARC" => Box::new(dmarc::DmarcHandler::from_config(section)?),
        "SenderID" => Box::new(sender_id::SenderIdHandler::from_config(section)?),
        "XGoogleDKIM" => Box::new(x_google_dkim::XGoogleDkimHandler::from_config(section)?),
        "Size" => Box::new(size::SizeHandler::from_config(section)?),
        "AlignedFrom" => Box::new(aligned_from::AlignedFromHandler::from_config(section)?),
        "Sanitize" => Box::new(sanitize::SanitizeHandler::from_config(config, section)?),
        "AddID" => Box::new(add_id::AddIdHandler::from_config(section)?),
        "ReturnOK" => Box::new(return_ok::ReturnOkHandler::from_config(section)?),
        other => anyhow::bail!("unknown handler {other:?} in load_handlers"),
    })
}

/// Deserialize a handler section, treating an absent section as defaults.
pub(crate) fn section_config<T>(section: serde_yaml::Value) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if section.is_null() {
        Ok(T::default())
    } else {
        Ok(serde_yaml::from_value(section)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_lists_follow_configured_order() {
        let config = Config {
            load_handlers: vec!["LocalIP".into(), "SPF".into(), "Size".into()],
            ..Config::default()
        };
        let registry = HandlerRegistry::build(&config, None).unwrap();
        let names: Vec<&str> = registry
            .get_callbacks(CallbackStage::EnvFrom)
            .iter()
            .map(|h| h.name())
            .collect();
        assert_eq!(names, vec!["SPF"]);
        assert!(registry.is_loaded("Size"));
        assert!(!registry.is_loaded("DKIM"));
    }

    #[test]
    fn missing_dependency_is_rejected() {
        let config = Config {
            load_handlers: vec!["SPF".into(), "DMARC".into()],
            ..Config::default()
        };
        let err = HandlerRegistry::build(&config, None).unwrap_err();
        assert!(err.to_string().contains("requires DKIM"));
    }

    #[test]
    fn unknown_handler_is_rejected() {
        let config = Config {
            load_handlers: vec!["Bogus".into()],
            ..Config::default()
        };
        assert!(HandlerRegistry::build(&config, None).is_err());
    }

    #[test]
    fn config_hook_mutates_a_copy() {
        let mut config = Config {
            load_handlers: vec!["Size".into()],
            ..Config::default()
        };
        config.handlers.insert(
            "Size".into(),
            serde_yaml::from_str("max_size: 100").unwrap(),
        );
        let hook = |name: &str, section: &mut serde_yaml::Value| {
            if name == "Size" {
                *section = serde_yaml::from_str("max_size: 5").unwrap();
            }
        };
        let registry = HandlerRegistry::build(&config, Some(&hook)).unwrap();
        assert!(registry.is_loaded("Size"));
        // The stored configuration is untouched.
        assert_eq!(
            config.handlers["Size"],
            serde_yaml::from_str::<serde_yaml::Value>("max_size: 100").unwrap()
        );
    }
}
