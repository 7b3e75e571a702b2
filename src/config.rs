use crate::handlers::ConfigHook;
use crate::headers::HeaderStyle;
use crate::ipmap::IpMapEntry;
use crate::timeout::TimeoutClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Handler names loaded when the configuration does not say otherwise.
const DEFAULT_HANDLERS: [&str; 10] = [
    "LocalIP",
    "TrustedIP",
    "Auth",
    "TLS",
    "IPrev",
    "PTR",
    "SPF",
    "DKIM",
    "DMARC",
    "Size",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Milter listener. A filesystem path binds a unix socket; an
    /// `addr:port` string binds TCP.
    pub socket_path: String,
    /// SMTP proxy listener, `addr:port`. Absent disables the proxy front.
    pub proxy_listen: Option<String>,
    /// Downstream SMTP server the proxy relays accepted messages to.
    pub proxy_downstream: Option<String>,
    /// AuthServID stamped on Authentication-Results. Defaults to the
    /// system hostname.
    pub hostname: Option<String>,

    pub debug: bool,
    pub logtoerr: bool,
    /// Evaluate everything but suppress header mutation packets.
    pub dryrun: bool,

    /// Seconds; 0 disarms the budget in question.
    pub session_timeout: u64,
    pub connect_timeout: u64,
    pub command_timeout: u64,
    pub content_timeout: u64,
    pub addheader_timeout: u64,

    pub dns_timeout: u64,
    pub dns_retry: usize,
    /// Nameserver addresses; empty uses the system configuration.
    pub dns_resolvers: Vec<String>,

    /// Peer rewriting, keyed by CIDR prefix.
    pub ip_map: HashMap<String, IpMapEntry>,
    /// AuthServIDs whose inbound Authentication-Results headers get blanked.
    pub hosts_to_remove: Vec<String>,

    pub header_indent_style: String,
    pub header_indent_by: usize,
    pub header_fold_at: Option<usize>,

    pub tempfail_on_error: bool,
    pub tempfail_on_error_authenticated: bool,
    pub tempfail_on_error_local: bool,
    pub tempfail_on_error_trusted: bool,

    /// Handlers in dispatch order. The order is the dependency order:
    /// DMARC must come after SPF and DKIM.
    pub load_handlers: Vec<String>,
    /// Handler-specific sections, deserialized by each handler.
    pub handlers: HashMap<String, serde_yaml::Value>,

    /// Prometheus scrape port. Absent disables the endpoint.
    pub metrics_port: Option<u16>,

    /// Optional mutator applied to a copy of each handler's configuration
    /// section as the registry loads it. A hook is code, so it cannot come
    /// from the YAML file; embedders install one on the loaded Config via
    /// `set_external_callback_processor`.
    #[serde(skip)]
    pub external_callback_processor: CallbackProcessor,
}

/// Holder for the handler-config mutator hook.
#[derive(Clone, Default)]
pub struct CallbackProcessor(Option<Arc<ConfigHook>>);

impl CallbackProcessor {
    pub fn as_hook(&self) -> Option<&ConfigHook> {
        self.0.as_deref()
    }
}

impl fmt::Debug for CallbackProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "CallbackProcessor(set)"
        } else {
            "CallbackProcessor(unset)"
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: "/var/run/auth-milter.sock".to_string(),
            proxy_listen: None,
            proxy_downstream: None,
            hostname: None,
            debug: false,
            logtoerr: false,
            dryrun: false,
            session_timeout: 600,
            connect_timeout: 30,
            command_timeout: 30,
            content_timeout: 60,
            addheader_timeout: 30,
            dns_timeout: 8,
            dns_retry: 2,
            dns_resolvers: Vec::new(),
            ip_map: HashMap::new(),
            hosts_to_remove: Vec::new(),
            header_indent_style: "entry".to_string(),
            header_indent_by: 4,
            header_fold_at: None,
            tempfail_on_error: true,
            tempfail_on_error_authenticated: true,
            tempfail_on_error_local: true,
            tempfail_on_error_trusted: true,
            load_handlers: DEFAULT_HANDLERS.iter().map(|s| s.to_string()).collect(),
            handlers: HashMap::new(),
            metrics_port: None,
            external_callback_processor: CallbackProcessor::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Section budget for a callback class. 0 seconds means disarmed.
    pub fn get_type_timeout(&self, class: TimeoutClass) -> Option<Duration> {
        let seconds = match class {
            TimeoutClass::Connect => self.connect_timeout,
            TimeoutClass::Command => self.command_timeout,
            TimeoutClass::Content => self.content_timeout,
            TimeoutClass::AddHeader => self.addheader_timeout,
        };
        (seconds > 0).then(|| Duration::from_secs(seconds))
    }

    pub fn session_budget(&self) -> Option<Duration> {
        (self.session_timeout > 0).then(|| Duration::from_secs(self.session_timeout))
    }

    /// The AuthServID: configured value or the system hostname.
    pub fn authserv_id(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        system_hostname().unwrap_or_else(|| "localhost".to_string())
    }

    pub fn header_style(&self) -> HeaderStyle {
        HeaderStyle {
            indent_style: self.header_indent_style.clone(),
            indent_by: self.header_indent_by,
            fold_at: self.header_fold_at,
        }
    }

    /// Raw configuration section for one handler, if present.
    pub fn handler_section(&self, name: &str) -> Option<&serde_yaml::Value> {
        self.handlers.get(name)
    }

    /// Install the handler-config mutator the registry applies to a copy
    /// of each handler's section.
    pub fn set_external_callback_processor<F>(&mut self, hook: F)
    where
        F: Fn(&str, &mut serde_yaml::Value) + Send + Sync + 'static,
    {
        self.external_callback_processor = CallbackProcessor(Some(Arc::new(hook)));
    }
}

fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}
