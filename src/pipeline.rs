use crate::config::Config;
use crate::disposition::{DispositionRegister, EventResponse};
use crate::dns::Dns;
use crate::errors::PipelineError;
use crate::handlers::{CallbackStage, Handler, HandlerRegistry};
use crate::headers::{AuthFragment, HeaderAccumulator, HeaderOp};
use crate::ipmap::IpMap;
use crate::metrics::{MetricsCollector, WorkerMetrics};
use crate::objects::ObjectStore;
use crate::symbols::SymbolTable;
use crate::timeout::DeadlineStack;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

/// Message-scoped state, alive from MAIL FROM to EOM or ABORT.
#[derive(Debug, Default)]
pub struct MessageContext {
    pub env_from: String,
    /// Ordered; duplicates allowed.
    pub env_rcpt: Vec<String>,
    pub body_bytes: u64,
    /// Raw header block and body, as received, for the signature engines.
    pub raw_message: Vec<u8>,
    /// Headers in arrival order, names lower-cased.
    pub headers: Vec<(String, String)>,
    /// Occurrence count per lower-cased header name.
    pub header_count: HashMap<String, u32>,
}

impl MessageContext {
    fn new(env_from: &str) -> Self {
        Self {
            env_from: env_from.to_string(),
            ..Self::default()
        }
    }
}

/// Everything a connection worker carries between events. Created on
/// accept, dropped on close.
pub struct ConnectionContext {
    pub raw_ip: Option<IpAddr>,
    pub ip: Option<IpAddr>,
    pub peer_hostname: Option<String>,
    pub raw_helo: Option<String>,
    pub helo_name: Option<String>,
    pub helo_override: Option<String>,
    pub symbols: SymbolTable,
    pub objects: ObjectStore,
    pub headers: HeaderAccumulator,
    pub disposition: DispositionRegister,
    pub timer: DeadlineStack,
    /// Per-handler private state, keyed by handler name.
    pub handler_state: HashMap<String, String>,
    pub exit_on_close: bool,
    pub status: String,
    pub debug_log: Vec<String>,
    pub message: Option<MessageContext>,
    /// AuthServID, for handlers that need the local identity.
    pub hostname: String,
    synthetic_queue_id: String,
}

impl ConnectionContext {
    pub fn new(hostname: String) -> Self {
        Self {
            raw_ip: None,
            ip: None,
            peer_hostname: None,
            raw_helo: None,
            helo_name: None,
            helo_override: None,
            symbols: SymbolTable::new(),
            objects: ObjectStore::new(),
            headers: HeaderAccumulator::new(),
            disposition: DispositionRegister::new(),
            timer: DeadlineStack::new(),
            handler_state: HashMap::new(),
            exit_on_close: false,
            status: "setup".to_string(),
            debug_log: Vec::new(),
            message: None,
            hostname,
            synthetic_queue_id: synthetic_queue_id(),
        }
    }

    /// The MTA queue id when known, a synthetic NOQUEUE id otherwise.
    pub fn queue_id(&self) -> String {
        self.symbols
            .get_symbol("i")
            .map(str::to_string)
            .unwrap_or_else(|| self.synthetic_queue_id.clone())
    }

    pub fn loginfo(&mut self, key: &str, value: &str) {
        let line = format!("{}: {key}: {value}", self.queue_id());
        log::info!("{line}");
        self.debug_log.push(line);
    }

    pub fn logdebug(&mut self, key: &str, value: &str) {
        let line = format!("{}: {key}: {value}", self.queue_id());
        log::debug!("{line}");
        self.debug_log.push(line);
    }

    pub fn logerror(&mut self, key: &str, value: &str) {
        let line = format!("{}: {key}: {value}", self.queue_id());
        log::error!("{line}");
        self.debug_log.push(line);
    }

    /// The direct DNS client, built lazily through the object store.
    pub fn dns(&mut self) -> Result<Arc<dyn Dns>, PipelineError> {
        self.objects
            .get_shared::<dyn Dns>("resolver")
            .map_err(|e| PipelineError::Config(e.to_string()))?
            .ok_or_else(|| PipelineError::Config("no resolver factory registered".to_string()))
    }

    /// The mail-auth verification engine.
    pub fn spf_server(&mut self) -> Result<Arc<mail_auth::Resolver>, PipelineError> {
        self.objects
            .get_shared::<mail_auth::Resolver>("spf_server")
            .map_err(|e| PipelineError::Config(e.to_string()))?
            .ok_or_else(|| PipelineError::Config("no spf_server factory registered".to_string()))
    }

    pub fn set_state(&mut self, handler: &str, value: &str) {
        self.handler_state
            .insert(handler.to_string(), value.to_string());
    }

    pub fn get_state(&self, handler: &str) -> Option<&str> {
        self.handler_state.get(handler).map(String::as_str)
    }

    pub fn is_local(&self) -> bool {
        self.get_state("LocalIP").is_some()
    }

    pub fn is_trusted(&self) -> bool {
        self.get_state("TrustedIP").is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.get_state("Auth").is_some()
    }

    pub fn add_auth_header(&mut self, fragment: AuthFragment) {
        self.headers.add_auth_header(fragment);
    }

    pub fn add_c_auth_header(&mut self, fragment: AuthFragment) {
        self.headers.add_c_auth_header(fragment);
    }

    pub fn reject_mail(&mut self, reason: &str) {
        self.disposition.reject_mail(reason);
    }

    pub fn defer_mail(&mut self, reason: &str) {
        self.disposition.defer_mail(reason);
    }

    pub fn quarantine_mail(&mut self, reason: &str) {
        self.disposition.quarantine_mail(reason);
    }
}

/// One MTA event with its arguments.
pub enum Event<'a> {
    Setup,
    Connect { hostname: &'a str, ip: IpAddr },
    Helo { helo: &'a str },
    EnvFrom { from: &'a str },
    EnvRcpt { rcpt: &'a str },
    Header { name: &'a str, value: &'a str },
    Eoh,
    Body { chunk: &'a [u8] },
    Eom,
    Abort,
    Close,
    AddHeader,
}

impl Event<'_> {
    fn stage(&self) -> CallbackStage {
        match self {
            Event::Setup => CallbackStage::Setup,
            Event::Connect { .. } => CallbackStage::Connect,
            Event::Helo { .. } => CallbackStage::Helo,
            Event::EnvFrom { .. } => CallbackStage::EnvFrom,
            Event::EnvRcpt { .. } => CallbackStage::EnvRcpt,
            Event::Header { .. } => CallbackStage::Header,
            Event::Eoh => CallbackStage::Eoh,
            Event::Body { .. } => CallbackStage::Body,
            Event::Eom => CallbackStage::Eom,
            Event::Abort => CallbackStage::Abort,
            Event::Close => CallbackStage::Close,
            Event::AddHeader => CallbackStage::AddHeader,
        }
    }
}

async fn invoke(
    handler: &dyn Handler,
    ctx: &mut ConnectionContext,
    event: &Event<'_>,
) -> Result<(), PipelineError> {
    match event {
        Event::Setup => handler.setup(ctx).await,
        Event::Connect { hostname, ip } => {
            // Handlers see the effective (remapped) peer address.
            let effective = ctx.ip.unwrap_or(*ip);
            handler.connect(ctx, hostname, effective).await
        }
        Event::Helo { helo } => {
            let effective = ctx.helo_name.clone().unwrap_or_else(|| helo.to_string());
            handler.helo(ctx, &effective).await
        }
        Event::EnvFrom { from } => handler.envfrom(ctx, from).await,
        Event::EnvRcpt { rcpt } => handler.envrcpt(ctx, rcpt).await,
        Event::Header { name, value } => handler.header(ctx, name, value).await,
        Event::Eoh => handler.eoh(ctx).await,
        Event::Body { chunk } => handler.body(ctx, chunk).await,
        Event::Eom => handler.eom(ctx).await,
        Event::Abort => handler.abort(ctx).await,
        Event::Close => handler.close(ctx).await,
        Event::AddHeader => handler.addheader(ctx).await,
    }
}

/// The staged state machine driving one connection: routes each MTA event
/// through the ordered handler chain under the section deadline, arbitrates
/// the disposition, and emits the composed headers at end of message.
pub struct Pipeline {
    config: Arc<Config>,
    registry: Arc<HandlerRegistry>,
    metrics: WorkerMetrics,
    ip_map: IpMap,
    hostname: String,
    last_event_timed_out: bool,
    pub ctx: ConnectionContext,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<HandlerRegistry>,
        metrics: WorkerMetrics,
    ) -> anyhow::Result<Self> {
        let ip_map = IpMap::parse(&config.ip_map)?;
        let hostname = config.authserv_id();
        Ok(Self {
            config,
            registry,
            metrics,
            ip_map,
            hostname: hostname.clone(),
            last_event_timed_out: false,
            ctx: ConnectionContext::new(hostname),
        })
    }

    /// Metrics every pipeline reports, registered once at startup.
    pub fn register_base_metrics(collector: &MetricsCollector) {
        collector.register("connect_total", "Connections accepted");
        collector.register(
            "callback_error_total",
            "Callback failures by stage, handler and kind",
        );
        collector.register(
            "time_microseconds_total",
            "Time spent in handler callbacks",
        );
    }

    fn status(&mut self, label: &str) {
        self.ctx.status = label.to_string();
        log::trace!("{}: status: {label}", self.ctx.queue_id());
    }

    pub async fn top_setup(&mut self) -> EventResponse {
        self.run_event(Event::Setup).await
    }

    pub async fn top_connect(&mut self, hostname: &str, ip: IpAddr) -> EventResponse {
        self.run_event(Event::Connect { hostname, ip }).await
    }

    pub async fn top_helo(&mut self, helo: &str) -> EventResponse {
        self.run_event(Event::Helo { helo }).await
    }

    pub async fn top_envfrom(&mut self, from: &str) -> EventResponse {
        self.run_event(Event::EnvFrom { from }).await
    }

    pub async fn top_envrcpt(&mut self, rcpt: &str) -> EventResponse {
        self.run_event(Event::EnvRcpt { rcpt }).await
    }

    pub async fn top_header(&mut self, name: &str, value: &str) -> EventResponse {
        self.run_event(Event::Header { name, value }).await
    }

    pub async fn top_eoh(&mut self) -> EventResponse {
        self.run_event(Event::Eoh).await
    }

    pub async fn top_body(&mut self, chunk: &[u8]) -> EventResponse {
        self.run_event(Event::Body { chunk }).await
    }

    /// End of message: run the eom chain, the policy hook, the addheader
    /// chain, and produce the header mutations for the transport to flush.
    pub async fn top_eom(&mut self) -> (EventResponse, Vec<HeaderOp>) {
        let response = self.run_event(Event::Eom).await;
        if self.last_event_timed_out {
            self.drop_message();
            return (response, Vec::new());
        }

        self.apply_policy();
        let _ = self.run_event(Event::AddHeader).await;

        let registry = self.registry.clone();
        let sorter = move |key: &str, a: &str, b: &str| registry.sort_fragments(key, a, b);
        let style = self.config.header_style();
        let ops = self.ctx.headers.emit_ops(
            &self.hostname,
            &style,
            self.ctx.disposition.quarantine_reason(),
            &sorter,
        );

        let response = self.ctx.disposition.get_return();
        let ops = if self.config.dryrun {
            self.ctx.logdebug("dryrun", "suppressing header mutations");
            Vec::new()
        } else {
            ops
        };
        self.drop_message();
        (response, ops)
    }

    pub async fn top_abort(&mut self) -> EventResponse {
        let response = self.run_event(Event::Abort).await;
        self.drop_message();
        response
    }

    pub async fn top_close(&mut self) -> EventResponse {
        let response = self.run_event(Event::Close).await;
        self.close_connection();
        response
    }

    /// Structural policy hook; no behavior is attached today.
    fn apply_policy(&mut self) {}

    async fn run_event(&mut self, event: Event<'_>) -> EventResponse {
        let stage = event.stage();
        self.status(stage.as_str());
        self.last_event_timed_out = false;

        match &event {
            Event::Connect { hostname, ip } => {
                self.metrics.count("connect_total", &[], 1);
                self.ctx.disposition.clear();
                self.apply_ip_map(hostname, *ip);
            }
            Event::Helo { helo } => {
                if self.ctx.helo_name.is_some() {
                    self.ctx
                        .logdebug("helo", &format!("ignoring repeated HELO {helo:?}"));
                    self.status("posthelo");
                    self.metrics.send();
                    return self.ctx.disposition.get_return();
                }
                self.ctx.raw_helo = Some(helo.to_string());
                let effective = self
                    .ctx
                    .helo_override
                    .clone()
                    .unwrap_or_else(|| helo.to_string());
                if self.ctx.helo_override.is_some() {
                    self.ctx
                        .logdebug("helo", &format!("remapped HELO {helo:?} to {effective:?}"));
                }
                self.ctx.helo_name = Some(effective);
            }
            Event::EnvFrom { from } => {
                self.ctx.disposition.clear();
                self.ctx.message = Some(MessageContext::new(from));
            }
            Event::EnvRcpt { rcpt } => {
                if let Some(message) = self.ctx.message.as_mut() {
                    message.env_rcpt.push(rcpt.to_string());
                }
            }
            Event::Header { name, value } => {
                if let Some(message) = self.ctx.message.as_mut() {
                    message
                        .raw_message
                        .extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
                    let lower = name.to_lowercase();
                    message.headers.push((lower.clone(), value.to_string()));
                    *message.header_count.entry(lower).or_insert(0) += 1;
                }
            }
            Event::Eoh => {
                if let Some(message) = self.ctx.message.as_mut() {
                    message.raw_message.extend_from_slice(b"\r\n");
                }
            }
            Event::Body { chunk } => {
                if let Some(message) = self.ctx.message.as_mut() {
                    message.body_bytes += chunk.len() as u64;
                    message.raw_message.extend_from_slice(chunk);
                }
            }
            _ => {}
        }
        // Each event starts from a continue return code; the addheader
        // chain runs inside the eom event and keeps its outcome.
        if stage != CallbackStage::AddHeader {
            self.ctx.disposition.set_return(EventResponse::Continue);
        }

        self.ctx
            .timer
            .arm_section(self.config.get_type_timeout(stage.timeout_class()));

        let registry = self.registry.clone();
        for handler in registry.get_callbacks(stage) {
            let started = Instant::now();
            let result = match self.ctx.timer.time_remaining() {
                Some(remaining) => {
                    match tokio::time::timeout(remaining, invoke(handler, &mut self.ctx, &event))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::timeout(stage.as_str())),
                    }
                }
                None => invoke(handler, &mut self.ctx, &event).await,
            };
            let elapsed = started.elapsed().as_micros() as u64;
            self.metrics.count(
                "time_microseconds_total",
                &[("callback", stage.as_str()), ("handler", handler.name())],
                elapsed,
            );

            match result {
                Ok(()) => {}
                Err(err) if err.is_timeout() => {
                    self.callback_failed(stage, Some(handler.name()), "Timeout", &err);
                    self.last_event_timed_out = true;
                    break;
                }
                Err(err) => {
                    self.callback_failed(stage, Some(handler.name()), "Error", &err);
                }
            }

            if let Err(err) = self.ctx.timer.check_now(stage.as_str()) {
                self.callback_failed(stage, None, "Timeout", &err);
                self.last_event_timed_out = true;
                break;
            }
        }
        self.ctx.timer.disarm_section();

        self.status(&format!("post{}", stage.as_str()));
        self.metrics.send();
        self.ctx.disposition.get_return()
    }

    fn callback_failed(
        &mut self,
        stage: CallbackStage,
        handler: Option<&'static str>,
        kind: &'static str,
        err: &PipelineError,
    ) {
        self.ctx.logerror(stage.as_str(), &err.to_string());
        self.ctx.exit_on_close = true;
        match handler {
            Some(name) => self.metrics.count(
                "callback_error_total",
                &[("stage", stage.as_str()), ("handler", name), ("type", kind)],
                1,
            ),
            None => self.metrics.count(
                "callback_error_total",
                &[("stage", stage.as_str()), ("type", kind)],
                1,
            ),
        }
        self.tempfail_on_error();
    }

    /// Select the tempfail-on-error flag by connection classification, in
    /// priority order: authenticated, local, trusted, default. A classifier
    /// counts only when its handler is loaded.
    fn tempfail_on_error(&mut self) {
        let checks = [
            (
                self.registry.is_loaded("Auth") && self.ctx.is_authenticated(),
                self.config.tempfail_on_error_authenticated,
            ),
            (
                self.registry.is_loaded("LocalIP") && self.ctx.is_local(),
                self.config.tempfail_on_error_local,
            ),
            (
                self.registry.is_loaded("TrustedIP") && self.ctx.is_trusted(),
                self.config.tempfail_on_error_trusted,
            ),
            (true, self.config.tempfail_on_error),
        ];
        if checks.iter().any(|(matches, flag)| *matches && *flag) {
            self.ctx.disposition.set_return(EventResponse::Tempfail(
                "451 4.7.1 Please try again later".to_string(),
            ));
        }
    }

    fn apply_ip_map(&mut self, hostname: &str, ip: IpAddr) {
        self.ctx.raw_ip = Some(ip);
        self.ctx.peer_hostname = Some(hostname.to_string());
        let mut effective = ip;
        if let Some(entry) = self.ip_map.lookup(ip) {
            if let Some(mapped) = entry.ip {
                self.ctx
                    .logdebug("ip_map", &format!("remapped {ip} to {mapped}"));
                effective = mapped;
            }
            self.ctx.helo_override = entry.helo.clone();
        }
        self.ctx.ip = Some(effective);
    }

    /// Drop message state and return the sub-machine to the post-connect
    /// position; the connection stays open.
    fn drop_message(&mut self) {
        self.ctx.message = None;
        self.ctx.disposition.clear();
        self.ctx.objects.destroy_objects();
        self.ctx.symbols.clear_symbols();
        self.ctx.headers.reset_message();
    }

    fn close_connection(&mut self) {
        self.drop_message();
        self.ctx.headers.reset_all();
        self.ctx.symbols.clear_all_symbols();
        if self.config.debug {
            for line in std::mem::take(&mut self.ctx.debug_log) {
                log::debug!("closed: {line}");
            }
        } else {
            self.ctx.debug_log.clear();
        }
    }
}

/// `NOQUEUE.<base32>` id used in log lines before the MTA assigns one,
/// derived from a hash over pid, time and a random value.
fn synthetic_queue_id() -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
        .hash(&mut hasher);
    rand::random::<u64>().hash(&mut hasher);
    format!("NOQUEUE.{}", base32_11(hasher.finish()))
}

fn base32_11(mut value: u64) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::with_capacity(11);
    for _ in 0..11 {
        out.push(ALPHABET[(value & 31) as usize] as char);
        value >>= 5;
    }
    out
}
