use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub type Labels = Vec<(String, String)>;

/// One counter increment, sent from a connection worker to the shared
/// collector.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub id: String,
    pub labels: Labels,
    pub count: u64,
}

/// Aggregated counters keyed by metric id and label set, with help text.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    help: HashMap<String, String>,
    counters: HashMap<String, HashMap<Labels, u64>>,
    started: Option<DateTime<Utc>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn register(&mut self, id: &str, help: &str) {
        self.help.insert(id.to_string(), help.to_string());
        self.counters.entry(id.to_string()).or_default();
    }

    pub fn apply(&mut self, event: MetricEvent) {
        let mut labels = event.labels;
        labels.sort();
        *self
            .counters
            .entry(event.id)
            .or_default()
            .entry(labels)
            .or_insert(0) += event.count;
    }

    pub fn get(&self, id: &str, labels: &[(&str, &str)]) -> u64 {
        let mut key: Labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        key.sort();
        self.counters
            .get(id)
            .and_then(|series| series.get(&key))
            .copied()
            .unwrap_or(0)
    }

    /// Prometheus text exposition of every registered counter.
    pub fn render(&self) -> String {
        let mut ids: Vec<&String> = self.counters.keys().collect();
        ids.sort();
        let mut out = String::new();
        if let Some(started) = self.started {
            out.push_str(&format!("# collector running since {}\n", started.to_rfc3339()));
        }
        for id in ids {
            if let Some(help) = self.help.get(id) {
                out.push_str(&format!("# HELP {id} {help}\n"));
            }
            out.push_str(&format!("# TYPE {id} counter\n"));
            let series = &self.counters[id];
            let mut keys: Vec<&Labels> = series.keys().collect();
            keys.sort();
            for labels in keys {
                let value = series[labels];
                if labels.is_empty() {
                    out.push_str(&format!("{id} {value}\n"));
                } else {
                    let rendered: Vec<String> = labels
                        .iter()
                        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('"', "'")))
                        .collect();
                    out.push_str(&format!("{id}{{{}}} {value}\n", rendered.join(",")));
                }
            }
        }
        out
    }
}

/// Shared sink for worker counters. Events are folded into the registry by
/// a background task so workers never contend on the lock.
pub struct MetricsCollector {
    registry: Arc<Mutex<MetricsRegistry>>,
    sender: mpsc::UnboundedSender<MetricEvent>,
    _handle: tokio::task::JoinHandle<()>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let registry = Arc::new(Mutex::new(MetricsRegistry::new()));
        let (sender, mut receiver) = mpsc::unbounded_channel::<MetricEvent>();
        let sink = registry.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Ok(mut registry) = sink.lock() {
                    registry.apply(event);
                }
            }
        });
        Self {
            registry,
            sender,
            _handle: handle,
        }
    }

    pub fn register(&self, id: &str, help: &str) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.register(id, help);
        }
    }

    pub fn registry(&self) -> Arc<Mutex<MetricsRegistry>> {
        self.registry.clone()
    }

    /// A buffered per-worker view that feeds this collector.
    pub fn worker(&self) -> WorkerMetrics {
        WorkerMetrics {
            buffer: HashMap::new(),
            sender: self.sender.clone(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-local counter buffer. Increments accumulate here and are flushed
/// to the collector at event boundaries; aggregation is commutative so the
/// flush order across workers does not matter.
pub struct WorkerMetrics {
    buffer: HashMap<(String, Labels), u64>,
    sender: mpsc::UnboundedSender<MetricEvent>,
}

impl WorkerMetrics {
    pub fn count(&mut self, id: &str, labels: &[(&str, &str)], count: u64) {
        let labels: Labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        *self.buffer.entry((id.to_string(), labels)).or_insert(0) += count;
    }

    pub fn send(&mut self) {
        for ((id, labels), count) in self.buffer.drain() {
            if let Err(e) = self.sender.send(MetricEvent { id, labels, count }) {
                log::warn!("failed to send metric event: {e}");
            }
        }
    }
}

/// Minimal scrape endpoint: answers any request on the metrics port with
/// the text exposition of the registry.
pub async fn serve_metrics(port: u16, registry: Arc<Mutex<MetricsRegistry>>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("metrics scrape endpoint listening on port {port}");
    loop {
        let (mut stream, peer) = listener.accept().await?;
        log::debug!("metrics scrape from {peer}");
        let body = match registry.lock() {
            Ok(registry) => registry.render(),
            Err(_) => String::new(),
        };
        tokio::spawn(async move {
            let mut request = [0u8; 1024];
            let _ = stream.read(&mut request).await;
            let response = format!(
                "HTTP/1.0 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            if let Err(e) = stream.write_all(response.as_bytes()).await {
                log::debug!("metrics response failed: {e}");
            }
        });
    }
}
