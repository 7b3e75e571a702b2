use async_trait::async_trait;
use auth_milter::config::Config;
use auth_milter::disposition::EventResponse;
use auth_milter::dns::{Dns, DnsError};
use auth_milter::errors::PipelineError;
use auth_milter::handlers::{CallbackStage, Handler, HandlerRegistry};
use auth_milter::headers::{AuthEntry, AuthFragment, HeaderOp};
use auth_milter::metrics::MetricsCollector;
use auth_milter::pipeline::{ConnectionContext, Pipeline};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

#[derive(Default)]
struct MockDns {
    ptr: HashMap<IpAddr, Vec<String>>,
    a: HashMap<String, Vec<Ipv4Addr>>,
}

#[async_trait]
impl Dns for MockDns {
    async fn ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        self.ptr.get(&ip).cloned().ok_or(DnsError::NotFound)
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        self.a.get(name).cloned().ok_or(DnsError::NotFound)
    }

    async fn aaaa(&self, _name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        Err(DnsError::NotFound)
    }

    async fn txt(&self, _name: &str) -> Result<Vec<String>, DnsError> {
        Err(DnsError::NotFound)
    }

    async fn mx(&self, _name: &str) -> Result<Vec<String>, DnsError> {
        Err(DnsError::NotFound)
    }
}

/// Emits scripted engine verdicts at end of message.
struct VerdictHandler;

#[async_trait]
impl Handler for VerdictHandler {
    fn name(&self) -> &'static str {
        "Verdicts"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        ctx.add_auth_header(AuthFragment::Structured(
            AuthEntry::new("spf", "pass").with_prop("smtp.mailfrom", "alice@example.com"),
        ));
        ctx.add_auth_header(AuthFragment::Structured(
            AuthEntry::new("dkim", "pass").with_prop("header.d", "example.com"),
        ));
        ctx.add_auth_header(AuthFragment::Structured(
            AuthEntry::new("dmarc", "pass").with_prop("header.from", "example.com"),
        ));
        Ok(())
    }
}

/// Sleeps past every deadline when asked to.
struct SlowHandler;

#[async_trait]
impl Handler for SlowHandler {
    fn name(&self) -> &'static str {
        "Slow"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Connect]
    }

    async fn connect(
        &self,
        _ctx: &mut ConnectionContext,
        _hostname: &str,
        _ip: IpAddr,
    ) -> Result<(), PipelineError> {
        tokio::time::sleep(std::time::Duration::from_secs(20)).await;
        Ok(())
    }
}

/// Applies a scripted disposition at MAIL FROM.
struct RejectingHandler {
    reason: &'static str,
}

#[async_trait]
impl Handler for RejectingHandler {
    fn name(&self) -> &'static str {
        "Rejecting"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::EnvFrom]
    }

    async fn envfrom(&self, ctx: &mut ConnectionContext, _from: &str) -> Result<(), PipelineError> {
        ctx.reject_mail(self.reason);
        Ok(())
    }
}

/// Counts its own helo callbacks and records what connect saw.
#[derive(Default)]
struct ObserverHandler;

#[async_trait]
impl Handler for ObserverHandler {
    fn name(&self) -> &'static str {
        "Observer"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Connect, CallbackStage::Helo]
    }

    async fn connect(
        &self,
        ctx: &mut ConnectionContext,
        _hostname: &str,
        ip: IpAddr,
    ) -> Result<(), PipelineError> {
        ctx.set_state("Observer.ip", &ip.to_string());
        Ok(())
    }

    async fn helo(&self, ctx: &mut ConnectionContext, helo: &str) -> Result<(), PipelineError> {
        let count = ctx
            .get_state("Observer.helo_count")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;
        ctx.set_state("Observer.helo_count", &count.to_string());
        ctx.set_state("Observer.helo", helo);
        Ok(())
    }
}

struct QuarantiningHandler;

#[async_trait]
impl Handler for QuarantiningHandler {
    fn name(&self) -> &'static str {
        "Quarantining"
    }

    fn callbacks(&self) -> &'static [CallbackStage] {
        &[CallbackStage::Eom]
    }

    async fn eom(&self, ctx: &mut ConnectionContext) -> Result<(), PipelineError> {
        ctx.quarantine_mail("suspicious content");
        Ok(())
    }
}

fn build_pipeline(
    config: Config,
    extra: Vec<Box<dyn Handler>>,
    dns: MockDns,
) -> (Pipeline, Arc<MetricsCollector>) {
    let collector = Arc::new(MetricsCollector::new());
    Pipeline::register_base_metrics(&collector);
    let mut registry = HandlerRegistry::build(&config, None).unwrap();
    for handler in extra {
        registry.push_handler(handler);
    }
    let mut pipeline = Pipeline::new(
        Arc::new(config),
        Arc::new(registry),
        collector.worker(),
    )
    .unwrap();
    let shared: Arc<dyn Dns> = Arc::new(dns);
    pipeline.ctx.objects.set_object("resolver", shared, false);
    (pipeline, collector)
}

fn auth_results(ops: &[HeaderOp]) -> &str {
    match &ops[0] {
        HeaderOp::Insert { index: 1, name, value } if name == "Authentication-Results" => value,
        other => panic!("Authentication-Results is not the first insertion: {other:?}"),
    }
}

async fn settle_metrics() {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

#[tokio::test]
async fn clean_pass_end_to_end() {
    let config = Config {
        hostname: Some("mx.example.com".to_string()),
        load_handlers: vec![
            "LocalIP".to_string(),
            "TrustedIP".to_string(),
            "IPrev".to_string(),
            "AddID".to_string(),
        ],
        ..Config::default()
    };
    let ip: IpAddr = "192.0.2.10".parse().unwrap();
    let mut dns = MockDns::default();
    dns.ptr.insert(ip, vec!["mail.example.com".to_string()]);
    dns.a.insert(
        "mail.example.com".to_string(),
        vec!["192.0.2.10".parse().unwrap()],
    );
    let (mut pipeline, _collector) =
        build_pipeline(config, vec![Box::new(VerdictHandler)], dns);

    assert_eq!(
        pipeline.top_connect("mail.example.com", ip).await,
        EventResponse::Continue
    );
    assert_eq!(
        pipeline.top_helo("mail.example.com").await,
        EventResponse::Continue
    );
    pipeline.top_envfrom("alice@example.com").await;
    pipeline.top_envrcpt("bob@example.net").await;
    pipeline.top_header("From", "alice@example.com").await;
    pipeline
        .top_header("DKIM-Signature", "v=1; a=rsa-sha256; d=example.com; s=s1; b=xyz")
        .await;
    pipeline.top_eoh().await;
    pipeline.top_body(b"Hello Bob\r\n").await;
    let (response, ops) = pipeline.top_eom().await;

    assert_eq!(response, EventResponse::Continue);
    let value = auth_results(&ops);
    assert!(value.starts_with("mx.example.com;"));
    assert!(value.contains("iprev=pass"));
    assert!(value.contains("spf=pass"));
    assert!(value.contains("dkim=pass"));
    assert!(value.contains("dmarc=pass"));
    assert!(ops.contains(&HeaderOp::Add {
        name: "X-Authentication-Milter".to_string(),
        value: "Header added by Authentication Milter".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn dns_timeout_tempfails_and_counts() {
    let config = Config {
        connect_timeout: 2,
        load_handlers: Vec::new(),
        ..Config::default()
    };
    let (mut pipeline, collector) =
        build_pipeline(config, vec![Box::new(SlowHandler)], MockDns::default());

    let response = pipeline
        .top_connect("mail.example.com", "192.0.2.10".parse().unwrap())
        .await;
    assert_eq!(
        response,
        EventResponse::Tempfail("451 4.7.1 Please try again later".to_string())
    );
    assert!(pipeline.ctx.exit_on_close);

    settle_metrics().await;
    let registry = collector.registry();
    let registry = registry.lock().unwrap();
    assert_eq!(
        registry.get(
            "callback_error_total",
            &[("handler", "Slow"), ("stage", "connect"), ("type", "Timeout")]
        ),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn timeout_without_tempfail_policy_continues() {
    let config = Config {
        connect_timeout: 2,
        tempfail_on_error: false,
        load_handlers: Vec::new(),
        ..Config::default()
    };
    let (mut pipeline, _collector) =
        build_pipeline(config, vec![Box::new(SlowHandler)], MockDns::default());
    let response = pipeline
        .top_connect("mail.example.com", "192.0.2.10".parse().unwrap())
        .await;
    assert_eq!(response, EventResponse::Continue);
    assert!(pipeline.ctx.exit_on_close);
}

#[tokio::test]
async fn ip_remap_is_visible_to_handlers() {
    let mut config = Config {
        load_handlers: Vec::new(),
        ..Config::default()
    };
    config.ip_map.insert(
        "198.51.100.0/24".to_string(),
        auth_milter::ipmap::IpMapEntry {
            ip: Some("192.0.2.5".parse().unwrap()),
            helo: Some("masked.example".to_string()),
        },
    );
    let (mut pipeline, _collector) =
        build_pipeline(config, vec![Box::new(ObserverHandler)], MockDns::default());

    pipeline
        .top_connect("orig.example", "198.51.100.77".parse().unwrap())
        .await;
    pipeline.top_helo("orig.example").await;

    assert_eq!(pipeline.ctx.raw_ip, Some("198.51.100.77".parse().unwrap()));
    assert_eq!(pipeline.ctx.get_state("Observer.ip"), Some("192.0.2.5"));
    assert_eq!(pipeline.ctx.raw_helo.as_deref(), Some("orig.example"));
    assert_eq!(
        pipeline.ctx.get_state("Observer.helo"),
        Some("masked.example")
    );
}

#[tokio::test]
async fn handler_reject_reaches_the_mta_verbatim() {
    let config = Config {
        load_handlers: Vec::new(),
        ..Config::default()
    };
    let (mut pipeline, _collector) = build_pipeline(
        config,
        vec![Box::new(RejectingHandler {
            reason: "550 5.7.1 SPF hardfail",
        })],
        MockDns::default(),
    );
    pipeline
        .top_connect("mail.example.com", "192.0.2.10".parse().unwrap())
        .await;
    let response = pipeline.top_envfrom("alice@example.com").await;
    assert_eq!(
        response,
        EventResponse::Reject("550 5.7.1 SPF hardfail".to_string())
    );
}

#[tokio::test]
async fn invalid_reject_reason_is_replaced() {
    let config = Config {
        load_handlers: Vec::new(),
        ..Config::default()
    };
    let (mut pipeline, _collector) = build_pipeline(
        config,
        vec![Box::new(RejectingHandler { reason: "nope" })],
        MockDns::default(),
    );
    pipeline
        .top_connect("mail.example.com", "192.0.2.10".parse().unwrap())
        .await;
    let response = pipeline.top_envfrom("alice@example.com").await;
    assert_eq!(
        response,
        EventResponse::Reject("550 5.0.0 Message rejected".to_string())
    );
}

#[tokio::test]
async fn second_helo_does_not_reach_handlers() {
    let config = Config {
        load_handlers: Vec::new(),
        ..Config::default()
    };
    let (mut pipeline, _collector) =
        build_pipeline(config, vec![Box::new(ObserverHandler)], MockDns::default());
    pipeline
        .top_connect("mail.example.com", "192.0.2.10".parse().unwrap())
        .await;
    pipeline.top_helo("a.example").await;
    pipeline.top_helo("b.example").await;
    assert_eq!(pipeline.ctx.helo_name.as_deref(), Some("a.example"));
    assert_eq!(pipeline.ctx.get_state("Observer.helo_count"), Some("1"));
    assert_eq!(pipeline.ctx.get_state("Observer.helo"), Some("a.example"));
}

#[tokio::test]
async fn quarantine_adds_marker_header_and_continues() {
    let config = Config {
        hostname: Some("mx.example.com".to_string()),
        load_handlers: Vec::new(),
        ..Config::default()
    };
    let (mut pipeline, _collector) =
        build_pipeline(config, vec![Box::new(QuarantiningHandler)], MockDns::default());
    pipeline
        .top_connect("mail.example.com", "192.0.2.10".parse().unwrap())
        .await;
    pipeline.top_envfrom("alice@example.com").await;
    let (response, ops) = pipeline.top_eom().await;
    assert_eq!(response, EventResponse::Continue);
    assert_eq!(
        ops[1],
        HeaderOp::Insert {
            index: 2,
            name: "X-Disposition-Quarantine".to_string(),
            value: "suspicious content".to_string(),
        }
    );
}

#[tokio::test]
async fn milter_session_over_the_wire() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let config = Config {
        hostname: Some("mx.example.com".to_string()),
        load_handlers: vec!["AddID".to_string()],
        session_timeout: 0,
        ..Config::default()
    };
    let collector = MetricsCollector::new();
    Pipeline::register_base_metrics(&collector);
    let registry = Arc::new(HandlerRegistry::build(&config, None).unwrap());
    let mut pipeline =
        Pipeline::new(Arc::new(config), registry, collector.worker()).unwrap();
    let shared: Arc<dyn Dns> = Arc::new(MockDns::default());
    pipeline.ctx.objects.set_object("resolver", shared, false);

    let (server_side, mut client) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(async move {
        let mut connection = auth_milter::milter::MilterConnection::new(server_side, pipeline);
        connection.handle(None).await.unwrap()
    });

    async fn send_packet(
        client: &mut tokio::io::DuplexStream,
        command: u8,
        data: &[u8],
    ) {
        let len = (data.len() + 1) as u32;
        client.write_all(&len.to_be_bytes()).await.unwrap();
        client.write_all(&[command]).await.unwrap();
        client.write_all(data).await.unwrap();
    }

    async fn read_packet(client: &mut tokio::io::DuplexStream) -> (u8, Vec<u8>) {
        let mut len_buf = [0u8; 4];
        client.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut data = vec![0u8; len];
        client.read_exact(&mut data).await.unwrap();
        (data[0], data[1..].to_vec())
    }

    // Option negotiation.
    let mut optneg = Vec::new();
    optneg.extend_from_slice(&6u32.to_be_bytes());
    optneg.extend_from_slice(&0x3fu32.to_be_bytes());
    optneg.extend_from_slice(&0u32.to_be_bytes());
    send_packet(&mut client, b'O', &optneg).await;
    let (code, data) = read_packet(&mut client).await;
    assert_eq!(code, b'O');
    assert_eq!(&data[..4], &6u32.to_be_bytes());

    // Connect.
    let mut connect = b"mail.example.com\0".to_vec();
    connect.push(b'4');
    connect.extend_from_slice(&25u16.to_be_bytes());
    connect.extend_from_slice(b"192.0.2.10\0");
    send_packet(&mut client, b'C', &connect).await;
    assert_eq!(read_packet(&mut client).await.0, b'c');

    send_packet(&mut client, b'H', b"mail.example.com\0").await;
    assert_eq!(read_packet(&mut client).await.0, b'c');

    // Queue id macro for MAIL, then the envelope.
    send_packet(&mut client, b'D', b"Mi\0QID42\0").await;
    send_packet(&mut client, b'M', b"<alice@example.com>\0").await;
    assert_eq!(read_packet(&mut client).await.0, b'c');
    send_packet(&mut client, b'R', b"<bob@example.net>\0").await;
    assert_eq!(read_packet(&mut client).await.0, b'c');

    send_packet(&mut client, b'L', b"From\0alice@example.com\0").await;
    assert_eq!(read_packet(&mut client).await.0, b'c');
    send_packet(&mut client, b'N', b"").await;
    assert_eq!(read_packet(&mut client).await.0, b'c');
    send_packet(&mut client, b'B', b"Hello Bob\r\n").await;
    assert_eq!(read_packet(&mut client).await.0, b'c');

    // End of message: expect the insheader, the addheader, then continue.
    send_packet(&mut client, b'E', b"").await;
    let (code, data) = read_packet(&mut client).await;
    assert_eq!(code, b'i');
    assert_eq!(&data[..4], &1u32.to_be_bytes());
    let text = String::from_utf8_lossy(&data[4..]);
    assert!(text.starts_with("Authentication-Results\0mx.example.com;"));
    let (code, data) = read_packet(&mut client).await;
    assert_eq!(code, b'h');
    assert!(String::from_utf8_lossy(&data).starts_with("X-Authentication-Milter\0"));
    assert_eq!(read_packet(&mut client).await.0, b'c');

    send_packet(&mut client, b'Q', b"").await;
    drop(client);
    let exit_on_close = server.await.unwrap();
    assert!(!exit_on_close);
}
