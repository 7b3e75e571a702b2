use crate::disposition::EventResponse;
use crate::headers::HeaderOp;
use crate::pipeline::Pipeline;
use std::net::IpAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

const MAX_LINE: usize = 8192;
const MAX_MESSAGE: usize = 64 * 1024 * 1024;

/// SMTP proxy session: accepts SMTP from the MTA side, drives the same
/// pipeline events as the milter path, applies the queued header mutations
/// to the buffered message, and relays accepted mail downstream.
pub struct SmtpProxyConnection<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    pipeline: Pipeline,
    peer_ip: IpAddr,
    downstream: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

impl<S: AsyncRead + AsyncWrite + Send> SmtpProxyConnection<S> {
    pub fn new(
        stream: S,
        peer_ip: IpAddr,
        pipeline: Pipeline,
        downstream: Option<String>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            pipeline,
            peer_ip,
            downstream,
            mail_from: None,
            rcpt_to: Vec::new(),
        }
    }

    pub async fn handle(
        &mut self,
        session_budget: Option<std::time::Duration>,
    ) -> anyhow::Result<bool> {
        if let Some(budget) = session_budget {
            self.pipeline.ctx.timer.set_overall(budget);
        }
        self.pipeline.top_setup().await;

        let hostname = self.pipeline.ctx.hostname.clone();
        let peer = format!("[{}]", self.peer_ip);
        match self.pipeline.top_connect(&peer, self.peer_ip).await {
            EventResponse::Reject(reason) | EventResponse::Tempfail(reason) => {
                self.reply(&reason).await?;
                return Ok(self.pipeline.ctx.exit_on_close);
            }
            _ => {}
        }
        self.reply(&format!("220 {hostname} ESMTP ready")).await?;

        loop {
            let Some(line) = self.read_line().await? else {
                let _ = self.pipeline.top_close().await;
                break;
            };
            let upper = line.to_uppercase();

            if upper.starts_with("EHLO ") {
                let domain = line["EHLO ".len()..].trim().to_string();
                self.pipeline.top_helo(&domain).await;
                self.reply(&format!("250-{hostname}\r\n250-PIPELINING\r\n250 8BITMIME"))
                    .await?;
            } else if upper.starts_with("HELO ") {
                let domain = line["HELO ".len()..].trim().to_string();
                self.pipeline.top_helo(&domain).await;
                self.reply(&format!("250 {hostname}")).await?;
            } else if upper.starts_with("MAIL FROM:") {
                let arg = line["MAIL FROM:".len()..].trim().to_string();
                let arg = arg.split_whitespace().next().unwrap_or_default().to_string();
                let response = self.pipeline.top_envfrom(&arg).await;
                if self.reply_command(&response, "250 2.1.0 Ok").await? {
                    self.mail_from = Some(arg);
                }
            } else if upper.starts_with("RCPT TO:") {
                if self.mail_from.is_none() {
                    self.reply("503 5.5.1 MAIL first").await?;
                    continue;
                }
                let arg = line["RCPT TO:".len()..].trim().to_string();
                let arg = arg.split_whitespace().next().unwrap_or_default().to_string();
                let response = self.pipeline.top_envrcpt(&arg).await;
                if self.reply_command(&response, "250 2.1.5 Ok").await? {
                    self.rcpt_to.push(arg);
                }
            } else if upper.trim() == "DATA" {
                if self.rcpt_to.is_empty() {
                    self.reply("503 5.5.1 RCPT first").await?;
                    continue;
                }
                self.reply("354 End data with <CR><LF>.<CR><LF>").await?;
                self.process_data().await?;
                self.mail_from = None;
                self.rcpt_to.clear();
            } else if upper.trim() == "RSET" {
                self.pipeline.top_abort().await;
                self.mail_from = None;
                self.rcpt_to.clear();
                self.reply("250 2.0.0 Ok").await?;
            } else if upper.trim() == "NOOP" {
                self.reply("250 2.0.0 Ok").await?;
            } else if upper.trim() == "QUIT" {
                self.pipeline.top_close().await;
                self.reply("221 2.0.0 Bye").await?;
                break;
            } else {
                self.reply("502 5.5.2 Command not implemented").await?;
            }
        }
        Ok(self.pipeline.ctx.exit_on_close)
    }

    /// Read the DATA payload, run the content events, apply the header
    /// mutations, and answer the client with the final disposition.
    async fn process_data(&mut self) -> anyhow::Result<()> {
        let mut raw_lines: Vec<String> = Vec::new();
        let mut size = 0usize;
        loop {
            let Some(line) = self.read_line().await? else {
                anyhow::bail!("connection lost during DATA");
            };
            if line == "." {
                break;
            }
            // Transparency: leading dot-doubling undone.
            let line = line.strip_prefix('.').map(str::to_string).unwrap_or(line);
            size += line.len() + 2;
            if size > MAX_MESSAGE {
                // Drain to the end-of-data marker before answering, or the
                // client's remaining payload would be read as commands.
                loop {
                    match self.read_line().await? {
                        Some(rest) if rest == "." => break,
                        Some(_) => {}
                        None => anyhow::bail!("connection lost during DATA"),
                    }
                }
                self.reply("552 5.3.4 Message too big").await?;
                self.pipeline.top_abort().await;
                return Ok(());
            }
            raw_lines.push(line);
        }

        let (mut headers, body) = split_message(&raw_lines);
        for (name, value) in &headers {
            self.pipeline.top_header(name, value).await;
        }
        self.pipeline.top_eoh().await;
        let body_text = body.join("\r\n");
        if !body_text.is_empty() {
            self.pipeline.top_body(body_text.as_bytes()).await;
        }

        let (response, ops) = self.pipeline.top_eom().await;
        match response {
            EventResponse::Reject(reason) | EventResponse::Tempfail(reason) => {
                self.reply(&reason).await?;
                return Ok(());
            }
            EventResponse::Discard => {
                self.reply("250 2.0.0 Ok").await?;
                return Ok(());
            }
            EventResponse::Continue | EventResponse::Accept => {}
        }

        apply_header_ops(&mut headers, &ops);
        let message = render_message(&headers, &body);
        let reply = match &self.downstream {
            Some(addr) => {
                let hostname = self.pipeline.ctx.hostname.clone();
                let mail_from = self.mail_from.clone().unwrap_or_default();
                match relay_downstream(addr, &hostname, &mail_from, &self.rcpt_to, &message).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::warn!("downstream relay to {addr} failed: {e}");
                        "451 4.4.1 Relay unavailable".to_string()
                    }
                }
            }
            None => "250 2.0.0 Ok".to_string(),
        };
        self.reply(&reply).await?;
        Ok(())
    }

    /// Map a per-command pipeline response onto the wire; true when the
    /// command was accepted.
    async fn reply_command(
        &mut self,
        response: &EventResponse,
        ok: &str,
    ) -> anyhow::Result<bool> {
        match response {
            EventResponse::Reject(reason) | EventResponse::Tempfail(reason) => {
                let reason = reason.clone();
                self.reply(&reason).await?;
                Ok(false)
            }
            _ => {
                self.reply(ok).await?;
                Ok(true)
            }
        }
    }

    async fn reply(&mut self, text: &str) -> anyhow::Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_LINE {
            anyhow::bail!("line too long");
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }
}

/// Split raw message lines into unfolded headers and body lines.
fn split_message(lines: &[String]) -> (Vec<(String, String)>, Vec<String>) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body_start = lines.len();
    for (pos, line) in lines.iter().enumerate() {
        if line.is_empty() {
            body_start = pos + 1;
            break;
        }
        if (line.starts_with(' ') || line.starts_with('\t')) && !headers.is_empty() {
            let last = headers.last_mut().unwrap();
            last.1.push_str("\r\n");
            last.1.push_str(line);
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.to_string(), value.trim_start().to_string()));
        } else {
            // Not a header line; treat the rest as body.
            body_start = pos;
            break;
        }
    }
    (headers, lines[body_start.min(lines.len())..].to_vec())
}

/// Apply queued mutations to the buffered header list.
fn apply_header_ops(headers: &mut Vec<(String, String)>, ops: &[HeaderOp]) {
    for op in ops {
        match op {
            HeaderOp::Insert { index, name, value } => {
                let pos = (*index as usize).saturating_sub(1).min(headers.len());
                headers.insert(pos, (name.clone(), value.clone()));
            }
            HeaderOp::Add { name, value } => {
                headers.push((name.clone(), value.clone()));
            }
            HeaderOp::Change {
                name,
                occurrence,
                value,
            } => {
                let mut seen = 0u32;
                for pos in 0..headers.len() {
                    if headers[pos].0.eq_ignore_ascii_case(name) {
                        seen += 1;
                        if seen == *occurrence {
                            if value.is_empty() {
                                headers.remove(pos);
                            } else {
                                headers[pos].1 = value.clone();
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn render_message(headers: &[(String, String)], body: &[String]) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    for line in body {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

async fn read_reply(reader: &mut BufReader<ReadHalf<TcpStream>>) -> anyhow::Result<String> {
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            anyhow::bail!("downstream closed");
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        if line.len() < 4 || line.as_bytes()[3] != b'-' {
            return Ok(line);
        }
    }
}

/// Minimal SMTP client used to hand the (possibly rewritten) message to
/// the downstream server. Returns the downstream's final DATA reply.
async fn relay_downstream(
    addr: &str,
    hostname: &str,
    mail_from: &str,
    rcpt_to: &[String],
    message: &str,
) -> anyhow::Result<String> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let greeting = read_reply(&mut reader).await?;
    if !greeting.starts_with("220") {
        anyhow::bail!("unexpected downstream greeting: {greeting}");
    }

    send_line(&mut writer, &format!("EHLO {hostname}")).await?;
    let reply = read_reply(&mut reader).await?;
    if !reply.starts_with("250") {
        anyhow::bail!("downstream rejected EHLO: {reply}");
    }
    send_line(&mut writer, &format!("MAIL FROM:{}", angle_wrap(mail_from))).await?;
    let reply = read_reply(&mut reader).await?;
    if !reply.starts_with("250") {
        anyhow::bail!("downstream rejected MAIL: {reply}");
    }
    for rcpt in rcpt_to {
        send_line(&mut writer, &format!("RCPT TO:{}", angle_wrap(rcpt))).await?;
        let reply = read_reply(&mut reader).await?;
        if !reply.starts_with("250") {
            anyhow::bail!("downstream rejected RCPT: {reply}");
        }
    }
    send_line(&mut writer, "DATA").await?;
    let reply = read_reply(&mut reader).await?;
    if !reply.starts_with("354") {
        anyhow::bail!("downstream rejected DATA: {reply}");
    }
    for line in message.split("\r\n") {
        // Dot transparency on the way out.
        if line.starts_with('.') {
            send_line(&mut writer, &format!(".{line}")).await?;
        } else {
            send_line(&mut writer, line).await?;
        }
    }
    send_line(&mut writer, ".").await?;
    let final_reply = read_reply(&mut reader).await?;
    send_line(&mut writer, "QUIT").await?;
    Ok(final_reply)
}

async fn send_line(writer: &mut WriteHalf<TcpStream>, text: &str) -> anyhow::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;
    Ok(())
}

fn angle_wrap(addr: &str) -> String {
    if addr.starts_with('<') {
        addr.to_string()
    } else {
        format!("<{addr}>")
    }
}
