use crate::disposition::EventResponse;
use crate::headers::HeaderOp;
use crate::pipeline::Pipeline;
use crate::symbols::SymbolStage;
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Milter protocol commands
const SMFIC_ABORT: u8 = b'A';
const SMFIC_BODY: u8 = b'B';
const SMFIC_CONNECT: u8 = b'C';
const SMFIC_MACRO: u8 = b'D';
const SMFIC_BODYEOB: u8 = b'E';
const SMFIC_HELO: u8 = b'H';
const SMFIC_HEADER: u8 = b'L';
const SMFIC_MAIL: u8 = b'M';
const SMFIC_EOH: u8 = b'N';
const SMFIC_OPTNEG: u8 = b'O';
const SMFIC_QUIT: u8 = b'Q';
const SMFIC_RCPT: u8 = b'R';
const SMFIC_DATA: u8 = b'T';

// Milter protocol responses
const SMFIR_ACCEPT: u8 = b'a';
const SMFIR_CONTINUE: u8 = b'c';
const SMFIR_DISCARD: u8 = b'd';
const SMFIR_ADDHEADER: u8 = b'h';
const SMFIR_INSHEADER: u8 = b'i';
const SMFIR_CHGHEADER: u8 = b'm';
const SMFIR_REPLYCODE: u8 = b'y';

// Actions negotiated with the MTA
const SMFIF_ADDHDRS: u32 = 0x01;
const SMFIF_CHGHDRS: u32 = 0x02;

const MAX_PACKET: usize = 64 * 1024 * 1024;

/// One milter session: decodes MTA packets, drives the pipeline events,
/// and encodes the pipeline's answers and header mutations back.
pub struct MilterConnection<S> {
    stream: S,
    pipeline: Pipeline,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> MilterConnection<S> {
    pub fn new(stream: S, pipeline: Pipeline) -> Self {
        Self { stream, pipeline }
    }

    /// Run the session to completion. Returns true when the worker should
    /// recycle instead of serving another connection.
    pub async fn handle(&mut self, session_budget: Option<std::time::Duration>) -> anyhow::Result<bool> {
        if let Some(budget) = session_budget {
            self.pipeline.ctx.timer.set_overall(budget);
        }
        self.pipeline.top_setup().await;

        loop {
            match self.read_packet().await? {
                Some((command, data)) => {
                    if !self.process_command(command, data).await? {
                        break;
                    }
                }
                None => {
                    log::debug!("milter peer closed the connection");
                    let _ = self.pipeline.top_close().await;
                    break;
                }
            }
        }
        Ok(self.pipeline.ctx.exit_on_close)
    }

    async fn read_packet(&mut self) -> anyhow::Result<Option<(u8, Vec<u8>)>> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_PACKET {
            anyhow::bail!("oversized milter packet: {len} bytes");
        }

        let mut cmd_buf = [0u8; 1];
        self.stream.read_exact(&mut cmd_buf).await?;
        let mut data = vec![0u8; len - 1];
        if len > 1 {
            self.stream.read_exact(&mut data).await?;
        }
        Ok(Some((cmd_buf[0], data)))
    }

    async fn send_response(&mut self, response: u8, data: &[u8]) -> anyhow::Result<()> {
        let len = (data.len() + 1) as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&[response]).await?;
        if !data.is_empty() {
            self.stream.write_all(data).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn respond(&mut self, response: EventResponse) -> anyhow::Result<()> {
        match response {
            EventResponse::Continue => self.send_response(SMFIR_CONTINUE, &[]).await,
            EventResponse::Accept => self.send_response(SMFIR_ACCEPT, &[]).await,
            EventResponse::Discard => self.send_response(SMFIR_DISCARD, &[]).await,
            EventResponse::Reject(reason) | EventResponse::Tempfail(reason) => {
                let mut data = reason.into_bytes();
                data.push(0);
                self.send_response(SMFIR_REPLYCODE, &data).await
            }
        }
    }

    async fn write_header_ops(&mut self, ops: Vec<HeaderOp>) -> anyhow::Result<()> {
        for op in ops {
            match op {
                HeaderOp::Insert { index, name, value } => {
                    let mut data = index.to_be_bytes().to_vec();
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                    data.extend_from_slice(value.as_bytes());
                    data.push(0);
                    self.send_response(SMFIR_INSHEADER, &data).await?;
                }
                HeaderOp::Add { name, value } => {
                    let mut data = name.into_bytes();
                    data.push(0);
                    data.extend_from_slice(value.as_bytes());
                    data.push(0);
                    self.send_response(SMFIR_ADDHEADER, &data).await?;
                }
                HeaderOp::Change {
                    name,
                    occurrence,
                    value,
                } => {
                    let mut data = occurrence.to_be_bytes().to_vec();
                    data.extend_from_slice(name.as_bytes());
                    data.push(0);
                    data.extend_from_slice(value.as_bytes());
                    data.push(0);
                    self.send_response(SMFIR_CHGHEADER, &data).await?;
                }
            }
        }
        Ok(())
    }

    async fn process_command(&mut self, command: u8, data: Vec<u8>) -> anyhow::Result<bool> {
        match command {
            SMFIC_OPTNEG => {
                let offered_version = if data.len() >= 4 {
                    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
                } else {
                    6
                };
                let mut response = Vec::with_capacity(12);
                response.extend_from_slice(&offered_version.min(6).to_be_bytes());
                response.extend_from_slice(&(SMFIF_ADDHDRS | SMFIF_CHGHDRS).to_be_bytes());
                // All protocol steps wanted.
                response.extend_from_slice(&0u32.to_be_bytes());
                self.send_response(SMFIC_OPTNEG, &response).await?;
                Ok(true)
            }
            SMFIC_MACRO => {
                if let Some((stage, macros)) = parse_macro_data(&data) {
                    for (name, value) in macros {
                        self.pipeline.ctx.symbols.set_symbol(stage, &name, &value);
                    }
                }
                // Macros carry no reply.
                Ok(true)
            }
            SMFIC_CONNECT => {
                let (hostname, ip) = parse_connect_data(&data);
                let ip = ip.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
                let response = self.pipeline.top_connect(&hostname, ip).await;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_HELO => {
                let helo = cstring_arg(&data);
                let response = self.pipeline.top_helo(&helo).await;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_MAIL => {
                let from = cstring_arg(&data);
                let response = self.pipeline.top_envfrom(&from).await;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_RCPT => {
                let rcpt = cstring_arg(&data);
                let response = self.pipeline.top_envrcpt(&rcpt).await;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_DATA => {
                self.send_response(SMFIR_CONTINUE, &[]).await?;
                Ok(true)
            }
            SMFIC_HEADER => {
                let (name, value) = parse_header_data(&data);
                let response = self.pipeline.top_header(&name, &value).await;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_EOH => {
                let response = self.pipeline.top_eoh().await;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_BODY => {
                let response = self.pipeline.top_body(&data).await;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_BODYEOB => {
                let (response, ops) = self.pipeline.top_eom().await;
                self.write_header_ops(ops).await?;
                self.respond(response).await?;
                Ok(true)
            }
            SMFIC_ABORT => {
                let _ = self.pipeline.top_abort().await;
                // Abort carries no reply.
                Ok(true)
            }
            SMFIC_QUIT => {
                let _ = self.pipeline.top_close().await;
                Ok(false)
            }
            other => {
                log::warn!("unknown milter command 0x{other:02x}");
                self.send_response(SMFIR_CONTINUE, &[]).await?;
                Ok(true)
            }
        }
    }
}

fn cstring_arg(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .split('\0')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Connect packet: `hostname\0 family port(2) address\0`.
fn parse_connect_data(data: &[u8]) -> (String, Option<IpAddr>) {
    let mut parts = data.splitn(2, |&b| b == 0);
    let hostname = String::from_utf8_lossy(parts.next().unwrap_or_default()).to_string();
    let rest = parts.next().unwrap_or_default();
    if rest.len() < 3 {
        return (hostname, None);
    }
    let family = rest[0];
    let address = String::from_utf8_lossy(&rest[3..])
        .trim_end_matches('\0')
        .to_string();
    let ip = match family {
        b'4' | b'6' => address.parse().ok(),
        // Unix socket peers are local by definition.
        b'L' | b'U' => Some(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        _ => None,
    };
    (hostname, ip)
}

/// Macro packet: stage command byte, then `name\0value\0` pairs. Multi-char
/// macro names arrive wrapped in braces; those are stripped.
fn parse_macro_data(data: &[u8]) -> Option<(SymbolStage, Vec<(String, String)>)> {
    let stage = SymbolStage::from_code(*data.first()?)?;
    let text = String::from_utf8_lossy(&data[1..]);
    let mut fields = text.split('\0');
    let mut macros = Vec::new();
    while let (Some(name), Some(value)) = (fields.next(), fields.next()) {
        if name.is_empty() {
            continue;
        }
        let name = name.trim_start_matches('{').trim_end_matches('}');
        macros.push((name.to_string(), value.to_string()));
    }
    Some((stage, macros))
}

/// Header packet: `name\0value\0`.
fn parse_header_data(data: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(data);
    let mut parts = text.split('\0');
    let name = parts.next().unwrap_or_default().to_string();
    let value = parts.next().unwrap_or_default().to_string();
    (name, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_packet_parses_ipv4() {
        let mut data = b"mail.example.com\0".to_vec();
        data.push(b'4');
        data.extend_from_slice(&25u16.to_be_bytes());
        data.extend_from_slice(b"192.0.2.10\0");
        let (hostname, ip) = parse_connect_data(&data);
        assert_eq!(hostname, "mail.example.com");
        assert_eq!(ip, Some("192.0.2.10".parse().unwrap()));
    }

    #[test]
    fn connect_packet_unix_peer_is_local() {
        let mut data = b"localhost\0".to_vec();
        data.push(b'L');
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(b"/var/run/mta.sock\0");
        let (_, ip) = parse_connect_data(&data);
        assert_eq!(ip, Some("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn macro_packet_strips_braces() {
        let data = b"M{auth_authen}\0alice\0i\0QID123\0";
        let (stage, macros) = parse_macro_data(data).unwrap();
        assert_eq!(stage, SymbolStage::Mail);
        assert_eq!(
            macros,
            vec![
                ("auth_authen".to_string(), "alice".to_string()),
                ("i".to_string(), "QID123".to_string())
            ]
        );
    }

    #[test]
    fn header_packet_splits_name_and_value() {
        let (name, value) = parse_header_data(b"Subject\0Hello there\0");
        assert_eq!(name, "Subject");
        assert_eq!(value, "Hello there");
    }
}
