/// SMTP capability: a small blocking mail client.
///
/// The server configuration travels with each call; there is no ambient
/// allowlist for mail. Supports plaintext, STARTTLS and implicit TLS,
/// with AUTH PLAIN when credentials are given.
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info};

use super::CapError;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Longest reply line we accept from a server.
const MAX_REPLY_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Plain,
    #[default]
    Starttls,
    Tls,
}

impl TlsMode {
    fn default_port(self) -> u16 {
        match self {
            TlsMode::Plain => 25,
            TlsMode::Starttls => 587,
            TlsMode::Tls => 465,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: TlsMode,
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_tls_verify() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

/// One recipient or several.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Recipients::One(one) => std::slice::from_ref(one),
            Recipients::Many(many) => many,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailMessage {
    pub from: String,
    pub to: Recipients,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

// ── Validation & formatting ─────────────────────────────

fn reject_line_breaks(field: &str, value: &str) -> Result<(), CapError> {
    if value.contains(['\r', '\n']) {
        return Err(CapError::InvalidArgument(format!(
            "{field} must not contain line breaks"
        )));
    }
    Ok(())
}

fn validate_address(field: &str, addr: &str) -> Result<(), CapError> {
    reject_line_breaks(field, addr)?;
    let valid = !addr.is_empty()
        && addr.len() <= 320
        && !addr.contains(['<', '>', ' ', ','])
        && addr
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && !domain.is_empty());
    if !valid {
        return Err(CapError::InvalidArgument(format!("{field}: invalid address '{addr}'")));
    }
    Ok(())
}

fn validate(message: &MailMessage) -> Result<(), CapError> {
    validate_address("from", &message.from)?;
    let to = message.to.as_slice();
    if to.is_empty() {
        return Err(CapError::InvalidArgument("at least one recipient is required".into()));
    }
    for addr in to {
        validate_address("to", addr)?;
    }
    reject_line_breaks("subject", &message.subject)?;
    reject_line_breaks("content_type", &message.content_type)?;
    Ok(())
}

/// RFC 2047 encoded-word for non-ASCII header text.
fn encode_header_text(text: &str) -> String {
    if text.is_ascii() {
        text.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", B64.encode(text))
    }
}

/// Normalizes line endings to CRLF and dot-stuffs the body.
fn encode_body(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 16);
    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Renders the DATA section (headers and body, without the final dot).
pub fn render(message: &MailMessage, date: &str, message_id: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("From: <{}>\r\n", message.from));
    let to: Vec<String> = message.to.as_slice().iter().map(|a| format!("<{a}>")).collect();
    out.push_str(&format!("To: {}\r\n", to.join(", ")));
    out.push_str(&format!("Subject: {}\r\n", encode_header_text(&message.subject)));
    out.push_str(&format!("Date: {date}\r\n"));
    out.push_str(&format!("Message-ID: <{message_id}>\r\n"));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str(&format!("Content-Type: {}\r\n", message.content_type));
    out.push_str("Content-Transfer-Encoding: 8bit\r\n");
    out.push_str("\r\n");
    out.push_str(&encode_body(&message.body));
    out
}

// ── Wire protocol ───────────────────────────────────────

enum Transport {
    Plain(TcpStream),
    Tls(native_tls::TlsStream<TcpStream>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

struct Session {
    stream: BufReader<Transport>,
}

fn io_err(e: std::io::Error) -> CapError {
    CapError::from_io("smtp", e)
}

fn tls_err(e: impl std::fmt::Display) -> CapError {
    CapError::Io(format!("smtp tls: {e}"))
}

impl Session {
    fn read_reply(&mut self) -> Result<Reply, CapError> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            let n = (&mut self.stream)
                .take(MAX_REPLY_LINE as u64)
                .read_line(&mut line)
                .map_err(io_err)?;
            if n == 0 {
                return Err(CapError::Io("smtp: connection closed by server".into()));
            }
            let line = line.trim_end();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| CapError::Io(format!("smtp: malformed reply '{line}'")))?;
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line.get(4..).unwrap_or(""));
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(Reply { code, text });
            }
        }
    }

    fn expect(&mut self, class: u16) -> Result<Reply, CapError> {
        let reply = self.read_reply()?;
        if reply.code / 100 != class {
            return Err(match reply.code {
                535 => CapError::Denied(format!("smtp authentication failed: {}", reply.text)),
                _ => CapError::Io(format!("smtp: {} {}", reply.code, reply.text)),
            });
        }
        Ok(reply)
    }

    fn command(&mut self, line: &str, class: u16) -> Result<Reply, CapError> {
        debug!("SMTP >> {}", line.split(' ').next().unwrap_or(line));
        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{line}\r\n").as_bytes())
            .and_then(|_| stream.flush())
            .map_err(io_err)?;
        self.expect(class)
    }

    fn upgrade(self, host: &str, verify: bool) -> Result<Self, CapError> {
        let Transport::Plain(tcp) = self.stream.into_inner() else {
            return Err(CapError::Io("smtp: connection already encrypted".into()));
        };
        let tls = wrap_tls(tcp, host, verify)?;
        Ok(Session {
            stream: BufReader::new(Transport::Tls(tls)),
        })
    }
}

fn wrap_tls(
    tcp: TcpStream,
    host: &str,
    verify: bool,
) -> Result<native_tls::TlsStream<TcpStream>, CapError> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!verify)
        .build()
        .map_err(tls_err)?;
    connector.connect(host, tcp).map_err(tls_err)
}

fn connect(config: &SmtpConfig, timeout: Duration) -> Result<TcpStream, CapError> {
    let port = config.port.unwrap_or_else(|| config.tls.default_port());
    let addrs = (config.host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| CapError::Io(format!("smtp: cannot resolve {}: {e}", config.host)))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout)).map_err(io_err)?;
                stream.set_write_timeout(Some(timeout)).map_err(io_err)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => io_err(e),
        None => CapError::Io(format!("smtp: no address for {}", config.host)),
    })
}

/// Sends one message. Blocks until the server accepts or rejects it.
pub fn send(config: &SmtpConfig, message: &MailMessage) -> Result<(), CapError> {
    validate(message)?;
    reject_line_breaks("host", &config.host)?;
    if config.host.is_empty() {
        return Err(CapError::InvalidArgument("smtp host is required".into()));
    }
    let credentials = match (&config.username, &config.password) {
        (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
        (None, None) => None,
        _ => {
            return Err(CapError::InvalidArgument(
                "username and password must be given together".into(),
            ))
        }
    };
    if credentials.is_some() && config.tls == TlsMode::Plain {
        return Err(CapError::Denied(
            "refusing to send credentials over an unencrypted connection".into(),
        ));
    }

    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let tcp = connect(config, timeout)?;
    let transport = match config.tls {
        TlsMode::Tls => Transport::Tls(wrap_tls(tcp, &config.host, config.tls_verify)?),
        _ => Transport::Plain(tcp),
    };
    let mut session = Session {
        stream: BufReader::new(transport),
    };

    session.expect(2)?;
    let ehlo = session.command("EHLO localhost", 2)?;

    if config.tls == TlsMode::Starttls {
        if !ehlo.text.lines().any(|l| l.eq_ignore_ascii_case("STARTTLS")) {
            return Err(CapError::Io("smtp: server does not offer STARTTLS".into()));
        }
        session.command("STARTTLS", 2)?;
        session = session.upgrade(&config.host, config.tls_verify)?;
        session.command("EHLO localhost", 2)?;
    }

    if let Some((user, pass)) = credentials {
        let token = B64.encode(format!("\0{user}\0{pass}"));
        session.command(&format!("AUTH PLAIN {token}"), 2)?;
    }

    session.command(&format!("MAIL FROM:<{}>", message.from), 2)?;
    for addr in message.to.as_slice() {
        session.command(&format!("RCPT TO:<{addr}>"), 2)?;
    }
    session.command("DATA", 3)?;

    let domain = message.from.rsplit('@').next().unwrap_or("localhost");
    let message_id = format!("{}@{domain}", uuid::Uuid::new_v4());
    let date = chrono::Utc::now().to_rfc2822();
    let data = render(message, &date, &message_id);
    let stream = session.stream.get_mut();
    stream
        .write_all(data.as_bytes())
        .and_then(|_| stream.write_all(b".\r\n"))
        .and_then(|_| stream.flush())
        .map_err(io_err)?;
    session.expect(2)?;

    // QUIT failures don't affect delivery
    let _ = session.command("QUIT", 2);
    info!(
        "Mail sent via {} to {} recipient(s)",
        config.host,
        message.to.as_slice().len()
    );
    Ok(())
}
