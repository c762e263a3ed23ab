//! Capability layer: the only path from script code to the OS.
//!
//! Every function in the submodules takes an explicit config object and
//! validates the request before any syscall runs on behalf of a script.
//! Engines reach these functions either through native bindings (Lua) or
//! through the JSON call surface in [`invoke`] (WebAssembly).
//!
//! Errors are returned as [`CapError`] values, never panics; engine
//! bindings turn them into the script language's own error mechanism so
//! application code can catch `Denied`/`NotFound` itself.

pub mod crypto;
pub mod db;
pub mod env;
pub mod fs;
pub mod http;
pub mod smtp;

use std::collections::BTreeSet;
use std::path::Path;

use base64::Engine;
use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::manifest::Manifest;
use crate::value::Value;

pub use db::Database;
pub use env::EnvConfig;
pub use fs::FsConfig;
pub use http::{HttpConfig, HttpSettings, HttpTransport, ReqwestTransport};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Largest random buffer a script may request in one call.
pub const MAX_RANDOM_BYTES: usize = 1024;

/// Uniform error taxonomy of the capability layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapError {
    /// Allowlist or path-validation failure.
    #[error("Denied: {0}")]
    Denied(String),
    #[error("NotFound: {0}")]
    NotFound(String),
    /// Malformed input (unparseable URL, missing field, bad parameter).
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),
    /// Underlying OS, network or database failure.
    #[error("IOError: {0}")]
    Io(String),
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl CapError {
    /// Stable kind name exposed to scripts.
    pub fn kind(&self) -> &'static str {
        match self {
            CapError::Denied(_) => "Denied",
            CapError::NotFound(_) => "NotFound",
            CapError::InvalidArgument(_) => "InvalidArgument",
            CapError::Io(_) => "IOError",
            CapError::Timeout(_) => "Timeout",
        }
    }

    /// Negative status code used by the WebAssembly ABI.
    pub fn code(&self) -> i64 {
        match self {
            CapError::Denied(_) => -1,
            CapError::NotFound(_) => -2,
            CapError::InvalidArgument(_) => -3,
            CapError::Io(_) => -4,
            CapError::Timeout(_) => -5,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CapError::Denied(m)
            | CapError::NotFound(m)
            | CapError::InvalidArgument(m)
            | CapError::Io(m)
            | CapError::Timeout(m) => m,
        }
    }

    pub(crate) fn from_io(context: &str, e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => CapError::NotFound(context.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                CapError::Denied(format!("{context}: {e}"))
            }
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                CapError::Timeout(format!("{context}: {e}"))
            }
            _ => CapError::Io(format!("{context}: {e}")),
        }
    }
}

/// An exact-match set of permitted names.
///
/// `Any` exists only for applications that declare no manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allowlist {
    Any,
    Only(BTreeSet<String>),
}

impl Allowlist {
    pub fn only<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Allowlist::Only(items.into_iter().map(Into::into).collect())
    }

    /// Case-insensitive variant: entries are lowercased on insertion and
    /// callers must lowercase the probe.
    pub fn only_lowercase<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Allowlist::Only(
            items
                .into_iter()
                .map(|s| s.as_ref().trim().to_ascii_lowercase())
                .collect(),
        )
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Allowlist::Any => true,
            Allowlist::Only(set) => set.contains(name),
        }
    }

    pub fn is_permissive(&self) -> bool {
        matches!(self, Allowlist::Any)
    }
}

/// Everything a script may touch, owned by the runtime host.
///
/// Built once from the manifest before the first dispatch and never
/// mutated afterwards.
pub struct Capabilities {
    pub fs: FsConfig,
    pub env: EnvConfig,
    pub http: HttpConfig,
    pub transport: Box<dyn HttpTransport>,
    pub db: Database,
}

impl Capabilities {
    pub fn new(
        fs: FsConfig,
        env: EnvConfig,
        http: HttpConfig,
        transport: Box<dyn HttpTransport>,
        db: Database,
    ) -> Self {
        Self {
            fs,
            env,
            http,
            transport,
            db,
        }
    }

    /// Derives all capability configs from the manifest and wires the
    /// real HTTP transport.
    pub fn from_manifest(
        manifest: &Manifest,
        data_dir: &Path,
        http: &HttpSettings,
        db: Database,
    ) -> Result<Self, CapError> {
        let fs = FsConfig::from_manifest(data_dir, manifest)?;
        let env = EnvConfig::from_manifest(manifest);
        let http = HttpConfig::from_manifest(manifest, http);
        let transport = ReqwestTransport::new(&http)?;
        Ok(Self::new(fs, env, http, Box::new(transport), db))
    }

    /// True if any allowlist runs in permissive mode.
    pub fn is_permissive(&self) -> bool {
        self.env.allow.is_permissive() || self.http.hosts.is_permissive()
    }
}

// ── JSON call surface ───────────────────────────────────

fn arg_str<'a>(args: &'a Json, key: &str) -> Result<&'a str, CapError> {
    args.get(key)
        .and_then(Json::as_str)
        .ok_or_else(|| CapError::InvalidArgument(format!("missing string field '{key}'")))
}

/// Reads a byte payload: either a JSON string or a `{"$blob": ..}` tag.
fn arg_bytes(args: &Json, key: &str) -> Result<Vec<u8>, CapError> {
    match args.get(key) {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(v) => match Value::from_json(v) {
            Some(Value::Text(s)) => Ok(s.into_bytes()),
            Some(Value::Blob(b)) => Ok(b),
            _ => Err(CapError::InvalidArgument(format!(
                "field '{key}' must be a string or blob"
            ))),
        },
    }
}

fn arg_params(args: &Json) -> Result<Vec<Value>, CapError> {
    match args.get("params") {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Value::from_json(v).ok_or_else(|| {
                    CapError::InvalidArgument(format!("parameter {} is not a scalar", i + 1))
                })
            })
            .collect(),
        Some(_) => Err(CapError::InvalidArgument("'params' must be an array".into())),
    }
}

fn arg_headers(args: &Json) -> Result<Vec<(String, String)>, CapError> {
    match args.get("headers") {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::Object(map)) => map
            .iter()
            .map(|(k, v)| match v.as_str() {
                Some(s) => Ok((k.clone(), s.to_string())),
                None => Err(CapError::InvalidArgument(format!("header '{k}' must be a string"))),
            })
            .collect(),
        Some(_) => Err(CapError::InvalidArgument("'headers' must be an object".into())),
    }
}

/// Encodes bytes as text when they are valid UTF-8, otherwise as a blob tag.
fn bytes_to_json(bytes: Vec<u8>) -> Json {
    match String::from_utf8(bytes) {
        Ok(s) => Json::String(s),
        Err(e) => Value::Blob(e.into_bytes()).to_json(),
    }
}

/// Executes a capability call named `name` with JSON arguments.
///
/// This is the complete boundary for engines without native bindings;
/// an unknown name is `InvalidArgument`, never a fallback.
pub fn invoke(caps: &Capabilities, name: &str, args: &Json) -> Result<Json, CapError> {
    match name {
        "fs.read" => {
            let data = fs::read(&caps.fs, arg_str(args, "path")?)?;
            Ok(json!({ "data": bytes_to_json(data) }))
        }
        "fs.write" => {
            fs::write(&caps.fs, arg_str(args, "path")?, &arg_bytes(args, "data")?)?;
            Ok(json!({ "ok": true }))
        }
        "fs.exists" => Ok(json!({ "exists": fs::exists(&caps.fs, arg_str(args, "path")?)? })),
        "fs.delete" => {
            fs::delete(&caps.fs, arg_str(args, "path")?)?;
            Ok(json!({ "ok": true }))
        }
        "env.get" => Ok(json!({ "value": env::get(&caps.env, arg_str(args, "name")?) })),
        "http.request" => {
            let method = args.get("method").and_then(Json::as_str).unwrap_or("GET");
            let response = http::request(
                &caps.http,
                caps.transport.as_ref(),
                method,
                arg_str(args, "url")?,
                arg_headers(args)?,
                arg_bytes(args, "body")?,
            )?;
            let headers: serde_json::Map<String, Json> = response
                .headers
                .into_iter()
                .map(|(k, v)| (k, Json::String(v)))
                .collect();
            Ok(json!({
                "status": response.status,
                "headers": headers,
                "body": bytes_to_json(response.body),
            }))
        }
        "db.query" => {
            let rows = caps.db.query_all(arg_str(args, "sql")?, &arg_params(args)?)?;
            let data: Vec<Json> = rows
                .rows
                .iter()
                .map(|row| Json::Array(row.iter().map(Value::to_json).collect()))
                .collect();
            Ok(json!({ "columns": rows.columns, "rows": data }))
        }
        "db.exec" => {
            let changes = caps.db.exec(arg_str(args, "sql")?, &arg_params(args)?)?;
            Ok(json!({ "changes": changes }))
        }
        "db.last_id" => Ok(json!({ "id": caps.db.last_id() })),
        "crypto.sha256" => Ok(json!({ "hex": hex::encode(crypto::sha256(&arg_bytes(args, "data")?)) })),
        "crypto.sha512" => Ok(json!({ "hex": hex::encode(crypto::sha512(&arg_bytes(args, "data")?)) })),
        "crypto.hmac_sha256" => {
            let mac = crypto::hmac_sha256(&arg_bytes(args, "key")?, &arg_bytes(args, "data")?)?;
            Ok(json!({ "hex": hex::encode(mac) }))
        }
        "crypto.random" => {
            let len = args
                .get("len")
                .and_then(Json::as_u64)
                .ok_or_else(|| CapError::InvalidArgument("missing integer field 'len'".into()))?;
            let len = usize::try_from(len).unwrap_or(usize::MAX);
            if len == 0 || len > MAX_RANDOM_BYTES {
                return Err(CapError::InvalidArgument(format!(
                    "random length must be 1..={MAX_RANDOM_BYTES}"
                )));
            }
            let mut buf = vec![0u8; len];
            crypto::random_bytes(&mut buf)?;
            Ok(json!({ "hex": hex::encode(buf) }))
        }
        "crypto.hash_password" => Ok(json!({ "hash": crypto::hash_password(arg_str(args, "password")?)? })),
        "crypto.verify_password" => {
            let ok = crypto::verify_password(arg_str(args, "password")?, arg_str(args, "hash")?)?;
            Ok(json!({ "valid": ok }))
        }
        "crypto.keypair" => {
            let (seed, public) = crypto::ed25519_keypair()?;
            Ok(json!({ "seed": hex::encode(seed), "public_key": hex::encode(public) }))
        }
        "crypto.sign" => {
            let seed = crypto::parse_hex_array::<32>(arg_str(args, "seed")?, "seed")?;
            let sig = crypto::sign(&seed, &arg_bytes(args, "message")?);
            Ok(json!({ "signature": hex::encode(sig) }))
        }
        "crypto.verify" => {
            let key = crypto::parse_hex_array::<32>(arg_str(args, "public_key")?, "public_key")?;
            let sig = crypto::parse_hex_array::<64>(arg_str(args, "signature")?, "signature")?;
            Ok(json!({ "valid": crypto::verify(&key, &arg_bytes(args, "message")?, &sig) }))
        }
        "crypto.base64_encode" => Ok(json!({ "text": B64.encode(arg_bytes(args, "data")?) })),
        "smtp.send" => {
            let config: smtp::SmtpConfig = serde_json::from_value(
                args.get("config").cloned().unwrap_or(Json::Null),
            )
            .map_err(|e| CapError::InvalidArgument(format!("smtp config: {e}")))?;
            let message: smtp::MailMessage = serde_json::from_value(
                args.get("message").cloned().unwrap_or(Json::Null),
            )
            .map_err(|e| CapError::InvalidArgument(format!("smtp message: {e}")))?;
            smtp::send(&config, &message)?;
            Ok(json!({ "ok": true }))
        }
        other => Err(CapError::InvalidArgument(format!("unknown capability '{other}'"))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for capability tests.

    use std::cell::RefCell;

    use super::*;
    use crate::capability::http::{OutboundRequest, OutboundResponse};

    /// Transport double that records every attempted send.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: RefCell<Vec<OutboundRequest>>,
        pub reply: Option<OutboundResponse>,
    }

    impl RecordingTransport {
        pub fn replying(status: u16, body: &str) -> Self {
            Self {
                sent: RefCell::new(Vec::new()),
                reply: Some(OutboundResponse {
                    status,
                    headers: vec![("content-type".to_string(), "text/plain".to_string())],
                    body: body.as_bytes().to_vec(),
                }),
            }
        }
    }

    impl HttpTransport for std::rc::Rc<RecordingTransport> {
        fn send(
            &self,
            request: &OutboundRequest,
            _config: &HttpConfig,
        ) -> Result<OutboundResponse, CapError> {
            self.sent.borrow_mut().push(request.clone());
            self.reply
                .clone()
                .ok_or_else(|| CapError::Io("no reply configured".into()))
        }
    }

    /// Capabilities over a temp data dir, in-memory database and a
    /// recording transport.
    pub fn caps(
        dir: &Path,
        manifest: &Manifest,
        transport: std::rc::Rc<RecordingTransport>,
    ) -> Capabilities {
        let fs = FsConfig::from_manifest(dir, manifest).unwrap();
        let env = EnvConfig::from_manifest(manifest);
        let http = HttpConfig::from_manifest(manifest, &HttpSettings::default());
        let db = Database::open_in_memory().unwrap();
        Capabilities::new(fs, env, http, Box::new(transport), db)
    }
}
