//! Startup attestation.
//!
//! Before anything is loaded, the host checks `signature.json` next to
//! the entry script: every listed file must hash to the signed SHA-256,
//! the Ed25519 signature must verify under the operator's trusted key,
//! and an optional platform layer must verify under the compiled-in
//! trust root. Any failure is fatal.
//!
//! ```json
//! {
//!   "public_key": "<hex>",
//!   "files": { "app.lua": "<sha256 hex>" },
//!   "manifest": { "env": ["API_KEY"] },
//!   "signature": "<hex>",
//!   "platform": { "files": { "x86_64": { "capsule-host": "<sha256 hex>" } }, "signature": "<hex>" }
//! }
//! ```
//!
//! The application signature covers the canonical form (compact, keys
//! sorted) of `{"files": .., "manifest": ..}`; the platform signature
//! covers `{"arch": .., "files": ..}` for the running architecture.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, info};

use crate::capability::{crypto, FsConfig};
use crate::manifest::Manifest;

pub const SIGNATURE_FILE: &str = "signature.json";

/// Ed25519 key the platform layer must be signed with.
const PLATFORM_TRUST_ROOT: &str =
    "0b4849bfbad1fc75440b249528e388476182b277f6d78dd7a181a427fcb8c5ca";

#[derive(Debug, Error)]
pub enum AttestError {
    #[error("signature file {0} not found")]
    Missing(PathBuf),
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed signature file: {0}")]
    Malformed(String),
    #[error("signature key does not match the trusted key")]
    UntrustedKey,
    #[error("{0} signature does not verify")]
    BadSignature(&'static str),
    #[error("file '{0}' does not match its signed hash")]
    HashMismatch(String),
    #[error("invalid signed path '{0}'")]
    InvalidPath(String),
    #[error("declared manifest differs from the signed manifest")]
    ManifestMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSignature {
    /// Architecture → file name → SHA-256 hex.
    pub files: BTreeMap<String, BTreeMap<String, String>>,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFile {
    pub public_key: String,
    pub files: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Json>,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSignature>,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub files: usize,
    /// Manifest echoed by the signature, if any.
    pub manifest: Option<Manifest>,
    pub platform_verified: bool,
}

impl Attestation {
    /// Refuses a declared manifest that differs from the signed echo.
    pub fn check_manifest(&self, declared: &Manifest) -> Result<(), AttestError> {
        match &self.manifest {
            Some(signed) if signed != declared => Err(AttestError::ManifestMismatch),
            _ => Ok(()),
        }
    }
}

/// Serializes `value` compactly with object keys sorted at every level.
pub fn canonical_json(value: &Json) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Json, out: &mut String) {
    match value {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Json::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

pub fn app_payload(files: &BTreeMap<String, String>, manifest: Option<&Json>) -> Vec<u8> {
    let value = serde_json::json!({
        "files": files,
        "manifest": manifest.cloned().unwrap_or(Json::Null),
    });
    canonical_json(&value).into_bytes()
}

pub fn platform_payload(arch: &str, files: &BTreeMap<String, String>) -> Vec<u8> {
    let value = serde_json::json!({ "arch": arch, "files": files });
    canonical_json(&value).into_bytes()
}

fn parse_key(hex_key: &str, what: &str) -> Result<[u8; 32], AttestError> {
    crypto::parse_hex_array::<32>(hex_key.trim(), what)
        .map_err(|e| AttestError::Malformed(e.message().to_string()))
}

fn check_signature(
    key: &[u8; 32],
    payload: &[u8],
    signature_hex: &str,
    layer: &'static str,
) -> Result<(), AttestError> {
    let signature = crypto::parse_hex_array::<64>(signature_hex.trim(), "signature")
        .map_err(|_| AttestError::BadSignature(layer))?;
    if crypto::verify(key, payload, &signature) {
        Ok(())
    } else {
        Err(AttestError::BadSignature(layer))
    }
}

/// Checks every `name → hash` entry against the files below `dir`.
fn check_hashes(dir: &Path, files: &BTreeMap<String, String>) -> Result<(), AttestError> {
    let base = FsConfig::permissive(dir).map_err(|e| AttestError::Io {
        path: dir.to_path_buf(),
        source: std::io::Error::other(e.to_string()),
    })?;
    for (name, expected) in files {
        let path = base
            .validate(name)
            .map_err(|_| AttestError::InvalidPath(name.clone()))?;
        let data = std::fs::read(&path).map_err(|source| AttestError::Io {
            path: path.clone(),
            source,
        })?;
        let actual = hex::encode(crypto::sha256(&data));
        if !crypto::constant_time_eq(actual.as_bytes(), expected.trim().to_ascii_lowercase().as_bytes())
        {
            return Err(AttestError::HashMismatch(name.clone()));
        }
        debug!("Verified {name}");
    }
    Ok(())
}

pub fn read_signature_file(dir: &Path) -> Result<SignatureFile, AttestError> {
    let path = dir.join(SIGNATURE_FILE);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AttestError::Missing(path))
        }
        Err(source) => return Err(AttestError::Io { path, source }),
    };
    serde_json::from_slice(&raw).map_err(|e| AttestError::Malformed(e.to_string()))
}

/// Verifies the application next to `entry` under `public_key` (hex).
pub fn verify_startup(entry: &Path, public_key: &str) -> Result<Attestation, AttestError> {
    let dir = match entry.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    verify_dir(dir, entry, public_key, &trust_root()?, exe_dir.as_deref())
}

fn trust_root() -> Result<[u8; 32], AttestError> {
    parse_key(PLATFORM_TRUST_ROOT, "trust root")
}

fn verify_dir(
    dir: &Path,
    entry: &Path,
    public_key: &str,
    trust_root: &[u8; 32],
    exe_dir: Option<&Path>,
) -> Result<Attestation, AttestError> {
    let sig = read_signature_file(dir)?;

    let trusted = parse_key(public_key, "trusted key")?;
    let declared = parse_key(&sig.public_key, "public_key")?;
    if !crypto::constant_time_eq(&trusted, &declared) {
        return Err(AttestError::UntrustedKey);
    }

    let payload = app_payload(&sig.files, sig.manifest.as_ref());
    check_signature(&trusted, &payload, &sig.signature, "application")?;

    let entry_name = entry
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AttestError::InvalidPath(entry.display().to_string()))?;
    if !sig.files.contains_key(entry_name) {
        return Err(AttestError::Malformed(format!(
            "entry point '{entry_name}' is not covered by the signature"
        )));
    }
    check_hashes(dir, &sig.files)?;

    let manifest = match &sig.manifest {
        Some(value) => Some(
            serde_json::from_value::<Manifest>(value.clone())
                .map(Manifest::declared)
                .map_err(|e| AttestError::Malformed(format!("manifest: {e}")))?,
        ),
        None => None,
    };

    let platform_verified = match (&sig.platform, exe_dir) {
        (Some(platform), Some(exe_dir)) => {
            verify_platform(platform, trust_root, std::env::consts::ARCH, exe_dir)?;
            true
        }
        (Some(_), None) => {
            return Err(AttestError::Malformed(
                "cannot locate the host executable for the platform layer".into(),
            ))
        }
        (None, _) => false,
    };

    info!(
        "Attestation passed ({} file(s){})",
        sig.files.len(),
        if platform_verified { ", platform layer verified" } else { "" }
    );
    Ok(Attestation {
        files: sig.files.len(),
        manifest,
        platform_verified,
    })
}

/// Verifies the platform layer for `arch` under the trust root.
pub fn verify_platform(
    platform: &PlatformSignature,
    trust_root: &[u8; 32],
    arch: &str,
    exe_dir: &Path,
) -> Result<(), AttestError> {
    let files = platform
        .files
        .get(arch)
        .ok_or_else(|| AttestError::Malformed(format!("no platform hashes for {arch}")))?;
    check_signature(
        trust_root,
        &platform_payload(arch, files),
        &platform.signature,
        "platform",
    )?;
    check_hashes(exe_dir, files)
}
