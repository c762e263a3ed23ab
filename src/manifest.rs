//! Application manifest: the capabilities an app declares it needs.
//!
//! The manifest is extracted from the loaded script once, handed to the
//! kernel sandbox and used to build the capability configs. It owns all
//! of its strings, so the script engine may be torn down before the
//! manifest is consumed.
//!
//! Declaration shape (same keys in Lua tables, WebAssembly JSON and the
//! `manifest` echo of a signature file):
//!
//! ```json
//! {
//!   "fs": [{ "path": "uploads", "perms": "rwc" }],
//!   "env": ["API_KEY"],
//!   "hosts": ["api.example.com"],
//!   "limits": { "heap_bytes": 33554432, "instruction_budget": 5000000 }
//! }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Permission bits attached to a filesystem grant.
///
/// Serialized as a compact string such as `"rw"` or `"rwc"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exec: bool,
}

impl Perms {
    pub const ALL: Perms = Perms {
        read: true,
        write: true,
        create: true,
        exec: false,
    };

    pub fn parse(s: &str) -> Result<Self, String> {
        let mut perms = Perms::default();
        for c in s.chars() {
            match c {
                'r' => perms.read = true,
                'w' => perms.write = true,
                'c' => perms.create = true,
                'x' => perms.exec = true,
                other => return Err(format!("unknown permission '{other}' in \"{s}\"")),
            }
        }
        Ok(perms)
    }

    /// True if the grant allows any kind of modification.
    pub fn is_writable(&self) -> bool {
        self.write || self.create
    }
}

impl TryFrom<String> for Perms {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Perms::parse(&s)
    }
}

impl From<Perms> for String {
    fn from(p: Perms) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (set, c) in [
            (self.read, 'r'),
            (self.write, 'w'),
            (self.create, 'c'),
            (self.exec, 'x'),
        ] {
            if set {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

/// A filesystem path (relative to the app data directory) with its permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsGrant {
    pub path: String,
    pub perms: Perms,
}

/// Optional resource-limit overrides declared by the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_budget: Option<u64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self.heap_bytes.is_none() && self.stack_bytes.is_none() && self.instruction_budget.is_none()
    }
}

/// The declared capability set of an application.
///
/// `present == false` means the script declared nothing. That is the
/// permissive default: no kernel sandbox is applied and the capability
/// allowlists accept anything except path escapes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(skip)]
    pub present: bool,
    #[serde(default)]
    pub fs: Vec<FsGrant>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "LimitOverrides::is_empty")]
    pub limits: LimitOverrides,
}

impl Manifest {
    /// The "nothing declared" manifest.
    pub fn absent() -> Self {
        Self::default()
    }

    /// Marks a freshly deserialized declaration as present.
    pub fn declared(mut self) -> Self {
        self.present = true;
        self
    }

    /// Parses a JSON declaration.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        Ok(manifest.declared())
    }

    /// Grants carrying the read bit.
    pub fn fs_read(&self) -> impl Iterator<Item = &FsGrant> {
        self.fs.iter().filter(|g| g.perms.read)
    }

    /// Grants carrying the write or create bit.
    pub fn fs_write(&self) -> impl Iterator<Item = &FsGrant> {
        self.fs.iter().filter(|g| g.perms.is_writable())
    }

    /// Short human-readable summary for startup logs.
    pub fn summary(&self) -> String {
        if !self.present {
            return "none declared (permissive)".to_string();
        }
        format!(
            "{} fs grant(s), {} env var(s), {} host(s)",
            self.fs.len(),
            self.env.len(),
            self.hosts.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perms_parse_and_display() {
        let p = Perms::parse("rwc").unwrap();
        assert!(p.read && p.write && p.create && !p.exec);
        assert_eq!(p.to_string(), "rwc");
        assert_eq!(Perms::parse("").unwrap(), Perms::default());
    }

    #[test]
    fn test_perms_rejects_unknown() {
        let err = Perms::parse("rz").unwrap_err();
        assert!(err.contains("'z'"));
    }

    #[test]
    fn test_from_json_full() {
        let manifest = Manifest::from_json(
            br#"{
                "fs": [{"path": "uploads", "perms": "rw"}, {"path": "static", "perms": "r"}],
                "env": ["API_KEY"],
                "hosts": ["api.example.com"],
                "limits": {"heap_bytes": 1048576}
            }"#,
        )
        .unwrap();
        assert!(manifest.present);
        assert_eq!(manifest.fs.len(), 2);
        assert_eq!(manifest.fs_read().count(), 2);
        assert_eq!(manifest.fs_write().count(), 1);
        assert_eq!(manifest.env, vec!["API_KEY"]);
        assert_eq!(manifest.limits.heap_bytes, Some(1_048_576));
        assert_eq!(manifest.limits.instruction_budget, None);
    }

    #[test]
    fn test_from_json_empty_object_is_present() {
        let manifest = Manifest::from_json(b"{}").unwrap();
        assert!(manifest.present);
        assert!(manifest.fs.is_empty());
    }

    #[test]
    fn test_from_json_bad_perms() {
        assert!(Manifest::from_json(br#"{"fs": [{"path": "a", "perms": "q"}]}"#).is_err());
    }

    #[test]
    fn test_absent_summary() {
        assert!(Manifest::absent().summary().contains("permissive"));
    }

    #[test]
    fn test_serialize_skips_presence_and_empty_limits() {
        let manifest = Manifest {
            present: true,
            fs: vec![],
            env: vec!["A".to_string()],
            hosts: vec![],
            limits: LimitOverrides::default(),
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json.get("present").is_none());
        assert!(json.get("limits").is_none());
        assert_eq!(json["env"][0], "A");
    }
}
