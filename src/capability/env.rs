/// Environment capability.
///
/// A variable is visible only if its name is in the allowlist verbatim.
/// "Not allowed" and "not set" both return `None`, so a script cannot
/// probe which variables exist on the host.
use super::Allowlist;
use crate::manifest::Manifest;

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub allow: Allowlist,
}

impl EnvConfig {
    pub fn new(allow: Allowlist) -> Self {
        Self { allow }
    }

    pub fn from_manifest(manifest: &Manifest) -> Self {
        if manifest.present {
            Self::new(Allowlist::only(manifest.env.iter().cloned()))
        } else {
            Self::new(Allowlist::Any)
        }
    }
}

pub fn get(config: &EnvConfig, name: &str) -> Option<String> {
    if !config.allow.contains(name) {
        return None;
    }
    std::env::var(name).ok()
}
