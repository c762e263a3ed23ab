//! Manifest-driven kernel sandbox.
//!
//! On Linux the process is confined with Landlock: manifest read grants
//! become read-only rules, write grants and the database directory
//! become read-write rules, and TCP bind is limited to the listen port
//! when the kernel supports network rules. Elsewhere this is a logged
//! no-op and the capability layer is the only enforcement point.
//!
//! Grants carrying the create bit name directories. Missing ones are
//! created before the ruleset is built, since Landlock can only attach
//! rules to paths that exist.
//!
//! Applying the sandbox is irreversible for the whole process and must
//! happen after the application is loaded but before the server starts
//! accepting requests. An absent manifest skips sandboxing entirely.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::manifest::Manifest;

/// System files needed for DNS resolution and TLS once confined.
const SYSTEM_READ_PATHS: &[&str] = &[
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/nsswitch.conf",
    "/etc/gai.conf",
    "/etc/ssl",
    "/etc/pki",
    "/etc/ca-certificates",
    "/usr/share/ca-certificates",
    "/etc/localtime",
    "/usr/share/zoneinfo",
    "/dev/urandom",
];

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("cannot resolve sandbox path {path}: {source}")]
    Path {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("landlock: {0}")]
    Landlock(String),
}

/// What [`SandboxPlan::apply`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    /// No manifest was declared.
    Skipped,
    /// The platform has no usable primitive.
    Unsupported,
    /// Rules are in force; `full` is false when the kernel only supports
    /// part of the requested restrictions.
    Enforced { full: bool },
}

#[derive(Debug, Clone)]
pub struct SandboxPlan {
    present: bool,
    read_only: Vec<PathBuf>,
    read_write: Vec<PathBuf>,
    create_dirs: Vec<PathBuf>,
    bind_ports: Vec<u16>,
}

impl SandboxPlan {
    /// Starts a plan from the manifest, resolving grant paths against
    /// the current directory. The database file's directory is always
    /// read-write.
    pub fn new(manifest: &Manifest, db_path: &Path) -> Self {
        Self::with_data_dir(manifest, db_path, Path::new("."))
    }

    /// Like [`SandboxPlan::new`] with grant paths relative to `data_dir`.
    pub fn with_data_dir(manifest: &Manifest, db_path: &Path, data_dir: &Path) -> Self {
        let mut plan = Self {
            present: manifest.present,
            read_only: Vec::new(),
            read_write: Vec::new(),
            create_dirs: Vec::new(),
            bind_ports: Vec::new(),
        };
        for grant in &manifest.fs {
            let path = data_dir.join(&grant.path);
            if grant.perms.create {
                plan.create_dirs.push(path.clone());
            }
            if grant.perms.is_writable() {
                plan.read_write.push(path);
            } else if grant.perms.read {
                plan.read_only.push(path);
            }
        }
        let db_dir = match db_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        plan.read_write.push(db_dir);
        plan
    }

    pub fn allow_read(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_only.push(path.into());
        self
    }

    pub fn allow_write(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_write.push(path.into());
        self
    }

    /// Allows binding a TCP listener on `port`.
    pub fn allow_bind(mut self, port: u16) -> Self {
        self.bind_ports.push(port);
        self
    }

    pub fn read_only(&self) -> &[PathBuf] {
        &self.read_only
    }

    pub fn read_write(&self) -> &[PathBuf] {
        &self.read_write
    }

    pub fn bind_ports(&self) -> &[u16] {
        &self.bind_ports
    }

    /// Creates the directories of create grants that do not exist yet.
    pub fn prepare(&self) -> Result<(), SandboxError> {
        for dir in &self.create_dirs {
            if dir.exists() {
                continue;
            }
            std::fs::create_dir_all(dir).map_err(|source| SandboxError::Path {
                path: dir.clone(),
                source,
            })?;
            info!("Created grant directory {}", dir.display());
        }
        Ok(())
    }

    /// Resolves every path that exists. Missing grant targets are
    /// skipped; the capability layer will report them as `NotFound`.
    fn resolved(paths: &[PathBuf]) -> Result<Vec<PathBuf>, SandboxError> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            match path.canonicalize() {
                Ok(p) => out.push(p),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Sandbox path {} does not exist, skipping", path.display());
                }
                Err(source) => {
                    return Err(SandboxError::Path {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    /// Confines the current process. Irreversible.
    pub fn apply(self) -> Result<SandboxStatus, SandboxError> {
        if !self.present {
            warn!("No manifest declared: kernel sandbox skipped, capability checks only");
            return Ok(SandboxStatus::Skipped);
        }
        self.prepare()?;
        let mut read_only = Self::resolved(&self.read_only)?;
        let read_write = Self::resolved(&self.read_write)?;
        for (ro, rw) in shadowed(&read_only, &read_write) {
            warn!(
                "Read-only grant {} is writable at the kernel level through {}",
                ro.display(),
                rw.display()
            );
        }
        read_only.extend(
            SYSTEM_READ_PATHS
                .iter()
                .map(PathBuf::from)
                .filter(|p| p.exists()),
        );
        enforce(&read_only, &read_write, &self.bind_ports)
    }
}

/// Read-only paths lying under a read-write path, paired with it.
fn shadowed<'a>(
    read_only: &'a [PathBuf],
    read_write: &'a [PathBuf],
) -> Vec<(&'a Path, &'a Path)> {
    read_only
        .iter()
        .filter_map(|ro| {
            read_write
                .iter()
                .find(|rw| ro.starts_with(rw))
                .map(|rw| (ro.as_path(), rw.as_path()))
        })
        .collect()
}

/// Applies the sandbox for `manifest` with default extras.
pub fn apply(manifest: &Manifest, db_path: &Path) -> Result<SandboxStatus, SandboxError> {
    SandboxPlan::new(manifest, db_path).apply()
}

#[cfg(target_os = "linux")]
fn enforce(
    read_only: &[PathBuf],
    read_write: &[PathBuf],
    bind_ports: &[u16],
) -> Result<SandboxStatus, SandboxError> {
    use landlock::{
        path_beneath_rules, Access, AccessFs, AccessNet, NetPort, Ruleset, RulesetAttr,
        RulesetCreatedAttr, RulesetStatus, ABI,
    };

    let abi = ABI::V4;
    let err = |e: landlock::RulesetError| SandboxError::Landlock(e.to_string());

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))
        .map_err(err)?;
    if !bind_ports.is_empty() {
        ruleset = ruleset.handle_access(AccessNet::BindTcp).map_err(err)?;
    }
    let mut created = ruleset
        .create()
        .map_err(err)?
        .add_rules(path_beneath_rules(read_only, AccessFs::from_read(abi)))
        .map_err(err)?
        .add_rules(path_beneath_rules(read_write, AccessFs::from_all(abi)))
        .map_err(err)?;
    for &port in bind_ports {
        created = created
            .add_rule(NetPort::new(port, AccessNet::BindTcp))
            .map_err(err)?;
    }

    let status = created.restrict_self().map_err(err)?;
    let full = match status.ruleset {
        RulesetStatus::FullyEnforced => true,
        RulesetStatus::PartiallyEnforced => false,
        RulesetStatus::NotEnforced => {
            warn!("Landlock is not supported by this kernel; capability checks only");
            return Ok(SandboxStatus::Unsupported);
        }
    };
    info!(
        "Landlock sandbox applied ({} read-only, {} read-write path(s), {} bind port(s){})",
        read_only.len(),
        read_write.len(),
        bind_ports.len(),
        if full { "" } else { ", partially enforced" }
    );
    Ok(SandboxStatus::Enforced { full })
}

#[cfg(not(target_os = "linux"))]
fn enforce(
    _read_only: &[PathBuf],
    _read_write: &[PathBuf],
    _bind_ports: &[u16],
) -> Result<SandboxStatus, SandboxError> {
    warn!(
        "No kernel sandbox on {}; capability checks only",
        std::env::consts::OS
    );
    Ok(SandboxStatus::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FsGrant, Perms};

    fn manifest() -> Manifest {
        Manifest {
            present: true,
            fs: vec![
                FsGrant {
                    path: "public".into(),
                    perms: Perms::parse("r").unwrap(),
                },
                FsGrant {
                    path: "uploads".into(),
                    perms: Perms::parse("rwc").unwrap(),
                },
                FsGrant {
                    path: "nothing".into(),
                    perms: Perms::default(),
                },
            ],
            ..Manifest::default()
        }
    }

    #[test]
    fn test_plan_splits_grants() {
        let plan = SandboxPlan::with_data_dir(
            &manifest(),
            Path::new("/var/lib/app/app.db"),
            Path::new("/srv/data"),
        )
        .allow_read("/srv/app")
        .allow_bind(8080);

        assert_eq!(
            plan.read_only(),
            &[PathBuf::from("/srv/data/public"), PathBuf::from("/srv/app")]
        );
        assert_eq!(
            plan.read_write(),
            &[
                PathBuf::from("/srv/data/uploads"),
                PathBuf::from("/var/lib/app")
            ]
        );
        assert_eq!(plan.bind_ports(), &[8080]);
    }

    #[test]
    fn test_db_in_current_dir() {
        let plan = SandboxPlan::new(&manifest(), Path::new("app.db"));
        assert_eq!(
            plan.read_write(),
            &[PathBuf::from("./uploads"), PathBuf::from(".")]
        );
    }

    #[test]
    fn test_absent_manifest_skips() {
        // Never reaches the kernel, so it is safe inside the test process
        let status = apply(&Manifest::absent(), Path::new("app.db")).unwrap();
        assert_eq!(status, SandboxStatus::Skipped);
    }

    #[test]
    fn test_prepare_creates_create_grants() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir(&data).unwrap();
        let plan = SandboxPlan::with_data_dir(&manifest(), &dir.path().join("db/app.db"), &data);

        // Before preparing, the missing grant would drop out of the ruleset
        assert!(SandboxPlan::resolved(plan.read_write()).unwrap().is_empty());

        plan.prepare().unwrap();
        assert!(data.join("uploads").is_dir());
        // Read-only and empty grants are left alone
        assert!(!data.join("public").exists());
        assert!(!data.join("nothing").exists());

        let resolved = SandboxPlan::resolved(plan.read_write()).unwrap();
        assert_eq!(resolved, vec![data.join("uploads").canonicalize().unwrap()]);

        // Idempotent
        plan.prepare().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_under_fresh_create_grant() {
        use crate::capability::fs::{self, FsConfig};

        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let db_dir = dir.path().join("db");
        std::fs::create_dir(&data).unwrap();
        std::fs::create_dir(&db_dir).unwrap();
        let manifest = manifest();
        let cfg = FsConfig::from_manifest(&data, &manifest).unwrap();
        let db_path = db_dir.join("app.db");

        // Landlock confines the calling thread only
        let result = std::thread::spawn(move || {
            SandboxPlan::with_data_dir(&manifest, &db_path, &data)
                .apply()
                .unwrap();
            fs::write(&cfg, "uploads/a.txt", b"x")
        })
        .join()
        .unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(
            std::fs::read(dir.path().join("data/uploads/a.txt")).unwrap(),
            b"x"
        );
    }

    #[test]
    fn test_shadowed_read_only_grants() {
        let ro = vec![PathBuf::from("/srv/data/public"), PathBuf::from("/srv/app")];
        let rw = vec![PathBuf::from("/srv/db"), PathBuf::from("/srv/data")];
        assert_eq!(
            shadowed(&ro, &rw),
            vec![(Path::new("/srv/data/public"), Path::new("/srv/data"))]
        );
        let rw = vec![PathBuf::from("/srv/db")];
        assert!(shadowed(&ro, &rw).is_empty());
    }

    #[test]
    fn test_resolved_skips_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let paths = vec![
            dir.path().join("a"),
            dir.path().join("missing"),
            dir.path().join("a/../a"),
        ];
        let resolved = SandboxPlan::resolved(&paths).unwrap();
        assert_eq!(resolved, vec![dir.path().join("a").canonicalize().unwrap()]);
    }
}
