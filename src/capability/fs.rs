/// Filesystem capability.
///
/// Script paths are always relative to the app data directory. Before any
/// path reaches the OS it goes through [`FsConfig::validate`], which
/// rejects absolute paths and `..` segments and resolves symlinks to make
/// sure the target stays inside the base directory. The manifest grants
/// then decide which operations are allowed on the resolved location.
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::CapError;
use crate::manifest::{Manifest, Perms};

/// Default cap on a single `read` (16 MB).
pub const DEFAULT_MAX_READ_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Access {
    Read,
    Write,
    Create,
}

#[derive(Debug, Clone)]
struct Grant {
    /// Relative to the base directory; empty means the whole base.
    prefix: PathBuf,
    perms: Perms,
}

#[derive(Debug, Clone)]
pub struct FsConfig {
    base: PathBuf,
    grants: Vec<Grant>,
    max_read_bytes: u64,
}

impl FsConfig {
    /// Creates a config rooted at `base` with no grants.
    ///
    /// The base directory must exist; it is canonicalized once here so
    /// later containment checks compare resolved paths.
    pub fn new(base: &Path) -> Result<Self, CapError> {
        let base = base
            .canonicalize()
            .map_err(|e| CapError::from_io(&format!("base directory {}", base.display()), e))?;
        Ok(Self {
            base,
            grants: Vec::new(),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
        })
    }

    /// Full read/write/create access to the whole base directory.
    pub fn permissive(base: &Path) -> Result<Self, CapError> {
        Self::new(base)?.with_grant("", Perms::ALL)
    }

    /// Builds the config from manifest grants, or the permissive config
    /// when the manifest is absent.
    pub fn from_manifest(base: &Path, manifest: &Manifest) -> Result<Self, CapError> {
        if !manifest.present {
            return Self::permissive(base);
        }
        let mut config = Self::new(base)?;
        for grant in &manifest.fs {
            config = config.with_grant(&grant.path, grant.perms)?;
        }
        Ok(config)
    }

    /// Adds a grant. The grant path obeys the same rules as script paths.
    pub fn with_grant(mut self, path: &str, perms: Perms) -> Result<Self, CapError> {
        let prefix = if path.is_empty() || path == "." {
            PathBuf::new()
        } else {
            check_relative(path)?
        };
        self.grants.push(Grant { prefix, perms });
        Ok(self)
    }

    pub fn with_max_read_bytes(mut self, max: u64) -> Self {
        self.max_read_bytes = max;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Validates a script-supplied path and returns the resolved location.
    ///
    /// Fails closed with `Denied` for absolute paths, any `..` segment,
    /// and anything that resolves (after following symlinks) outside the
    /// base directory.
    pub fn validate(&self, path: &str) -> Result<PathBuf, CapError> {
        let relative = check_relative(path)?;
        let joined = self.base.join(&relative);

        // Resolve the longest existing ancestor; the remainder does not
        // exist yet and contains only normal segments.
        let mut existing = joined.as_path();
        let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
        let resolved_prefix = loop {
            match existing.canonicalize() {
                Ok(p) => break p,
                Err(_) => {
                    let name = existing
                        .file_name()
                        .ok_or_else(|| CapError::Denied(format!("cannot resolve '{path}'")))?;
                    rest.push(name);
                    existing = existing
                        .parent()
                        .ok_or_else(|| CapError::Denied(format!("cannot resolve '{path}'")))?;
                }
            }
        };

        if !resolved_prefix.starts_with(&self.base) {
            return Err(CapError::Denied(format!(
                "'{path}' resolves outside the data directory"
            )));
        }

        let mut resolved = resolved_prefix;
        for name in rest.iter().rev() {
            resolved.push(name);
            // Anything left here failed to canonicalize, so an entry that
            // still exists is a dangling symlink.
            if fs::symlink_metadata(&resolved).is_ok() {
                return Err(CapError::Denied(format!(
                    "'{path}' passes through an unresolvable symlink"
                )));
            }
        }
        Ok(resolved)
    }

    fn authorize(&self, resolved: &Path, access: Access, path: &str) -> Result<(), CapError> {
        let relative = resolved
            .strip_prefix(&self.base)
            .map_err(|_| CapError::Denied(format!("'{path}' is outside the data directory")))?;
        let allowed = self.grants.iter().any(|g| {
            relative.starts_with(&g.prefix)
                && match access {
                    Access::Read => g.perms.read,
                    Access::Write => g.perms.write,
                    Access::Create => g.perms.create,
                }
        });
        if allowed {
            Ok(())
        } else {
            Err(CapError::Denied(format!(
                "no {access:?} permission for '{path}'"
            )))
        }
    }
}

/// Rejects absolute paths and non-normal segments, returning the
/// relative path as a `PathBuf`.
fn check_relative(path: &str) -> Result<PathBuf, CapError> {
    if path.is_empty() {
        return Err(CapError::InvalidArgument("empty path".into()));
    }
    if path.contains('\0') {
        return Err(CapError::InvalidArgument("path contains NUL byte".into()));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(CapError::Denied(format!("absolute path '{path}'")));
    }
    // Check both separators so "a\..\b" is caught on every platform.
    if path.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(CapError::Denied(format!("'..' segment in '{path}'")));
    }

    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            _ => return Err(CapError::Denied(format!("illegal path '{path}'"))),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(CapError::InvalidArgument(format!("path '{path}' names no file")));
    }
    Ok(out)
}

/// Reads a whole file.
pub fn read(config: &FsConfig, path: &str) -> Result<Vec<u8>, CapError> {
    let resolved = config.validate(path)?;
    config.authorize(&resolved, Access::Read, path)?;

    let file = fs::File::open(&resolved).map_err(|e| CapError::from_io(path, e))?;
    let meta = file.metadata().map_err(|e| CapError::from_io(path, e))?;
    if meta.is_dir() {
        return Err(CapError::InvalidArgument(format!("'{path}' is a directory")));
    }
    if meta.len() > config.max_read_bytes {
        return Err(CapError::InvalidArgument(format!(
            "'{path}' is {} bytes (limit {})",
            meta.len(),
            config.max_read_bytes
        )));
    }

    let mut data = Vec::with_capacity(usize::try_from(meta.len()).unwrap_or(0));
    file.take(config.max_read_bytes)
        .read_to_end(&mut data)
        .map_err(|e| CapError::from_io(path, e))?;
    debug!("fs.read {path} ({} bytes)", data.len());
    Ok(data)
}

/// Writes (creating or truncating) a file. Missing parent directories are
/// created when the grant carries the create bit.
pub fn write(config: &FsConfig, path: &str, data: &[u8]) -> Result<(), CapError> {
    let resolved = config.validate(path)?;
    let access = if resolved.exists() {
        Access::Write
    } else {
        Access::Create
    };
    config.authorize(&resolved, access, path)?;

    if resolved.is_dir() {
        return Err(CapError::InvalidArgument(format!("'{path}' is a directory")));
    }
    if let Some(parent) = resolved.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| CapError::from_io(path, e))?;
        }
    }
    fs::write(&resolved, data).map_err(|e| CapError::from_io(path, e))?;
    debug!("fs.write {path} ({} bytes)", data.len());
    Ok(())
}

pub fn exists(config: &FsConfig, path: &str) -> Result<bool, CapError> {
    let resolved = config.validate(path)?;
    config.authorize(&resolved, Access::Read, path)?;
    Ok(resolved.exists())
}

pub fn delete(config: &FsConfig, path: &str) -> Result<(), CapError> {
    let resolved = config.validate(path)?;
    config.authorize(&resolved, Access::Write, path)?;
    if resolved.is_dir() {
        return Err(CapError::InvalidArgument(format!("'{path}' is a directory")));
    }
    fs::remove_file(&resolved).map_err(|e| CapError::from_io(path, e))?;
    debug!("fs.delete {path}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FsGrant;

    fn scoped(dir: &Path) -> FsConfig {
        FsConfig::new(dir)
            .unwrap()
            .with_grant("static", Perms::parse("r").unwrap())
            .unwrap()
            .with_grant("uploads", Perms::parse("rwc").unwrap())
            .unwrap()
    }

    #[test]
    fn test_validate_rejects_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap();
        for p in ["/etc/passwd", "/", "\\windows\\system32"] {
            assert!(matches!(config.validate(p), Err(CapError::Denied(_))), "{p}");
        }
    }

    #[test]
    fn test_validate_rejects_dotdot_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap();
        for p in ["..", "../x", "a/../b", "a/..", "a\\..\\b", "./../etc"] {
            assert!(matches!(config.validate(p), Err(CapError::Denied(_))), "{p}");
        }
    }

    #[test]
    fn test_read_passwd_traversal_denied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let config = FsConfig::permissive(&dir.path().join("data")).unwrap();
        let err = read(&config, "../../etc/passwd").unwrap_err();
        assert!(matches!(err, CapError::Denied(_)));
    }

    #[test]
    fn test_validate_empty_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap();
        assert!(matches!(config.validate(""), Err(CapError::InvalidArgument(_))));
        assert!(matches!(config.validate("."), Err(CapError::InvalidArgument(_))));
        assert!(matches!(config.validate("a\0b"), Err(CapError::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_nonexistent_inside_base() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap();
        let resolved = config.validate("new/dir/file.txt").unwrap();
        assert!(resolved.starts_with(config.base()));
        assert!(resolved.ends_with("new/dir/file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_symlink_escape_denied() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s3cr3t").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let config = FsConfig::permissive(dir.path()).unwrap();
        assert!(matches!(config.validate("link/secret"), Err(CapError::Denied(_))));
        assert!(matches!(read(&config, "link/secret"), Err(CapError::Denied(_))));
        assert!(matches!(
            write(&config, "link/new.txt", b"x"),
            Err(CapError::Denied(_))
        ));
        assert!(!outside.path().join("new.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_denied() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("missing"), dir.path().join("dangling"))
            .unwrap();

        let config = FsConfig::permissive(dir.path()).unwrap();
        assert!(matches!(
            write(&config, "dangling", b"x"),
            Err(CapError::Denied(_))
        ));
        assert!(!outside.path().join("missing").exists());
    }

    #[test]
    fn test_write_read_exists_delete() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap();

        assert!(!exists(&config, "a/b.txt").unwrap());
        write(&config, "a/b.txt", b"hello").unwrap();
        assert!(exists(&config, "a/b.txt").unwrap());
        assert_eq!(read(&config, "a/b.txt").unwrap(), b"hello");
        delete(&config, "a/b.txt").unwrap();
        assert!(!exists(&config, "a/b.txt").unwrap());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap();
        assert!(matches!(read(&config, "nope.txt"), Err(CapError::NotFound(_))));
        assert!(matches!(delete(&config, "nope.txt"), Err(CapError::NotFound(_))));
    }

    #[test]
    fn test_grants_enforced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("static")).unwrap();
        std::fs::write(dir.path().join("static/index.html"), b"<h1>hi</h1>").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        let config = scoped(dir.path());

        assert_eq!(read(&config, "static/index.html").unwrap(), b"<h1>hi</h1>");
        assert!(matches!(
            write(&config, "static/index.html", b"pwned"),
            Err(CapError::Denied(_))
        ));
        assert!(matches!(read(&config, "top.txt"), Err(CapError::Denied(_))));
        write(&config, "uploads/file.bin", &[1, 2, 3]).unwrap();
        assert_eq!(read(&config, "uploads/file.bin").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_write_without_create_bit_cannot_create() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/app.log"), b"old").unwrap();
        let config = FsConfig::new(dir.path())
            .unwrap()
            .with_grant("logs", Perms::parse("rw").unwrap())
            .unwrap();

        write(&config, "logs/app.log", b"new").unwrap();
        assert!(matches!(
            write(&config, "logs/other.log", b"x"),
            Err(CapError::Denied(_))
        ));
    }

    #[test]
    fn test_prefix_is_segment_based() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uploads-private"), b"x").unwrap();
        let config = scoped(dir.path());
        assert!(matches!(read(&config, "uploads-private"), Err(CapError::Denied(_))));
    }

    #[test]
    fn test_max_read_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big"), vec![0u8; 100]).unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap().with_max_read_bytes(10);
        assert!(matches!(read(&config, "big"), Err(CapError::InvalidArgument(_))));
    }

    #[test]
    fn test_from_manifest_rejects_escaping_grant() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            present: true,
            fs: vec![FsGrant {
                path: "../etc".into(),
                perms: Perms::ALL,
            }],
            ..Default::default()
        };
        assert!(FsConfig::from_manifest(dir.path(), &manifest).is_err());
    }

    #[test]
    fn test_from_manifest_absent_is_permissive() {
        let dir = tempfile::tempdir().unwrap();
        let config = FsConfig::from_manifest(dir.path(), &Manifest::absent()).unwrap();
        write(&config, "anything.txt", b"ok").unwrap();
    }

    #[test]
    fn test_directory_operations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let config = FsConfig::permissive(dir.path()).unwrap();
        assert!(matches!(read(&config, "sub"), Err(CapError::InvalidArgument(_))));
        assert!(matches!(delete(&config, "sub"), Err(CapError::InvalidArgument(_))));
    }
}
