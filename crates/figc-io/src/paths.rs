//! Cache-root normalization, endpoint naming, package keys, and archive
//! entry sanitization.

use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};

/// Derived socket paths for one cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointNames {
    /// The service endpoint clients connect to.
    pub service: Utf8PathBuf,
    /// The singleton rendezvous; exactly one process may hold it.
    pub lock: Utf8PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path is not valid UTF-8: {0:?}")]
    NonUtf8(std::path::PathBuf),

    #[error("absolute path in archive entry: {0}")]
    AbsoluteEntry(String),

    #[error("path traversal in archive entry: {0}")]
    TraversalEntry(String),

    #[error("empty archive entry path")]
    EmptyEntry,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Normalize a cache root to an absolute canonical directory.
///
/// Expands a leading `~`, absolutizes against the current directory, creates
/// the directory if missing, and resolves symlinks so the same root always
/// derives the same endpoint names.
pub fn normalize_root(raw: &str) -> Result<Utf8PathBuf, PathError> {
    let expanded = expand_home(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        let cwd = std::env::current_dir()?;
        let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(PathError::NonUtf8)?;
        cwd.join(expanded)
    };
    std::fs::create_dir_all(&absolute)?;
    let canonical = std::fs::canonicalize(&absolute)?;
    Utf8PathBuf::from_path_buf(canonical).map_err(PathError::NonUtf8)
}

fn expand_home(raw: &str) -> Utf8PathBuf {
    if raw == "~" || raw.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if raw == "~" {
                return Utf8PathBuf::from(home);
            }
            return Utf8Path::new(&home).join(&raw[2..]);
        }
    }
    Utf8PathBuf::from(raw)
}

/// Deduplication key and final directory name: `lower(id) + "#" + version`.
/// Case folding applies to the id only; the version is opaque.
pub fn package_key(id: &str, version: &str) -> String {
    format!("{}#{}", id.to_lowercase(), version)
}

/// Default base name for the IPC endpoints.
pub fn default_pipe_base() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("fhir-ig-agent-{user}")
}

fn runtime_dir() -> Utf8PathBuf {
    for var in ["XDG_RUNTIME_DIR", "TMPDIR"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Utf8PathBuf::from(value);
            }
        }
    }
    Utf8PathBuf::from("/tmp")
}

/// Derive the stable socket names for a normalized cache root.
///
/// The suffix is the first 6 bytes of SHA-256 of the root path as lowercase
/// hex: distinct roots get distinct endpoints, the same root always maps to
/// the same pair.
pub fn endpoint_names(base: &str, normalized_root: &Utf8Path) -> EndpointNames {
    let digest = Sha256::digest(normalized_root.as_str().as_bytes());
    let hash = hex::encode(&digest[..6]);
    let dir = runtime_dir();
    EndpointNames {
        service: dir.join(format!("{base}-{hash}.sock")),
        lock: dir.join(format!("{base}-lock-{hash}.sock")),
    }
}

/// Lexical half of archive entry validation.
///
/// Rejects absolute paths (leading `/` or a drive-letter prefix) and any
/// `..` component; normalizes backslashes to the host separator and drops
/// `.` segments. The extractor still performs the authoritative
/// canonicalized prefix check per entry after parent directories exist.
pub fn sanitize_entry_path(raw: &str) -> Result<Utf8PathBuf, PathError> {
    let unified = raw.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(PathError::AbsoluteEntry(raw.to_string()));
    }
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(PathError::AbsoluteEntry(raw.to_string()));
    }

    let mut out = Utf8PathBuf::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(PathError::TraversalEntry(raw.to_string())),
            component => out.push(component),
        }
    }
    if out.as_str().is_empty() {
        return Err(PathError::EmptyEntry);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_key_lowercases_id_only() {
        assert_eq!(
            package_key("HL7.FHIR.US.CORE", "6.1.0"),
            "hl7.fhir.us.core#6.1.0"
        );
        assert_eq!(package_key("pkg", "1.0.0-RC1"), "pkg#1.0.0-RC1");
    }

    #[test]
    fn endpoint_names_are_stable_and_distinct() {
        let a1 = endpoint_names("fhir-ig-agent-t", Utf8Path::new("/cache/a"));
        let a2 = endpoint_names("fhir-ig-agent-t", Utf8Path::new("/cache/a"));
        let b = endpoint_names("fhir-ig-agent-t", Utf8Path::new("/cache/b"));
        assert_eq!(a1, a2);
        assert_ne!(a1.service, b.service);
        assert_ne!(a1.lock, b.lock);
        assert_ne!(a1.service, a1.lock);
        let name = a1.service.file_name().unwrap();
        assert!(name.starts_with("fhir-ig-agent-t-"));
        assert!(name.ends_with(".sock"));
    }

    #[test]
    fn normalize_root_resolves_symlinks() {
        let dir = tempfile::TempDir::new().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let via_real = normalize_root(real.to_str().unwrap()).unwrap();
        let via_link = normalize_root(link.to_str().unwrap()).unwrap();
        assert_eq!(via_real, via_link);
    }

    #[test]
    fn normalize_root_creates_missing_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("a/b/c");
        let normalized = normalize_root(target.to_str().unwrap()).unwrap();
        assert!(normalized.is_dir());
    }

    #[test]
    fn sanitize_accepts_normal_entries() {
        assert_eq!(
            sanitize_entry_path("package/package.json").unwrap(),
            Utf8PathBuf::from("package/package.json")
        );
        assert_eq!(
            sanitize_entry_path("./package/data.bin").unwrap(),
            Utf8PathBuf::from("package/data.bin")
        );
        assert_eq!(
            sanitize_entry_path("package\\sub\\file.txt").unwrap(),
            Utf8PathBuf::from("package/sub/file.txt")
        );
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(matches!(
            sanitize_entry_path("/etc/passwd"),
            Err(PathError::AbsoluteEntry(_))
        ));
        assert!(matches!(
            sanitize_entry_path("C:\\windows\\system32"),
            Err(PathError::AbsoluteEntry(_))
        ));
        assert!(matches!(
            sanitize_entry_path("../outside"),
            Err(PathError::TraversalEntry(_))
        ));
        assert!(matches!(
            sanitize_entry_path("package/../../outside"),
            Err(PathError::TraversalEntry(_))
        ));
        assert!(matches!(
            sanitize_entry_path("./."),
            Err(PathError::EmptyEntry)
        ));
    }
}
