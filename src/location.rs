use std::fmt;
use std::path::{Path, PathBuf};

/// Schemes that describe live or pseudo streams. Analyzing them unattended
/// either never terminates or spins up hardware, so only user-initiated
/// requests may touch them.
const FORBIDDEN_PREFIXES: &[&str] = &[
    "cdda://", "http://", "https://", "mms://", "rtsp://", "rtmp://", "icy://", "record:",
    "random:",
];

/// Identity of a playable stream: a path (or URL) plus the subsong index inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub path: String,
    pub subsong: u32,
}

impl Location {
    pub fn new(path: impl Into<String>, subsong: u32) -> Self {
        Self {
            path: path.into(),
            subsong,
        }
    }

    /// Build a location for a local file (subsong 0).
    pub fn from_file(path: &Path) -> Self {
        Self::new(path.to_string_lossy().to_string(), 0)
    }

    /// The URL scheme of the path, if any. Single-letter prefixes are
    /// treated as Windows drive letters, not schemes.
    pub fn scheme(&self) -> Option<&str> {
        let (scheme, _) = self.path.split_once(':')?;
        let valid = scheme.len() > 1
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.');
        valid.then_some(scheme)
    }

    /// Resolve to a filesystem path. Returns `None` for anything that is not
    /// a `file://` URL or a bare path.
    pub fn file_path(&self) -> Option<PathBuf> {
        match self.scheme() {
            None => Some(PathBuf::from(&self.path)),
            Some(s) if s.eq_ignore_ascii_case("file") => {
                let rest = &self.path[s.len() + 1..];
                Some(PathBuf::from(rest.strip_prefix("//").unwrap_or(rest)))
            }
            Some(_) => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subsong == 0 {
            write!(f, "{}", self.path)
        } else {
            write!(f, "{} [{}]", self.path, self.subsong)
        }
    }
}

/// True for locations that must not be analyzed without a user asking for it:
/// live radio, CD audio and record/random pseudo-locations.
pub fn is_location_forbidden(location: &Location) -> bool {
    let lower = location.path.to_ascii_lowercase();
    FORBIDDEN_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Host capability answering "does the media behind this path still exist?".
pub trait MediaExists: Send + Sync {
    fn exists(&self, location: &Location) -> bool;
}

/// Checks the local filesystem. Locations that do not resolve to a local
/// path cannot be verified and are reported as existing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFiles;

impl MediaExists for LocalFiles {
    fn exists(&self, location: &Location) -> bool {
        match location.file_path() {
            Some(path) => path.exists(),
            None => true,
        }
    }
}
