//! Directory scopes and content fingerprints.
//!
//! A [`DirectoryScope`] is the flat directory being synchronized. It lists
//! candidate files (optionally filtered by a literal name or a glob pattern),
//! computes a [`FileFingerprint`] for each, and resolves file names received
//! from a peer into paths that are guaranteed to stay inside the scope.
//!
//! Fingerprints are always computed fresh; nothing here caches results.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Read size used while streaming file contents through the hasher.
const HASH_READ_SIZE: usize = 64 * 1024;

/// Characters that turn a file argument into a glob pattern.
const GLOB_CHARS: &[char] = &['*', '?', '[', ']'];

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ScopeError>;

fn io_error(path: &Path, source: std::io::Error) -> ScopeError {
    if source.kind() == std::io::ErrorKind::NotFound {
        ScopeError::NotFound(path.display().to_string())
    } else {
        ScopeError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// SHA-256 digest of a file's raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash an in-memory buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Identity of one file's content: name, hash and size.
///
/// Equality is structural. Two fingerprints describe "the same file" only if
/// all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// File name relative to the scope root (no separators)
    pub name: String,
    /// SHA-256 over the raw file bytes
    pub content_hash: ContentHash,
    /// Byte length from filesystem metadata
    pub size: u64,
}

/// Return every fingerprint of `a` that does not appear anywhere in `b`.
///
/// Order of `a` is preserved. Not symmetric: each side computes what *it*
/// has that the other lacks.
pub fn unique_to(a: &[FileFingerprint], b: &[FileFingerprint]) -> Vec<FileFingerprint> {
    let theirs: HashSet<&FileFingerprint> = b.iter().collect();
    a.iter()
        .filter(|fp| !theirs.contains(fp))
        .cloned()
        .collect()
}

/// Sum of the advertised sizes, or `None` if it does not fit in a `u64`.
pub fn total_size(files: &[FileFingerprint]) -> Option<u64> {
    files
        .iter()
        .try_fold(0u64, |total, fp| total.checked_add(fp.size))
}

/// Check whether a file argument should be expanded as a glob.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(GLOB_CHARS)
}

/// A validated directory used as the unit of synchronization (flat, one level).
#[derive(Debug, Clone)]
pub struct DirectoryScope {
    root: PathBuf,
}

impl DirectoryScope {
    /// Open a scope, failing unless `root` exists and is a directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let scope = Self { root: root.into() };
        scope.revalidate()?;
        Ok(scope)
    }

    /// Re-check that the root still exists and is a directory.
    ///
    /// Called before every burst of directory I/O.
    pub fn revalidate(&self) -> Result<()> {
        let metadata = std::fs::metadata(&self.root).map_err(|e| io_error(&self.root, e))?;
        if !metadata.is_dir() {
            return Err(ScopeError::NotDirectory(self.root.display().to_string()));
        }
        Ok(())
    }

    /// Map a bare file name to a path inside the scope.
    ///
    /// Rejects anything that could escape the root: empty names, `.`/`..`,
    /// absolute paths and names containing separators.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// List candidate file names, sorted.
    ///
    /// - `None` or empty: every regular file in the scope
    /// - glob (`* ? [ ]`): regular files whose name matches
    /// - literal: that single file, or [`ScopeError::NotFound`]
    pub async fn list_files(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let files = self.regular_files().await?;

        let pattern = match pattern {
            Some(p) if !p.is_empty() => p,
            _ => return Ok(files),
        };

        if is_glob(pattern) {
            if pattern.contains("..") {
                return Err(ScopeError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "path traversal is not allowed".to_string(),
                });
            }
            let matcher = glob_to_regex(pattern)?;
            let matched: Vec<String> = files.into_iter().filter(|f| matcher.is_match(f)).collect();
            debug!(pattern, count = matched.len(), "Expanded glob");
            return Ok(matched);
        }

        validate_name(pattern)?;
        if files.iter().any(|f| f == pattern) {
            Ok(vec![pattern.to_string()])
        } else {
            Err(ScopeError::NotFound(pattern.to_string()))
        }
    }

    /// Ordered, de-duplicated union of [`list_files`](Self::list_files) over
    /// several patterns. No patterns means the whole directory.
    pub async fn list_matching(&self, patterns: &[String]) -> Result<Vec<String>> {
        if patterns.is_empty() {
            return self.list_files(None).await;
        }

        let mut seen = HashSet::new();
        let mut names = Vec::new();
        for pattern in patterns {
            for name in self.list_files(Some(pattern.as_str())).await? {
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Fingerprint the named files.
    ///
    /// All-or-nothing: the first file that cannot be opened, read or stat'ed
    /// aborts the whole batch.
    pub async fn fingerprint(&self, names: &[String]) -> Result<Vec<FileFingerprint>> {
        self.revalidate()?;

        let mut fingerprints = Vec::with_capacity(names.len());
        for name in names {
            let path = self.resolve(name)?;
            let (content_hash, size) = hash_file(&path).await?;
            fingerprints.push(FileFingerprint {
                name: name.clone(),
                content_hash,
                size,
            });
        }
        Ok(fingerprints)
    }

    /// List and fingerprint in one step.
    pub async fn fingerprint_matching(&self, patterns: &[String]) -> Result<Vec<FileFingerprint>> {
        let names = self.list_matching(patterns).await?;
        self.fingerprint(&names).await
    }

    /// Names of regular files directly under the root, sorted.
    async fn regular_files(&self) -> Result<Vec<String>> {
        self.revalidate()?;

        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| io_error(&self.root, e))? {
            let path = entry.path();
            let metadata = match fs::metadata(&path).await {
                Ok(m) => m,
                // Dangling symlink or entry removed mid-listing
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(&path, e)),
            };
            if !metadata.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if validate_name(&name).is_ok() => names.push(name),
                Ok(name) => warn!(file = %name, "Skipping file name that cannot be synced"),
                Err(raw) => warn!("Skipping non UTF-8 file name {:?}", raw),
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Stream a file through SHA-256 and return `(hash, metadata size)`.
async fn hash_file(path: &Path) -> Result<(ContentHash, u64)> {
    let mut file = fs::File::open(path).await.map_err(|e| io_error(path, e))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| io_error(path, e))?
        .len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_READ_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| io_error(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok((ContentHash(hasher.finalize().into()), size))
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || Path::new(name).is_absolute();
    if invalid {
        Err(ScopeError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Translate a shell-style glob into an anchored regex.
///
/// Supports `*`, `?` and bracket classes (`[abc]`, `[a-z]`, `[!x]`).
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let invalid = |reason: &str| ScopeError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                let mut class = String::new();
                if matches!(chars.peek(), Some('!') | Some('^')) {
                    chars.next();
                    class.push('^');
                }
                // `]` directly after the opening bracket is a literal member
                if chars.peek() == Some(&']') {
                    chars.next();
                    class.push_str("\\]");
                }
                let mut closed = false;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '-' => class.push('-'),
                        '\\' | '[' | '^' | '&' | '~' => {
                            class.push('\\');
                            class.push(c);
                        }
                        other => class.push(other),
                    }
                }
                if !closed {
                    return Err(invalid("unterminated character class"));
                }
                re.push('[');
                re.push_str(&class);
                re.push(']');
            }
            other => re.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }

    re.push('$');
    Regex::new(&re).map_err(|e| invalid(&e.to_string()))
}
