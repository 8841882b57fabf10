//! Basic-Auth gate in front of the secured file tree
//!
//! A request is first resolved to a user by exact name and password-hash
//! equality, scanning users in declaration order so earlier entries shadow
//! later ones. The HTML-escaped request path is then tested against that
//! user's patterns in order:
//!
//! - first matching pattern: the file is served (as a download unless it is
//!   an `.html` page)
//! - empty path or no match: a listing of every entry below the gated root
//!   whose relative path matches any of the user's patterns
//!
//! Anything else is a 401 with a `WWW-Authenticate: Basic` challenge. The
//! response never says whether the name or the password was wrong.

use crate::config::{RoutingConfig, UserRule};
use crate::files::SanitizedPath;
use base64::Engine;
use hyper::header::AUTHORIZATION;
use hyper::HeaderMap;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Credentials supplied with a request
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub name: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Parse an `Authorization: Basic ...` header
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (name, password) = decoded.split_once(':')?;
        Some(Self {
            name: name.to_string(),
            password: password.to_string(),
        })
    }

    fn password_hash(&self) -> String {
        hex::encode(Sha256::digest(self.password.as_bytes()))
    }
}

/// Identity resolved for one request
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub name: String,
    pub allowed_patterns: Vec<Regex>,
}

impl From<&UserRule> for AuthenticatedUser {
    fn from(rule: &UserRule) -> Self {
        Self {
            name: rule.name.clone(),
            allowed_patterns: rule.file_patterns.clone(),
        }
    }
}

/// Outcome of [`AccessGate::authorize`]
#[derive(Debug)]
pub enum Decision {
    /// No user matched the supplied credentials
    Forbidden,
    /// Serve the requested file
    FileMatch {
        user: AuthenticatedUser,
        /// Index of the matching pattern in the user's list
        pattern: usize,
        /// Force a download instead of in-browser rendering
        attachment: bool,
    },
    /// Show the entries the user is entitled to, as paths relative to the
    /// gated root
    DirectoryListing {
        user: AuthenticatedUser,
        entries: Vec<String>,
    },
}

/// Access rules for the secured tree
#[derive(Debug, Clone)]
pub struct AccessGate {
    root: PathBuf,
    /// URL prefix the gated tree is mounted at, used in listing links
    mount: String,
}

impl AccessGate {
    pub fn new(root: impl Into<PathBuf>, mount: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            mount: mount.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the user for `credentials`, first match in declaration order
    pub fn authenticate(
        &self,
        routing: &RoutingConfig,
        credentials: Option<&Credentials>,
    ) -> Option<AuthenticatedUser> {
        let credentials = credentials?;
        let hash = credentials.password_hash();
        routing
            .users
            .iter()
            .find(|user| user.name == credentials.name && user.password_hash == hash)
            .map(AuthenticatedUser::from)
    }

    pub fn authorize(
        &self,
        routing: &RoutingConfig,
        credentials: Option<&Credentials>,
        path: &SanitizedPath,
    ) -> Decision {
        let Some(user) = self.authenticate(routing, credentials) else {
            if let Some(credentials) = credentials {
                warn!(user = %credentials.name, "Rejected credentials for secured path");
            }
            return Decision::Forbidden;
        };

        let escaped = html_escape::encode_quoted_attribute(&path.relative);
        if !escaped.is_empty() {
            if let Some(pattern) = user
                .allowed_patterns
                .iter()
                .position(|re| re.is_match(&escaped))
            {
                debug!(user = %user.name, path = %path.relative, pattern, "Secured path matched");
                let attachment = !escaped.ends_with(".html");
                return Decision::FileMatch {
                    user,
                    pattern,
                    attachment,
                };
            }
        }

        let entries = self.allowed_entries(&user);
        debug!(user = %user.name, entries = entries.len(), "Rendering secured listing");
        Decision::DirectoryListing { user, entries }
    }

    /// Every entry below the root whose relative path matches one of the
    /// user's patterns, sorted and without duplicates. Regenerated per call.
    pub fn allowed_entries(&self, user: &AuthenticatedUser) -> Vec<String> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if user.allowed_patterns.iter().any(|re| re.is_match(&relative)) {
                entries.push(relative);
            }
        }
        entries
    }

    /// Render a listing as HTML links below the mount point
    pub fn render_listing(&self, entries: &[String]) -> String {
        let mut html = String::from("<!doctype html>\n<meta name=\"viewport\" content=\"width=device-width\">\n");
        for entry in entries {
            let href = format!("{}/{}", self.mount.trim_end_matches('/'), urlencoding_path(entry));
            html.push_str(&format!(
                "<a href=\"{}\">{}</a><br>\n",
                html_escape::encode_double_quoted_attribute(&href),
                html_escape::encode_text(entry)
            ));
        }
        html
    }
}

/// Percent-encode each segment of a relative path, keeping the separators
fn urlencoding_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
