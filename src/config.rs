use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the compiled size of a single user file pattern
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

/// Errors raised while reading or validating the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
    #[error("no configuration source to reload from")]
    NoSource,
}

/// Top-level configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Serve plaintext only on the dev port, without TLS or ACME
    #[serde(default)]
    pub dev: bool,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub site: SiteConfig,

    #[serde(default)]
    pub acme: AcmeConfig,

    /// Virtual hosts, in declaration order
    #[serde(default)]
    pub subdomains: Vec<SubdomainConfig>,

    /// Users allowed into the secured tree, in declaration order
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Plaintext port, used for the HTTPS redirect and HTTP-01 challenges
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// TLS port
    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Plaintext port used when `dev = true`
    #[serde(default = "default_dev_port")]
    pub dev_port: u16,

    /// Loopback port of the operator API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the operator API. Generated at startup if unset.
    pub admin_token: Option<String>,

    /// Append-only combined-format access log (unset disables it)
    #[serde(default = "default_access_log")]
    pub access_log: Option<String>,

    /// Maximum time to wait for an origin's response head, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per origin (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            dev_port: default_dev_port(),
            admin_port: default_admin_port(),
            admin_token: None,
            access_log: default_access_log(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Local directories served by the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct SiteConfig {
    /// Site root, served at `/`
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Public read-only files, served at `/shared/`
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,

    /// Access-gated files, served at `/secured/`
    #[serde(default = "default_secured_dir")]
    pub secured_dir: PathBuf,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            static_dir: default_static_dir(),
            shared_dir: default_shared_dir(),
            secured_dir: default_secured_dir(),
        }
    }
}

/// ACME (Let's Encrypt) settings for on-demand certificates
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Contact email for the ACME account (required to create one)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    pub directory_url: Option<String>,

    /// Certificate and account cache directory
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,

    /// Renew certificates that expire within this many days
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,

    /// How often the background renewal check runs, in seconds
    #[serde(default = "default_renewal_check_secs")]
    pub renewal_check_secs: u64,
}

impl AcmeConfig {
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_days * 24 * 60 * 60)
    }

    pub fn renewal_check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_check_secs)
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            directory_url: None,
            cache_dir: default_acme_cache_dir(),
            renew_before_days: default_renew_before_days(),
            renewal_check_secs: default_renewal_check_secs(),
        }
    }
}

/// A virtual host. Without `proxy` the host serves local content.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SubdomainConfig {
    pub host: String,
    /// Origin URL (scheme://host[:port]) all traffic for this host goes to
    #[serde(default)]
    pub proxy: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct UserConfig {
    pub name: String,
    /// Hex-encoded SHA-256 of the user's password
    #[serde(alias = "password")]
    pub password_hash: String,
    /// Regular expressions over request paths, first match wins
    #[serde(default)]
    pub files: Vec<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_dev_port() -> u16 {
    8081
}

fn default_admin_port() -> u16 {
    9080
}

fn default_access_log() -> Option<String> {
    Some("access.log".to_string())
}

fn default_request_timeout() -> u64 {
    60
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_shared_dir() -> PathBuf {
    PathBuf::from("shared")
}

fn default_secured_dir() -> PathBuf {
    PathBuf::from("secured")
}

fn default_acme_cache_dir() -> String {
    "./certs".to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_renewal_check_secs() -> u64 {
    12 * 60 * 60
}

impl Config {
    /// Load and validate a config file. `.json` files are parsed as JSON,
    /// everything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_compiled(path).map(|(config, _)| config)
    }

    /// Load a config file together with its routing snapshot, compiling
    /// every pattern once
    pub fn load_compiled<P: AsRef<Path>>(path: P) -> Result<(Self, RoutingConfig), ConfigError> {
        let config = Self::read(path.as_ref())?;
        let routing = config.compile_routing()?;
        Ok((config, routing))
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validate all configuration, collecting every problem
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.compile_routing().map(|_| ())
    }

    /// Build the immutable routing snapshot for this configuration
    pub fn compile_routing(&self) -> Result<RoutingConfig, ConfigError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        let mut subdomains = Vec::with_capacity(self.subdomains.len());

        for rule in &self.subdomains {
            let host = normalize_host(&rule.host);
            if host.is_empty() {
                errors.push("subdomain host must not be empty".to_string());
                continue;
            }
            if !seen.insert(host.clone()) {
                errors.push(format!("duplicate subdomain host '{}'", host));
                continue;
            }
            let origin = match &rule.proxy {
                Some(url) => match Origin::parse(url) {
                    Ok(origin) => Some(origin),
                    Err(e) => {
                        errors.push(format!("subdomain '{}': {}", host, e));
                        continue;
                    }
                },
                None => None,
            };
            subdomains.push(SubdomainRule { host, origin });
        }

        let mut users = Vec::with_capacity(self.users.len());
        for (index, user) in self.users.iter().enumerate() {
            match UserRule::compile(user) {
                Ok(rule) => users.push(rule),
                Err(mut user_errors) => {
                    for e in user_errors.iter_mut() {
                        *e = format!("user #{} '{}': {}", index + 1, user.name, e);
                    }
                    errors.append(&mut user_errors);
                }
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(RoutingConfig { subdomains, users })
    }
}

/// Scheme, authority and path prefix of a proxy origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub scheme: String,
    pub authority: String,
    /// Prefixed onto every forwarded path. Empty, or `/seg...` without a
    /// trailing slash.
    pub base_path: String,
}

impl Origin {
    pub fn parse(url: &str) -> Result<Self, String> {
        let uri: hyper::Uri = url
            .trim()
            .parse()
            .map_err(|e| format!("invalid origin URL '{}': {}", url, e))?;
        let scheme = match uri.scheme_str() {
            Some(s @ ("http" | "https")) => s.to_string(),
            Some(other) => return Err(format!("unsupported origin scheme '{}'", other)),
            None => return Err(format!("origin URL '{}' has no scheme", url)),
        };
        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| format!("origin URL '{}' has no host", url))?;
        if uri.query().is_some() {
            return Err(format!("origin URL '{}' must not have a query", url));
        }
        let base_path = uri.path().trim_end_matches('/').to_string();
        Ok(Self {
            scheme,
            authority,
            base_path,
        })
    }
}

/// A compiled virtual host rule
#[derive(Debug, Clone)]
pub struct SubdomainRule {
    /// Lowercased host name
    pub host: String,
    /// `None` means "serve locally"
    pub origin: Option<Origin>,
}

/// A compiled user entry
#[derive(Debug, Clone)]
pub struct UserRule {
    pub name: String,
    /// Lowercase hex SHA-256 of the password
    pub password_hash: String,
    pub file_patterns: Vec<Regex>,
}

impl UserRule {
    fn compile(user: &UserConfig) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        if user.name.is_empty() {
            errors.push("name must not be empty".to_string());
        }

        let password_hash = user.password_hash.trim().to_ascii_lowercase();
        if password_hash.len() != 64 || !password_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            errors.push("password_hash must be a hex-encoded SHA-256 digest".to_string());
        }

        let mut file_patterns = Vec::with_capacity(user.files.len());
        for pattern in &user.files {
            match RegexBuilder::new(pattern).size_limit(PATTERN_SIZE_LIMIT).build() {
                Ok(re) => file_patterns.push(re),
                Err(e) => errors.push(format!("invalid file pattern '{}': {}", pattern, e)),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            name: user.name.clone(),
            password_hash,
            file_patterns,
        })
    }
}

/// Immutable routing snapshot swapped in as a whole on reload
#[derive(Debug, Clone, Default)]
pub struct RoutingConfig {
    pub subdomains: Vec<SubdomainRule>,
    pub users: Vec<UserRule>,
}

impl RoutingConfig {
    /// Look up a virtual host (case-insensitive, port ignored)
    pub fn subdomain(&self, host: &str) -> Option<&SubdomainRule> {
        let host = normalize_host(host);
        self.subdomains.iter().find(|rule| rule.host == host)
    }

    /// Origin for `host`, if it is a proxied virtual host
    pub fn origin_for(&self, host: &str) -> Option<&Origin> {
        self.subdomain(host).and_then(|rule| rule.origin.as_ref())
    }

    /// Whether certificates may be issued for `host`
    pub fn allows_certificate(&self, host: &str) -> bool {
        self.subdomain(host).is_some()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.subdomains.iter().map(|rule| rule.host.as_str())
    }
}

/// Lowercase a Host header value and strip any port
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // IPv6 literal
        host.split(']').next().map(|h| &h[1..]).unwrap_or(host)
    } else {
        host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "5e884898da28047151d0e56f8dc6297c5dfcc8a6a4eeb64e0ff2eb8a0d9d0b5e";

    #[test]
    fn test_parse_config() {
        let toml = format!(
            r#"
[server]
bind = "127.0.0.1"
http_port = 8080
https_port = 8443
admin_port = 9000

[site]
static_dir = "/srv/static"

[acme]
email = "ops@example.com"
renew_before_days = 20

[[subdomains]]
host = "example.com"

[[subdomains]]
host = "api.example.com"
proxy = "http://127.0.0.1:3000"

[[users]]
name = "alice"
password_hash = "{HASH}"
files = ['report\.pdf', '^private/']
"#
        );

        let config = Config::from_toml(&toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.https_port, 8443);
        assert_eq!(config.site.static_dir, PathBuf::from("/srv/static"));
        assert_eq!(config.site.shared_dir, PathBuf::from("shared"));
        assert_eq!(config.acme.renew_before_days, 20);
        assert_eq!(config.subdomains.len(), 2);
        assert_eq!(config.users[0].files.len(), 2);

        let routing = config.compile_routing().unwrap();
        let origin = routing.origin_for("API.example.com:443").unwrap();
        assert_eq!(origin.scheme, "http");
        assert_eq!(origin.authority, "127.0.0.1:3000");
        assert!(routing.origin_for("example.com").is_none());
        assert!(routing.allows_certificate("example.com"));
        assert!(!routing.allows_certificate("evil.example.net"));
    }

    #[test]
    fn test_parse_json_config() {
        let json = format!(
            r#"{{
                "users": [{{"name": "bob", "password": "{HASH}", "files": ["\\.txt$"]}}],
                "subdomains": [{{"host": "recipes.example.com", "proxy": "http://localhost:8000"}}],
                "dev": true
            }}"#
        );
        let config = Config::from_json(&json).unwrap();
        assert!(config.dev);
        assert_eq!(config.users[0].password_hash, HASH);
        let routing = config.compile_routing().unwrap();
        assert!(routing.origin_for("recipes.example.com").is_some());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert!(!config.dev);
        assert_eq!(config.server.http_port, 80);
        assert_eq!(config.server.https_port, 443);
        assert_eq!(config.server.dev_port, 8081);
        assert_eq!(config.server.access_log.as_deref(), Some("access.log"));
        assert_eq!(config.acme.cache_dir, "./certs");
        assert_eq!(config.acme.renew_before(), Duration::from_secs(30 * 86400));
        assert_eq!(config.acme.renewal_check_interval(), Duration::from_secs(43200));
    }

    #[test]
    fn test_duplicate_hosts_rejected() {
        let config = Config {
            subdomains: vec![
                SubdomainConfig { host: "a.example.com".into(), proxy: None },
                SubdomainConfig { host: "A.example.com".into(), proxy: None },
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate subdomain host"));
    }

    #[test]
    fn test_invalid_origin_rejected() {
        for bad in ["ftp://x", "not a url", "/relative"] {
            let config = Config {
                subdomains: vec![SubdomainConfig {
                    host: "a.example.com".into(),
                    proxy: Some(bad.into()),
                }],
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_invalid_pattern_fails_fast() {
        let config = Config {
            users: vec![UserConfig {
                name: "alice".into(),
                password_hash: HASH.into(),
                files: vec!["(unclosed".into()],
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid file pattern"));
    }

    #[test]
    fn test_oversized_pattern_rejected() {
        let config = Config {
            users: vec![UserConfig {
                name: "alice".into(),
                password_hash: HASH.into(),
                files: vec!["(\\w{500}){500}".into()],
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_password_hash_rejected() {
        let config = Config {
            users: vec![UserConfig {
                name: "alice".into(),
                password_hash: "hunter2".into(),
                files: vec![],
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("password_hash"));
    }

    #[test]
    fn test_all_errors_reported() {
        let config = Config {
            subdomains: vec![SubdomainConfig { host: "".into(), proxy: None }],
            users: vec![UserConfig {
                name: "".into(),
                password_hash: HASH.into(),
                files: vec!["[".into()],
            }],
            ..Default::default()
        };
        match config.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_dot_host_matches() {
        let config = Config {
            subdomains: vec![SubdomainConfig { host: "Example.com.".into(), proxy: None }],
            ..Default::default()
        };
        let routing = config.compile_routing().unwrap();
        assert_eq!(routing.hosts().collect::<Vec<_>>(), vec!["example.com"]);
        assert!(routing.allows_certificate("example.com"));
        assert!(routing.subdomain("EXAMPLE.com.:443").is_some());
    }

    #[test]
    fn test_origin_path_is_kept() {
        let origin = Origin::parse("http://127.0.0.1:8080/app/").unwrap();
        assert_eq!(origin.authority, "127.0.0.1:8080");
        assert_eq!(origin.base_path, "/app");
        assert_eq!(Origin::parse("http://127.0.0.1:8080").unwrap().base_path, "");
        assert_eq!(Origin::parse("http://127.0.0.1:8080/").unwrap().base_path, "");
        assert!(Origin::parse("http://127.0.0.1:8080/app?x=1").is_err());
    }

    #[test]
    fn test_load_compiled_returns_routing() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::fs::write(
            file.path(),
            format!(
                "[[subdomains]]\nhost = \"a.example.com\"\n\n[[users]]\nname = \"alice\"\npassword_hash = \"{HASH}\"\nfiles = ['a\\.txt']\n"
            ),
        )
        .unwrap();

        let (config, routing) = Config::load_compiled(file.path()).unwrap();
        assert_eq!(config.users.len(), 1);
        assert_eq!(routing.users[0].file_patterns.len(), 1);
        assert!(routing.allows_certificate("a.example.com"));

        std::fs::write(file.path(), "[[users]]\nname = \"bob\"\npassword_hash = \"x\"\n").unwrap();
        assert!(matches!(
            Config::load_compiled(file.path()),
            Err(ConfigError::Invalid(_))
        ));
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Example.COM"), "example.com");
        assert_eq!(normalize_host("example.com:8443"), "example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("[::1]:443"), "::1");
    }
}
