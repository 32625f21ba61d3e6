//! Configuration — CLI flags, environment variables, config file,
//! and the passdb/userdb chain declarations (TOML).

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::drivers;
use crate::passdb::AuthPassdb;
use crate::userdb::AuthUserdb;
use crate::username;

/// mauthd — mail authentication daemon
#[derive(Parser, Debug)]
#[command(name = "mauthd", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(long, default_value = "mauthd.conf")]
    pub config: String,

    /// Run as a worker process instead of the master
    #[arg(long)]
    pub worker: bool,

    /// Front-end UNIX socket path
    #[arg(long, short = 's')]
    pub socket: Option<String>,

    /// Passdb/userdb chains TOML file
    #[arg(long)]
    pub databases: Option<String>,

    /// Worker UNIX socket path
    #[arg(long)]
    pub worker_socket: Option<String>,

    /// Max concurrent worker connections
    #[arg(long)]
    pub worker_max_count: Option<usize>,

    /// Requests a worker serves before asking to retire
    #[arg(long)]
    pub worker_max_requests: Option<usize>,

    /// Seconds before an in-flight worker lookup is aborted
    #[arg(long)]
    pub lookup_timeout: Option<u64>,

    /// Realm appended to domainless usernames
    #[arg(long)]
    pub default_realm: Option<String>,

    /// Allowed username characters (empty = all)
    #[arg(long)]
    pub username_chars: Option<String>,

    /// Username byte translation pairs, e.g. "%@" maps '%' to '@'
    #[arg(long)]
    pub username_translation: Option<String>,

    /// Template rewriting the username after normalization
    #[arg(long)]
    pub username_format: Option<String>,

    /// Separator splitting master*login usernames
    #[arg(long)]
    pub master_user_separator: Option<String>,

    /// User the ANONYMOUS mechanism logs in as
    #[arg(long)]
    pub anonymous_username: Option<String>,

    /// Take the username from the TLS peer certificate when given
    #[arg(long)]
    pub ssl_username_from_cert: bool,

    /// Cache size in KiB (0 disables the cache)
    #[arg(long)]
    pub cache_size: Option<usize>,

    /// Positive cache TTL in seconds
    #[arg(long)]
    pub cache_ttl: Option<u64>,

    /// Negative cache TTL in seconds
    #[arg(long)]
    pub cache_negative_ttl: Option<u64>,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// HTTP port for admin API (health, metrics, status)
    #[arg(long)]
    pub admin_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub worker: bool,
    pub socket_path: String,
    pub databases: Option<String>,
    pub worker_socket: String,
    pub worker_max_count: usize,
    pub worker_max_requests: usize,
    pub lookup_timeout_secs: u64,
    pub default_realm: Option<String>,
    pub username_chars: String,
    pub username_translation: String,
    pub username_format: Option<String>,
    pub master_user_separator: Option<char>,
    pub anonymous_username: String,
    pub ssl_username_from_cert: bool,
    pub cache_size_kib: usize,
    pub cache_ttl_secs: u64,
    pub cache_negative_ttl_secs: u64,
    pub log_level: String,
    pub admin_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: false,
            socket_path: "/var/run/mauthd/auth.sock".into(),
            databases: None,
            worker_socket: "/var/run/mauthd/worker.sock".into(),
            worker_max_count: 30,
            worker_max_requests: 10000,
            lookup_timeout_secs: 60,
            default_realm: None,
            username_chars: username::DEFAULT_USERNAME_CHARS.into(),
            username_translation: String::new(),
            username_format: None,
            master_user_separator: None,
            anonymous_username: "anonymous".into(),
            ssl_username_from_cert: false,
            cache_size_kib: 0,
            cache_ttl_secs: 3600,
            cache_negative_ttl_secs: 3600,
            log_level: "info".into(),
            admin_port: None,
        }
    }
}

fn parse_separator(value: &str) -> Option<char> {
    value.chars().next()
}

impl Config {
    /// Load configuration: defaults → config file → env vars → CLI flags.
    pub fn load() -> Self {
        let cli = Cli::parse();
        let mut config = Config::default();

        let config_path = Path::new(&cli.config);
        if config_path.exists()
            && let Ok(content) = fs::read_to_string(config_path)
        {
            apply_config_file(&mut config, &content);
        }

        apply_env(&mut config);

        if cli.worker {
            config.worker = true;
        }
        if let Some(v) = cli.socket {
            config.socket_path = v;
        }
        if let Some(v) = cli.databases {
            config.databases = Some(v);
        }
        if let Some(v) = cli.worker_socket {
            config.worker_socket = v;
        }
        if let Some(v) = cli.worker_max_count {
            config.worker_max_count = v;
        }
        if let Some(v) = cli.worker_max_requests {
            config.worker_max_requests = v;
        }
        if let Some(v) = cli.lookup_timeout {
            config.lookup_timeout_secs = v;
        }
        if let Some(v) = cli.default_realm {
            config.default_realm = Some(v);
        }
        if let Some(v) = cli.username_chars {
            config.username_chars = v;
        }
        if let Some(v) = cli.username_translation {
            config.username_translation = v;
        }
        if let Some(v) = cli.username_format {
            config.username_format = Some(v);
        }
        if let Some(v) = &cli.master_user_separator {
            config.master_user_separator = parse_separator(v);
        }
        if let Some(v) = cli.anonymous_username {
            config.anonymous_username = v;
        }
        if cli.ssl_username_from_cert {
            config.ssl_username_from_cert = true;
        }
        if let Some(v) = cli.cache_size {
            config.cache_size_kib = v;
        }
        if let Some(v) = cli.cache_ttl {
            config.cache_ttl_secs = v;
        }
        if let Some(v) = cli.cache_negative_ttl {
            config.cache_negative_ttl_secs = v;
        }
        if let Some(v) = cli.log_level {
            config.log_level = v;
        }
        if let Some(v) = cli.admin_port {
            config.admin_port = Some(v);
        }

        config
    }

    /// Validate configuration. Returns an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.socket_path.is_empty() {
            return Err("socket path must not be empty".into());
        }
        if self.worker_socket.is_empty() {
            return Err("worker socket path must not be empty".into());
        }
        if self.lookup_timeout_secs == 0 {
            return Err("lookup_timeout must be > 0".into());
        }
        if self.cache_size_kib > 0 && self.cache_ttl_secs == 0 {
            return Err("cache_size requires cache_ttl > 0".into());
        }
        if self.databases.is_none() {
            return Err("databases file is required (see --databases)".into());
        }
        if let Some(path) = &self.databases
            && !Path::new(path).exists()
        {
            return Err(format!("databases file not found: {path}"));
        }
        Ok(())
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_size_kib > 0 && self.cache_ttl_secs > 0
    }
}

fn apply_config_file(config: &mut Config, content: &str) {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some(eq_pos) = trimmed.find('=') else {
            continue;
        };

        let key = trimmed[..eq_pos].trim();
        let mut value = trimmed[eq_pos + 1..].trim().to_string();

        // Strip quotes
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }

        match key {
            "socket" | "socket_path" => config.socket_path = value,
            "databases" => config.databases = Some(value),
            "worker_socket" => config.worker_socket = value,
            "worker_max_count" => {
                if let Ok(v) = value.parse() {
                    config.worker_max_count = v;
                }
            }
            "worker_max_requests" => {
                if let Ok(v) = value.parse() {
                    config.worker_max_requests = v;
                }
            }
            "lookup_timeout" => {
                if let Ok(v) = value.parse() {
                    config.lookup_timeout_secs = v;
                }
            }
            "default_realm" => config.default_realm = Some(value),
            "username_chars" => config.username_chars = value,
            "username_translation" => config.username_translation = value,
            "username_format" => config.username_format = Some(value),
            "master_user_separator" => {
                config.master_user_separator = parse_separator(&value);
            }
            "anonymous_username" => config.anonymous_username = value,
            "ssl_username_from_cert" => {
                config.ssl_username_from_cert = matches!(value.as_str(), "true" | "1" | "yes");
            }
            "cache_size" => {
                if let Ok(v) = value.parse() {
                    config.cache_size_kib = v;
                }
            }
            "cache_ttl" => {
                if let Ok(v) = value.parse() {
                    config.cache_ttl_secs = v;
                }
            }
            "cache_negative_ttl" => {
                if let Ok(v) = value.parse() {
                    config.cache_negative_ttl_secs = v;
                }
            }
            "log_level" => config.log_level = value,
            "admin_port" => {
                if let Ok(v) = value.parse() {
                    config.admin_port = Some(v);
                }
            }
            _ => {}
        }
    }
}

fn apply_env(config: &mut Config) {
    if let Ok(v) = std::env::var("MAUTHD_SOCKET") {
        config.socket_path = v;
    }
    if let Ok(v) = std::env::var("MAUTHD_DATABASES") {
        config.databases = Some(v);
    }
    // compatibility names used by the worker and cache subsystems
    if let Ok(v) = std::env::var("AUTH_WORKER_PATH") {
        config.worker_socket = v;
    }
    if let Ok(v) = std::env::var("AUTH_WORKER_MAX_COUNT")
        && let Ok(n) = v.parse()
    {
        config.worker_max_count = n;
    }
    if let Ok(v) = std::env::var("MAUTHD_WORKER_MAX_REQUESTS")
        && let Ok(n) = v.parse()
    {
        config.worker_max_requests = n;
    }
    if let Ok(v) = std::env::var("MAUTHD_LOOKUP_TIMEOUT")
        && let Ok(n) = v.parse()
    {
        config.lookup_timeout_secs = n;
    }
    if let Ok(v) = std::env::var("MAUTHD_DEFAULT_REALM") {
        config.default_realm = Some(v);
    }
    if let Ok(v) = std::env::var("MAUTHD_USERNAME_CHARS") {
        config.username_chars = v;
    }
    if let Ok(v) = std::env::var("MAUTHD_USERNAME_TRANSLATION") {
        config.username_translation = v;
    }
    if let Ok(v) = std::env::var("MAUTHD_USERNAME_FORMAT") {
        config.username_format = Some(v);
    }
    if let Ok(v) = std::env::var("MAUTHD_MASTER_USER_SEPARATOR") {
        config.master_user_separator = parse_separator(&v);
    }
    if let Ok(v) = std::env::var("MAUTHD_ANONYMOUS_USERNAME") {
        config.anonymous_username = v;
    }
    if let Ok(v) = std::env::var("MAUTHD_SSL_USERNAME_FROM_CERT") {
        config.ssl_username_from_cert = matches!(v.as_str(), "true" | "1" | "yes");
    }
    if let Ok(v) = std::env::var("CACHE_SIZE")
        && let Ok(n) = v.parse()
    {
        config.cache_size_kib = n;
    }
    if let Ok(v) = std::env::var("CACHE_TTL")
        && let Ok(n) = v.parse()
    {
        config.cache_ttl_secs = n;
    }
    if let Ok(v) = std::env::var("CACHE_NEGATIVE_TTL")
        && let Ok(n) = v.parse()
    {
        config.cache_negative_ttl_secs = n;
    }
    if let Ok(v) = std::env::var("MAUTHD_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Ok(v) = std::env::var("MAUTHD_ADMIN_PORT")
        && let Ok(p) = v.parse()
    {
        config.admin_port = Some(p);
    }
}

// ─── Chain declarations (TOML) ──────────────────────────────────────────────

/// Top-level structure of the databases TOML file.
#[derive(Debug, Deserialize)]
pub struct ChainsFile {
    #[serde(default)]
    pub passdb: Vec<PassdbToml>,
    #[serde(default)]
    pub userdb: Vec<UserdbToml>,
}

/// One `[[passdb]]` block.
#[derive(Debug, Deserialize)]
pub struct PassdbToml {
    pub driver: String,
    #[serde(default)]
    pub args: String,
    /// success continues to the next passdb
    #[serde(default)]
    pub pass: bool,
    /// success means the user is blocked
    #[serde(default)]
    pub deny: bool,
    /// entry belongs to the master chain
    #[serde(default)]
    pub master: bool,
    /// route lookups through the worker pool
    #[serde(default)]
    pub blocking: bool,
    /// override the driver's cache key template ("" = uncacheable)
    pub cache_key: Option<String>,
    pub default_scheme: Option<String>,
}

/// One `[[userdb]]` block.
#[derive(Debug, Deserialize)]
pub struct UserdbToml {
    pub driver: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub blocking: bool,
}

#[derive(Debug)]
pub struct Chains {
    pub passdbs: Vec<AuthPassdb>,
    pub masterdbs: Vec<AuthPassdb>,
    pub userdbs: Vec<AuthUserdb>,
}

/// Load and instantiate the chains from a TOML file.
pub fn load_chains(path: &str) -> Result<Chains, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read databases file '{path}': {e}"))?;
    let parsed: ChainsFile =
        toml::from_str(&content).map_err(|e| format!("invalid TOML in '{path}': {e}"))?;

    if parsed.passdb.is_empty() {
        return Err(format!("databases file '{path}' declares no [[passdb]] blocks"));
    }

    let mut passdbs = Vec::new();
    let mut masterdbs = Vec::new();
    // ids are unique across both chains; workers address entries by id
    for (id, db) in parsed.passdb.into_iter().enumerate() {
        let default_scheme = db.default_scheme.unwrap_or_else(|| "PLAIN".to_string());
        let (driver, defaults) =
            drivers::create_passdb_driver(&db.driver, &db.args, &default_scheme)?;
        let cache_key = match db.cache_key {
            Some(key) if key.is_empty() => None,
            Some(key) => Some(key),
            None => defaults.cache_key,
        };
        let entry = AuthPassdb {
            id: id as u32,
            driver,
            pass: db.pass,
            deny: db.deny,
            master: db.master,
            blocking: db.blocking,
            cache_key,
            default_pass_scheme: defaults.default_pass_scheme,
        };
        entry.check()?;
        if db.master {
            masterdbs.push(entry);
        } else {
            passdbs.push(entry);
        }
    }

    if passdbs.is_empty() {
        return Err(format!("databases file '{path}' has only master passdbs"));
    }

    let mut userdbs = Vec::new();
    for (id, db) in parsed.userdb.into_iter().enumerate() {
        let driver = drivers::create_userdb_driver(&db.driver, &db.args)?;
        userdbs.push(AuthUserdb {
            id: id as u32,
            driver,
            blocking: db.blocking,
        });
    }

    Ok(Chains {
        passdbs,
        masterdbs,
        userdbs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ─── Config file parsing ─────────────────────────────────────────────

    #[test]
    fn parse_basic_config_file() {
        let mut config = Config::default();
        apply_config_file(
            &mut config,
            r#"
socket = /tmp/auth.sock
databases = /etc/mauthd/databases.toml
worker_max_count = 8
log_level = debug
"#,
        );
        assert_eq!(config.socket_path, "/tmp/auth.sock");
        assert_eq!(config.databases.as_deref(), Some("/etc/mauthd/databases.toml"));
        assert_eq!(config.worker_max_count, 8);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn parse_quoted_values() {
        let mut config = Config::default();
        apply_config_file(
            &mut config,
            r#"
default_realm = "example.org"
anonymous_username = 'guest'
"#,
        );
        assert_eq!(config.default_realm.as_deref(), Some("example.org"));
        assert_eq!(config.anonymous_username, "guest");
    }

    #[test]
    fn comments_and_unknown_keys_ignored() {
        let mut config = Config::default();
        apply_config_file(
            &mut config,
            "# comment\nunknown_key = x\ncache_size = 512\n",
        );
        assert_eq!(config.cache_size_kib, 512);
    }

    #[test]
    fn invalid_numbers_keep_defaults() {
        let mut config = Config::default();
        apply_config_file(&mut config, "worker_max_count = lots\n");
        assert_eq!(config.worker_max_count, 30);
    }

    #[test]
    fn separator_takes_first_char() {
        let mut config = Config::default();
        apply_config_file(&mut config, "master_user_separator = *\n");
        assert_eq!(config.master_user_separator, Some('*'));
    }

    #[test]
    fn booleans_parse() {
        let mut config = Config::default();
        apply_config_file(&mut config, "ssl_username_from_cert = yes\n");
        assert!(config.ssl_username_from_cert);
    }

    // ─── Env overrides ───────────────────────────────────────────────────

    #[test]
    fn worker_env_compat_names() {
        let mut config = Config::default();
        // SAFETY: test runs single-threaded (cargo test default), no concurrent env access
        unsafe {
            std::env::set_var("AUTH_WORKER_PATH", "/tmp/wrk.sock");
            std::env::set_var("AUTH_WORKER_MAX_COUNT", "5");
            std::env::set_var("CACHE_SIZE", "1024");
            std::env::set_var("CACHE_TTL", "120");
            std::env::set_var("CACHE_NEGATIVE_TTL", "30");
        }
        apply_env(&mut config);
        unsafe {
            std::env::remove_var("AUTH_WORKER_PATH");
            std::env::remove_var("AUTH_WORKER_MAX_COUNT");
            std::env::remove_var("CACHE_SIZE");
            std::env::remove_var("CACHE_TTL");
            std::env::remove_var("CACHE_NEGATIVE_TTL");
        }
        assert_eq!(config.worker_socket, "/tmp/wrk.sock");
        assert_eq!(config.worker_max_count, 5);
        assert_eq!(config.cache_size_kib, 1024);
        assert_eq!(config.cache_ttl_secs, 120);
        assert_eq!(config.cache_negative_ttl_secs, 30);
    }

    // ─── Validation ──────────────────────────────────────────────────────

    fn valid_config(databases: &str) -> Config {
        Config {
            databases: Some(databases.to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn validate_requires_databases() {
        let config = Config::default();
        assert!(config.validate().unwrap_err().contains("databases"));
    }

    #[test]
    fn validate_missing_databases_file() {
        let config = valid_config("/no/such/file.toml");
        assert!(config.validate().unwrap_err().contains("not found"));
    }

    #[test]
    fn validate_zero_lookup_timeout() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[[passdb]]\ndriver = \"static\"\nargs = \"nopassword\"").unwrap();
        let mut config = valid_config(f.path().to_str().unwrap());
        config.lookup_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_cache_needs_ttl() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "[[passdb]]\ndriver = \"static\"\nargs = \"nopassword\"").unwrap();
        let mut config = valid_config(f.path().to_str().unwrap());
        config.cache_size_kib = 100;
        config.cache_ttl_secs = 0;
        assert!(config.validate().is_err());
        config.cache_ttl_secs = 60;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn cache_enabled_rules() {
        let mut config = Config::default();
        assert!(!config.cache_enabled());
        config.cache_size_kib = 100;
        assert!(config.cache_enabled());
    }

    // ─── Chains TOML ─────────────────────────────────────────────────────

    fn write_chains(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn load_chains_full() {
        let f = write_chains(
            r#"
[[passdb]]
driver = "static"
args = "password=master-secret"
master = true
pass = true

[[passdb]]
driver = "static"
args = "password=secret uid=1000"
blocking = true
cache_key = "%u/%s"

[[userdb]]
driver = "static"
args = "uid=1000 gid=1000 home=/home/%n"

[[userdb]]
driver = "prefetch"
"#,
        );
        let chains = load_chains(f.path().to_str().unwrap()).unwrap();
        assert_eq!(chains.passdbs.len(), 1);
        assert_eq!(chains.masterdbs.len(), 1);
        assert_eq!(chains.userdbs.len(), 2);

        assert!(chains.masterdbs[0].master);
        assert!(chains.masterdbs[0].pass);
        assert_eq!(chains.masterdbs[0].id, 0);

        let main = &chains.passdbs[0];
        assert_eq!(main.id, 1);
        assert!(main.blocking);
        assert_eq!(main.cache_key.as_deref(), Some("%u/%s"));
        assert_eq!(main.default_pass_scheme, "PLAIN");
    }

    #[test]
    fn empty_cache_key_disables_caching() {
        let f = write_chains(
            "[[passdb]]\ndriver = \"static\"\nargs = \"nopassword\"\ncache_key = \"\"\n",
        );
        let chains = load_chains(f.path().to_str().unwrap()).unwrap();
        assert_eq!(chains.passdbs[0].cache_key, None);
    }

    #[test]
    fn chains_require_a_passdb() {
        let f = write_chains("[[userdb]]\ndriver = \"prefetch\"\n");
        assert!(load_chains(f.path().to_str().unwrap()).is_err());

        let f = write_chains(
            "[[passdb]]\ndriver = \"static\"\nargs = \"nopassword\"\nmaster = true\n",
        );
        assert!(
            load_chains(f.path().to_str().unwrap())
                .unwrap_err()
                .contains("only master")
        );
    }

    #[test]
    fn chains_unknown_driver_errors() {
        let f = write_chains("[[passdb]]\ndriver = \"ldap\"\n");
        assert!(
            load_chains(f.path().to_str().unwrap())
                .unwrap_err()
                .contains("Unknown passdb driver")
        );
    }

    #[test]
    fn chains_invalid_toml_errors() {
        let f = write_chains("this is not toml [");
        assert!(load_chains(f.path().to_str().unwrap()).is_err());
    }
}
