//! Built-in passdb/userdb drivers.
//!
//! `static` answers from configured template fields, `passwd-file`
//! from a colon-separated flat file, `prefetch` from the `userdb_`
//! fields a passdb already attached. Anything heavier (SQL, LDAP,
//! PAM) plugs into the same contract.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::passdb::{PassdbDriver, PassdbResult};
use crate::request::AuthRequest;
use crate::scheme;
use crate::userdb::{UserdbDriver, UserdbResult};

/// Driver-provided attributes the chain entry starts from.
pub struct PassdbDefaults {
    pub cache_key: Option<String>,
    pub default_pass_scheme: String,
}

/// Instantiate a passdb driver by name.
pub fn create_passdb_driver(
    name: &str,
    args: &str,
    default_scheme: &str,
) -> Result<(Arc<dyn PassdbDriver>, PassdbDefaults), String> {
    match name {
        "static" => {
            let driver = StaticPassdb::parse(args, default_scheme)?;
            Ok((
                Arc::new(driver),
                PassdbDefaults {
                    cache_key: None,
                    default_pass_scheme: default_scheme.to_string(),
                },
            ))
        }
        "passwd-file" => {
            let file = PasswdFile::load(args)?;
            Ok((
                Arc::new(PasswdFilePassdb {
                    file,
                    default_scheme: default_scheme.to_string(),
                }),
                PassdbDefaults {
                    cache_key: Some("%u".to_string()),
                    default_pass_scheme: default_scheme.to_string(),
                },
            ))
        }
        _ => Err(format!("Unknown passdb driver '{name}'")),
    }
}

/// Instantiate a userdb driver by name.
pub fn create_userdb_driver(name: &str, args: &str) -> Result<Arc<dyn UserdbDriver>, String> {
    match name {
        "static" => Ok(Arc::new(StaticUserdb::parse(args)?)),
        "passwd-file" => Ok(Arc::new(PasswdFileUserdb {
            file: PasswdFile::load(args)?,
        })),
        "prefetch" => {
            if !args.is_empty() {
                return Err(format!("userdb prefetch: No args are supported: {args}"));
            }
            Ok(Arc::new(PrefetchUserdb))
        }
        _ => Err(format!("Unknown userdb driver '{name}'")),
    }
}

fn parse_template_args(args: &str) -> Vec<(String, Option<String>)> {
    args.split_whitespace()
        .map(|tok| match tok.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.to_string())),
            None => (tok.to_string(), None),
        })
        .collect()
}

// ─── static passdb ──────────────────────────────────────────────────────────

/// Accepts any user; fields (password included) come from the args
/// template, e.g. `password=secret uid=1000` or `nopassword`.
pub struct StaticPassdb {
    fields: Vec<(String, Option<String>)>,
    default_scheme: String,
}

impl StaticPassdb {
    fn parse(args: &str, default_scheme: &str) -> Result<Self, String> {
        let fields = parse_template_args(args);
        let has_password = fields
            .iter()
            .any(|(k, _)| k == "password" || k == "nopassword");
        if !has_password {
            return Err("passdb static: password= or nopassword required".to_string());
        }
        Ok(Self {
            fields,
            default_scheme: default_scheme.to_string(),
        })
    }

    fn export_fields(&self, request: &mut AuthRequest) {
        for (k, v) in &self.fields {
            let value = match v {
                Some(v) => request.expand_template(v),
                None => String::new(),
            };
            request.set_field(k, &value, Some(&self.default_scheme));
        }
    }
}

impl PassdbDriver for StaticPassdb {
    fn name(&self) -> &'static str {
        "static"
    }

    fn verify_plain(&self, request: &mut AuthRequest, password: &str) -> PassdbResult {
        self.export_fields(request);
        if request.no_password {
            return PassdbResult::Ok;
        }
        let Some(tagged) = request.passdb_password.as_deref().map(|p| p.to_string()) else {
            return PassdbResult::Ok;
        };
        let (scheme_name, data) = scheme::extract_scheme(&tagged)
            .unwrap_or((self.default_scheme.as_str(), tagged.as_str()));
        if request.password_verify(password, data, scheme_name) > 0 {
            PassdbResult::Ok
        } else {
            PassdbResult::PasswordMismatch
        }
    }

    fn lookup_credentials(&self, request: &mut AuthRequest) -> Option<PassdbResult> {
        self.export_fields(request);
        Some(PassdbResult::Ok)
    }
}

// ─── passwd-file ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct PasswdFileEntry {
    /// stored credential, scheme-tagged or raw; None for an empty
    /// password field (any password goes)
    password: Option<String>,
    /// `!`/`*` prefixed password: administratively locked
    locked: bool,
    uid: Option<String>,
    gid: Option<String>,
    home: Option<String>,
    extra: Vec<(String, String)>,
}

/// Shared parse of a flat passwd file:
/// `user:password:uid:gid:gecos:home:shell:key=value:...`
pub struct PasswdFile {
    entries: Mutex<HashMap<String, PasswdFileEntry>>,
}

impl PasswdFile {
    pub fn load(path: &str) -> Result<Arc<Self>, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("passwd-file {path}: {e}"))?;
        let mut entries = HashMap::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split(':');
            let Some(user) = fields.next().filter(|u| !u.is_empty()) else {
                warn!(path, lineno = lineno + 1, "passwd-file: missing username, line skipped");
                continue;
            };
            let mut entry = PasswdFileEntry::default();
            if let Some(pw) = fields.next() {
                if pw.starts_with('!') || pw.starts_with('*') {
                    entry.locked = true;
                } else if !pw.is_empty() {
                    entry.password = Some(pw.to_string());
                }
            }
            entry.uid = fields.next().filter(|v| !v.is_empty()).map(String::from);
            entry.gid = fields.next().filter(|v| !v.is_empty()).map(String::from);
            let _gecos = fields.next();
            entry.home = fields.next().filter(|v| !v.is_empty()).map(String::from);
            let _shell = fields.next();
            for extra in fields {
                if let Some((k, v)) = extra.split_once('=') {
                    entry.extra.push((k.to_string(), v.to_string()));
                } else if !extra.is_empty() {
                    entry.extra.push((extra.to_string(), String::new()));
                }
            }
            entries.insert(user.to_string(), entry);
        }
        Ok(Arc::new(Self {
            entries: Mutex::new(entries),
        }))
    }

    fn get(&self, user: &str) -> Option<PasswdFileEntry> {
        self.entries.lock().unwrap().get(user).cloned()
    }
}

pub struct PasswdFilePassdb {
    file: Arc<PasswdFile>,
    default_scheme: String,
}

impl PasswdFilePassdb {
    /// Returns None for unknown user; exports the entry's fields.
    fn lookup_entry(&self, request: &mut AuthRequest) -> Option<PasswdFileEntry> {
        let entry = self.file.get(&request.user)?;
        let extra = entry.extra.clone();
        for (k, v) in extra {
            let value = request.expand_template(&v);
            request.set_field(&k, &value, Some(&self.default_scheme));
        }
        Some(entry)
    }
}

impl PassdbDriver for PasswdFilePassdb {
    fn name(&self) -> &'static str {
        "passwd-file"
    }

    fn verify_plain(&self, request: &mut AuthRequest, password: &str) -> PassdbResult {
        let Some(entry) = self.lookup_entry(request) else {
            return PassdbResult::UserUnknown;
        };
        if entry.locked {
            return PassdbResult::UserDisabled;
        }
        let Some(stored) = entry.password else {
            request.set_field("nopassword", "", None);
            return PassdbResult::Ok;
        };
        request.set_field("password", &stored, Some(&self.default_scheme));
        let (scheme_name, data) = scheme::extract_scheme(&stored)
            .unwrap_or((self.default_scheme.as_str(), stored.as_str()));
        if request.password_verify(password, data, scheme_name) > 0 {
            PassdbResult::Ok
        } else {
            PassdbResult::PasswordMismatch
        }
    }

    fn lookup_credentials(&self, request: &mut AuthRequest) -> Option<PassdbResult> {
        let Some(entry) = self.lookup_entry(request) else {
            return Some(PassdbResult::UserUnknown);
        };
        if entry.locked {
            return Some(PassdbResult::UserDisabled);
        }
        if let Some(stored) = entry.password {
            request.set_field("password", &stored, Some(&self.default_scheme));
        }
        Some(PassdbResult::Ok)
    }

    fn set_credentials(&self, request: &mut AuthRequest, new_credentials: &str) -> Option<bool> {
        // TODO: persist updates back to the file on SIGHUP-style reload
        let mut entries = self.file.entries.lock().unwrap();
        match entries.get_mut(&request.user) {
            Some(entry) => {
                entry.password = Some(new_credentials.to_string());
                entry.locked = false;
                Some(true)
            }
            None => Some(false),
        }
    }
}

pub struct PasswdFileUserdb {
    file: Arc<PasswdFile>,
}

impl UserdbDriver for PasswdFileUserdb {
    fn name(&self) -> &'static str {
        "passwd-file"
    }

    fn lookup(&self, request: &mut AuthRequest) -> UserdbResult {
        let Some(entry) = self.file.get(&request.user) else {
            return UserdbResult::UserUnknown;
        };
        request.init_userdb_reply();
        if let Some(uid) = &entry.uid {
            request.set_userdb_field("uid", uid);
        }
        if let Some(gid) = &entry.gid {
            request.set_userdb_field("gid", gid);
        }
        if let Some(home) = &entry.home {
            request.set_userdb_field("home", home);
        }
        for (k, v) in &entry.extra {
            let value = request.expand_template(v);
            request.set_userdb_field(k, &value);
        }
        UserdbResult::Ok
    }
}

// ─── static userdb ──────────────────────────────────────────────────────────

/// Answers every lookup from a `key=value ...` template, values
/// expanded with request variables.
pub struct StaticUserdb {
    template: Vec<(String, String)>,
}

impl StaticUserdb {
    fn parse(args: &str) -> Result<Self, String> {
        let mut template = Vec::new();
        for (k, v) in parse_template_args(args) {
            if k.is_empty() {
                return Err(format!("userdb static: Empty key (={})", v.unwrap_or_default()));
            }
            template.push((k, v.unwrap_or_default()));
        }
        Ok(Self { template })
    }
}

impl UserdbDriver for StaticUserdb {
    fn name(&self) -> &'static str {
        "static"
    }

    fn lookup(&self, request: &mut AuthRequest) -> UserdbResult {
        request.init_userdb_reply();
        for (k, v) in &self.template {
            let value = request.expand_template(v);
            request.set_userdb_field(k, &value);
        }
        UserdbResult::Ok
    }
}

// ─── prefetch userdb ────────────────────────────────────────────────────────

/// Serves the `userdb_`-prefixed fields the passdb phase already
/// placed into the userdb reply.
pub struct PrefetchUserdb;

impl UserdbDriver for PrefetchUserdb {
    fn name(&self) -> &'static str {
        "prefetch"
    }

    fn lookup(&self, request: &mut AuthRequest) -> UserdbResult {
        if request.userdb_reply.is_empty() {
            // the next userdb may still know the user
            return UserdbResult::UserUnknown;
        }
        UserdbResult::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::AuthRequestState;
    use std::io::Write;

    fn request_for(user: &str) -> AuthRequest {
        let mut r = AuthRequest::new("PLAIN", 1);
        r.user = user.to_string();
        r.original_username = Some(user.to_string());
        r.service = "imap".into();
        r.state = AuthRequestState::MechContinue;
        r
    }

    fn write_passwd_file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    // ─── static passdb ───────────────────────────────────────────────────

    #[test]
    fn static_passdb_verifies_template_password() {
        let (driver, _) = create_passdb_driver("static", "password=secret uid=1000", "PLAIN").unwrap();
        let mut req = request_for("alice");
        assert_eq!(driver.verify_plain(&mut req, "secret"), PassdbResult::Ok);
        assert!(req.extra_fields.split().any(|f| f == "uid=1000"));

        let mut req = request_for("alice");
        assert_eq!(
            driver.verify_plain(&mut req, "wrong"),
            PassdbResult::PasswordMismatch
        );
    }

    #[test]
    fn static_passdb_nopassword_accepts_anything() {
        let (driver, _) = create_passdb_driver("static", "nopassword", "PLAIN").unwrap();
        let mut req = request_for("alice");
        assert_eq!(driver.verify_plain(&mut req, "anything"), PassdbResult::Ok);
        assert!(req.no_password);
    }

    #[test]
    fn static_passdb_requires_password_arg() {
        assert!(create_passdb_driver("static", "uid=1", "PLAIN").is_err());
    }

    #[test]
    fn static_passdb_supports_credentials_lookup() {
        let (driver, _) = create_passdb_driver("static", "password=secret", "PLAIN").unwrap();
        let mut req = request_for("alice");
        assert_eq!(driver.lookup_credentials(&mut req), Some(PassdbResult::Ok));
        assert_eq!(
            req.passdb_password.as_deref().map(|p| &**p),
            Some("{PLAIN}secret")
        );
    }

    #[test]
    fn unknown_driver_is_an_error() {
        assert!(create_passdb_driver("ldap", "", "PLAIN").is_err());
        assert!(create_userdb_driver("sql", "").is_err());
    }

    // ─── passwd-file ─────────────────────────────────────────────────────

    const PASSWD: &str = "\
# test users
alice:{PLAIN}secret:1000:1000::/home/alice::quota=10M
bob:plainpw:1001:1001::/home/bob:/bin/sh
carol:!locked:1002:1002::/home/carol
dave::1003:1003::/home/dave
";

    #[test]
    fn passwd_file_verify_tagged_and_untagged() {
        let f = write_passwd_file(PASSWD);
        let (driver, defaults) =
            create_passdb_driver("passwd-file", f.path().to_str().unwrap(), "PLAIN").unwrap();
        assert_eq!(defaults.cache_key.as_deref(), Some("%u"));

        let mut req = request_for("alice");
        assert_eq!(driver.verify_plain(&mut req, "secret"), PassdbResult::Ok);
        assert!(req.extra_fields.split().any(|f| f == "quota=10M"));

        // untagged password falls back to the default scheme
        let mut req = request_for("bob");
        assert_eq!(driver.verify_plain(&mut req, "plainpw"), PassdbResult::Ok);

        let mut req = request_for("alice");
        assert_eq!(
            driver.verify_plain(&mut req, "nope"),
            PassdbResult::PasswordMismatch
        );
    }

    #[test]
    fn passwd_file_unknown_and_locked_and_empty() {
        let f = write_passwd_file(PASSWD);
        let (driver, _) =
            create_passdb_driver("passwd-file", f.path().to_str().unwrap(), "PLAIN").unwrap();

        let mut req = request_for("nobody");
        assert_eq!(
            driver.verify_plain(&mut req, "x"),
            PassdbResult::UserUnknown
        );

        let mut req = request_for("carol");
        assert_eq!(
            driver.verify_plain(&mut req, "locked"),
            PassdbResult::UserDisabled
        );

        // empty password field lets anything through
        let mut req = request_for("dave");
        assert_eq!(driver.verify_plain(&mut req, "whatever"), PassdbResult::Ok);
        assert!(req.no_password);
    }

    #[test]
    fn passwd_file_lookup_credentials() {
        let f = write_passwd_file(PASSWD);
        let (driver, _) =
            create_passdb_driver("passwd-file", f.path().to_str().unwrap(), "PLAIN").unwrap();
        let mut req = request_for("alice");
        assert_eq!(driver.lookup_credentials(&mut req), Some(PassdbResult::Ok));
        assert_eq!(
            req.passdb_password.as_deref().map(|p| &**p),
            Some("{PLAIN}secret")
        );
    }

    #[test]
    fn passwd_file_set_credentials_updates_entry() {
        let f = write_passwd_file(PASSWD);
        let (driver, _) =
            create_passdb_driver("passwd-file", f.path().to_str().unwrap(), "PLAIN").unwrap();
        let mut req = request_for("alice");
        assert_eq!(
            driver.set_credentials(&mut req, "{PLAIN}newpw"),
            Some(true)
        );
        let mut req = request_for("alice");
        assert_eq!(driver.verify_plain(&mut req, "newpw"), PassdbResult::Ok);

        let mut req = request_for("nobody");
        assert_eq!(driver.set_credentials(&mut req, "{PLAIN}x"), Some(false));
    }

    #[test]
    fn passwd_file_missing_file_errors() {
        assert!(create_passdb_driver("passwd-file", "/no/such/file", "PLAIN").is_err());
    }

    #[test]
    fn passwd_file_userdb_fields() {
        let f = write_passwd_file(PASSWD);
        let driver = create_userdb_driver("passwd-file", f.path().to_str().unwrap()).unwrap();
        let mut req = request_for("alice");
        assert_eq!(driver.lookup(&mut req), UserdbResult::Ok);
        let fields: Vec<&str> = req.userdb_reply.split().collect();
        assert!(fields.contains(&"uid=1000"));
        assert!(fields.contains(&"gid=1000"));
        assert!(fields.contains(&"home=/home/alice"));

        let mut req = request_for("nobody");
        assert_eq!(driver.lookup(&mut req), UserdbResult::UserUnknown);
    }

    // ─── static userdb ───────────────────────────────────────────────────

    #[test]
    fn static_userdb_expands_variables() {
        let driver =
            create_userdb_driver("static", "uid=1000 gid=1000 home=/home/%n").unwrap();
        let mut req = request_for("alice@example.org");
        assert_eq!(driver.lookup(&mut req), UserdbResult::Ok);
        assert!(req.userdb_reply.split().any(|f| f == "home=/home/alice"));
    }

    // ─── prefetch ────────────────────────────────────────────────────────

    #[test]
    fn prefetch_serves_passdb_fields_or_nothing() {
        let driver = create_userdb_driver("prefetch", "").unwrap();

        let mut req = request_for("alice");
        assert_eq!(driver.lookup(&mut req), UserdbResult::UserUnknown);

        let mut req = request_for("alice");
        req.set_field("userdb_uid", "1000", None);
        assert_eq!(driver.lookup(&mut req), UserdbResult::Ok);
        assert!(req.userdb_reply.split().any(|f| f == "uid=1000"));
    }

    #[test]
    fn prefetch_rejects_args() {
        assert!(create_userdb_driver("prefetch", "x").is_err());
    }
}
