//! Auth request state machine — owns one authentication attempt.
//!
//! A request walks the passdb chain in declaration order, consulting
//! the cache before each backend call and falling back to expired
//! cache entries when a backend fails internally. Master-user
//! substitution, username normalization, `allow_nets` checks and the
//! userdb phase all live here. The C-style callback resumption of the
//! original design is expressed as an async loop: worker offload and
//! driver calls are the suspension points.

use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use crate::cache::AuthCache;
use crate::expand::{VarTable, expand};
use crate::metrics::Metrics;
use crate::netpolicy::{self, NetMatch};
use crate::passdb::{AuthPassdb, PassdbResult};
use crate::reply::{self, Reply};
use crate::scheme::{self, Translated};
use crate::userdb::{AuthUserdb, UserdbResult};
use crate::username::UsernameRules;
use crate::worker_pool::WorkerPool;

/// Everything the pipeline shares: chains, cache, worker pool,
/// normalization rules. Built once at startup and passed to every
/// request.
pub struct AuthContext {
    pub rules: UsernameRules,
    pub master_user_separator: Option<char>,
    pub anonymous_username: String,
    pub ssl_username_from_cert: bool,
    pub passdbs: Vec<AuthPassdb>,
    pub masterdbs: Vec<AuthPassdb>,
    pub userdbs: Vec<AuthUserdb>,
    pub cache: Option<AuthCache>,
    pub workers: Option<WorkerPool>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequestState {
    New,
    MechContinue,
    Passdb,
    Userdb,
    Finished,
}

/// Cursor into one of the two passdb chains. `Unset` means a master
/// login was requested but no master chain is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassdbCursor {
    Main(usize),
    Master(usize),
    Unset,
}

enum ChainControl {
    /// re-enter the lookup loop at the (already advanced) cursor
    Next,
    Done(PassdbResult),
}

pub struct AuthRequest {
    pub state: AuthRequestState,
    pub mech_name: String,
    pub conn_id: u64,

    /// the user being authenticated; master logins swap this around,
    /// see `master_lookup_finish`
    pub user: String,
    /// username exactly as the client sent it; mechanisms that bind
    /// the name into their hash need it
    pub original_username: Option<String>,
    pub requested_login_user: Option<String>,
    pub master_user: Option<String>,

    pub mech_password: Option<Zeroizing<String>>,
    /// scheme-tagged credential provided by a passdb
    pub passdb_password: Option<Zeroizing<String>>,
    /// scheme the mechanism wants back from lookup_credentials
    pub credentials_scheme: String,

    passdb_cursor: PassdbCursor,
    userdb_index: usize,

    pub extra_fields: Reply,
    pub userdb_reply: Reply,

    pub service: String,
    pub local_ip: Option<IpAddr>,
    pub remote_ip: Option<IpAddr>,
    pub client_pid: u32,
    pub connect_uid: u32,

    pub successful: bool,
    /// password was fine but a secondary check (allow_nets) failed
    pub passdb_failure: bool,
    pub internal_failure: bool,
    /// some passdb in the chain failed internally; promoted to the
    /// final result if the chain ends in plain failure
    pub passdb_internal_failure: bool,
    pub no_password: bool,
    pub no_failure_delay: bool,
    pub skip_password_check: bool,
    pub no_login: bool,
    pub cert_username: bool,
    pub proxy: bool,
}

impl AuthRequest {
    pub fn new(mech_name: &str, conn_id: u64) -> Self {
        Self {
            state: AuthRequestState::New,
            mech_name: mech_name.to_string(),
            conn_id,
            user: String::new(),
            original_username: None,
            requested_login_user: None,
            master_user: None,
            mech_password: None,
            passdb_password: None,
            credentials_scheme: String::new(),
            passdb_cursor: PassdbCursor::Main(0),
            userdb_index: 0,
            extra_fields: Reply::new(),
            userdb_reply: Reply::new(),
            service: String::new(),
            local_ip: None,
            remote_ip: None,
            client_pid: 0,
            connect_uid: 0,
            successful: false,
            passdb_failure: false,
            internal_failure: false,
            passdb_internal_failure: false,
            no_password: false,
            no_failure_delay: false,
            skip_password_check: false,
            no_login: false,
            cert_username: false,
            proxy: false,
        }
    }

    // ─── Logging ─────────────────────────────────────────────────────────

    fn log_prefix(&self, subsystem: &str) -> String {
        let mut s = format!("{subsystem}(");
        if self.user.is_empty() {
            s.push('?');
        } else {
            s.push_str(&self.user);
        }
        if let Some(ip) = &self.remote_ip {
            s.push(',');
            s.push_str(&ip.to_string());
        }
        if self.requested_login_user.is_some() {
            s.push_str(",master");
        }
        s.push_str(")");
        s
    }

    pub(crate) fn log_debug(&self, subsystem: &str, msg: &str) {
        debug!(conn_id = self.conn_id, "{}: {}", self.log_prefix(subsystem), msg);
    }

    pub(crate) fn log_info(&self, subsystem: &str, msg: &str) {
        info!(conn_id = self.conn_id, "{}: {}", self.log_prefix(subsystem), msg);
    }

    pub(crate) fn log_error(&self, subsystem: &str, msg: &str) {
        error!(conn_id = self.conn_id, "{}: {}", self.log_prefix(subsystem), msg);
    }

    // ─── Import / export ─────────────────────────────────────────────────

    /// Take one `key=value` from the front-end. Returns false for keys
    /// outside the request surface.
    pub fn import(&mut self, ctx: &AuthContext, key: &str, value: &str) -> bool {
        match key {
            "user" => self.user = value.to_string(),
            "master_user" => self.master_user = Some(value.to_string()),
            "cert_username" => {
                if ctx.ssl_username_from_cert {
                    // username from the TLS peer certificate overrides
                    // whatever the mechanism will claim
                    self.user = value.to_string();
                    self.cert_username = true;
                }
            }
            "service" => self.service = value.to_string(),
            "lip" => self.local_ip = value.parse().ok(),
            "rip" => self.remote_ip = value.parse().ok(),
            _ => return false,
        }
        true
    }

    /// Serialize the request's identity for worker commands.
    pub fn export(&self, out: &mut Reply) {
        out.add("user", &self.user);
        out.add("service", &self.service);
        if let Some(mu) = &self.master_user {
            out.add("master_user", mu);
        }
        if let Some(ip) = &self.local_ip {
            out.add("lip", &ip.to_string());
        }
        if let Some(ip) = &self.remote_ip {
            out.add("rip", &ip.to_string());
        }
    }

    fn export_string(&self) -> String {
        let mut r = Reply::new();
        self.export(&mut r);
        r.export().to_string()
    }

    // ─── Variables ───────────────────────────────────────────────────────

    pub fn var_table(&self) -> VarTable {
        let home = self
            .userdb_reply
            .fields()
            .find(|(k, _)| *k == "home")
            .and_then(|(_, v)| v);
        VarTable {
            user: self.user.clone(),
            service: self.service.clone(),
            home,
            local_ip: self.local_ip.map(|ip| ip.to_string()),
            remote_ip: self.remote_ip.map(|ip| ip.to_string()),
            client_pid: (self.client_pid != 0).then_some(self.client_pid),
            password: self.mech_password.as_deref().map(|p| p.to_string()),
            connect_uid: (self.connect_uid != 0).then_some(self.connect_uid),
        }
    }

    pub fn expand_template(&self, template: &str) -> String {
        expand(template, &self.var_table(), Some(&reply::escape_value))
    }

    // ─── Username handling ───────────────────────────────────────────────

    fn fix_username(&mut self, ctx: &AuthContext, name: &str) -> Result<String, &'static str> {
        let fixed = ctx.rules.fix(name)?;
        let Some(format) = &ctx.rules.format else {
            return Ok(fixed);
        };
        // the template's %u must see the in-progress name
        let saved = std::mem::replace(&mut self.user, fixed);
        let expanded = self.expand_template(format);
        self.user = saved;
        Ok(expanded)
    }

    /// Install the username from the mechanism, splitting off a master
    /// login target when the separator is configured.
    pub fn set_username(&mut self, ctx: &AuthContext, username: &str) -> Result<(), &'static str> {
        if self.original_username.is_none() {
            self.original_username = Some(username.to_string());
        }
        if self.cert_username {
            // certificate name wins over the mechanism
            return Ok(());
        }

        let mut active = username;
        let mut login_user = None;
        if let Some(sep) = ctx.master_user_separator
            && let Some(pos) = username.find(sep)
        {
            // master*login: the prefix authenticates, the suffix is
            // who the master wants to become
            login_user = Some(&username[pos + sep.len_utf8()..]);
            active = &username[..pos];
        }

        if active.is_empty() {
            return Err("Empty username");
        }
        self.user = self.fix_username(ctx, active)?;

        if let Some(login) = login_user {
            self.set_login_username(ctx, login)?;
        }
        Ok(())
    }

    pub fn set_login_username(
        &mut self,
        ctx: &AuthContext,
        username: &str,
    ) -> Result<(), &'static str> {
        if username.is_empty() {
            return Err("Empty username");
        }
        if username == self.user {
            // not really a master login
            return Ok(());
        }
        self.passdb_cursor = if ctx.masterdbs.is_empty() {
            PassdbCursor::Unset
        } else {
            PassdbCursor::Master(0)
        };
        self.requested_login_user = Some(self.fix_username(ctx, username)?);
        Ok(())
    }

    // ─── Fields from drivers / cache replay ──────────────────────────────

    /// Driver-side injection point. Recognized names mutate request
    /// state; everything else lands in the extra-fields reply.
    pub fn set_field(&mut self, name: &str, value: &str, default_scheme: Option<&str>) {
        assert!(!name.is_empty());

        match name {
            "password" => {
                if self.passdb_password.is_some() {
                    self.log_error("passdb", "Multiple password values not supported");
                    return;
                }
                let tagged = if value.starts_with('{') {
                    value.to_string()
                } else {
                    let scheme = default_scheme
                        .expect("untagged password needs a default scheme");
                    format!("{{{scheme}}}{value}")
                };
                self.passdb_password = Some(Zeroizing::new(tagged));
            }
            "user" => {
                // backend normalized the username
                if self.user != value {
                    self.log_debug("auth", &format!("username changed {} -> {}", self.user, value));
                    self.user = value.to_string();
                }
            }
            "nodelay" => self.no_failure_delay = true,
            "nopassword" => {
                assert!(
                    self.passdb_password.is_none(),
                    "nopassword with a password present"
                );
                self.no_password = true;
            }
            "allow_nets" => self.validate_networks(value),
            "nologin" => {
                self.no_login = true;
                self.extra_fields.add_flag(name);
            }
            "proxy" => {
                // front-end forwards the login; plaintext mechs echo
                // the password back in the reply
                self.proxy = true;
                self.extra_fields.add_flag(name);
            }
            _ if name.starts_with("userdb_") => {
                self.set_userdb_field(&name["userdb_".len()..], value);
            }
            _ => self.extra_fields.add(name, value),
        }
    }

    fn validate_networks(&mut self, networks: &str) {
        let Some(remote_ip) = self.remote_ip else {
            self.log_info("passdb", "allow_nets check failed: Remote IP not known");
            self.passdb_failure = true;
            return;
        };

        let mut found = false;
        for net in netpolicy::split_networks(networks) {
            match netpolicy::is_ip_in_network(net, &remote_ip) {
                NetMatch::Match => found = true,
                NetMatch::Invalid => {
                    self.log_info("passdb", &format!("allow_nets: Invalid network '{net}'"));
                }
                NetMatch::NoMatch => {}
            }
        }
        if !found {
            self.log_info("passdb", "allow_nets check failed: IP not in allowed networks");
        }
        self.passdb_failure = !found;
    }

    pub fn init_userdb_reply(&mut self) {
        self.userdb_reply.reset();
        self.userdb_reply.import(&reply::escape_value(&self.user));
    }

    pub fn set_userdb_field(&mut self, name: &str, value: &str) {
        if self.userdb_reply.is_empty() {
            self.init_userdb_reply();
        }
        self.userdb_reply.add(name, value);
    }

    // ─── Password verification ───────────────────────────────────────────

    /// Returns 1 verified, 0 mismatch, -1 broken scheme/credential.
    pub fn password_verify(&mut self, plain: &str, crypted: &str, scheme_name: &str) -> i32 {
        if self.skip_password_check {
            // only master logins get here
            assert!(self.master_user.is_some());
            return 1;
        }
        let user = self.original_username.clone().unwrap_or_default();
        match scheme::verify(plain, crypted, scheme_name, &user) {
            Ok(true) => 1,
            Ok(false) => {
                self.log_info("password", "Password mismatch");
                0
            }
            Err(scheme::SchemeError::UnknownScheme(_)) => {
                self.log_error("password", &format!("Unknown password scheme {scheme_name}"));
                -1
            }
            Err(e) => {
                self.log_error("password", &format!("{e}"));
                -1
            }
        }
    }

    // ─── Chain plumbing ──────────────────────────────────────────────────

    fn current_passdb<'a>(&self, ctx: &'a AuthContext) -> Option<&'a AuthPassdb> {
        match self.passdb_cursor {
            PassdbCursor::Main(i) => ctx.passdbs.get(i),
            PassdbCursor::Master(i) => ctx.masterdbs.get(i),
            PassdbCursor::Unset => None,
        }
    }

    fn has_next_passdb(&self, ctx: &AuthContext) -> bool {
        match self.passdb_cursor {
            PassdbCursor::Main(i) => i + 1 < ctx.passdbs.len(),
            PassdbCursor::Master(i) => i + 1 < ctx.masterdbs.len(),
            PassdbCursor::Unset => false,
        }
    }

    fn advance_passdb(&mut self) {
        match &mut self.passdb_cursor {
            PassdbCursor::Main(i) | PassdbCursor::Master(i) => *i += 1,
            PassdbCursor::Unset => unreachable!("advance with no passdb"),
        }
    }

    /// Master login verified: swap identities and decide whether the
    /// main chain still runs for the impersonated user.
    fn master_lookup_finish(&mut self, ctx: &AuthContext, entry_pass: bool) -> bool {
        let target = self
            .requested_login_user
            .take()
            .expect("master finish without login user");
        self.log_info(
            "passdb",
            &format!("Master user logging in as {target}"),
        );
        Metrics::inc(&ctx.metrics.auth_master_logins);

        self.master_user = Some(std::mem::replace(&mut self.user, target));
        self.skip_password_check = true;
        self.passdb_password = None;

        if !entry_pass {
            // authenticated, no further passdb lookup needed
            return true;
        }
        // let the main chain attach extra fields for the target user
        self.passdb_cursor = PassdbCursor::Main(0);
        false
    }

    /// The uniform chain policy, applied after every passdb result.
    fn handle_passdb_callback(
        &mut self,
        ctx: &AuthContext,
        deny: bool,
        pass: bool,
        mut result: PassdbResult,
    ) -> ChainControl {
        // the stored credential was only needed for verification
        self.passdb_password = None;

        if deny && result != PassdbResult::UserUnknown {
            // deny passdb: only "user not listed" gets through;
            // internal errors are fatal here
            if result != PassdbResult::InternalFailure {
                self.log_info("passdb", "User found from deny passdb");
                result = PassdbResult::UserDisabled;
            }
        } else if result == PassdbResult::Ok {
            if self.requested_login_user.is_some() {
                return if self.master_lookup_finish(ctx, pass) {
                    ChainControl::Done(PassdbResult::Ok)
                } else {
                    ChainControl::Next
                };
            }
            if pass {
                // not the decisive passdb; keep walking
                self.advance_passdb();
                self.extra_fields.reset();
                return ChainControl::Next;
            }
        } else if self.has_next_passdb(ctx) && result != PassdbResult::UserDisabled {
            self.advance_passdb();
            if result == PassdbResult::InternalFailure {
                self.passdb_internal_failure = true;
            }
            self.extra_fields.reset();
            return ChainControl::Next;
        } else if self.passdb_internal_failure {
            // an earlier passdb may have known the right password;
            // don't present an outage as an auth denial
            result = PassdbResult::InternalFailure;
        }

        ChainControl::Done(result)
    }

    // ─── Cache consultation ──────────────────────────────────────────────

    fn cache_key(&self, entry: &AuthPassdb) -> Option<String> {
        let template = entry.cache_key.as_deref()?;
        if template.is_empty() {
            return None;
        }
        Some(self.expand_template(template))
    }

    fn log_cache_hit(&self, value: &str) {
        let shown = match value.split_once('\t') {
            Some((pw, rest)) if !pw.is_empty() => format!("<hidden>\t{rest}"),
            _ => value.to_string(),
        };
        self.log_debug("cache", &format!("hit: {shown}"));
    }

    /// Try to resolve a verify_plain from the cache. `None` means the
    /// backend must be consulted.
    fn cache_verify_plain(
        &mut self,
        ctx: &AuthContext,
        entry: &AuthPassdb,
        password: &str,
        use_expired: bool,
    ) -> Option<PassdbResult> {
        let cache = ctx.cache.as_ref()?;
        let key = self.cache_key(entry)?;
        let Some(hit) = cache.lookup(&key) else {
            self.log_debug("cache", "miss");
            Metrics::inc(&ctx.metrics.cache_misses);
            return None;
        };
        if hit.expired && !use_expired {
            self.log_debug("cache", "expired");
            Metrics::inc(&ctx.metrics.cache_misses);
            return None;
        }
        self.log_cache_hit(&hit.value);

        if hit.value.is_empty() {
            Metrics::inc(&ctx.metrics.cache_hits);
            self.log_info("cache", "User unknown");
            return Some(PassdbResult::UserUnknown);
        }

        let mut parts = hit.value.split('\t');
        let cached_pw = parts.next().unwrap_or("");
        let ret = if cached_pw.is_empty() {
            self.log_info("cache", "NULL password access");
            1
        } else {
            let (scheme_name, data) = scheme::extract_scheme(cached_pw)
                .expect("cached password lost its scheme tag");
            let ret = self.password_verify(password, data, scheme_name);
            if ret == 0 && hit.last_success {
                // last verify succeeded with this entry; the password
                // probably changed, so treat the entry as stale
                cache.set_last_success(&key, false);
                return None;
            }
            ret
        };
        cache.set_last_success(&key, ret > 0);
        Metrics::inc(&ctx.metrics.cache_hits);

        let fields: Vec<(String, Option<String>)> = parts
            .filter(|r| !r.is_empty())
            .map(|r| {
                let (k, v) = reply::parse_field(r);
                (k.to_string(), v.map(reply::unescape_value))
            })
            .collect();
        for (k, v) in fields {
            self.set_field(&k, v.as_deref().unwrap_or(""), None);
        }

        Some(if ret > 0 {
            PassdbResult::Ok
        } else {
            PassdbResult::PasswordMismatch
        })
    }

    /// Cache form of lookup_credentials: `(result, tagged password)`.
    fn cache_lookup_credentials(
        &mut self,
        ctx: &AuthContext,
        entry: &AuthPassdb,
        use_expired: bool,
    ) -> Option<(PassdbResult, Option<String>)> {
        let cache = ctx.cache.as_ref()?;
        let key = self.cache_key(entry)?;
        let Some(hit) = cache.lookup(&key) else {
            self.log_debug("cache", "miss");
            Metrics::inc(&ctx.metrics.cache_misses);
            return None;
        };
        if hit.expired && !use_expired {
            self.log_debug("cache", "expired");
            Metrics::inc(&ctx.metrics.cache_misses);
            return None;
        }
        self.log_cache_hit(&hit.value);
        Metrics::inc(&ctx.metrics.cache_hits);

        if hit.value.is_empty() {
            return Some((PassdbResult::UserUnknown, None));
        }

        let mut parts = hit.value.split('\t');
        let cached_pw = parts.next().unwrap_or("").to_string();
        let fields: Vec<(String, Option<String>)> = parts
            .filter(|r| !r.is_empty())
            .map(|r| {
                let (k, v) = reply::parse_field(r);
                (k.to_string(), v.map(reply::unescape_value))
            })
            .collect();
        for (k, v) in fields {
            self.set_field(&k, v.as_deref().unwrap_or(""), None);
        }

        let password = (!cached_pw.is_empty()).then_some(cached_pw);
        Some((PassdbResult::Ok, password))
    }

    /// Store a finished lookup. Negative results cache empty entries,
    /// USER_DISABLED is never cached (a later hit would read as
    /// success).
    fn save_cache(&mut self, ctx: &AuthContext, entry: &AuthPassdb, result: PassdbResult) {
        match result {
            PassdbResult::UserDisabled => return,
            PassdbResult::InternalFailure => unreachable!("internal failures are never cached"),
            _ => {}
        }
        let Some(cache) = &ctx.cache else { return };
        let Some(key) = self.cache_key(entry) else { return };

        assert!(
            !self
                .extra_fields
                .split()
                .any(|r| r == "pass" || r.starts_with("pass=")),
            "pass field must not enter the cache"
        );

        match result {
            PassdbResult::UserUnknown => {
                cache.insert(&key, "");
                return;
            }
            PassdbResult::SchemeNotAvailable => return,
            _ => {}
        }

        if !self.no_password && self.passdb_password.is_none() {
            // the passdb verified without revealing the credential; a
            // successful plaintext attempt is itself cacheable
            if result != PassdbResult::Ok {
                return;
            }
            let Some(mech_pw) = self.mech_password.as_deref().map(|p| p.to_string()) else {
                return;
            };
            self.passdb_password = Some(Zeroizing::new(mech_pw));
        }

        let mut value = String::new();
        if let Some(pw) = &self.passdb_password {
            let tagged = if pw.starts_with('{') {
                pw.to_string()
            } else {
                format!("{{{}}}{}", entry.default_pass_scheme, &**pw)
            };
            if tagged.contains('\t') || tagged.contains('\n') {
                panic!("{}: password contains TAB or LF", self.user);
            }
            value.push_str(&tagged);
        }
        if !self.extra_fields.is_empty() {
            value.push('\t');
            value.push_str(self.extra_fields.export());
        }
        if self.no_failure_delay {
            value.push_str("\tnodelay");
        }
        cache.insert(&key, &value);
    }

    // ─── verify_plain ────────────────────────────────────────────────────

    /// Drive a plaintext verification through the passdb chain.
    pub async fn verify_plain(&mut self, ctx: &AuthContext, password: &str) -> PassdbResult {
        assert_eq!(self.state, AuthRequestState::MechContinue);
        if self.mech_password.is_none() {
            self.mech_password = Some(Zeroizing::new(password.to_string()));
        }

        loop {
            let Some(entry) = self.current_passdb(ctx) else {
                assert!(self.requested_login_user.is_some());
                self.log_info("passdb", "Attempted master login with no master passdbs");
                return PassdbResult::UserUnknown;
            };
            let (deny, pass) = (entry.deny, entry.pass);

            // a cache hit short-circuits the chain
            if let Some(result) = self.cache_verify_plain(ctx, entry, password, false) {
                return result;
            }

            self.state = AuthRequestState::Passdb;
            let result = if entry.blocking {
                self.worker_verify_plain(ctx, entry, password).await
            } else {
                entry.driver.clone().verify_plain(self, password)
            };
            self.state = AuthRequestState::MechContinue;

            let entry = self.current_passdb(ctx).unwrap();
            let result = if result != PassdbResult::InternalFailure {
                self.save_cache(ctx, entry, result);
                result
            } else if let Some(fallback) = self.cache_verify_plain(ctx, entry, password, true) {
                self.log_info("passdb", "Fallbacking to expired data from cache");
                Metrics::inc(&ctx.metrics.cache_expired_fallbacks);
                fallback
            } else {
                result
            };

            match self.handle_passdb_callback(ctx, deny, pass, result) {
                ChainControl::Next => continue,
                ChainControl::Done(final_result) => return final_result,
            }
        }
    }

    async fn worker_verify_plain(
        &mut self,
        ctx: &AuthContext,
        entry: &AuthPassdb,
        password: &str,
    ) -> PassdbResult {
        let Some(workers) = &ctx.workers else {
            self.log_error("passdb", "blocking passdb but no worker pool configured");
            return PassdbResult::InternalFailure;
        };
        let data = format!(
            "PASSV\t{}\t{}\t{}",
            entry.id,
            password,
            self.export_string()
        );
        let payload = workers.call(data).await;
        self.parse_worker_passdb_reply(ctx, &payload, false).0
    }

    /// Parse `OK\t<user>\t<password>[\t<field>...]` / `FAIL\t<code>`.
    /// With `credentials`, the password field carries the translated
    /// credential instead of the stored password.
    fn parse_worker_passdb_reply(
        &mut self,
        ctx: &AuthContext,
        payload: &str,
        credentials: bool,
    ) -> (PassdbResult, Option<Vec<u8>>) {
        let mut parts = payload.split('\t');
        match parts.next() {
            Some("OK") => {
                let user = parts.next().unwrap_or("");
                if !user.is_empty() && user != self.user {
                    self.set_field("user", user, None);
                }
                let password = parts.next().unwrap_or("");
                let mut creds = None;
                if credentials {
                    match scheme::extract_scheme(password) {
                        Some((scheme_name, data)) => match scheme::decode(data, scheme_name) {
                            Ok(raw) => {
                                self.credentials_scheme =
                                    scheme_name.split('.').next().unwrap_or("").to_string();
                                creds = Some(raw);
                            }
                            Err(e) => {
                                self.log_error("worker", &format!("Invalid credentials: {e}"));
                                return (PassdbResult::InternalFailure, None);
                            }
                        },
                        None => {
                            self.log_error("worker", "BUG: credentials reply without scheme");
                            return (PassdbResult::InternalFailure, None);
                        }
                    }
                } else if !password.is_empty() {
                    self.passdb_password = Some(Zeroizing::new(password.to_string()));
                }
                let fields: Vec<(String, Option<String>)> = parts
                    .filter(|r| !r.is_empty())
                    .map(|r| {
                        let (k, v) = reply::parse_field(r);
                        (k.to_string(), v.map(reply::unescape_value))
                    })
                    .collect();
                for (k, v) in fields {
                    self.set_field(&k, v.as_deref().unwrap_or(""), None);
                }
                (PassdbResult::Ok, creds)
            }
            Some("FAIL") => {
                let code: i32 = parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1);
                let result = PassdbResult::from_wire_code(code)
                    .unwrap_or(PassdbResult::InternalFailure);
                (result, None)
            }
            _ => {
                self.log_error("worker", "BUG: invalid reply from worker");
                (PassdbResult::InternalFailure, None)
            }
        }
    }

    // ─── lookup_credentials ──────────────────────────────────────────────

    /// Fetch the stored credential in `wanted_scheme` ("" accepts any;
    /// the scheme actually found lands in `credentials_scheme`).
    pub async fn lookup_credentials(
        &mut self,
        ctx: &AuthContext,
        wanted_scheme: &str,
    ) -> (PassdbResult, Option<Vec<u8>>) {
        assert_eq!(self.state, AuthRequestState::MechContinue);
        self.credentials_scheme = wanted_scheme.to_string();

        loop {
            let Some(entry) = self.current_passdb(ctx) else {
                assert!(self.requested_login_user.is_some());
                self.log_info("passdb", "Attempted master login with no master passdbs");
                return (PassdbResult::UserUnknown, None);
            };
            let (deny, pass) = (entry.deny, entry.pass);

            if let Some((result, password)) = self.cache_lookup_credentials(ctx, entry, false) {
                // terminal, as in the verify path
                return self.translate_tagged(result, password.as_deref());
            }

            self.state = AuthRequestState::Passdb;
            let (result, credentials) = if entry.blocking {
                self.worker_lookup_credentials(ctx, entry).await
            } else {
                match entry.driver.clone().lookup_credentials(self) {
                    None => {
                        // this passdb doesn't support credential lookups
                        (PassdbResult::SchemeNotAvailable, None)
                    }
                    Some(res) => {
                        let tagged = self.passdb_password.as_deref().map(|p| p.to_string());
                        self.translate_tagged(res, tagged.as_deref())
                    }
                }
            };
            self.state = AuthRequestState::MechContinue;

            let entry = self.current_passdb(ctx).unwrap();
            let (result, credentials) = if result != PassdbResult::InternalFailure {
                self.save_cache(ctx, entry, result);
                (result, credentials)
            } else if let Some((fb_result, fb_password)) =
                self.cache_lookup_credentials(ctx, entry, true)
            {
                self.log_info("passdb", "Fallbacking to expired data from cache");
                Metrics::inc(&ctx.metrics.cache_expired_fallbacks);
                self.translate_tagged(fb_result, fb_password.as_deref())
            } else {
                (result, credentials)
            };

            match self.handle_passdb_callback(ctx, deny, pass, result) {
                ChainControl::Next => continue,
                ChainControl::Done(PassdbResult::Ok) => return (PassdbResult::Ok, credentials),
                ChainControl::Done(other) => return (other, None),
            }
        }
    }

    /// Convert a scheme-tagged stored credential into what the
    /// mechanism asked for.
    pub(crate) fn translate_tagged(
        &mut self,
        result: PassdbResult,
        tagged: Option<&str>,
    ) -> (PassdbResult, Option<Vec<u8>>) {
        if result != PassdbResult::Ok {
            return (result, None);
        }
        let Some(tagged) = tagged else {
            self.log_info(
                "password",
                &format!(
                    "Requested {} scheme, but we have a NULL password",
                    self.credentials_scheme
                ),
            );
            return (PassdbResult::SchemeNotAvailable, None);
        };
        let (input_scheme, data) = scheme::extract_scheme(tagged)
            .expect("stored credential lost its scheme tag");
        let user = self.original_username.clone().unwrap_or_default();
        match scheme::translate(data, input_scheme, &self.credentials_scheme, &user) {
            Ok(Translated::Ok(raw, actual_scheme)) => {
                self.credentials_scheme = actual_scheme;
                (PassdbResult::Ok, Some(raw))
            }
            Ok(Translated::SchemeNotAvailable) => {
                self.log_info(
                    "password",
                    &format!(
                        "Requested {} scheme, but we have only {}",
                        self.credentials_scheme, input_scheme
                    ),
                );
                (PassdbResult::SchemeNotAvailable, None)
            }
            Err(e) => {
                self.log_error("password", &format!("{e}"));
                (PassdbResult::SchemeNotAvailable, None)
            }
        }
    }

    async fn worker_lookup_credentials(
        &mut self,
        ctx: &AuthContext,
        entry: &AuthPassdb,
    ) -> (PassdbResult, Option<Vec<u8>>) {
        let Some(workers) = &ctx.workers else {
            self.log_error("passdb", "blocking passdb but no worker pool configured");
            return (PassdbResult::InternalFailure, None);
        };
        let data = format!(
            "PASSL\t{}\t{}\t{}",
            entry.id,
            self.credentials_scheme,
            self.export_string()
        );
        let payload = workers.call(data).await;
        self.parse_worker_passdb_reply(ctx, &payload, true)
    }

    // ─── set_credentials ─────────────────────────────────────────────────

    /// Update the stored credential in the current passdb.
    pub async fn set_credentials(
        &mut self,
        ctx: &AuthContext,
        scheme_name: &str,
        plaintext: &str,
    ) -> bool {
        let Some(entry) = self.current_passdb(ctx) else {
            return false;
        };
        let new_credentials = match scheme::generate_tagged(
            plaintext,
            self.original_username.as_deref().unwrap_or(&self.user),
            scheme_name,
        ) {
            Ok(c) => c,
            Err(e) => {
                self.log_error("password", &format!("{e}"));
                return false;
            }
        };

        if entry.blocking {
            let Some(workers) = &ctx.workers else {
                self.log_error("passdb", "blocking passdb but no worker pool configured");
                return false;
            };
            let data = format!(
                "SETCRED\t{}\t{}\t{}",
                entry.id,
                new_credentials,
                self.export_string()
            );
            let payload = workers.call(data).await;
            return payload == "OK" || payload.starts_with("OK\t");
        }

        match entry.driver.clone().set_credentials(self, &new_credentials) {
            Some(ok) => ok,
            None => {
                self.log_error("passdb", "set_credentials not supported");
                false
            }
        }
    }

    // ─── Userdb phase ────────────────────────────────────────────────────

    /// Enrich the request from the userdb chain after a successful
    /// passdb phase.
    pub async fn lookup_user(&mut self, ctx: &AuthContext) -> UserdbResult {
        self.state = AuthRequestState::Userdb;
        let result = loop {
            let Some(entry) = ctx.userdbs.get(self.userdb_index) else {
                break UserdbResult::UserUnknown;
            };
            let result = if entry.blocking {
                self.worker_lookup_user(ctx, entry).await
            } else {
                entry.driver.clone().lookup(self)
            };
            match result {
                UserdbResult::UserUnknown if self.userdb_index + 1 < ctx.userdbs.len() => {
                    self.userdb_index += 1;
                    continue;
                }
                other => break other,
            }
        };
        self.state = AuthRequestState::MechContinue;
        if result == UserdbResult::UserUnknown && self.client_pid != 0 {
            // an actual login attempt for a user no userdb knows
            self.log_error("userdb", "user not found from userdb");
        }
        result
    }

    async fn worker_lookup_user(&mut self, ctx: &AuthContext, entry: &AuthUserdb) -> UserdbResult {
        let Some(workers) = &ctx.workers else {
            self.log_error("userdb", "blocking userdb but no worker pool configured");
            return UserdbResult::InternalFailure;
        };
        let data = format!("USER\t{}\t{}", entry.id, self.export_string());
        let payload = workers.call(data).await;
        if payload == "OK" || payload.starts_with("OK\t") {
            self.userdb_reply.reset();
            self.userdb_reply
                .import(payload.strip_prefix("OK").unwrap().trim_start_matches('\t'));
            UserdbResult::Ok
        } else if payload == "NOTFOUND" || payload.starts_with("NOTFOUND\t") {
            UserdbResult::UserUnknown
        } else {
            UserdbResult::InternalFailure
        }
    }
}
