//! Mechanisms — what the pipeline sees of SASL.
//!
//! The byte-level protocols stay with the front-ends; the pipeline
//! needs only the contract: feed input, get back a challenge or a
//! terminal verdict. PLAIN and ANONYMOUS ship in-tree.

use crate::passdb::PassdbResult;
use crate::request::{AuthContext, AuthRequest, AuthRequestState};

/// Outcome of one mechanism step.
#[derive(Debug, PartialEq, Eq)]
pub enum MechReply {
    /// send this challenge and wait for more client input
    Continue(Vec<u8>),
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mech {
    Plain,
    Anonymous,
}

impl Mech {
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "ANONYMOUS" => Some(Self::Anonymous),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Anonymous => "ANONYMOUS",
        }
    }

    /// First mechanism step. Must be called exactly once, in phase NEW.
    pub async fn auth_initial(
        self,
        ctx: &AuthContext,
        request: &mut AuthRequest,
        data: &[u8],
    ) -> MechReply {
        assert_eq!(request.state, AuthRequestState::New);
        request.state = AuthRequestState::MechContinue;
        if data.is_empty() {
            // no initial response; ask the client to start
            return MechReply::Continue(Vec::new());
        }
        self.step(ctx, request, data).await
    }

    /// Subsequent mechanism steps.
    pub async fn auth_continue(
        self,
        ctx: &AuthContext,
        request: &mut AuthRequest,
        data: &[u8],
    ) -> MechReply {
        assert_eq!(request.state, AuthRequestState::MechContinue);
        self.step(ctx, request, data).await
    }

    async fn step(self, ctx: &AuthContext, request: &mut AuthRequest, data: &[u8]) -> MechReply {
        match self {
            Self::Plain => plain_step(ctx, request, data).await,
            Self::Anonymous => anonymous_step(ctx, request, data),
        }
    }
}

/// `authzid NUL authcid NUL password`; authzid, when set, is the user
/// the authenticating identity wants to become.
async fn plain_step(ctx: &AuthContext, request: &mut AuthRequest, data: &[u8]) -> MechReply {
    let parts: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        request.log_info("plain", "invalid input");
        return MechReply::Failure;
    }
    let (Ok(authzid), Ok(authcid), Ok(password)) = (
        std::str::from_utf8(parts[0]),
        std::str::from_utf8(parts[1]),
        std::str::from_utf8(parts[2]),
    ) else {
        request.log_info("plain", "invalid input");
        return MechReply::Failure;
    };

    if let Err(error) = request.set_username(ctx, authcid) {
        request.log_info("plain", error);
        return MechReply::Failure;
    }
    if !authzid.is_empty()
        && let Err(error) = request.set_login_username(ctx, authzid)
    {
        request.log_info("plain", error);
        return MechReply::Failure;
    }

    match request.verify_plain(ctx, password).await {
        PassdbResult::Ok => MechReply::Success,
        PassdbResult::InternalFailure => {
            request.internal_failure = true;
            MechReply::Failure
        }
        PassdbResult::UserDisabled => {
            // administratively blocked users skip the failure delay
            request.no_failure_delay = true;
            MechReply::Failure
        }
        _ => MechReply::Failure,
    }
}

/// The client-supplied token is only trace data; the configured
/// anonymous user is what actually logs in. No passdb involved.
fn anonymous_step(ctx: &AuthContext, request: &mut AuthRequest, data: &[u8]) -> MechReply {
    if ctx.anonymous_username.is_empty() {
        request.log_error("anonymous", "anonymous_username not configured");
        request.internal_failure = true;
        return MechReply::Failure;
    }

    let trace: String = String::from_utf8_lossy(data)
        .chars()
        .filter(|c| !c.is_control())
        .take(64)
        .collect();
    request.log_info("anonymous", &format!("login: {trace}"));

    request.user = ctx.anonymous_username.clone();
    MechReply::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::passdb::{AuthPassdb, PassdbDriver};
    use crate::username::UsernameRules;
    use std::sync::Arc;

    struct FixedPassdb {
        user: &'static str,
        password: &'static str,
    }

    impl PassdbDriver for FixedPassdb {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn verify_plain(&self, request: &mut AuthRequest, password: &str) -> PassdbResult {
            if request.user != self.user {
                PassdbResult::UserUnknown
            } else if password == self.password || request.skip_password_check {
                PassdbResult::Ok
            } else {
                PassdbResult::PasswordMismatch
            }
        }
    }

    fn ctx(user: &'static str, password: &'static str) -> AuthContext {
        AuthContext {
            rules: UsernameRules::default(),
            master_user_separator: None,
            anonymous_username: "anonymous".into(),
            ssl_username_from_cert: false,
            passdbs: vec![AuthPassdb {
                id: 0,
                driver: Arc::new(FixedPassdb { user, password }),
                pass: false,
                deny: false,
                master: false,
                blocking: false,
                cache_key: None,
                default_pass_scheme: "PLAIN".into(),
            }],
            masterdbs: vec![],
            userdbs: vec![],
            cache: None,
            workers: None,
            metrics: Arc::new(Metrics::new()),
        }
    }

    #[tokio::test]
    async fn mech_names() {
        assert_eq!(Mech::by_name("plain"), Some(Mech::Plain));
        assert_eq!(Mech::by_name("ANONYMOUS"), Some(Mech::Anonymous));
        assert_eq!(Mech::by_name("SCRAM-SHA-1"), None);
    }

    #[tokio::test]
    async fn plain_initial_without_response_continues() {
        let ctx = ctx("alice", "secret");
        let mut req = AuthRequest::new("PLAIN", 1);
        let reply = Mech::Plain.auth_initial(&ctx, &mut req, b"").await;
        assert_eq!(reply, MechReply::Continue(Vec::new()));
        assert_eq!(req.state, AuthRequestState::MechContinue);
    }

    #[tokio::test]
    async fn plain_success() {
        let ctx = ctx("alice", "secret");
        let mut req = AuthRequest::new("PLAIN", 1);
        let reply = Mech::Plain
            .auth_initial(&ctx, &mut req, b"\0alice\0secret")
            .await;
        assert_eq!(reply, MechReply::Success);
        assert_eq!(req.user, "alice");
    }

    #[tokio::test]
    async fn plain_wrong_password_fails() {
        let ctx = ctx("alice", "secret");
        let mut req = AuthRequest::new("PLAIN", 1);
        let reply = Mech::Plain
            .auth_initial(&ctx, &mut req, b"\0alice\0nope")
            .await;
        assert_eq!(reply, MechReply::Failure);
        assert!(!req.internal_failure);
    }

    #[tokio::test]
    async fn plain_malformed_input_fails() {
        let ctx = ctx("alice", "secret");
        for bad in [&b"no-nuls-at-all"[..], b"\0onlyone", b"a\0b\0c\0d"] {
            let mut req = AuthRequest::new("PLAIN", 1);
            let reply = Mech::Plain.auth_initial(&ctx, &mut req, bad).await;
            assert_eq!(reply, MechReply::Failure);
        }
    }

    #[tokio::test]
    async fn plain_authzid_requests_master_login() {
        let ctx = ctx("alice", "secret");
        // no master chain configured: master logins are user-unknown
        let mut req = AuthRequest::new("PLAIN", 1);
        let reply = Mech::Plain
            .auth_initial(&ctx, &mut req, b"bob\0alice\0secret")
            .await;
        assert_eq!(reply, MechReply::Failure);
        assert_eq!(req.requested_login_user.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn anonymous_forces_configured_user() {
        let ctx = ctx("alice", "secret");
        let mut req = AuthRequest::new("ANONYMOUS", 1);
        let reply = Mech::Anonymous
            .auth_initial(&ctx, &mut req, b"trace-token")
            .await;
        assert_eq!(reply, MechReply::Success);
        assert_eq!(req.user, "anonymous");
    }

    #[tokio::test]
    async fn anonymous_without_configured_user_fails() {
        let mut c = ctx("alice", "secret");
        c.anonymous_username = String::new();
        let mut req = AuthRequest::new("ANONYMOUS", 1);
        let reply = Mech::Anonymous.auth_initial(&c, &mut req, b"x").await;
        assert_eq!(reply, MechReply::Failure);
        assert!(req.internal_failure);
    }
}
