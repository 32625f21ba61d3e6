//! Passdb contract — result codes, driver trait, chain entries.
//!
//! Drivers are synchronous lookups against their backing store; the
//! request pipeline decides whether they run in-line or get shipped to
//! a worker process (the `blocking` flag on the chain entry).

use std::sync::Arc;

use crate::request::AuthRequest;

/// Outcome of one passdb operation.
///
/// The integer codes are wire-stable: master and worker may be
/// different binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassdbResult {
    Ok,
    InternalFailure,
    SchemeNotAvailable,
    UserUnknown,
    UserDisabled,
    PasswordMismatch,
}

impl PassdbResult {
    /// Wire code for FAIL replies. `Ok` is never sent as a code.
    pub fn wire_code(self) -> i32 {
        match self {
            Self::Ok => panic!("OK has no failure wire code"),
            Self::InternalFailure => -1,
            Self::SchemeNotAvailable => 0,
            Self::UserUnknown => 1,
            Self::UserDisabled => 2,
            Self::PasswordMismatch => 3,
        }
    }

    pub fn from_wire_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::InternalFailure),
            0 => Some(Self::SchemeNotAvailable),
            1 => Some(Self::UserUnknown),
            2 => Some(Self::UserDisabled),
            3 => Some(Self::PasswordMismatch),
            _ => None,
        }
    }

    /// Failed lookup (no usable credential), as opposed to a completed
    /// verification (`Ok` / `PasswordMismatch`).
    pub fn is_lookup_failure(self) -> bool {
        !matches!(self, Self::Ok | Self::PasswordMismatch)
    }
}

/// What a passdb driver implements.
///
/// `verify_plain` is mandatory. A driver without `lookup_credentials`
/// makes the pipeline synthesize SCHEME_NOT_AVAILABLE; one without
/// `set_credentials` rejects credential updates.
pub trait PassdbDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify a plaintext password, setting extra fields and the
    /// stored credential on the request as they are discovered.
    fn verify_plain(&self, request: &mut AuthRequest, password: &str) -> PassdbResult;

    /// Look up the stored credential (driver stores it on the request
    /// via the `password` field). `None` means unsupported.
    fn lookup_credentials(&self, _request: &mut AuthRequest) -> Option<PassdbResult> {
        None
    }

    /// Replace the stored credential. `None` means unsupported.
    fn set_credentials(&self, _request: &mut AuthRequest, _new_credentials: &str) -> Option<bool> {
        None
    }
}

impl std::fmt::Debug for AuthPassdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPassdb")
            .field("id", &self.id)
            .field("driver", &self.driver.name())
            .field("pass", &self.pass)
            .field("deny", &self.deny)
            .field("master", &self.master)
            .field("blocking", &self.blocking)
            .field("cache_key", &self.cache_key)
            .field("default_pass_scheme", &self.default_pass_scheme)
            .finish()
    }
}

/// One entry in a passdb chain.
pub struct AuthPassdb {
    pub id: u32,
    pub driver: Arc<dyn PassdbDriver>,
    /// success does not terminate the chain; fields accumulate for a
    /// later decisive passdb
    pub pass: bool,
    /// success means the user is blocked
    pub deny: bool,
    /// entry belongs to the master-passdb chain
    pub master: bool,
    /// route lookups through the worker pool
    pub blocking: bool,
    /// cache key template; None = uncacheable
    pub cache_key: Option<String>,
    pub default_pass_scheme: String,
}

impl AuthPassdb {
    /// The driver-module invariant: a cacheable passdb must declare
    /// the scheme its stored credentials use.
    pub fn check(&self) -> Result<(), String> {
        if self.cache_key.is_some() && self.default_pass_scheme.is_empty() {
            return Err(format!(
                "passdb {} (id {}): cache_key requires default_pass_scheme",
                self.driver.name(),
                self.id
            ));
        }
        Ok(())
    }
}
