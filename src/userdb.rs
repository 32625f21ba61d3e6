//! Userdb contract — result codes, driver trait, chain entries.

use std::sync::Arc;

use crate::request::AuthRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserdbResult {
    Ok,
    UserUnknown,
    InternalFailure,
}

/// What a userdb driver implements: fill the request's userdb reply
/// for the active user.
pub trait UserdbDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup(&self, request: &mut AuthRequest) -> UserdbResult;
}

impl std::fmt::Debug for AuthUserdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthUserdb")
            .field("id", &self.id)
            .field("driver", &self.driver.name())
            .field("blocking", &self.blocking)
            .finish()
    }
}

/// One entry in the userdb chain.
pub struct AuthUserdb {
    /// position in the chain; the worker protocol addresses userdbs
    /// by this index
    pub id: u32,
    pub driver: Arc<dyn UserdbDriver>,
    pub blocking: bool,
}
