//! The authentication provider collaborator.
//!
//! Login, token refresh and redirects live outside this crate; a session only
//! needs to know who the current principal is and how to end the session.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::OwnerId;

/// The authenticated user whose records a session mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: OwnerId,
    pub email: Option<String>,
    /// `user_metadata.full_name`, used to seed a lazily created profile.
    pub full_name: Option<String>,
}

impl Principal {
    pub fn new(id: OwnerId) -> Self {
        Self {
            id,
            email: None,
            full_name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to sign out: {0}")]
    SignOut(String),
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn current_principal(&self) -> Option<Principal>;

    async fn sign_out(&self) -> Result<(), AuthError>;
}

/// In-process provider holding a fixed principal until sign-out.
#[derive(Debug, Default)]
pub struct StaticAuth {
    principal: RwLock<Option<Principal>>,
}

impl StaticAuth {
    pub fn signed_in(principal: Principal) -> Self {
        Self {
            principal: RwLock::new(Some(principal)),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, principal: Principal) {
        *self.principal.write().unwrap_or_else(PoisonError::into_inner) = Some(principal);
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    fn current_principal(&self) -> Option<Principal> {
        self.principal
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.principal
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}
