//! Authentication provider seam.
//!
//! The core never talks to an identity service directly. It sees an
//! [`AuthProvider`]: the current user plus a subscription to sign-in and
//! sign-out events. [`SessionAuth`] is the in-process provider used by the
//! server. It admits a caller presenting the admin token, or signs in a
//! canned user when test mode is on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use subtle::ConstantTimeEq;

use crate::error::{CmsError, CmsResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
}

impl User {
    /// The user substituted for a real identity when test mode is on.
    pub fn test_user() -> Self {
        Self {
            id: "test-user".into(),
            email: "test@example.com".into(),
            name: "Test User".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(User),
    SignedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type AuthListener = Arc<dyn Fn(&AuthEvent) + Send + Sync>;

pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<User>;

    fn subscribe(&self, listener: AuthListener) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    fn require_user(&self) -> CmsResult<User> {
        self.current_user().ok_or(CmsError::Unauthorized)
    }
}

pub struct SessionAuth {
    admin_token: Option<String>,
    admin_email: String,
    user: RwLock<Option<User>>,
    listeners: Mutex<BTreeMap<SubscriptionId, AuthListener>>,
    next_id: AtomicU64,
}

impl SessionAuth {
    /// `admin_token` of `None` disables token sign-in entirely.
    pub fn new(admin_token: Option<String>, admin_email: impl Into<String>) -> Self {
        Self {
            admin_token,
            admin_email: admin_email.into(),
            user: RwLock::new(None),
            listeners: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Sign in with the admin token.
    pub fn sign_in(&self, token: &str) -> CmsResult<User> {
        let Some(expected) = &self.admin_token else {
            return Err(CmsError::Unconfigured(
                "admin token is not set; sign-in is disabled".into(),
            ));
        };
        if !bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
            tracing::warn!("rejected sign-in with invalid token");
            return Err(CmsError::Unauthorized);
        }
        let user = User {
            id: "admin".into(),
            email: self.admin_email.clone(),
            name: "Administrator".into(),
        };
        self.set_user(Some(user.clone()));
        Ok(user)
    }

    /// Sign in the canned test user without a token.
    pub fn sign_in_test_user(&self) -> User {
        let user = User::test_user();
        self.set_user(Some(user.clone()));
        user
    }

    pub fn sign_out(&self) {
        self.set_user(None);
    }

    fn set_user(&self, user: Option<User>) {
        let event = {
            let mut current = self.user.write().unwrap_or_else(|e| e.into_inner());
            if *current == user {
                return;
            }
            *current = user.clone();
            match user {
                Some(u) => AuthEvent::SignedIn(u),
                None => AuthEvent::SignedOut,
            }
        };
        match &event {
            AuthEvent::SignedIn(u) => tracing::info!(user = %u.email, "signed in"),
            AuthEvent::SignedOut => tracing::info!("signed out"),
        }
        // Listeners may call back into the provider.
        let listeners: Vec<AuthListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

impl AuthProvider for SessionAuth {
    fn current_user(&self) -> Option<User> {
        self.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn subscribe(&self, listener: AuthListener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(auth: &SessionAuth) -> (Arc<Mutex<Vec<AuthEvent>>>, SubscriptionId) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = auth.subscribe(Arc::new(move |e: &AuthEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        (seen, id)
    }

    #[test]
    fn test_token_sign_in_and_out() {
        let auth = SessionAuth::new(Some("s3cret".into()), "me@example.com");
        let (seen, _) = recorder(&auth);

        assert!(matches!(auth.sign_in("wrong"), Err(CmsError::Unauthorized)));
        assert!(auth.current_user().is_none());

        let user = auth.sign_in("s3cret").unwrap();
        assert_eq!(user.email, "me@example.com");
        assert_eq!(auth.require_user().unwrap(), user);

        auth.sign_out();
        assert!(auth.require_user().is_err());

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], AuthEvent::SignedIn(_)));
        assert_eq!(events[1], AuthEvent::SignedOut);
    }

    #[test]
    fn test_token_must_match_exactly() {
        let auth = SessionAuth::new(Some("s3cret".into()), "me@example.com");
        assert!(auth.sign_in("s3cre").is_err());
        assert!(auth.sign_in("s3cret!").is_err());
        assert!(auth.sign_in("").is_err());
        assert!(auth.sign_in("s3cret").is_ok());
    }

    #[test]
    fn test_sign_in_disabled_without_token() {
        let auth = SessionAuth::new(None, "me@example.com");
        assert!(matches!(auth.sign_in(""), Err(CmsError::Unconfigured(_))));
    }

    #[test]
    fn test_repeated_state_does_not_renotify() {
        let auth = SessionAuth::new(None, "x");
        let (seen, id) = recorder(&auth);
        auth.sign_out();
        auth.sign_in_test_user();
        auth.sign_in_test_user();
        assert_eq!(seen.lock().unwrap().len(), 1);

        auth.unsubscribe(id);
        auth.sign_out();
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(User::test_user().id, "test-user");
    }
}
