use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;

/// The signed-in user, or nobody.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key under which the user's mutation queue is stored.
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => f.write_str("User(unauthenticated)"),
        }
    }
}

/// Bearer token sent when a stream is opened.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub user: User,
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("user", &self.user)
            .finish()
    }
}

pub type UserChangeListener = Arc<dyn Fn(User) + Send + Sync>;

#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<AuthToken>>;

    /// Makes the next [`get_token`](Self::get_token) fetch a fresh token.
    fn invalidate_token(&self);

    /// Registers the callback invoked with the current user right away and
    /// again whenever the user changes.
    fn set_change_listener(&self, listener: UserChangeListener);
}

/// Provider for clients that never sign in.
#[derive(Clone, Debug, Default)]
pub struct EmptyCredentialsProvider;

impl EmptyCredentialsProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<AuthToken>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: UserChangeListener) {
        listener(User::unauthenticated());
    }
}

#[derive(Default)]
struct StaticState {
    user: User,
    token: Option<String>,
    invalidations: usize,
    listener: Option<UserChangeListener>,
}

/// Serves a fixed token per user. Switching the user notifies the
/// registered listener.
#[derive(Clone, Default)]
pub struct StaticCredentialsProvider {
    state: Arc<Mutex<StaticState>>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StaticState {
                user,
                token,
                ..StaticState::default()
            })),
        }
    }

    pub fn change_user(&self, user: User, token: Option<String>) {
        let listener = {
            let mut state = self.lock();
            state.user = user.clone();
            state.token = token;
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }

    /// How often the token was invalidated, e.g. after an unauthenticated
    /// stream close.
    pub fn invalidation_count(&self) -> usize {
        self.lock().invalidations
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<AuthToken>> {
        let state = self.lock();
        Ok(state.token.clone().map(|value| AuthToken {
            value,
            user: state.user.clone(),
        }))
    }

    fn invalidate_token(&self) {
        self.lock().invalidations += 1;
    }

    fn set_change_listener(&self, listener: UserChangeListener) {
        let user = {
            let mut state = self.lock();
            state.listener = Some(Arc::clone(&listener));
            state.user.clone()
        };
        listener(user);
    }
}
