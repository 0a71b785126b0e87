// Cziczere Sync Engine: In-process credential source
//
// Hosts with a real identity provider implement `CredentialSource`
// themselves. This one holds a token and identity set from the outside
// (CLI flags, tests).

use crate::atoms::error::SyncResult;
use crate::atoms::traits::CredentialSource;
use crate::atoms::types::{Token, UserId};
use async_trait::async_trait;
use log::info;
use parking_lot::RwLock;
use tokio::sync::watch;

pub struct StaticCredentials {
    token: RwLock<Option<Token>>,
    identity: watch::Sender<Option<UserId>>,
}

impl StaticCredentials {
    pub fn new(token: Option<Token>, identity: Option<UserId>) -> Self {
        let (identity_tx, _) = watch::channel(identity);
        StaticCredentials { token: RwLock::new(token), identity: identity_tx }
    }

    pub fn signed_out() -> Self {
        Self::new(None, None)
    }

    pub fn set_token(&self, token: Option<Token>) {
        *self.token.write() = token;
    }

    /// Publish a new identity. No-op when unchanged.
    pub fn set_identity(&self, identity: Option<UserId>) {
        let changed = self.identity.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            *current = identity.clone();
            true
        });
        if changed {
            info!(
                "[credentials] identity → {}",
                identity.as_ref().map(|u| u.as_str()).unwrap_or("<signed out>")
            );
        }
    }

    /// Sign in as `user` with `token` in one step.
    pub fn sign_in(&self, user: UserId, token: Token) {
        self.set_token(Some(token));
        self.set_identity(Some(user));
    }

    pub fn sign_out(&self) {
        self.set_token(None);
        self.set_identity(None);
    }
}

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn current_token(&self) -> SyncResult<Option<Token>> {
        Ok(self.token.read().clone())
    }

    fn identity_changes(&self) -> watch::Receiver<Option<UserId>> {
        self.identity.subscribe()
    }
}
