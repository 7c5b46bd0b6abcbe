use std::{fmt::Display, str::FromStr};

use anyhow::{anyhow, Error};
use argon2::{
    password_hash::{self, rand_core::OsRng, PasswordHashString, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use confidante_core::xmpp::jid::Jid;

use super::{MechanismNegotiatorResult, StoredPassword, StoredPasswordLookup};

#[derive(Debug)]
pub struct StoredPasswordArgon2 {
    pub hash: PasswordHashString,
}

impl StoredPassword for StoredPasswordArgon2 {
    fn new(plaintext: &str) -> Result<Self, Error> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2.hash_password(plaintext.as_bytes(), &salt)?.into();
        Ok(Self { hash })
    }
}

impl FromStr for StoredPasswordArgon2 {
    type Err = password_hash::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hash = PasswordHashString::new(s)?;
        Ok(Self { hash })
    }
}

impl Display for StoredPasswordArgon2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// One-shot PLAIN negotiator (RFC 4616): the whole `authzid\0authcid\0passwd`
/// message arrives in the initial response, so there is never a challenge.
pub struct PlainNegotiator<S> {
    domain: String,
    store: S,
    authenticated_id: Option<String>,
}

impl<S> PlainNegotiator<S>
where
    S: StoredPasswordLookup + Send + Sync,
{
    pub fn new(domain: String, store: S) -> Self {
        Self {
            domain,
            store,
            authenticated_id: None,
        }
    }

    pub async fn process(&mut self, payload: Vec<u8>) -> MechanismNegotiatorResult {
        match self.try_process(payload).await {
            Ok(authcid) => {
                self.authenticated_id = Some(authcid);
                MechanismNegotiatorResult::Success(None)
            }
            Err(err) => MechanismNegotiatorResult::Failure(err),
        }
    }

    async fn try_process(&self, payload: Vec<u8>) -> Result<String, Error> {
        let text = std::str::from_utf8(&payload)
            .map_err(|_| anyhow!("PLAIN response is not valid UTF-8"))?;
        let mut parts = text.splitn(3, '\0');
        let _authzid = parts.next();
        let authcid = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("PLAIN response is missing an authentication identity"))?;
        let password = parts
            .next()
            .ok_or_else(|| anyhow!("PLAIN response is missing a password"))?;

        let jid = Jid::new(Some(authcid.to_string()), self.domain.clone(), None);
        let stored = self.store.get_stored_password_argon2(jid).await?;
        let stored: StoredPasswordArgon2 = stored
            .parse()
            .map_err(|err| anyhow!("stored PLAIN credential is malformed: {err}"))?;

        Argon2::default()
            .verify_password(password.as_bytes(), &stored.hash.password_hash())
            .map_err(|_| anyhow!("password does not match"))?;

        Ok(authcid.to_string())
    }

    pub async fn authentication_id(self) -> Result<String, Error> {
        self.authenticated_id
            .ok_or_else(|| anyhow!("PLAIN negotiation never succeeded"))
    }
}
