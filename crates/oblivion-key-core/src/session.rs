//! Session identity: one SID per store, URL-supplied SIDs always win.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

pub const SID_STORAGE_KEY: &str = "oblivion_sid";
pub const SID_PREFIX: &str = "SID-";
pub const SID_RANDOM_LEN: usize = 7;

const SID_ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Opaque client session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid(String);

impl Sid {
    /// Trims the raw value; blank input is not a SID.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Sid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidSource {
    Url,
    Stored,
    Generated,
}

impl SidSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Stored => "stored",
            Self::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSid {
    pub sid: Sid,
    pub source: SidSource,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no session found: {reason}")]
    NoSession { reason: String },
}

/// Durable slot holding the client's SID.
pub trait SessionStore {
    type Error: fmt::Display;

    fn load_sid(&self) -> Result<Option<String>, Self::Error>;
    fn persist_sid(&self, sid: &str) -> Result<(), Self::Error>;
}

impl<S: SessionStore + ?Sized> SessionStore for Arc<S> {
    type Error = S::Error;

    fn load_sid(&self) -> Result<Option<String>, Self::Error> {
        (**self).load_sid()
    }

    fn persist_sid(&self, sid: &str) -> Result<(), Self::Error> {
        (**self).persist_sid(sid)
    }
}

#[derive(Debug, Clone)]
pub struct SessionIdentity<S> {
    store: S,
}

impl<S: SessionStore> SessionIdentity<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn resolve(&self, url_sid: Option<&str>) -> Result<Sid, SessionError> {
        self.resolve_with_source(url_sid).map(|resolved| resolved.sid)
    }

    /// Resolves the active SID.
    ///
    /// A SID from the inbound URL is persisted over whatever is stored and
    /// returned even if the write fails. Otherwise the stored SID is reused,
    /// and only when the slot is empty is a fresh one generated and persisted.
    pub fn resolve_with_source(&self, url_sid: Option<&str>) -> Result<ResolvedSid, SessionError> {
        if let Some(sid) = url_sid.and_then(Sid::parse) {
            match self.store.persist_sid(sid.as_str()) {
                Ok(()) => debug!(sid = %sid, "persisted url-supplied session id"),
                Err(error) => warn!(
                    sid = %sid,
                    %error,
                    "could not persist url-supplied session id; using it for this run only"
                ),
            }
            return Ok(ResolvedSid {
                sid,
                source: SidSource::Url,
            });
        }

        if let Some(sid) = self.current()? {
            return Ok(ResolvedSid {
                sid,
                source: SidSource::Stored,
            });
        }

        let sid = generate_sid(&mut rand::rng());
        self.store
            .persist_sid(sid.as_str())
            .map_err(|error| SessionError::NoSession {
                reason: format!("session storage unwritable: {error}"),
            })?;
        info!(sid = %sid, "generated new session id");
        Ok(ResolvedSid {
            sid,
            source: SidSource::Generated,
        })
    }

    /// Stored SID, without generating one.
    pub fn current(&self) -> Result<Option<Sid>, SessionError> {
        let stored = self
            .store
            .load_sid()
            .map_err(|error| SessionError::NoSession {
                reason: format!("session storage unreadable: {error}"),
            })?;
        Ok(stored.as_deref().and_then(Sid::parse))
    }
}

/// `SID-` followed by seven characters from `[0-9A-Z]`.
pub fn generate_sid<R: Rng + ?Sized>(rng: &mut R) -> Sid {
    let suffix = (0..SID_RANDOM_LEN)
        .map(|_| char::from(SID_ALPHABET[rng.random_range(0..SID_ALPHABET.len())]))
        .collect::<String>();
    Sid(format!("{SID_PREFIX}{suffix}"))
}
