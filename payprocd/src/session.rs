//! In-memory session and alias store.
//!
//! Sessions let the stateless request/response protocol carry state across
//! requests, e.g. between the two halves of a PayPal checkout.  They are
//! intentionally not persistent and die with the daemon.
//!
//! Sessions and aliases are indexed by the first two z-base-32 characters
//! of their id (32 x 32 buckets).  All operations run under one store-wide
//! lock with short critical sections; time is passed in from the outside
//! so expiry is testable.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::keyvalue::Dict;
use crate::zbase32;

/// Default session TTL; every access re-arms it.
pub const DEFAULT_TTL: i64 = 1800;

/// Hard cap on the entire lifetime of a session, to keep the daemon from
/// being used as a cheap storage provider.
pub const MAX_SESSION_LIFETIME: i64 = 6 * 3600;

/// Cap on the number of active sessions.
pub const MAX_SESSIONS: usize = 65_536;

/// Number of aliases a single session may have.
pub const MAX_ALIASES_PER_SESSION: usize = 3;

const ID_RAW_LEN: usize = 20;
const ID_LEN: usize = 32;
const NBUCKETS: usize = 32 * 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session or alias id")]
    InvalidId,
    #[error("no such session or alias")]
    NotFound,
    #[error("limit reached")]
    LimitReached,
}

struct Session {
    sessid: String,
    ttl: i64,
    created: i64,
    accessed: i64,
    dict: Dict,
    aliases: [Option<String>; MAX_ALIASES_PER_SESSION],
}

struct AliasEntry {
    aliasid: String,
    sessid: String,
}

struct Inner {
    sessions: Vec<Vec<Session>>,
    aliases: Vec<Vec<AliasEntry>>,
    in_use: usize,
}

pub struct SessionStore {
    inner: Mutex<Inner>,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Map an id to its bucket index after validating shape and alphabet of
/// the indexing characters.
fn bucket_index(id: &str) -> Result<usize, SessionError> {
    let bytes = id.as_bytes();
    if bytes.len() != ID_LEN {
        return Err(SessionError::InvalidId);
    }
    let a = zbase32::index(bytes[0]).ok_or(SessionError::InvalidId)?;
    let b = zbase32::index(bytes[1]).ok_or(SessionError::InvalidId)?;
    Ok(a * 32 + b)
}

fn mint_id() -> String {
    let mut nonce = [0u8; ID_RAW_LEN];
    rand::thread_rng().fill(&mut nonce[..]);
    zbase32::encode(&nonce, 8 * ID_RAW_LEN)
}

fn expired(sess: &Session, now: i64) -> bool {
    (sess.ttl > 0 && sess.accessed + sess.ttl < now)
        || sess.created + MAX_SESSION_LIFETIME < now
}

// --- impl SessionStore --- //

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                sessions: (0..NBUCKETS).map(|_| Vec::new()).collect(),
                aliases: (0..NBUCKETS).map(|_| Vec::new()).collect(),
                in_use: 0,
            }),
        }
    }

    /// Create a new session.  TTL <= 0 selects the default; larger values
    /// are capped at the maximum session lifetime.  Non-empty entries of
    /// DICT become the initial session data.
    pub fn create(&self, ttl: i64, dict: &Dict) -> Result<String, SessionError> {
        self.create_at(ttl, dict, unix_now())
    }

    pub fn create_at(&self, ttl: i64, dict: &Dict, now: i64) -> Result<String, SessionError> {
        let ttl = match ttl {
            t if t > MAX_SESSION_LIFETIME => MAX_SESSION_LIFETIME,
            t if t > 0 => t,
            _ => DEFAULT_TTL,
        };

        let mut inner = self.inner.lock().expect("sessions lock");
        if inner.in_use >= MAX_SESSIONS {
            return Err(SessionError::LimitReached);
        }

        let sessid = mint_id();
        let mut data = Dict::new();
        for (name, value) in dict.iter() {
            if !name.is_empty() && !value.is_empty() {
                data.put(name, value);
            }
        }
        let idx = bucket_index(&sessid)?;
        inner.sessions[idx].push(Session {
            sessid: sessid.clone(),
            ttl,
            created: now,
            accessed: now,
            dict: data,
            aliases: Default::default(),
        });
        inner.in_use += 1;
        Ok(sessid)
    }

    /// Destroy a session together with all its aliases.
    pub fn destroy(&self, sessid: &str) -> Result<(), SessionError> {
        let idx = bucket_index(sessid)?;
        let mut inner = self.inner.lock().expect("sessions lock");
        inner.remove_session(idx, sessid)
    }

    /// Snapshot the session's data.  An expired session is destroyed and
    /// reported as not found; otherwise the access time is refreshed.
    pub fn get(&self, sessid: &str) -> Result<Dict, SessionError> {
        self.get_at(sessid, unix_now())
    }

    pub fn get_at(&self, sessid: &str, now: i64) -> Result<Dict, SessionError> {
        let idx = bucket_index(sessid)?;
        let mut inner = self.inner.lock().expect("sessions lock");
        let sess = inner.live_session(idx, sessid, now)?;
        sess.accessed = now;
        Ok(sess.dict.clone())
    }

    /// Apply PATCH to the session's data: non-empty values upsert, empty
    /// values delete.
    pub fn put(&self, sessid: &str, patch: &Dict) -> Result<(), SessionError> {
        self.put_at(sessid, patch, unix_now())
    }

    pub fn put_at(&self, sessid: &str, patch: &Dict, now: i64) -> Result<(), SessionError> {
        let idx = bucket_index(sessid)?;
        let mut inner = self.inner.lock().expect("sessions lock");
        let sess = inner.live_session(idx, sessid, now)?;
        sess.accessed = now;
        for (name, value) in patch.iter() {
            if name.is_empty() {
                continue;
            }
            if value.is_empty() {
                sess.dict.remove(name);
            } else {
                sess.dict.put(name, value);
            }
        }
        Ok(())
    }

    /// Create an alias for a session.  An alias is a one-shot handle that
    /// can be given to a remote service without handing over the session
    /// itself.  At most [`MAX_ALIASES_PER_SESSION`] aliases may exist.
    pub fn create_alias(&self, sessid: &str) -> Result<String, SessionError> {
        self.create_alias_at(sessid, unix_now())
    }

    pub fn create_alias_at(&self, sessid: &str, now: i64) -> Result<String, SessionError> {
        let idx = bucket_index(sessid)?;
        let mut inner = self.inner.lock().expect("sessions lock");
        let sess = inner.live_session(idx, sessid, now)?;
        sess.accessed = now;

        let slot = sess
            .aliases
            .iter()
            .position(Option::is_none)
            .ok_or(SessionError::LimitReached)?;
        let aliasid = mint_id();
        sess.aliases[slot] = Some(aliasid.clone());
        let sessid = sess.sessid.clone();

        let aidx = bucket_index(&aliasid)?;
        inner.aliases[aidx].push(AliasEntry { aliasid: aliasid.clone(), sessid });
        Ok(aliasid)
    }

    /// Destroy an alias.  The session itself is not affected.
    pub fn destroy_alias(&self, aliasid: &str) -> Result<(), SessionError> {
        let idx = bucket_index(aliasid)?;
        let mut inner = self.inner.lock().expect("sessions lock");

        let pos = inner.aliases[idx]
            .iter()
            .position(|a| a.aliasid == aliasid)
            .ok_or(SessionError::NotFound)?;
        let entry = inner.aliases[idx].remove(pos);

        // Clear the back reference in the owning session.
        if let Ok(sidx) = bucket_index(&entry.sessid) {
            if let Some(sess) = inner.sessions[sidx]
                .iter_mut()
                .find(|s| s.sessid == entry.sessid)
            {
                for slot in sess.aliases.iter_mut() {
                    if slot.as_deref() == Some(aliasid) {
                        *slot = None;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve an alias to its session id.  Neither the alias nor the
    /// session is refreshed.
    pub fn get_sessid(&self, aliasid: &str) -> Result<String, SessionError> {
        let idx = bucket_index(aliasid)?;
        let inner = self.inner.lock().expect("sessions lock");
        inner.aliases[idx]
            .iter()
            .find(|a| a.aliasid == aliasid)
            .map(|a| a.sessid.clone())
            .ok_or(SessionError::NotFound)
    }

    /// Sweep all buckets and destroy expired sessions.
    pub fn housekeeping(&self) {
        self.housekeeping_at(unix_now())
    }

    pub fn housekeeping_at(&self, now: i64) {
        let mut inner = self.inner.lock().expect("sessions lock");
        for idx in 0..NBUCKETS {
            let expired_ids: Vec<String> = inner.sessions[idx]
                .iter()
                .filter(|s| expired(s, now))
                .map(|s| s.sessid.clone())
                .collect();
            for sessid in expired_ids {
                debug!("session '{sessid}' expired");
                let _ = inner.remove_session(idx, &sessid);
            }
        }
    }

    /// Number of active sessions.
    pub fn count(&self) -> usize {
        self.inner.lock().expect("sessions lock").in_use
    }
}

// --- impl Inner --- //

impl Inner {
    /// Find a session and check its TTL; an expired session is destroyed.
    fn live_session(
        &mut self,
        idx: usize,
        sessid: &str,
        now: i64,
    ) -> Result<&mut Session, SessionError> {
        let pos = self.sessions[idx]
            .iter()
            .position(|s| s.sessid == sessid)
            .ok_or(SessionError::NotFound)?;
        if expired(&self.sessions[idx][pos], now) {
            debug!("session '{sessid}' expired");
            let _ = self.remove_session(idx, sessid);
            return Err(SessionError::NotFound);
        }
        Ok(&mut self.sessions[idx][pos])
    }

    fn remove_session(&mut self, idx: usize, sessid: &str) -> Result<(), SessionError> {
        let pos = self.sessions[idx]
            .iter()
            .position(|s| s.sessid == sessid)
            .ok_or(SessionError::NotFound)?;
        let sess = self.sessions[idx].remove(pos);
        self.in_use -= 1;

        for aliasid in sess.aliases.into_iter().flatten() {
            if let Ok(aidx) = bucket_index(&aliasid) {
                self.aliases[aidx].retain(|a| a.aliasid != aliasid);
            }
        }
        Ok(())
    }
}
