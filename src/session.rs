use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, RwLock};

use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::SecretBytes;

/// Upper bound on concurrent RMCP+ sessions.
pub(crate) const MAX_SESSIONS: usize = 64;

/// Key material derived on successful RAKP3. Present exactly when the
/// session is authenticated; wiped on drop.
#[derive(Clone)]
pub(crate) struct SessionKeys {
    /// Session Integrity Key.
    pub sik: [u8; 20],
    /// Integrity key (K1) for HMAC-SHA1-96 trailers.
    pub k1: [u8; 20],
    /// AES-128 key, the first 16 bytes of K2.
    pub aes_key: [u8; 16],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.sik.zeroize();
        self.k1.zeroize();
        self.aes_key.zeroize();
    }
}

/// A single RMCP+ session, keyed by the managed-system session ID the BMC
/// allocated for it.
pub(crate) struct Session {
    pub remote_console_session_id: u32,
    pub remote_console_random: [u8; 16],
    pub managed_system_random: [u8; 16],
    pub managed_system_guid: [u8; 16],
    pub requested_privilege: u8,
    pub user_name: Vec<u8>,
    /// Password resolved at RAKP1 time; later user-table edits do not
    /// affect an in-flight handshake.
    pub password: Option<SecretBytes>,
    pub keys: Option<SessionKeys>,
    pub authenticated: bool,
    out_seq: AtomicU32,
}

impl Session {
    fn new(remote_console_session_id: u32) -> Self {
        let mut rng = rand::rng();
        let mut managed_system_random = [0u8; 16];
        rng.fill_bytes(&mut managed_system_random);
        let mut managed_system_guid = [0u8; 16];
        rng.fill_bytes(&mut managed_system_guid);

        Self {
            remote_console_session_id,
            remote_console_random: [0u8; 16],
            managed_system_random,
            managed_system_guid,
            requested_privilege: 0,
            user_name: Vec::new(),
            password: None,
            keys: None,
            authenticated: false,
            out_seq: AtomicU32::new(0),
        }
    }

    /// Allocate the next outbound session sequence number.
    ///
    /// The counter starts at zero and is pre-incremented, so the first
    /// response carries 1. Consoles treat sequence 0 as out of window.
    pub(crate) fn next_out_seq(&self) -> u32 {
        self.out_seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// Concurrent map from managed-system session ID to session.
pub(crate) struct SessionStore {
    sessions: RwLock<HashMap<u32, Session>>,
}

impl SessionStore {
    pub(crate) fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Create an unauthenticated session with a fresh non-zero
    /// managed-system session ID. Returns `None` at capacity.
    pub(crate) fn create(&self, remote_console_session_id: u32) -> Option<u32> {
        let mut sessions = self.sessions.write().expect("session lock");
        if sessions.len() >= MAX_SESSIONS {
            return None;
        }

        let mut rng = rand::rng();
        let session_id = loop {
            let id = rng.next_u32();
            if id != 0 && !sessions.contains_key(&id) {
                break id;
            }
        };

        sessions.insert(session_id, Session::new(remote_console_session_id));
        Some(session_id)
    }

    /// Run `f` with shared access to a session.
    pub(crate) fn with_session<R>(
        &self,
        session_id: u32,
        f: impl FnOnce(&Session) -> R,
    ) -> Option<R> {
        let sessions = self.sessions.read().expect("session lock");
        sessions.get(&session_id).map(f)
    }

    /// Run `f` with exclusive access to a session.
    pub(crate) fn with_session_mut<R>(
        &self,
        session_id: u32,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.write().expect("session lock");
        sessions.get_mut(&session_id).map(f)
    }

    /// Destroy a session and its keys.
    pub(crate) fn remove(&self, session_id: u32) {
        let mut sessions = self.sessions.write().expect("session lock");
        sessions.remove(&session_id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.sessions.read().expect("session lock").len()
    }
}

/// IPMI v1.5 challenge/activation sub-state.
///
/// The LAN 1.5 path needs only the most recent challenge and activated
/// session ID; both live here, owned by the server object rather than as
/// process-wide state.
pub(crate) struct Ipmi15State {
    inner: Mutex<Ipmi15Inner>,
}

#[derive(Default)]
struct Ipmi15Inner {
    challenge_session_id: u32,
    challenge: [u8; 16],
    active_session_id: u32,
}

impl Ipmi15State {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Ipmi15Inner::default()),
        }
    }

    /// Generate and record a temporary session ID and 16-byte challenge.
    pub(crate) fn new_challenge(&self) -> (u32, [u8; 16]) {
        let mut rng = rand::rng();
        let session_id = rng.next_u32();
        let mut challenge = [0u8; 16];
        rng.fill_bytes(&mut challenge);

        let mut inner = self.inner.lock().expect("ipmi15 lock");
        inner.challenge_session_id = session_id;
        inner.challenge = challenge;
        (session_id, challenge)
    }

    /// Allocate and record a non-zero active session ID.
    pub(crate) fn activate(&self) -> u32 {
        let mut rng = rand::rng();
        let session_id = loop {
            let id = rng.next_u32();
            if id != 0 {
                break id;
            }
        };

        let mut inner = self.inner.lock().expect("ipmi15 lock");
        inner.active_session_id = session_id;
        session_id
    }
}
