//! Concurrency ceilings for active streams.
//!
//! Every decision and every release runs under one mutex, so two requests
//! can never race past a limit on a stale read. Slots are handed out as
//! [`AdmissionPermit`]s and returned exactly once when the permit is released
//! or dropped.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Ceilings applied by [`AdmissionController`]. Zero disables a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub max_per_token: usize,
    pub max_clients: usize,
    pub max_global: usize,
}

/// Why a stream was refused.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Too many concurrent streams for this file, try again later or pick another file")]
    PerFileLimit,

    #[error("Too many clients are streaming right now, try again later")]
    MaxClients,

    #[error("Server is at capacity, try again later")]
    GlobalLimit,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::PerFileLimit => "per_file_limit",
            Rejection::MaxClients => "max_clients",
            Rejection::GlobalLimit => "global_limit",
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    per_token: HashMap<String, usize>,
    per_client: HashMap<String, usize>,
    global: usize,
}

/// Read-only view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdmissionSnapshot {
    pub active_streams: usize,
    pub active_tokens: usize,
    pub active_clients: usize,
}

struct ControllerInner {
    limits: AdmissionLimits,
    counters: Mutex<Counters>,
}

#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<ControllerInner>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                limits,
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Admit a stream for `token` requested by `client`.
    ///
    /// Checks run in a fixed order and the first failing one wins: per-file,
    /// then distinct clients (only for a client with no active stream), then
    /// global.
    pub fn try_admit(&self, token: &str, client: &str) -> Result<AdmissionPermit, Rejection> {
        let limits = self.inner.limits;
        let mut counters = self.inner.counters.lock();

        let token_count = counters.per_token.get(token).copied().unwrap_or(0);
        if limits.max_per_token > 0 && token_count >= limits.max_per_token {
            return Err(Rejection::PerFileLimit);
        }

        let client_count = counters.per_client.get(client).copied().unwrap_or(0);
        if limits.max_clients > 0
            && client_count == 0
            && counters.per_client.len() >= limits.max_clients
        {
            return Err(Rejection::MaxClients);
        }

        if limits.max_global > 0 && counters.global >= limits.max_global {
            return Err(Rejection::GlobalLimit);
        }

        *counters.per_token.entry(token.to_string()).or_default() += 1;
        *counters.per_client.entry(client.to_string()).or_default() += 1;
        counters.global += 1;
        debug!(
            client,
            global = counters.global,
            per_client = client_count + 1,
            per_token = token_count + 1,
            "Admitted stream"
        );
        drop(counters);

        Ok(AdmissionPermit {
            controller: self.clone(),
            token: token.to_string(),
            client: client.to_string(),
            released: false,
        })
    }

    fn release(&self, token: &str, client: &str) {
        let mut counters = self.inner.counters.lock();
        if !decrement(&mut counters.per_token, token) {
            warn!(client, "Released a token slot that was not held");
        }
        if !decrement(&mut counters.per_client, client) {
            warn!(client, "Released a client slot that was not held");
        }
        counters.global = counters.global.saturating_sub(1);
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let counters = self.inner.counters.lock();
        AdmissionSnapshot {
            active_streams: counters.global,
            active_tokens: counters.per_token.len(),
            active_clients: counters.per_client.len(),
        }
    }
}

/// Decrement a keyed counter, dropping the key at zero. Returns false when the
/// key was absent.
fn decrement(map: &mut HashMap<String, usize>, key: &str) -> bool {
    match map.get_mut(key) {
        Some(count) if *count > 1 => {
            *count -= 1;
            true
        }
        Some(_) => {
            map.remove(key);
            true
        }
        None => false,
    }
}

/// One admitted stream slot. The slot is returned on [`AdmissionPermit::release`]
/// or on drop, whichever comes first.
pub struct AdmissionPermit {
    controller: AdmissionController,
    token: String,
    client: String,
    released: bool,
}

impl AdmissionPermit {
    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.controller.release(&self.token, &self.client);
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("client", &self.client)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_per_token: usize, max_clients: usize, max_global: usize) -> AdmissionController {
        AdmissionController::new(AdmissionLimits {
            max_per_token,
            max_clients,
            max_global,
        })
    }

    #[test]
    fn test_per_token_limit_until_release() {
        let ctl = controller(2, 0, 0);
        let a = ctl.try_admit("t", "c1").unwrap();
        let _b = ctl.try_admit("t", "c2").unwrap();
        assert_eq!(ctl.try_admit("t", "c3").unwrap_err(), Rejection::PerFileLimit);

        // Other tokens are unaffected.
        let _other = ctl.try_admit("u", "c3").unwrap();

        a.release();
        let _c = ctl.try_admit("t", "c3").unwrap();
    }

    #[test]
    fn test_max_clients_only_blocks_new_clients() {
        let ctl = controller(0, 2, 0);
        let _a = ctl.try_admit("t1", "c1").unwrap();
        let _b = ctl.try_admit("t2", "c2").unwrap();
        assert_eq!(ctl.try_admit("t3", "c3").unwrap_err(), Rejection::MaxClients);
        // An already active client may open more streams.
        let _c = ctl.try_admit("t3", "c1").unwrap();
    }

    #[test]
    fn test_global_limit() {
        let ctl = controller(0, 0, 2);
        let _a = ctl.try_admit("t1", "c1").unwrap();
        let b = ctl.try_admit("t2", "c2").unwrap();
        assert_eq!(ctl.try_admit("t3", "c3").unwrap_err(), Rejection::GlobalLimit);
        drop(b);
        let _c = ctl.try_admit("t3", "c3").unwrap();
    }

    #[test]
    fn test_check_order_per_file_first() {
        // Every ceiling is hit; the per-file reason wins.
        let ctl = controller(1, 1, 1);
        let _a = ctl.try_admit("t", "c1").unwrap();
        assert_eq!(ctl.try_admit("t", "c2").unwrap_err(), Rejection::PerFileLimit);
        assert_eq!(ctl.try_admit("u", "c2").unwrap_err(), Rejection::MaxClients);
        assert_eq!(ctl.try_admit("u", "c1").unwrap_err(), Rejection::GlobalLimit);
    }

    #[test]
    fn test_release_is_exactly_once() {
        let ctl = controller(0, 0, 0);
        let a = ctl.try_admit("t", "c").unwrap();
        let _b = ctl.try_admit("t", "c").unwrap();
        assert_eq!(ctl.snapshot().active_streams, 2);

        a.release();
        assert_eq!(ctl.snapshot().active_streams, 1);
        assert_eq!(ctl.snapshot().active_tokens, 1);
    }

    #[test]
    fn test_counters_drain_to_zero() {
        let ctl = controller(0, 0, 0);
        let permits: Vec<_> = (0..10)
            .map(|i| ctl.try_admit(&format!("t{}", i % 3), &format!("c{}", i % 4)).unwrap())
            .collect();
        assert_eq!(
            ctl.snapshot(),
            AdmissionSnapshot {
                active_streams: 10,
                active_tokens: 3,
                active_clients: 4,
            }
        );
        drop(permits);
        assert_eq!(ctl.snapshot(), AdmissionSnapshot::default());
    }

    #[test]
    fn test_concurrent_admits_never_exceed_global() {
        let ctl = controller(0, 0, 5);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ctl = ctl.clone();
                std::thread::spawn(move || ctl.try_admit(&format!("t{i}"), &format!("c{i}")).ok())
            })
            .collect();
        let admitted: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(admitted.len(), 5);
        assert_eq!(ctl.snapshot().active_streams, 5);
    }
}
