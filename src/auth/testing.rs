//! Deterministic stand-ins for the clock, cache backends and providers,
//! shared by unit and integration tests. Compiled for tests and under the
//! `testing` feature only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::ExposeSecret;

use crate::auth::authenticator::{IdentityAuthenticator, StepRequest};
use crate::auth::clock::Clock;
use crate::auth::error::{CacheError, StepError};
use crate::auth::sso::{DeviceAuthorization, SsoParams};
use crate::auth::store::CacheBackend;
use crate::auth::types::{Credentials, Identity, IssuedVia, StepOutput};

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).single().unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        ManualClock::now(self)
    }
}

/// In-memory cache backend. Clones share the same entries, so a test can
/// keep a handle while the store owns another.
#[derive(Clone)]
pub struct MemoryBackend {
    via: IssuedVia,
    entries: Arc<Mutex<HashMap<String, Credentials>>>,
}

impl MemoryBackend {
    /// `via` is the tag hits are served with, standing in for a secure or
    /// file backend.
    pub fn new(via: IssuedVia) -> Self {
        Self {
            via,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Seed an entry directly, bypassing the store's owner check.
    pub fn insert(&self, identity: &str, credentials: Credentials) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(identity.to_string(), credentials);
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(identity))
            .unwrap_or(false)
    }

    /// Owner recorded for `identity`'s entry.
    pub fn owner_of(&self, identity: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(identity).map(|c| c.owner().to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read(&self, identity: &str) -> Result<Option<Credentials>, CacheError> {
        let entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
        Ok(entries
            .get(identity)
            .cloned()
            .map(|credentials| credentials.served_from(self.via)))
    }

    fn write(&self, identity: &str, credentials: &Credentials) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
        entries.insert(identity.to_string(), credentials.clone());
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::LockPoisoned)?;
        entries.remove(identity);
        Ok(())
    }
}

/// Authenticator that records every call and derives secrets from the
/// chain: a step's secret is `<name>:<parent secret>`, so `admin:ps:base`
/// proves all three steps ran in order.
pub struct ScriptedAuthenticator {
    clock: Arc<dyn Clock>,
    ttl: Mutex<Duration>,
    delay: Mutex<Option<std::time::Duration>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<StepError>>>,
    invalid: Mutex<HashSet<String>>,
}

impl ScriptedAuthenticator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            ttl: Mutex::new(Duration::hours(1)),
            delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            invalid: Mutex::new(HashSet::new()),
        }
    }

    /// Lifetime of issued credentials.
    pub fn set_ttl(&self, ttl: Duration) {
        *lock(&self.ttl) = ttl;
    }

    /// Sleep this long inside every call.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Fail the next call for `identity` with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, identity: &str, error: StepError) {
        lock(&self.failures)
            .entry(identity.to_string())
            .or_default()
            .push_back(error);
    }

    /// Make `validate` reject `identity`.
    pub fn reject_config(&self, identity: &str) {
        lock(&self.invalid).insert(identity.to_string());
    }

    /// Identity names in the order they were authenticated.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, identity: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == identity).count()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl IdentityAuthenticator for ScriptedAuthenticator {
    fn validate(&self, identity: &Identity) -> Result<(), StepError> {
        if lock(&self.invalid).contains(&identity.name) {
            return Err(StepError::InvalidConfig(format!(
                "{} is misconfigured",
                identity.name
            )));
        }
        Ok(())
    }

    async fn authenticate(&self, request: &StepRequest<'_>) -> Result<StepOutput, StepError> {
        let name = request.identity.name.clone();
        lock(&self.calls).push(name.clone());

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = lock(&self.failures)
            .get_mut(&name)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        let secret = match request.index {
            0 => name,
            _ => format!(
                "{}:{}",
                name,
                request.require_parent()?.secret().expose_secret()
            ),
        };
        let ttl = *lock(&self.ttl);
        Ok(StepOutput::new(secret, self.clock.now() + ttl))
    }
}

/// Device flow that issues `device-token-<n>` for the n-th call, valid for
/// eight hours.
pub struct ScriptedDeviceFlow {
    clock: Arc<dyn Clock>,
    calls: Mutex<usize>,
}

impl ScriptedDeviceFlow {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

#[async_trait]
impl DeviceAuthorization for ScriptedDeviceFlow {
    async fn authorize(
        &self,
        _provider: &Identity,
        _params: &SsoParams,
    ) -> Result<StepOutput, StepError> {
        let n = {
            let mut calls = lock(&self.calls);
            *calls += 1;
            *calls
        };
        Ok(StepOutput::new(
            format!("device-token-{}", n),
            self.clock.now() + Duration::hours(8),
        ))
    }
}
