//! Token lifecycle management: identity fetch, silent refresh, background renewal, logout
//!
//! The manager never returns errors from its public operations. Every failure resolves to a
//! state transition that observers see through [`SessionManager::subscribe`] and
//! [`SessionManager::events`].

use crate::config::{ClientConfig, CredentialStoreKind, SessionConfig};
use crate::credentials::{
    CredentialLifetimes, CredentialStore, KeyringCredentialStore, MemoryCredentialStore,
};
use crate::session_api::{HttpSessionApi, SessionApi};
use crate::{CredentialPair, Identity, RehearseError, Result, SessionState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Keyring service name for stored credentials
pub const KEYRING_SERVICE: &str = "rehearsekit";

/// Session changes worth surfacing to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn,
    SignedOut,
    SessionExpired,
    CredentialsRenewed,
    RenewalFailed,
}

/// Change in authentication caused by one state write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Gained,
    Lost,
    Unchanged,
}

/// Periodic proactive refresh. Lives exactly as long as the session is authenticated.
struct RenewalTimer {
    handle: JoinHandle<()>,
}

impl RenewalTimer {
    fn start(inner: Weak<Inner>, period: Duration) -> Option<Self> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime available, background renewal disabled");
                return None;
            }
        };

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                SessionManager { inner }.renew().await;
            }
        });

        debug!("Background renewal scheduled every {:?}", period);
        Some(Self { handle })
    }
}

impl Drop for RenewalTimer {
    fn drop(&mut self) {
        debug!("Background renewal stopped");
        self.handle.abort();
    }
}

struct Inner {
    api: Arc<dyn SessionApi>,
    store: Arc<dyn CredentialStore>,
    lifetimes: CredentialLifetimes,
    renewal_interval: Duration,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    /// Bumped by login and logout; in-flight work from an older generation must not write
    generation: AtomicU64,
    /// Serializes identity fetches and credential refreshes
    fetch_guard: tokio::sync::Mutex<()>,
    /// Makes "check generation, then write store or state" atomic against login and logout
    writes: Mutex<()>,
    renewal: Mutex<Option<RenewalTimer>>,
}

/// Owner of the authenticated-identity lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn SessionApi>,
        store: Arc<dyn CredentialStore>,
        config: &SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::starting());
        let (events, _) = broadcast::channel(16);

        Self {
            inner: Arc::new(Inner {
                api,
                store,
                lifetimes: CredentialLifetimes::from(config),
                renewal_interval: config.renewal_interval(),
                state,
                events,
                generation: AtomicU64::new(0),
                fetch_guard: tokio::sync::Mutex::new(()),
                writes: Mutex::new(()),
                renewal: Mutex::new(None),
            }),
        }
    }

    /// Build the HTTP-backed manager described by a client configuration
    pub fn from_config(config: &ClientConfig, api_url: &str) -> Result<Self> {
        let api = HttpSessionApi::new(api_url, &config.api)?;
        let store: Arc<dyn CredentialStore> = match config.session.store {
            CredentialStoreKind::Keyring => Arc::new(KeyringCredentialStore::new(
                KEYRING_SERVICE,
                api.base_url().as_str(),
            )?),
            CredentialStoreKind::Memory => Arc::new(MemoryCredentialStore::new()),
        };

        Ok(Self::new(Arc::new(api), store, &config.session))
    }

    /// Current session snapshot
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.state.borrow().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    /// Observe every session state transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Receive user-facing session notifications
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the background renewal timer is currently alive
    pub fn has_renewal_timer(&self) -> bool {
        self.inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Resolve the identity behind the stored access credential
    pub async fn fetch_identity(&self) {
        let _guard = self.inner.fetch_guard.lock().await;
        let generation = self.generation();

        self.inner.state.send_if_modified(|state| {
            let changed = !state.is_loading;
            state.is_loading = true;
            changed
        });

        let identity = match self.resolve_identity(generation).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Identity fetch failed, signing out: {}", e);
                self.discard_credentials(generation);
                None
            }
        };

        let transition = {
            let _writes = self.lock_writes();
            if self.is_current(generation) {
                Some(self.apply(identity))
            } else {
                debug!("Identity fetch superseded by login or logout, discarding result");
                self.inner.state.send_if_modified(|state| {
                    let changed = state.is_loading;
                    state.is_loading = false;
                    changed
                });
                None
            }
        };

        match transition {
            Some(Transition::Gained) => {
                info!("Session authenticated");
                self.emit(SessionEvent::SignedIn);
            }
            Some(Transition::Lost) => {
                info!("Session no longer authenticated");
                self.emit(SessionEvent::SessionExpired);
            }
            _ => {}
        }
    }

    /// Persist a freshly issued credential pair and load the identity it belongs to
    pub async fn login(&self, pair: CredentialPair) {
        {
            let _writes = self.lock_writes();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);

            if let Err(e) = self.inner.store.store_pair(&pair, self.inner.lifetimes) {
                warn!("Failed to persist credentials: {}", e);
            }
        }

        self.fetch_identity().await;
    }

    /// Sign out. The visible session is cleared before this returns; the server is
    /// notified in the background and its answer is ignored.
    pub fn logout(&self) {
        let access_token = {
            let _writes = self.lock_writes();
            self.inner.generation.fetch_add(1, Ordering::SeqCst);

            let access_token = self.inner.store.access_token().ok().flatten();
            self.apply(None);

            if let Err(e) = self.inner.store.clear() {
                warn!("Failed to remove stored credentials: {}", e);
            }
            access_token
        };

        info!("Signed out");
        self.emit(SessionEvent::SignedOut);

        let Some(access_token) = access_token else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let api = Arc::clone(&self.inner.api);
                runtime.spawn(async move {
                    if let Err(e) = api.logout(&access_token).await {
                        debug!("Logout notification failed: {}", e);
                    }
                });
            }
            Err(_) => debug!("No async runtime available, skipping logout notification"),
        }
    }

    /// Re-read the identity, e.g. after a profile edit. Credentials are left alone.
    pub async fn refresh_identity(&self) {
        self.fetch_identity().await;
    }

    /// Exchange the refresh credential for a new pair. Failure removes both credentials
    /// and ends the session.
    pub async fn refresh_credentials(&self) -> bool {
        let _guard = self.inner.fetch_guard.lock().await;
        let generation = self.generation();
        if self.refresh_unguarded(generation).await {
            return true;
        }

        if self.end_session(generation) == Some(Transition::Lost) {
            info!("Credential refresh failed, session ended");
            self.emit(SessionEvent::SessionExpired);
        }
        false
    }

    async fn resolve_identity(&self, generation: u64) -> Result<Option<Identity>> {
        let Some(access_token) = self.inner.store.access_token()? else {
            debug!("No access credential stored");
            return Ok(None);
        };

        match self.inner.api.fetch_identity(&access_token).await {
            Ok(identity) => Ok(Some(identity)),
            Err(e) if e.is_unauthorized() => {
                info!("Access credential rejected, attempting silent refresh");

                if !self.refresh_unguarded(generation).await {
                    self.discard_credentials(generation);
                    return Ok(None);
                }

                let access_token = self.inner.store.access_token()?.ok_or_else(|| {
                    RehearseError::Auth("refreshed access credential was not stored".to_string())
                })?;

                // Exactly one retry; a second rejection is final
                self.inner.api.fetch_identity(&access_token).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_unguarded(&self, generation: u64) -> bool {
        let refresh_token = match self.inner.store.refresh_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("No refresh credential stored");
                return false;
            }
            Err(e) => {
                warn!("Failed to read refresh credential: {}", e);
                self.discard_credentials(generation);
                return false;
            }
        };

        match self.inner.api.refresh(&refresh_token).await {
            Ok(pair) => {
                let stored = {
                    let _writes = self.lock_writes();
                    if !self.is_current(generation) {
                        debug!("Credential refresh superseded, discarding new pair");
                        return false;
                    }
                    self.inner.store.store_pair(&pair, self.inner.lifetimes)
                };

                match stored {
                    Ok(()) => {
                        debug!("Credentials refreshed");
                        true
                    }
                    Err(e) => {
                        warn!("Failed to persist refreshed credentials: {}", e);
                        self.discard_credentials(generation);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("Credential refresh failed: {}", e);
                self.discard_credentials(generation);
                false
            }
        }
    }

    /// Timer tick: renew ahead of expiry, end the session if that is no longer possible
    async fn renew(&self) {
        let _guard = self.inner.fetch_guard.lock().await;
        let generation = self.generation();

        debug!("Proactively renewing credentials");
        if self.refresh_unguarded(generation).await {
            self.emit(SessionEvent::CredentialsRenewed);
            return;
        }

        let Some(transition) = self.end_session(generation) else {
            return;
        };

        warn!("Background renewal failed, ending session");
        self.emit(SessionEvent::RenewalFailed);
        if transition == Transition::Lost {
            self.emit(SessionEvent::SessionExpired);
        }
    }

    /// Clear the session after an unrecoverable credential failure, unless superseded
    fn end_session(&self, generation: u64) -> Option<Transition> {
        let _writes = self.lock_writes();
        if !self.is_current(generation) {
            return None;
        }
        Some(self.apply(None))
    }

    /// Write the identity, finish loading, and keep the renewal timer in step with it
    fn apply(&self, identity: Option<Identity>) -> Transition {
        let mut transition = Transition::Unchanged;
        self.inner.state.send_modify(|state| {
            let was_authenticated = state.is_authenticated();
            state.identity = identity;
            state.is_loading = false;

            transition = match (was_authenticated, state.is_authenticated()) {
                (false, true) => Transition::Gained,
                (true, false) => Transition::Lost,
                _ => Transition::Unchanged,
            };
        });

        self.sync_renewal();
        transition
    }

    fn sync_renewal(&self) {
        let authenticated = self.inner.state.borrow().is_authenticated();
        let mut renewal = self
            .inner
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match (authenticated, renewal.is_some()) {
            (true, false) => {
                *renewal =
                    RenewalTimer::start(Arc::downgrade(&self.inner), self.inner.renewal_interval);
            }
            (false, true) => {
                let timer = renewal.take();
                drop(renewal);
                drop(timer);
            }
            _ => {}
        }
    }

    fn discard_credentials(&self, generation: u64) {
        let _writes = self.lock_writes();
        if !self.is_current(generation) {
            return;
        }

        if let Err(e) = self.inner.store.clear() {
            warn!("Failed to remove stored credentials: {}", e);
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.inner.events.send(event);
    }
}
