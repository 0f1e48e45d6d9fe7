//! Identity state tracker: presence state machine and debounced sighting updates.
//!
//! Each identity is either `Idle` or `RecentlySeen`. An accepted match moves
//! it to `RecentlySeen`; if the debounce window has elapsed since the last
//! counted sighting, the sighting counter and last-seen timestamp are
//! advanced and persisted through the gallery store. Without accepted
//! matches for the inactivity period the identity falls back to `Idle`.

use crate::gallery::{GalleryError, GalleryStore};
use crate::pipeline::SharedConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Idle,
    RecentlySeen,
}

#[derive(Debug, Default)]
struct IdentityState {
    last_match: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

impl IdentityState {
    fn presence(&self, now: DateTime<Utc>, inactivity: Duration) -> Presence {
        match self.last_match {
            Some(seen) if !elapsed(seen, now, inactivity) => Presence::RecentlySeen,
            _ => Presence::Idle,
        }
    }
}

/// True once `window` has passed between `since` and `now`.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match (now - since).to_std() {
        Ok(gap) => gap >= window,
        // Clock went backwards.
        Err(_) => false,
    }
}

/// Owns per-identity runtime state; one lock per identity.
pub struct IdentityTracker {
    store: Arc<GalleryStore>,
    config: SharedConfig,
    states: Mutex<HashMap<String, Arc<Mutex<IdentityState>>>>,
}

impl IdentityTracker {
    pub fn new(store: Arc<GalleryStore>, config: SharedConfig) -> Self {
        Self {
            store,
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<GalleryStore> {
        &self.store
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    fn state(&self, name: &str) -> Arc<Mutex<IdentityState>> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.entry(name.to_string()).or_default().clone()
    }

    /// Handle an accepted match for `name` at `now`.
    ///
    /// Returns `true` when the sighting counter was advanced (and persisted),
    /// `false` when the match fell inside the debounce window.
    ///
    /// The debounce slot is claimed under the identity's lock and the store
    /// write happens after releasing it; a failed write gives the slot back.
    pub fn on_accepted_match(&self, name: &str, now: DateTime<Utc>) -> Result<bool, GalleryError> {
        let debounce = self.config.load().debounce;
        let state = self.state(name);

        let previous_update = {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.last_match.map_or(true, |seen| seen < now) {
                state.last_match = Some(now);
            }

            let due = debounce.is_zero()
                || state.last_update.map_or(true, |last| elapsed(last, now, debounce));
            if !due {
                tracing::debug!(name, "sighting debounced");
                return Ok(false);
            }
            state.last_update.replace(now)
        };

        match self.store.record_sighting(name, now) {
            Ok(profile) => {
                tracing::debug!(name, sightings = profile.sightings, "sighting recorded");
                Ok(true)
            }
            Err(e) => {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.last_update == Some(now) {
                    state.last_update = previous_update;
                }
                Err(e)
            }
        }
    }

    pub fn presence(&self, name: &str, now: DateTime<Utc>) -> Presence {
        let inactivity = self.config.load().inactivity;
        let state = {
            let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            states.get(name).cloned()
        };
        match state {
            Some(state) => state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .presence(now, inactivity),
            None => Presence::Idle,
        }
    }

    /// Names of identities currently `RecentlySeen`, sorted.
    pub fn visible(&self, now: DateTime<Utc>) -> Vec<String> {
        let inactivity = self.config.load().inactivity;
        let entries: Vec<(String, Arc<Mutex<IdentityState>>)> = {
            let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
            states.iter().map(|(name, state)| (name.clone(), state.clone())).collect()
        };
        let mut names: Vec<String> = entries
            .into_iter()
            .filter(|(_, state)| {
                state.lock().unwrap_or_else(PoisonError::into_inner).presence(now, inactivity)
                    == Presence::RecentlySeen
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }
}
