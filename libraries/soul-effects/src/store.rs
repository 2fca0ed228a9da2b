//! Parameter store
//!
//! Single owner of the session's [`EffectParameters`]. Every mutation is a
//! read-modify-write through [`ParameterStore::update`]; readers always get a
//! complete snapshot. Subscribers are notified through a `watch` channel.

use crate::params::EffectParameters;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone)]
pub struct ParameterStore {
    sender: Arc<watch::Sender<EffectParameters>>,
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(EffectParameters::default())
    }
}

impl ParameterStore {
    pub fn new(params: EffectParameters) -> Self {
        let (sender, _) = watch::channel(params);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Clone of the current parameters
    pub fn snapshot(&self) -> EffectParameters {
        self.sender.borrow().clone()
    }

    /// Read without cloning; do not hold across awaits
    pub fn read<R>(&self, f: impl FnOnce(&EffectParameters) -> R) -> R {
        f(&self.sender.borrow())
    }

    /// Apply a mutation and notify subscribers
    pub fn update(&self, f: impl FnOnce(&mut EffectParameters)) {
        self.sender.send_modify(f);
    }

    /// Overwrite the loudness reading
    pub fn set_momentary_lufs(&self, lufs: f64) {
        self.sender.send_if_modified(|params| {
            let changed = params.loudness.momentary_lufs != lufs;
            params.loudness.momentary_lufs = lufs;
            changed
        });
    }

    /// Back to defaults
    pub fn reset(&self) {
        self.sender.send_replace(EffectParameters::default());
        debug!("Parameter store reset");
    }

    pub fn subscribe(&self) -> watch::Receiver<EffectParameters> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_read() {
        let store = ParameterStore::default();
        store.update(|p| p.widener.amount = 0.9);
        assert_eq!(store.read(|p| p.widener.amount), 0.9);
        assert_eq!(store.snapshot().widener.amount, 0.9);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let store = ParameterStore::default();
        let mut rx = store.subscribe();

        store.update(|p| p.compressor.enabled = true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().compressor.enabled);
    }

    #[tokio::test]
    async fn test_identical_loudness_reading_does_not_notify() {
        let store = ParameterStore::default();
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store.set_momentary_lufs(-70.0);
        assert!(!rx.has_changed().unwrap());

        store.set_momentary_lufs(-20.0);
        assert!(rx.has_changed().unwrap());
    }

    #[test]
    fn test_reset() {
        let store = ParameterStore::default();
        store.update(|p| p.eq_gains[0] = 6.0);
        store.reset();
        assert_eq!(store.snapshot(), EffectParameters::default());
    }
}
