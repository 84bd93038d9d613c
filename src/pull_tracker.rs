//! Tracks which models are currently being pulled, so a second `/settings model pull` for the
//! same model doesn't start a second download on the inference server.

use crate::ollama::canonical_model_name;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

#[derive(Clone, Default)]
pub struct PullTracker {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Marks a pull as in flight until dropped
pub struct PullGuard {
    tracker: PullTracker,
    model: String,
}

impl PullTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `model` for pulling.  `None` if a pull for it is already running.
    pub fn begin(&self, model: &str) -> Option<PullGuard> {
        let model = canonical_model_name(model);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(model.clone()) {
            return None;
        }
        Some(PullGuard {
            tracker: self.clone(),
            model,
        })
    }
}

impl Drop for PullGuard {
    fn drop(&mut self) {
        self.tracker
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.model);
    }
}
