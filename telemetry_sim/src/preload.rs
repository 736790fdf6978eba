//! Simulated image loader for look-ahead scenarios.

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use telemetry_core::{Preloader, State, Value};
use telemetry_env::{CancelToken, EnvError};

/// Image name referenced by a frame's `camera.image`, if any.
pub fn camera_image(state: &State) -> Option<&str> {
    state.get("camera")?.as_map()?.get("image")?.as_str()
}

/// "Loads" camera images into a shared set after a seeded number of yields.
pub struct SimImagePreloader {
    loaded: Arc<Mutex<BTreeSet<String>>>,
    latency_rng: Mutex<ChaCha8Rng>,
    max_latency_polls: u32,
    loads: AtomicU64,
    unloads: AtomicU64,
}

impl SimImagePreloader {
    pub fn new(latency_rng: ChaCha8Rng) -> Self {
        Self {
            loaded: Arc::new(Mutex::new(BTreeSet::new())),
            latency_rng: Mutex::new(latency_rng),
            max_latency_polls: 8,
            loads: AtomicU64::new(0),
            unloads: AtomicU64::new(0),
        }
    }
    
    pub fn with_max_latency(mut self, polls: u32) -> Self {
        self.max_latency_polls = polls;
        self
    }
    
    /// Images currently resident, sorted.
    pub fn loaded(&self) -> Vec<String> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
    
    pub fn is_loaded(&self, image: &str) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(image)
    }
    
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
    
    pub fn unloads(&self) -> u64 {
        self.unloads.load(Ordering::SeqCst)
    }
}

impl Preloader for SimImagePreloader {
    fn preload(&self, state: &State, cancel: CancelToken) -> Vec<BoxFuture<'static, Result<(), EnvError>>> {
        let Some(image) = camera_image(state).map(str::to_owned) else {
            return Vec::new();
        };
        self.loads.fetch_add(1, Ordering::SeqCst);
        let polls = self
            .latency_rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..=self.max_latency_polls);
        let loaded = self.loaded.clone();
        
        let load = async move {
            for _ in 0..polls {
                cancel.check()?;
                tokio::task::yield_now().await;
            }
            // Checked under the lock so a concurrent unload cannot be overtaken
            let mut loaded = loaded.lock().unwrap_or_else(PoisonError::into_inner);
            cancel.check()?;
            loaded.insert(image);
            Ok::<(), EnvError>(())
        };
        vec![load.boxed()]
    }
    
    fn unload(&self, state: &State) {
        if let Some(image) = camera_image(state) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            self.loaded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(image);
        }
    }
    
    /// Marks the visible camera frame ready once its image is resident.
    fn process_state(&self, state: &mut State) -> bool {
        let Some(image) = camera_image(state).map(str::to_owned) else {
            return false;
        };
        if !self.is_loaded(&image) {
            return false;
        }
        match state.get_mut("camera").and_then(Value::as_map_mut) {
            Some(camera) if camera.get("ready") != Some(&Value::Bool(true)) => {
                camera.insert("ready".into(), Value::Bool(true));
                true
            }
            _ => false,
        }
    }
}
