//! GPU-exclusive model manager: only one model family may be resident at a
//! time, so acquiring a model unloads every other loaded model first. See
//! spec §4.2 and §5 (CONCURRENCY & RESOURCE MODEL).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A loadable/unloadable model family (ASR engine, diarization embedder,
/// OCR engine, ...). Implementations own whatever process/handle backs the
/// actual model and must make `unload` idempotent.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> anyhow::Result<()>;
    async fn unload(&self) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

struct Slot {
    loader: Arc<dyn ModelLoader>,
    loaded: bool,
}

/// Tracks which model is currently resident and enforces exclusivity.
///
/// `acquire` is the only supported entry point for pipeline stages: it
/// unloads every other registered model, loads (or confirms loaded) the
/// requested one, and returns without auto-unloading on scope exit — the
/// next `acquire` call for a different model does that instead.
pub struct ModelManager {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ModelManager {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_loader(&self, loader: Arc<dyn ModelLoader>) {
        let mut slots = self.slots.lock().await;
        slots.insert(
            loader.name().to_string(),
            Slot {
                loader,
                loaded: false,
            },
        );
    }

    /// Ensure `name` is the only loaded model, loading it if necessary.
    pub async fn acquire(&self, name: &str) -> anyhow::Result<()> {
        let mut slots = self.slots.lock().await;

        let keys: Vec<String> = slots.keys().cloned().collect();
        for key in keys {
            if key == name {
                continue;
            }
            let needs_unload = slots.get(&key).map(|s| s.loaded).unwrap_or(false);
            if needs_unload {
                let loader = slots.get(&key).unwrap().loader.clone();
                info!(model = %key, "unloading to free resources for exclusive acquire");
                match loader.unload().await {
                    Ok(()) => {
                        if let Some(slot) = slots.get_mut(&key) {
                            slot.loaded = false;
                        }
                    }
                    Err(e) => {
                        warn!(model = %key, error = %e, "failed to unload model");
                        return Err(e);
                    }
                }
            }
        }

        let slot = slots
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("no loader registered for model '{name}'"))?;
        if !slot.loaded {
            info!(model = %name, "loading model");
            slot.loader.load().await?;
            slot.loaded = true;
        }
        Ok(())
    }

    pub async fn unload(&self, name: &str) -> anyhow::Result<()> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(name) {
            if slot.loaded {
                slot.loader.unload().await?;
                slot.loaded = false;
            }
        }
        Ok(())
    }

    pub async fn unload_all(&self) -> anyhow::Result<()> {
        let mut slots = self.slots.lock().await;
        for (key, slot) in slots.iter_mut() {
            if slot.loaded {
                info!(model = %key, "unloading model");
                slot.loader.unload().await?;
                slot.loaded = false;
            }
        }
        Ok(())
    }

    pub async fn is_loaded(&self, name: &str) -> bool {
        let slots = self.slots.lock().await;
        slots.get(name).map(|s| s.loaded).unwrap_or(false)
    }
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        name: String,
        loads: AtomicUsize,
        unloads: AtomicUsize,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self) -> anyhow::Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn unload(&self) -> anyhow::Result<()> {
            self.unloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn name(&self) -> &str {
            &self.name
        }
    }

    #[tokio::test]
    async fn acquiring_a_second_model_unloads_the_first() {
        let manager = ModelManager::new();
        let asr = Arc::new(CountingLoader {
            name: "asr".into(),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        });
        let ocr = Arc::new(CountingLoader {
            name: "ocr".into(),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        });
        manager.register_loader(asr.clone()).await;
        manager.register_loader(ocr.clone()).await;

        manager.acquire("asr").await.unwrap();
        assert_eq!(asr.loads.load(Ordering::SeqCst), 1);
        assert!(manager.is_loaded("asr").await);

        manager.acquire("ocr").await.unwrap();
        assert_eq!(asr.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(ocr.loads.load(Ordering::SeqCst), 1);
        assert!(!manager.is_loaded("asr").await);
        assert!(manager.is_loaded("ocr").await);
    }

    #[tokio::test]
    async fn reacquiring_the_same_model_does_not_reload() {
        let manager = ModelManager::new();
        let asr = Arc::new(CountingLoader {
            name: "asr".into(),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
        });
        manager.register_loader(asr.clone()).await;
        manager.acquire("asr").await.unwrap();
        manager.acquire("asr").await.unwrap();
        assert_eq!(asr.loads.load(Ordering::SeqCst), 1);
    }
}
