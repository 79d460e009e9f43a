//! Process-wide embedding model handle.
//!
//! The model is loaded at most once and shared by search and reconciliation.
//! Concurrent first callers wait on the same guard and see the same outcome.
//! A failed load is remembered and reported as `ModelUnavailable` until
//! someone calls [`EmbeddingProvider::retry`].

use image::DynamicImage;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::semantic::embeddings::{EmbeddingError, FastembedImageModel, ImageEmbedder};

type Loader = Box<dyn Fn() -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> + Send + Sync>;

enum ProviderState {
    Uninitialized,
    Ready(Arc<dyn ImageEmbedder>),
    Failed(String),
}

pub struct EmbeddingProvider {
    model_name: String,
    loader: Loader,
    state: Mutex<ProviderState>,
}

impl EmbeddingProvider {
    /// Provider that builds its model with `loader` on first use.
    pub fn with_loader<F>(model_name: &str, loader: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> + Send + Sync + 'static,
    {
        Self {
            model_name: model_name.to_string(),
            loader: Box::new(loader),
            state: Mutex::new(ProviderState::Uninitialized),
        }
    }

    /// Provider backed by a local fastembed model cached under `base_path`.
    pub fn fastembed(config: &EmbeddingConfig, base_path: PathBuf) -> Self {
        let model = config.model.clone();
        let show_progress = config.show_download_progress;
        let timeout = Duration::from_secs(config.download_timeout_secs);

        Self::with_timeout(&config.model, timeout, move || {
            FastembedImageModel::new(&model, base_path.clone(), show_progress)
                .map(|loaded| Arc::new(loaded) as Arc<dyn ImageEmbedder>)
        })
    }

    /// Provider whose `build` runs on its own thread and is abandoned after
    /// `timeout`; an abandoned load finishes in the background.
    pub fn with_timeout<F>(model_name: &str, timeout: Duration, build: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> + Send + Sync + 'static,
    {
        let build = Arc::new(build);
        let model = model_name.to_string();

        Self::with_loader(model_name, move || {
            let (tx, rx) = mpsc::channel();
            std::thread::spawn({
                let build = build.clone();
                move || {
                    let _ = tx.send(build());
                }
            });

            match rx.recv_timeout(timeout) {
                Ok(loaded) => loaded,
                Err(mpsc::RecvTimeoutError::Timeout) => Err(EmbeddingError::ModelUnavailable(
                    format!("model '{}' did not load within {}s", model, timeout.as_secs()),
                )),
                Err(mpsc::RecvTimeoutError::Disconnected) => Err(
                    EmbeddingError::ModelUnavailable(format!("loader for '{}' panicked", model)),
                ),
            }
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Get the model, loading it if nobody has tried yet.
    pub fn handle(&self) -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> {
        let mut state = self.lock()?;

        match &*state {
            ProviderState::Ready(model) => return Ok(model.clone()),
            ProviderState::Failed(reason) => {
                return Err(EmbeddingError::ModelUnavailable(reason.clone()))
            }
            ProviderState::Uninitialized => {}
        }
        Self::load_into(&self.loader, &self.model_name, &mut state)
    }

    /// Forget a previous load failure and try again.
    pub fn retry(&self) -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> {
        let mut state = self.lock()?;

        if let ProviderState::Ready(model) = &*state {
            return Ok(model.clone());
        }
        Self::load_into(&self.loader, &self.model_name, &mut state)
    }

    /// Embed one decoded image with the shared model.
    pub fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>, EmbeddingError> {
        self.handle()?.embed(image)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ProviderState>, EmbeddingError> {
        self.state
            .lock()
            .map_err(|e| EmbeddingError::ModelUnavailable(format!("provider lock poisoned: {}", e)))
    }

    fn load_into(
        loader: &Loader,
        model_name: &str,
        state: &mut ProviderState,
    ) -> Result<Arc<dyn ImageEmbedder>, EmbeddingError> {
        log::info!("Initializing image embedding model '{}'", model_name);

        match loader() {
            Ok(model) => {
                *state = ProviderState::Ready(model.clone());
                Ok(model)
            }
            Err(err) => {
                let reason = match err {
                    EmbeddingError::ModelUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                log::error!("Failed to initialize model '{}': {}", model_name, reason);
                *state = ProviderState::Failed(reason.clone());
                Err(EmbeddingError::ModelUnavailable(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::testing::FakeEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_provider(fail_first: usize) -> (Arc<EmbeddingProvider>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider = EmbeddingProvider::with_loader("fake", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            if n < fail_first {
                Err(EmbeddingError::ModelUnavailable("artifact missing".to_string()))
            } else {
                Ok(Arc::new(FakeEmbedder::new(4)) as Arc<dyn ImageEmbedder>)
            }
        });
        (Arc::new(provider), calls)
    }

    #[test]
    fn test_loads_once_across_calls() {
        let (provider, calls) = counting_provider(0);

        provider.handle().unwrap();
        provider.handle().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_use_is_single_flight() {
        let (provider, calls) = counting_provider(0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                std::thread::spawn(move || provider.handle().map(|m| m.dimensions()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 4);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_sticky_until_retry() {
        let (provider, calls) = counting_provider(1);

        assert!(matches!(
            provider.handle(),
            Err(EmbeddingError::ModelUnavailable(_))
        ));
        assert!(matches!(
            provider.handle(),
            Err(EmbeddingError::ModelUnavailable(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        provider.retry().unwrap();
        provider.handle().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_callers_share_failure() {
        let (provider, calls) = counting_provider(usize::MAX);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let provider = provider.clone();
                std::thread::spawn(move || provider.handle().is_err())
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_other_loader_errors_become_model_unavailable() {
        let provider = EmbeddingProvider::with_loader("bogus", || {
            Err(EmbeddingError::InvalidModel("bogus".to_string()))
        });
        assert!(matches!(
            provider.handle(),
            Err(EmbeddingError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_slow_load_times_out() {
        let provider = EmbeddingProvider::with_timeout("slow", Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Arc::new(FakeEmbedder::new(4)) as Arc<dyn ImageEmbedder>)
        });

        match provider.handle() {
            Err(EmbeddingError::ModelUnavailable(reason)) => {
                assert!(reason.contains("did not load within"), "{reason}")
            }
            other => panic!("expected timeout, got {:?}", other.map(|m| m.dimensions())),
        }
    }

    #[test]
    fn test_panicking_load_is_reported() {
        let provider = EmbeddingProvider::with_timeout("broken", Duration::from_secs(5), || {
            panic!("onnx runtime missing")
        });

        match provider.handle() {
            Err(EmbeddingError::ModelUnavailable(reason)) => {
                assert!(reason.contains("panicked"), "{reason}")
            }
            other => panic!("expected panic report, got {:?}", other.map(|m| m.dimensions())),
        }
    }

    #[test]
    fn test_timed_load_passes_through_result() {
        let provider = EmbeddingProvider::with_timeout("fast", Duration::from_secs(5), || {
            Ok(Arc::new(FakeEmbedder::new(3)) as Arc<dyn ImageEmbedder>)
        });
        assert_eq!(provider.handle().unwrap().dimensions(), 3);

        let failing = EmbeddingProvider::with_timeout("gone", Duration::from_secs(5), || {
            Err(EmbeddingError::ModelUnavailable("no network".to_string()))
        });
        assert!(matches!(
            failing.handle(),
            Err(EmbeddingError::ModelUnavailable(reason)) if reason == "no network"
        ));
    }
}
