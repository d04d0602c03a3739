//! Scoped acquisition of one inference artifact with guaranteed release.

use std::sync::Mutex;

use burn::prelude::*;
use tracing::debug;

use crate::artifact::Artifact;
use crate::error::ModelError;

/// Explicit load state. `perform` is the only `Unloaded -> Loaded` path; a
/// failed load records `Failed` but does not poison the instance — the next
/// call retries from scratch.
enum LoadState<M> {
    Unloaded,
    Loaded(M),
    Failed,
}

/// Owns one artifact and serializes every prediction against it.
///
/// Concurrent callers queue on the internal lock, so all predictions for one
/// artifact are sequential regardless of the calling context.
pub struct ManagedModel<B: Backend> {
    name: String,
    state: Mutex<LoadState<Box<dyn Artifact<B>>>>,
    #[allow(clippy::type_complexity)]
    loader: Box<dyn Fn() -> Result<Box<dyn Artifact<B>>, ModelError> + Send + Sync>,
}

impl<B: Backend> ManagedModel<B> {
    pub fn new(
        name: impl Into<String>,
        loader: impl Fn() -> Result<Box<dyn Artifact<B>>, ModelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LoadState::Unloaded),
            loader: Box::new(loader),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` against the loaded artifact, loading first if absent.
    pub fn perform<R>(
        &self,
        f: impl FnOnce(&dyn Artifact<B>) -> Result<R, ModelError>,
    ) -> Result<R, ModelError> {
        let mut state = self.state.lock().expect("managed model lock");
        if let LoadState::Loaded(model) = &*state {
            return f(model.as_ref());
        }
        debug!(model = %self.name, "loading artifact");
        match (self.loader)() {
            Ok(model) => {
                let result = f(model.as_ref());
                *state = LoadState::Loaded(model);
                result
            }
            Err(err) => {
                *state = LoadState::Failed;
                Err(err)
            }
        }
    }

    pub fn load(&self) -> Result<(), ModelError> {
        self.perform(|_| Ok(()))
    }

    pub fn unload(&self) {
        let mut state = self.state.lock().expect("managed model lock");
        if matches!(&*state, LoadState::Loaded(_)) {
            debug!(model = %self.name, "unloading artifact");
        }
        *state = LoadState::Unloaded;
    }

    /// Load then immediately unload, populating any on-disk compilation
    /// caches the host framework keeps.
    pub fn prewarm(&self) -> Result<(), ModelError> {
        self.load()?;
        self.unload();
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        matches!(
            &*self.state.lock().expect("managed model lock"),
            LoadState::Loaded(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{FeatureDescription, FnArtifact};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type TestBackend = burn_ndarray::NdArray;

    fn counting_model(
        loads: Arc<AtomicUsize>,
        fail_first: bool,
    ) -> ManagedModel<TestBackend> {
        ManagedModel::new("test", move || {
            let attempt = loads.fetch_add(1, Ordering::SeqCst);
            if fail_first && attempt == 0 {
                return Err(ModelError::LoadFailed {
                    name: "test".into(),
                    reason: "backend refused".into(),
                });
            }
            Ok(Box::new(FnArtifact::new(
                vec![FeatureDescription::new("x", [1, 1, 1, 1])],
                vec![FeatureDescription::new("y", [1, 1, 1, 1])],
                Ok,
            )))
        })
    }

    #[test]
    fn perform_loads_lazily_and_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let model = counting_model(Arc::clone(&loads), false);
        assert!(!model.is_loaded());

        model.perform(|_| Ok(())).unwrap();
        model.perform(|_| Ok(())).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(model.is_loaded());
    }

    #[test]
    fn unload_releases_and_reload_works() {
        let loads = Arc::new(AtomicUsize::new(0));
        let model = counting_model(Arc::clone(&loads), false);
        model.load().unwrap();
        model.unload();
        assert!(!model.is_loaded());
        model.perform(|_| Ok(())).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_load_does_not_poison() {
        let loads = Arc::new(AtomicUsize::new(0));
        let model = counting_model(Arc::clone(&loads), true);

        assert!(matches!(
            model.perform(|_| Ok(())),
            Err(ModelError::LoadFailed { .. })
        ));
        assert!(!model.is_loaded());

        // The next request retries and succeeds.
        model.perform(|_| Ok(())).unwrap();
        assert!(model.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prewarm_leaves_the_model_unloaded() {
        let loads = Arc::new(AtomicUsize::new(0));
        let model = counting_model(Arc::clone(&loads), false);
        model.prewarm().unwrap();
        assert!(!model.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
