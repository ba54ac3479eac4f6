use std::sync::Arc;

use tower::Layer;

use super::{AdmissionController, AdmissionService};

/// Wraps services in an [`AdmissionService`] sharing one controller.
///
/// ```rust
/// use std::sync::Arc;
///
/// use llm_admission::admission::{
///     AdmissionController, AdmissionLayer, ControlConfig,
///     error::CallError,
///     types::{ResponseMeta, RunResult},
/// };
/// use tower::ServiceBuilder;
///
/// let controller = Arc::new(AdmissionController::new(ControlConfig::default()));
/// let service = ServiceBuilder::new()
///     .layer(AdmissionLayer::new(controller))
///     .service_fn(|prompt: String| async move {
///         Ok::<_, CallError>(RunResult::new(prompt.len(), ResponseMeta::ok()))
///     });
/// # drop(service);
/// ```
#[derive(Clone, Debug)]
pub struct AdmissionLayer {
    controller: Arc<AdmissionController>,
}

impl AdmissionLayer {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService::new(inner, Arc::clone(&self.controller))
    }
}
