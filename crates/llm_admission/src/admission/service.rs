use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use tower::{Service, ServiceExt};

use super::{
    AdmissionController,
    error::{AdmissionError, CallError},
    types::{RequestMeta, RunResult},
};

/// A request body together with what the controller needs to admit it.
#[derive(Clone, Debug)]
pub struct AdmissionRequest<R> {
    pub meta: RequestMeta,
    pub body: R,
}

impl<R> AdmissionRequest<R> {
    pub fn new(meta: RequestMeta, body: R) -> Self {
        Self { meta, body }
    }
}

/// Runs every call to the inner service through [`AdmissionController::run`].
///
/// The inner service is only driven to readiness once the request has been
/// admitted, so the controller's queue is the only place requests wait.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    controller: Arc<AdmissionController>,
}

impl<S> AdmissionService<S> {
    pub fn new(inner: S, controller: Arc<AdmissionController>) -> Self {
        Self { inner, controller }
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }
}

impl<S, R, T> Service<AdmissionRequest<R>> for AdmissionService<S>
where
    S: Service<R, Response = RunResult<T>, Error = CallError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    R: Send + 'static,
    T: Send + 'static,
{
    type Response = RunResult<T>;
    type Error = AdmissionError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: AdmissionRequest<R>) -> Self::Future {
        let controller = Arc::clone(&self.controller);
        let inner = self.inner.clone();
        let AdmissionRequest { meta, body } = request;

        Box::pin(async move { controller.run(meta, move || inner.oneshot(body)).await })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::future::{Ready, ready};
    use http::StatusCode;
    use tokio::time::sleep;
    use tokio_test::assert_ready_ok;
    use tower::{service_fn, util::MapErr};
    use tower_test::mock;

    use super::*;
    use crate::{
        admission::{ControlConfig, QueueSettings, types::ResponseMeta},
        test_utils::{request, window},
    };

    fn controller(config: ControlConfig) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(config))
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_calls_reach_the_inner_service() {
        let controller = controller(ControlConfig::default());
        let inner = service_fn(|prompt: &'static str| {
            ready(Ok::<_, CallError>(RunResult::new(
                prompt.len(),
                ResponseMeta::ok().with_tokens(Some(2), Some(5)),
            )))
        });
        let mut service = AdmissionService::new(inner, Arc::clone(&controller));

        let reply = service
            .ready()
            .await
            .unwrap()
            .call(AdmissionRequest::new(request("sim"), "hello"))
            .await
            .unwrap();

        assert_eq!(reply.result, 5);
        assert_eq!(controller.limiter_state(&request("sim")).rate, 550.0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_rejections_never_reach_the_inner_service() {
        let config = ControlConfig::builder()
            .queue(QueueSettings::builder().max_size(1).timeout_ms(20).build())
            .concurrency_limiter(window(1.0))
            .build();
        let controller = controller(config);

        let (inner, mut handle) = mock::pair::<&'static str, RunResult<()>>();
        let inner = MapErr::new(inner, |err: crate::Error| CallError::transport(err));
        let mut service = AdmissionService::new(inner, Arc::clone(&controller));

        handle.allow(1);
        let first = tokio::spawn(service.call(AdmissionRequest::new(request("sim"), "first")));
        let (body, respond) = handle.next_request().await.unwrap();
        assert_eq!(body, "first");

        let second = service
            .call(AdmissionRequest::new(request("sim"), "second"))
            .await;
        assert!(matches!(second, Err(AdmissionError::QueueTimeout { .. })));

        respond.send_response(RunResult::new((), ResponseMeta::ok()));
        first.await.unwrap().unwrap();
        assert_eq!(controller.limiter_state(&request("sim")).inflight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inner_failures_are_settled_and_returned() {
        let controller = controller(ControlConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let inner = service_fn(move |_: ()| -> Ready<Result<RunResult<()>, CallError>> {
            counter.fetch_add(1, Ordering::SeqCst);
            ready(Err(CallError::response(
                ResponseMeta::new(StatusCode::SERVICE_UNAVAILABLE),
                "overloaded",
            )))
        });
        let mut service = AdmissionService::new(inner, Arc::clone(&controller));

        let mut ready_check = tokio_test::task::spawn(service.ready());
        assert_ready_ok!(ready_check.poll());
        drop(ready_check);

        let err = service
            .call(AdmissionRequest::new(request("sim"), ()))
            .await
            .unwrap_err();
        assert_eq!(err.response_meta().unwrap().status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(controller.limiter_state(&request("sim")).rate < 500.0);
    }

    #[tokio::test(start_paused = true)]
    async fn service_futures_wait_for_capacity() {
        let config = ControlConfig::builder()
            .concurrency_limiter(window(1.0))
            .build();
        let controller = controller(config);
        let (inner, mut handle) = mock::pair::<(), RunResult<()>>();
        let inner = MapErr::new(inner, |err: crate::Error| CallError::transport(err));
        let mut service = AdmissionService::new(inner, Arc::clone(&controller));

        handle.allow(2);
        let first = tokio::spawn(service.call(AdmissionRequest::new(request("sim"), ())));
        let (_, respond) = handle.next_request().await.unwrap();

        let second = tokio::spawn(service.call(AdmissionRequest::new(request("sim"), ())));
        sleep(Duration::from_millis(5)).await;
        assert_eq!(controller.queue_len(), 1);

        respond.send_response(RunResult::new((), ResponseMeta::ok()));
        first.await.unwrap().unwrap();

        let (_, respond) = handle.next_request().await.unwrap();
        respond.send_response(RunResult::new((), ResponseMeta::ok()));
        second.await.unwrap().unwrap();
        assert_eq!(controller.queue_len(), 0);
    }
}
