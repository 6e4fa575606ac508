//! Provides an implementation for draining Pods from a Kubernetes Node, similar to `kubectl drain`.
//!
//! Draining in Kubernetes is done client side, and is typically a combination of "cordoning" a Node by
//! marking it as unschedulable, followed by deleting (or evicting, which is a distinct concept) Pods from the
//! Node. This implementation uses evictions, which respect PodDisruptionBudgets (PDBs).
//!
//! Cordoning is not handled here, because `kube-rs` provides `Api::cordon()`.
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, EvictParams, ListParams},
    Api, ResourceExt,
};
use snafu::{ensure, ResultExt};
use tokio::time::{sleep, timeout, Duration};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

// Maximum number of Pods to evict concurrently. Waiting for Pods to be deleted is included in this limitation.
const CONCURRENT_EVICTIONS: usize = 5;

// When waiting for a PodDisruptionBudget to be satisfied, or if there is a server error, we stall for a fixed rate between eviction attempts.
// `kubectl drain` similarly waits 5 seconds between eviction attempts.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

// After evictions are created, we wait for the Pods to be deleted by Kubernetes.
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

// Some errors while attempting evictions result in retries with exponential backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(20);
const NUM_RETRIES: usize = 10;

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Configures which Pods a drain may remove and how long it may take.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DrainOptions {
    /// Evict Pods which are not managed by a controller. These will not be recreated elsewhere.
    pub force: bool,
    /// Leave DaemonSet-managed Pods in place instead of refusing to drain.
    pub ignore_daemonsets: bool,
    /// Evict Pods using `emptyDir` volumes, whose data is lost.
    pub delete_emptydir_data: bool,
    /// Overrides each Pod's own termination grace period when set.
    pub grace_period_seconds: Option<u32>,
    /// Upper bound for the entire drain, including waiting for Pods to be deleted.
    pub timeout: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        DrainOptions {
            force: true,
            ignore_daemonsets: true,
            delete_emptydir_data: true,
            grace_period_seconds: None,
            timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl DrainOptions {
    fn evict_params(&self) -> EvictParams {
        EvictParams {
            delete_options: self.grace_period_seconds.map(|grace_period| DeleteParams {
                grace_period_seconds: Some(grace_period),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Wrapper struct to provide retry configurations for evictions.
struct RetryStrategy {}
impl RetryStrategy {
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(NUM_RETRIES)
    }
}

impl tokio_retry::Condition<error::EvictionError> for RetryStrategy {
    fn should_retry(&mut self, error: &error::EvictionError) -> bool {
        error.should_retry()
    }
}

/// What a drain does with a particular Pod.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PodDisposition {
    Evict,
    Skip(&'static str),
    Refuse(&'static str),
}

/// Drains a node of all pods.
///
/// Pods are selected as `kubectl drain` selects them, see [`pod_disposition`]. If any Pod on the node cannot be
/// drained under `options`, the drain fails before anything is evicted.
///
/// Evictions which keep failing, or Pods which are not deleted in time, fail the drain once the remaining evictions
/// have finished. Evictions in progress are abandoned when `options.timeout` elapses or `shutdown` is cancelled.
#[instrument(skip(k8s_client, shutdown), err)]
pub(crate) async fn drain_node(
    k8s_client: &kube::Client,
    node_name: &str,
    options: &DrainOptions,
    shutdown: &CancellationToken,
) -> Result<(), error::DrainError> {
    let target_pods = find_target_pods(k8s_client, node_name, options).await?;
    event!(
        Level::INFO,
        pod_count = target_pods.len(),
        "Evicting Pods from node."
    );

    let evictions = evict_pods(k8s_client, target_pods, options);

    let failed_pods = tokio::select! {
        failed_pods = timeout(options.timeout, evictions) => {
            failed_pods.map_err(|_| error::DrainError::Timeout {
                node_name: node_name.to_string(),
                max_wait: options.timeout,
            })?
        }
        _ = shutdown.cancelled() => {
            return error::CancelledSnafu { node_name }.fail();
        }
    };

    ensure!(
        failed_pods.is_empty(),
        error::EvictionsFailedSnafu {
            node_name,
            pod_names: failed_pods,
        }
    );
    Ok(())
}

/// Evicts each Pod and waits for its deletion, returning the names of the Pods which could not be removed.
async fn evict_pods(
    k8s_client: &kube::Client,
    target_pods: Vec<Pod>,
    options: &DrainOptions,
) -> Vec<String> {
    let evict_params = options.evict_params();
    stream::iter(target_pods)
        .map(|pod| {
            let evict_params = &evict_params;
            async move {
                match evict_pod(k8s_client, &pod, evict_params).await {
                    Ok(EvictionOutcome::AlreadyGone) => None,
                    Ok(EvictionOutcome::Evicted) => {
                        wait_for_deletion(k8s_client, &pod).await;
                        None
                    }
                    Err(_) => Some(pod.name_any()),
                }
            }
        })
        .buffer_unordered(CONCURRENT_EVICTIONS)
        .filter_map(futures::future::ready)
        .collect()
        .await
}

/// Finds all pods on a given node that are targeted for eviction during a drain.
#[instrument(skip(k8s_client, options), err)]
async fn find_target_pods(
    k8s_client: &kube::Client,
    node_name: &str,
    options: &DrainOptions,
) -> Result<Vec<Pod>, error::DrainError> {
    let pods: Api<Pod> = Api::all(k8s_client.clone());

    let node_pods = pods
        .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
        .await
        .context(error::FindTargetPodsSnafu { node_name })?;

    select_target_pods(node_name, node_pods.into_iter(), options)
}

fn select_target_pods<I: Iterator<Item = Pod>>(
    node_name: &str,
    pods: I,
    options: &DrainOptions,
) -> Result<Vec<Pod>, error::DrainError> {
    let mut targets = Vec::new();
    let mut refusals = Vec::new();

    for pod in pods {
        match pod_disposition(&pod, options) {
            PodDisposition::Evict => targets.push(pod),
            PodDisposition::Skip(reason) => {
                event!(Level::INFO, "Not draining Pod '{}': {}", pod.name_any(), reason);
            }
            PodDisposition::Refuse(reason) => {
                refusals.push(format!("{}: {}", pod.name_any(), reason));
            }
        }
    }

    ensure!(
        refusals.is_empty(),
        error::UnevictablePodsSnafu {
            node_name,
            reasons: refusals,
        }
    );
    Ok(targets)
}

/// Decides whether a drain evicts, skips, or is blocked by the given Pod.
///
/// * Completed Pods are always evicted.
/// * Mirror Pods are static and cannot be controlled, so they are skipped.
/// * DaemonSet Pods are skipped with `ignore_daemonsets`. The DaemonSet controller does not respect node cordons.
/// * Pods without a controller require `force`, since nothing will recreate them.
/// * Pods with `emptyDir` volumes require `delete_emptydir_data`.
fn pod_disposition(pod: &Pod, options: &DrainOptions) -> PodDisposition {
    let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref());
    if matches!(phase, Some("Failed") | Some("Succeeded")) {
        return PodDisposition::Evict;
    }

    if pod
        .metadata
        .annotations
        .as_ref()
        .map_or(false, |annotations| annotations.contains_key(MIRROR_POD_ANNOTATION))
    {
        return PodDisposition::Skip("Pod is a static Mirror Pod");
    }

    let controller = pod.metadata.owner_references.as_ref().and_then(|references| {
        references
            .iter()
            .find(|reference| reference.controller == Some(true))
    });

    match controller {
        Some(reference) if reference.kind == "DaemonSet" => {
            return if options.ignore_daemonsets {
                PodDisposition::Skip("Pod is member of a DaemonSet")
            } else {
                PodDisposition::Refuse("Pod is member of a DaemonSet")
            };
        }
        None if !options.force => {
            return PodDisposition::Refuse("Pod is not managed by a controller");
        }
        _ => {}
    }

    let uses_empty_dir = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map_or(false, |volumes| {
            volumes.iter().any(|volume| volume.empty_dir.is_some())
        });
    if uses_empty_dir && !options.delete_emptydir_data {
        return PodDisposition::Refuse("Pod uses local storage (emptyDir)");
    }

    PodDisposition::Evict
}

enum EvictionOutcome {
    Evicted,
    AlreadyGone,
}

#[instrument(skip(k8s_client, pod, evict_params), fields(pod = %pod.name_any()), err)]
/// Create an eviction for the desired Pod.
async fn evict_pod(
    k8s_client: &kube::Client,
    pod: &Pod,
    evict_params: &EvictParams,
) -> Result<EvictionOutcome, error::EvictionError> {
    let pod_api = namespaced_pod_api(k8s_client, pod);
    let pod_name = pod.name_any();

    // When evicting a node, a 429 (TOO_MANY_REQUESTS) response code is used to indicate that we must wait to allow a
    // PodDisruptionBudget (PDB) to be satisfied. If there is some kind of misconfiguration (e.g. multiple PDBs that
    // refer to the same Pod), you get a 500. Both are retried until the drain times out.
    RetryIf::spawn(
        RetryStrategy::retry_strategy(),
        || async {
            loop {
                event!(Level::INFO, "Attempting to evict pod {}", &pod_name);
                match pod_api.evict(&pod_name, evict_params).await {
                    Ok(_) => {
                        event!(Level::INFO, "Successfully evicted Pod '{}'", pod_name);
                        return Ok(EvictionOutcome::Evicted);
                    }
                    Err(kube::Error::Api(e)) if e.code == 429 => {
                        event!(
                            Level::WARN,
                            "Too many requests when creating Eviction for Pod '{}': '{}'. This is likely due to respecting a Pod Disruption Budget. Retrying in {:.2}s.",
                            pod_name,
                            e,
                            EVICTION_RETRY_INTERVAL.as_secs_f64()
                        );
                        sleep(EVICTION_RETRY_INTERVAL).await;
                    }
                    Err(kube::Error::Api(e)) if e.code == 500 => {
                        event!(
                            Level::WARN,
                            "Error when evicting Pod '{}': '{}'. Check for misconfigured PodDisruptionBudgets. Retrying in {:.2}s.",
                            pod_name,
                            e,
                            EVICTION_RETRY_INTERVAL.as_secs_f64()
                        );
                        sleep(EVICTION_RETRY_INTERVAL).await;
                    }
                    Err(kube::Error::Api(e)) if e.code == 404 => {
                        event!(Level::INFO, "Pod '{}' no longer exists.", pod_name);
                        return Ok(EvictionOutcome::AlreadyGone);
                    }
                    Err(kube::Error::Api(e)) if e.code == 403 => {
                        // An eviction request in a deleting namespace will throw a forbidden error.
                        return Err(error::EvictionError::NonRetriableEviction {
                            source: kube::Error::Api(e),
                            pod_name: pod_name.clone(),
                        });
                    }
                    Err(e) => {
                        event!(Level::ERROR, "Eviction failed: '{}'. Retrying...", e);
                        return Err(error::EvictionError::RetriableEviction {
                            source: e,
                            pod_name: pod_name.clone(),
                        });
                    }
                }
            }
        },
        RetryStrategy {},
    )
    .await
}

/// Wait for the given Pod to be deleted by Kubernetes.
///
/// This has no deadline of its own; it is bounded by the timeout of the drain.
async fn wait_for_deletion(k8s_client: &kube::Client, pod: &Pod) {
    let pod_api = namespaced_pod_api(k8s_client, pod);
    let pod_name = pod.name_any();
    loop {
        match pod_api.get(&pod_name).await {
            Err(kube::Error::Api(e)) if e.code == 404 => {
                event!(Level::INFO, "Pod {} deleted.", pod_name);
                return;
            }
            // A Pod with the same name but a different UID is a replacement; the evicted Pod is gone.
            Ok(current) if current.metadata.uid != pod.metadata.uid => {
                event!(Level::INFO, "Pod {} deleted.", pod_name);
                return;
            }
            Ok(_) => {
                event!(
                    Level::DEBUG,
                    "Pod '{}' not yet deleted. Waiting {}s.",
                    pod_name,
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
            Err(e) => {
                event!(
                    Level::ERROR,
                    "Could not determine if Pod '{}' has been deleted: '{}'. Waiting {}s.",
                    pod_name,
                    e,
                    DELETION_CHECK_INTERVAL.as_secs_f64()
                );
            }
        }
        sleep(DELETION_CHECK_INTERVAL).await;
    }
}

/// Creates a kube::Api<Pod> for interacting with Pods in the namespace associated with the given Pod.
fn namespaced_pod_api(k8s_client: &kube::Client, pod: &Pod) -> Api<Pod> {
    match pod.metadata.namespace.as_ref() {
        Some(ns) => Api::namespaced(k8s_client.clone(), ns),
        None => Api::default_namespaced(k8s_client.clone()),
    }
}

pub mod error {
    use snafu::Snafu;
    use tokio::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("Unable to find drainable Pods for Node '{}': '{}'", node_name, source))]
        FindTargetPods {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Node '{}' has Pods which cannot be drained: {}", node_name, reasons.join(", ")))]
        UnevictablePods {
            node_name: String,
            reasons: Vec<String>,
        },

        #[snafu(display("Failed to evict Pods from Node '{}': {}", node_name, pod_names.join(", ")))]
        EvictionsFailed {
            node_name: String,
            pod_names: Vec<String>,
        },

        #[snafu(display("Node '{}' was not drained in the time allocated ({:.2}s).", node_name, max_wait.as_secs_f64()))]
        Timeout {
            node_name: String,
            max_wait: Duration,
        },

        #[snafu(display("Drain of Node '{}' was cancelled by shutdown.", node_name))]
        Cancelled { node_name: String },
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum EvictionError {
        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// An error occurred while attempting to evict a Pod. This may result in an attempt to retry the eviction.
        RetriableEviction {
            source: kube::Error,
            pod_name: String,
        },

        #[snafu(display("Unable to create eviction for Pod '{}': '{}'", pod_name, source))]
        /// A fatal error occurred while attempting to evict a Pod. This will not be retried.
        NonRetriableEviction {
            source: kube::Error,
            pod_name: String,
        },
    }

    impl EvictionError {
        pub fn should_retry(&self) -> bool {
            match self {
                Self::RetriableEviction { .. } => true,
                Self::NonRetriableEviction { .. } => false,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use http::{Method, Request, Response, StatusCode};
    use hyper::Body;
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, PodSpec, PodStatus, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use maplit::btreemap;
    use serde_json::json;
    use tower_test::mock::{self, Handle};

    const NODE_NAME: &str = "node-a";
    const PODS_PATH: &str = "/api/v1/pods";
    const WEB_EVICTION_PATH: &str = "/api/v1/namespaces/default/pods/web/eviction";
    const WEB_POD_PATH: &str = "/api/v1/namespaces/default/pods/web";

    type ApiServerHandle = Handle<Request<Body>, Response<Body>>;

    /// A `kube::Client` whose requests are answered through the returned handle.
    fn mock_client() -> (kube::Client, ApiServerHandle) {
        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        (kube::Client::new(mock_service, "default"), handle)
    }

    fn status_body(code: u16, reason: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": if code < 300 { "Success" } else { "Failure" },
            "message": format!("{} from the API server", reason),
            "reason": reason,
            "code": code,
        })
    }

    /// Answers the next request, which must be `method` on `path`.
    async fn respond(
        handle: &mut ApiServerHandle,
        method: Method,
        path: &str,
        status: StatusCode,
        body: serde_json::Value,
    ) {
        let (request, send) = handle.next_request().await.expect("service not called");
        assert_eq!(request.method(), method);
        assert_eq!(request.uri().path(), path);
        send.send_response(
            Response::builder()
                .status(status)
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        );
    }

    async fn respond_with_pods(handle: &mut ApiServerHandle, pods: Vec<Pod>) {
        let pod_list = json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": { "resourceVersion": "1" },
            "items": pods,
        });
        respond(handle, Method::GET, PODS_PATH, StatusCode::OK, pod_list).await;
    }

    async fn respond_to_eviction(handle: &mut ApiServerHandle, status: StatusCode) {
        let body = status_body(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
        );
        respond(handle, Method::POST, WEB_EVICTION_PATH, status, body).await;
    }

    /// Asserts that no further requests arrive once every client is dropped.
    async fn assert_no_more_requests(mut handle: ApiServerHandle) {
        assert!(handle.next_request().await.is_none());
    }

    fn web_pod() -> Pod {
        let mut web = pod("web", Some("ReplicaSet"));
        web.metadata.uid = Some("web-uid".to_string());
        web
    }

    fn pod(name: &str, controller_kind: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                owner_references: controller_kind.map(|kind| {
                    vec![OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: kind.to_string(),
                        name: format!("{}-owner", name),
                        uid: "owner-uid".to_string(),
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn with_empty_dir(mut pod: Pod) -> Pod {
        pod.spec = Some(PodSpec {
            volumes: Some(vec![Volume {
                name: "scratch".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn strict_options() -> DrainOptions {
        DrainOptions {
            force: false,
            ignore_daemonsets: false,
            delete_emptydir_data: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_options() {
        let options = DrainOptions::default();
        assert!(options.force);
        assert!(options.ignore_daemonsets);
        assert!(options.delete_emptydir_data);
        assert_eq!(options.grace_period_seconds, None);
        assert_eq!(options.timeout, Duration::from_secs(60));
        assert!(options.evict_params().delete_options.is_none());
    }

    #[test]
    fn test_grace_period_override() {
        let options = DrainOptions {
            grace_period_seconds: Some(15),
            ..Default::default()
        };
        let delete_options = options.evict_params().delete_options.unwrap();
        assert_eq!(delete_options.grace_period_seconds, Some(15));
    }

    #[test]
    fn test_pod_disposition_with_default_options() {
        let options = DrainOptions::default();

        let mut mirror = pod("mirror", None);
        mirror.metadata.annotations = Some(btreemap! {
            MIRROR_POD_ANNOTATION.to_string() => "abc".to_string(),
        });

        let test_cases = vec![
            (pod("replica", Some("ReplicaSet")), PodDisposition::Evict),
            (pod("bare", None), PodDisposition::Evict),
            (
                with_empty_dir(pod("cache", Some("StatefulSet"))),
                PodDisposition::Evict,
            ),
            (
                pod("logger", Some("DaemonSet")),
                PodDisposition::Skip("Pod is member of a DaemonSet"),
            ),
            (mirror, PodDisposition::Skip("Pod is a static Mirror Pod")),
        ];

        for (pod, expected) in test_cases {
            assert_eq!(pod_disposition(&pod, &options), expected, "{:?}", pod.metadata.name);
        }
    }

    #[test]
    fn test_pod_disposition_with_strict_options() {
        let options = strict_options();

        let mut completed = pod("job-run", None);
        completed.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });

        let test_cases = vec![
            (pod("replica", Some("ReplicaSet")), PodDisposition::Evict),
            (completed, PodDisposition::Evict),
            (
                pod("bare", None),
                PodDisposition::Refuse("Pod is not managed by a controller"),
            ),
            (
                with_empty_dir(pod("cache", Some("StatefulSet"))),
                PodDisposition::Refuse("Pod uses local storage (emptyDir)"),
            ),
            (
                pod("logger", Some("DaemonSet")),
                PodDisposition::Refuse("Pod is member of a DaemonSet"),
            ),
        ];

        for (pod, expected) in test_cases {
            assert_eq!(pod_disposition(&pod, &options), expected, "{:?}", pod.metadata.name);
        }
    }

    #[test]
    fn test_select_target_pods() {
        let pods = vec![
            pod("replica", Some("ReplicaSet")),
            pod("logger", Some("DaemonSet")),
            pod("bare", None),
        ];

        let targets =
            select_target_pods("node-a", pods.clone().into_iter(), &DrainOptions::default())
                .unwrap();
        let names: Vec<_> = targets.iter().map(|pod| pod.name_any()).collect();
        assert_eq!(names, vec!["replica".to_string(), "bare".to_string()]);

        let refused = select_target_pods("node-a", pods.into_iter(), &strict_options());
        match refused {
            Err(error::DrainError::UnevictablePods { node_name, reasons }) => {
                assert_eq!(node_name, "node-a");
                assert_eq!(
                    reasons,
                    vec![
                        "logger: Pod is member of a DaemonSet".to_string(),
                        "bare: Pod is not managed by a controller".to_string(),
                    ]
                );
            }
            other => panic!("Expected UnevictablePods, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_retries_disruption_budget_rejections() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            respond_with_pods(&mut handle, vec![web_pod()]).await;
            respond_to_eviction(&mut handle, StatusCode::TOO_MANY_REQUESTS).await;
            respond_to_eviction(&mut handle, StatusCode::INTERNAL_SERVER_ERROR).await;
            respond_to_eviction(&mut handle, StatusCode::CREATED).await;
            respond(
                &mut handle,
                Method::GET,
                WEB_POD_PATH,
                StatusCode::NOT_FOUND,
                status_body(404, "NotFound"),
            )
            .await;
            assert_no_more_requests(handle).await;
        });

        drain_node(
            &client,
            NODE_NAME,
            &DrainOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_counts_missing_pod_as_evicted() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            respond_with_pods(&mut handle, vec![web_pod()]).await;
            respond_to_eviction(&mut handle, StatusCode::NOT_FOUND).await;
            assert_no_more_requests(handle).await;
        });

        drain_node(
            &client,
            NODE_NAME,
            &DrainOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_does_not_retry_forbidden_eviction() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            respond_with_pods(&mut handle, vec![web_pod()]).await;
            respond_to_eviction(&mut handle, StatusCode::FORBIDDEN).await;
            assert_no_more_requests(handle).await;
        });

        let result = drain_node(
            &client,
            NODE_NAME,
            &DrainOptions::default(),
            &CancellationToken::new(),
        )
        .await;
        match result {
            Err(error::DrainError::EvictionsFailed {
                node_name,
                pod_names,
            }) => {
                assert_eq!(node_name, NODE_NAME);
                assert_eq!(pod_names, vec!["web".to_string()]);
            }
            other => panic!("Expected EvictionsFailed, got {:?}", other),
        }
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            respond_with_pods(&mut handle, vec![web_pod()]).await;
            // The disruption budget never allows the eviction.
            while let Some((request, send)) = handle.next_request().await {
                assert_eq!(request.uri().path(), WEB_EVICTION_PATH);
                send.send_response(
                    Response::builder()
                        .status(StatusCode::TOO_MANY_REQUESTS)
                        .body(Body::from(
                            serde_json::to_vec(&status_body(429, "TooManyRequests")).unwrap(),
                        ))
                        .unwrap(),
                );
            }
        });

        let options = DrainOptions {
            timeout: Duration::from_secs(20),
            ..Default::default()
        };
        let result = drain_node(&client, NODE_NAME, &options, &CancellationToken::new()).await;
        match result {
            Err(error::DrainError::Timeout {
                node_name,
                max_wait,
            }) => {
                assert_eq!(node_name, NODE_NAME);
                assert_eq!(max_wait, Duration::from_secs(20));
            }
            other => panic!("Expected Timeout, got {:?}", other),
        }
        drop(client);
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let (client, mut handle) = mock_client();
        let server = tokio::spawn(async move {
            respond_with_pods(&mut handle, vec![web_pod()]).await;
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.uri().path(), WEB_EVICTION_PATH);
            // Shutdown arrives while the eviction is in flight. The response is never sent.
            server_shutdown.cancel();
            drop(send);
            let mut later_requests = 0;
            while handle.next_request().await.is_some() {
                later_requests += 1;
            }
            assert!(later_requests <= 1);
        });

        let result = drain_node(&client, NODE_NAME, &DrainOptions::default(), &shutdown).await;
        assert!(matches!(
            result,
            Err(error::DrainError::Cancelled { node_name }) if node_name == NODE_NAME
        ));
        drop(client);
        server.await.unwrap();
    }
}
