/*!
metadata is a client for the instance metadata service of the infrastructure platform.

The metadata service is reachable from every VM at a link-local address. It serves the identity of the VM and the
scheduled-events feed, and accepts acknowledgements which allow a scheduled event to start before its `NotBefore`
time. Every request must carry the `Metadata: true` header.
*/

use models::maintenance::EventDocument;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use tokio::sync::OnceCell;
use tokio::time::Duration;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{event, instrument, Level};

const INSTANCE_PATH: &str = "/metadata/instance";
const INSTANCE_API_VERSION: &str = "2020-09-01";
const SCHEDULED_EVENTS_PATH: &str = "/metadata/scheduledevents";
const SCHEDULED_EVENTS_API_VERSION: &str = "2019-08-01";
const METADATA_HEADER: &str = "Metadata";
const METADATA_HEADER_VALUE: &str = "true";

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://169.254.169.254";

// Calls to the metadata service use exponential backoff.
// These values configure how long to delay between tries.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const NUM_RETRIES: usize = 5;

/// The module-wide result type.
pub type Result<T> = std::result::Result<T, metadata_error::Error>;

#[async_trait]
/// Read and acknowledge calls against the metadata service. This is provided as a trait so that the poller can be
/// tested without a metadata service.
pub trait MetadataClient: Send + Sync {
    /// Returns the platform's name for the VM this process runs on. The name is resolved once and cached.
    async fn resolve_self(&self) -> Result<String>;
    /// Retrieves the complete scheduled-events document.
    async fn fetch_events(&self) -> Result<EventDocument>;
    /// Retrieves the scheduled-events document, keeping only the events which affect this VM.
    async fn fetch_self_events(&self) -> Result<EventDocument>;
    /// Allows the given events to start. Stops at the first event which cannot be acknowledged.
    async fn acknowledge(&self, event_ids: &[String]) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct InstanceMetadata {
    compute: Compute,
}

#[derive(Debug, Deserialize)]
struct Compute {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ScheduledEventsAck<'a> {
    start_requests: Vec<StartRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    #[serde(rename = "EventId")]
    event_id: &'a str,
}

/// HTTP client for the instance metadata service.
#[derive(Debug)]
pub struct ImdsClient {
    http_client: reqwest::Client,
    endpoint: String,
    num_retries: usize,
    self_name: OnceCell<String>,
}

impl ImdsClient {
    /// Creates a client for the metadata service at `endpoint`. Every request fails after `request_timeout`.
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            // The metadata service is link-local and must never be reached through a proxy.
            .no_proxy()
            .build()
            .context(metadata_error::HttpClientCreateSnafu)?;

        Ok(ImdsClient {
            http_client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            num_retries: NUM_RETRIES,
            self_name: OnceCell::new(),
        })
    }

    /// Sets how many times a failed request is retried before its error is returned.
    pub fn with_retries(mut self, num_retries: usize) -> Self {
        self.num_retries = num_retries;
        self
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(self.num_retries)
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.endpoint, path, api_version)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        api_version: &str,
    ) -> std::result::Result<T, metadata_error::RequestError> {
        let url = self.url(path, api_version);
        let response = self
            .http_client
            .get(&url)
            .header(METADATA_HEADER, METADATA_HEADER_VALUE)
            .send()
            .await
            .context(metadata_error::SendSnafu { url: &url })?;

        let body = read_success_body(response, &url).await?;
        serde_json::from_str(&body).context(metadata_error::DecodeSnafu { url, body })
    }

    async fn post_start_request(
        &self,
        event_id: &str,
    ) -> std::result::Result<(), metadata_error::RequestError> {
        let url = self.url(SCHEDULED_EVENTS_PATH, SCHEDULED_EVENTS_API_VERSION);
        let response = self
            .http_client
            .post(&url)
            .header(METADATA_HEADER, METADATA_HEADER_VALUE)
            .json(&ScheduledEventsAck {
                start_requests: vec![StartRequest { event_id }],
            })
            .send()
            .await
            .context(metadata_error::SendSnafu { url: &url })?;

        read_success_body(response, &url).await.map(|_| ())
    }
}

/// Reads the body of a response, failing if the response does not indicate success.
async fn read_success_body(
    response: reqwest::Response,
    url: &str,
) -> std::result::Result<String, metadata_error::RequestError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .context(metadata_error::ReadBodySnafu { url })?;
    ensure!(
        status.is_success(),
        metadata_error::StatusSnafu { url, status, body }
    );
    Ok(body)
}

#[async_trait]
impl MetadataClient for ImdsClient {
    #[instrument(skip(self), err)]
    async fn resolve_self(&self) -> Result<String> {
        self.self_name
            .get_or_try_init(|| async {
                let instance: InstanceMetadata = Retry::spawn(self.retry_strategy(), || {
                    self.get_json(INSTANCE_PATH, INSTANCE_API_VERSION)
                })
                .await
                .context(metadata_error::IdentityUnavailableSnafu)?;

                ensure!(
                    !instance.compute.name.is_empty(),
                    metadata_error::IdentityMissingSnafu
                );
                event!(Level::INFO, name = %instance.compute.name, "Resolved VM identity.");
                Ok::<_, metadata_error::Error>(instance.compute.name)
            })
            .await
            .cloned()
    }

    #[instrument(skip(self), err)]
    async fn fetch_events(&self) -> Result<EventDocument> {
        Retry::spawn(self.retry_strategy(), || {
            self.get_json(SCHEDULED_EVENTS_PATH, SCHEDULED_EVENTS_API_VERSION)
        })
        .await
        .context(metadata_error::TransientFetchSnafu)
    }

    #[instrument(skip(self), err)]
    async fn fetch_self_events(&self) -> Result<EventDocument> {
        let self_name = self.resolve_self().await?;
        let document = self.fetch_events().await?;
        Ok(document.for_resource(&self_name))
    }

    #[instrument(skip(self), err)]
    async fn acknowledge(&self, event_ids: &[String]) -> Result<()> {
        for (acknowledged, event_id) in event_ids.iter().enumerate() {
            Retry::spawn(self.retry_strategy(), || self.post_start_request(event_id))
                .await
                .context(metadata_error::TransientAckSnafu {
                    event_id,
                    acknowledged,
                })?;
            event!(Level::INFO, %event_id, "Acknowledged scheduled event.");
        }
        Ok(())
    }
}

pub mod metadata_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum RequestError {
        #[snafu(display("Unable to send request to '{}': '{}'", url, source))]
        Send { source: reqwest::Error, url: String },

        #[snafu(display("Unable to read response from '{}': '{}'", url, source))]
        ReadBody { source: reqwest::Error, url: String },

        #[snafu(display("Metadata service responded to '{}' with {}: '{}'", url, status, body))]
        Status {
            url: String,
            status: reqwest::StatusCode,
            body: String,
        },

        #[snafu(display("Cannot parse response from '{}': '{}'\n{}", url, source, body))]
        Decode {
            source: serde_json::Error,
            url: String,
            body: String,
        },
    }

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to create HTTP client: '{}'", source))]
        HttpClientCreate { source: reqwest::Error },

        #[snafu(display("Unable to resolve the identity of this VM: '{}'", source))]
        IdentityUnavailable { source: RequestError },

        #[snafu(display("Instance metadata does not contain a compute name."))]
        IdentityMissing,

        #[snafu(display("Unable to fetch scheduled events: '{}'", source))]
        TransientFetch { source: RequestError },

        #[snafu(display(
            "Unable to acknowledge scheduled event '{}' after acknowledging {} event(s): '{}'",
            event_id,
            acknowledged,
            source
        ))]
        TransientAck {
            source: RequestError,
            event_id: String,
            acknowledged: usize,
        },
    }
}
