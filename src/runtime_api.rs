use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use crate::errors::ReportableError;

pub const API_VERSION: &str = "2018-06-01";

const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";
const RESPONSE_MODE_HEADER: &str = "Lambda-Runtime-Function-Response-Mode";
const STREAMING_CONTENT_TYPE: &str = "application/vnd.awslambda.http-integration-response";

#[derive(Clone)]
pub struct RuntimeApiClient {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug)]
pub struct NextInvocation {
    pub request_id: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RuntimeApiClient {
    pub fn new(base_url: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().http1_only().build()?;
        Ok(Self { base_url, http })
    }

    /// Long-poll for the next invocation. Blocks until the control plane has
    /// a work item; a transport failure or non-2xx here is fatal to the loop
    /// and is never retried internally.
    pub async fn next_invocation(&self) -> anyhow::Result<NextInvocation> {
        let url = format!("{}/{API_VERSION}/runtime/invocation/next", self.base_url);
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("/next failed (status {status})");
        }

        let headers = resp.headers().clone();
        let request_id = headers
            .get("Lambda-Runtime-Aws-Request-Id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow::anyhow!("/next response missing Lambda-Runtime-Aws-Request-Id"))?
            .to_string();

        let body = resp.bytes().await?;

        Ok(NextInvocation {
            request_id,
            headers,
            body,
        })
    }

    /// Post a buffered result as JSON.
    pub async fn post_result(
        &self,
        request_id: &str,
        value: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/{API_VERSION}/runtime/invocation/{request_id}/response",
            self.base_url
        );
        let resp = self.http.post(url).json(value).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("posting invocation response failed (status {status})");
        }
        Ok(())
    }

    /// Open the chunked streaming response for one invocation. Frames sent
    /// on the returned channel become the response body; dropping the sender
    /// closes it. The join handle resolves once the control plane accepted
    /// (or rejected) the full body.
    pub fn start_streaming_response(
        &self,
        request_id: String,
        capacity: usize,
    ) -> (
        mpsc::Sender<Bytes>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let url = format!(
            "{}/{API_VERSION}/runtime/invocation/{request_id}/response",
            self.base_url
        );

        let client = self.http.clone();
        let (tx, rx) = mpsc::channel::<Bytes>(capacity.max(1));

        let join = tokio::spawn(async move {
            let body_stream = ReceiverStream::new(rx).map(Ok::<Bytes, std::convert::Infallible>);
            let resp = client
                .post(url)
                .header(RESPONSE_MODE_HEADER, "streaming")
                .header("Transfer-Encoding", "chunked")
                .header("Content-Type", STREAMING_CONTENT_TYPE)
                .body(reqwest::Body::wrap_stream(body_stream))
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                anyhow::bail!("posting streamed response failed (status {status})");
            }

            Ok(())
        });

        (tx, join)
    }

    /// Report an error that occurred during a specific invocation.
    pub async fn post_invocation_error(
        &self,
        request_id: &str,
        error: &ReportableError,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/{API_VERSION}/runtime/invocation/{request_id}/error",
            self.base_url
        );
        let resp = self
            .http
            .post(url)
            .header(ERROR_TYPE_HEADER, &error.error_type)
            .json(error)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("posting invocation error failed (status {status})");
        }
        Ok(())
    }

    /// Report a failure that occurred before any invocation was received.
    pub async fn post_init_error(&self, error: &ReportableError) -> anyhow::Result<()> {
        let url = format!("{}/{API_VERSION}/runtime/init/error", self.base_url);
        let resp = self
            .http
            .post(url)
            .header(ERROR_TYPE_HEADER, &error.error_type)
            .json(error)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("posting init error failed (status {status})");
        }
        Ok(())
    }
}
