use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

/// Builds a client with the crate user agent. Without `timeout` only connecting is
/// bounded, which is what long streamed uploads need.
pub(crate) fn build_client(timeout: Option<Duration>, connect: Duration) -> Result<Client, String> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("mdingest/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| err.to_string())?,
    );
    let mut builder = Client::builder()
        .default_headers(headers)
        .connect_timeout(connect);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().map_err(|err| err.to_string())
}

/// Sends the request built by `make_req`, retrying transient failures with a
/// linear backoff. Non-transient statuses are returned to the caller as-is.
pub(crate) async fn send_with_retries<F>(mut make_req: F) -> Result<Response, reqwest::Error>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match make_req().send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    tracing::debug!(status, attempt, "retrying request");
                    backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    tracing::debug!(error = %err, attempt, "retrying request");
                    backoff(attempt).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

async fn backoff(attempt: usize) {
    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
    tokio::time::sleep(Duration::from_millis(delay)).await;
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
