//! CommandRunner trait and the HTTP runner for the device execute endpoint.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::Client;

use crate::error::CommandError;

/// Body of a command response, chunk by chunk, as the device produces it.
pub type ResponseBody = Pin<Box<dyn Stream<Item = Result<Bytes, CommandError>> + Send>>;

/// Starts a command on the device. Enables fake injection for testing.
pub trait CommandRunner: Send + Sync + 'static {
    fn open(
        &self,
        command: &str,
    ) -> impl Future<Output = Result<ResponseBody, CommandError>> + Send;
}

const EXECUTE_PATH: &str = "/api/execute";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `POST /api/execute` with a form-encoded `command`; the response body grows
/// while the command runs.
#[derive(Debug, Clone)]
pub struct HttpCommandRunner {
    client: Client,
    endpoint: String,
}

impl HttpCommandRunner {
    pub fn new(base_url: &str) -> Result<Self, CommandError> {
        // No overall request timeout: stalls are the executor's watchdog's job.
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{EXECUTE_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CommandRunner for HttpCommandRunner {
    async fn open(&self, command: &str) -> Result<ResponseBody, CommandError> {
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("command", command)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommandError::Status {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(command, status = status.as_u16(), "command response started");
        Ok(Box::pin(response.bytes_stream().map_err(CommandError::from)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn collect(mut body: ResponseBody) -> String {
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.expect("chunk"));
        }
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn endpoint_from_base_url() {
        let runner = HttpCommandRunner::new("http://192.168.4.1/").expect("client");
        assert_eq!(runner.endpoint(), "http://192.168.4.1/api/execute");
    }

    #[tokio::test]
    async fn posts_form_encoded_command() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/execute"))
            .and(body_string("command=metrics+list+v.b"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v.b.soc 81%\n"))
            .expect(1)
            .mount(&server)
            .await;

        let runner = HttpCommandRunner::new(&server.uri()).expect("client");
        let body = runner.open("metrics list v.b").await.expect("open");
        assert_eq!(collect(body).await, "v.b.soc 81%\n");
    }

    #[tokio::test]
    async fn non_success_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/execute"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let runner = HttpCommandRunner::new(&server.uri()).expect("client");
        let err = match runner.open("stat").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        match err {
            CommandError::Status { status, body } => {
                assert_eq!(status, 401);
                assert_eq!(body, "Unauthorized");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_device_is_request_error() {
        let runner = HttpCommandRunner::new("http://127.0.0.1:1").expect("client");
        let err = match runner.open("stat").await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, CommandError::Request(_)));
    }
}
