//! HTTP transport seam
//!
//! The credential cache and API client speak to the network through
//! [`HttpTransport`]. Production uses synchronous HTTP (ureq) so the engine
//! stays executor-agnostic; tests substitute scripted transports.

use std::time::Duration;

use ureq::Agent;

use crate::error::TransportError;

/// Raw HTTP reply: status code plus body text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP operations the engine needs
///
/// Non-2xx statuses are returned as replies, not errors. Errors are reserved
/// for failures where no status was received.
pub trait HttpTransport: Send + Sync {
    /// GET `url` with query parameters and headers
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(&str, String)],
    ) -> Result<HttpReply, TransportError>;

    /// POST an urlencoded form to `url`
    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, TransportError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(&str, String)],
    ) -> Result<HttpReply, TransportError> {
        (**self).get(url, query, headers)
    }

    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, TransportError> {
        (**self).post_form(url, form)
    }
}

/// ureq-backed transport with a global per-request timeout
pub struct UreqTransport {
    agent: Agent,
}

impl UreqTransport {
    /// Create a transport whose requests are bounded by `timeout`
    pub fn new(timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();

        Self {
            agent: Agent::new_with_config(config),
        }
    }

    fn read_reply(mut response: ureq::http::Response<ureq::Body>) -> Result<HttpReply, TransportError> {
        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(map_ureq_error)?;
        Ok(HttpReply { status, body })
    }
}

impl HttpTransport for UreqTransport {
    fn get(
        &self,
        url: &str,
        query: &[(String, String)],
        headers: &[(&str, String)],
    ) -> Result<HttpReply, TransportError> {
        let mut request = self.agent.get(url);
        for (key, value) in query {
            request = request.query(key, value);
        }
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.call().map_err(map_ureq_error)?;
        Self::read_reply(response)
    }

    fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpReply, TransportError> {
        let response = self
            .agent
            .post(url)
            .send_form(form.iter().copied())
            .map_err(map_ureq_error)?;
        Self::read_reply(response)
    }
}

fn map_ureq_error(err: ureq::Error) -> TransportError {
    match err {
        ureq::Error::Timeout(_) => TransportError::Timeout,
        other => TransportError::Io(other.to_string()),
    }
}
