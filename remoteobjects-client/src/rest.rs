use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::{multipart, Client as HttpClient, Response};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, trace};

use remoteobjects_core::{Error, PROTOCOL_VERSION};

/// Structured bodies are JSON-encoded; raw payloads travel as octet
/// streams with an explicit length.
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
}

/// Low-level HTTP verb wrapper over the remote-object endpoints.
///
/// Every non-2xx response is fatal for that call: the `{error}` envelope
/// is parsed back into a typed [`Error`] and no retry is attempted.
#[derive(Debug, Clone)]
pub struct RestClient {
    server_uri: String,
    http: HttpClient,
}

impl RestClient {
    pub fn new(server_uri: &str) -> Result<Self, Error> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| Error::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(RestClient {
            server_uri: server_uri.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn server_uri(&self) -> &str {
        &self.server_uri
    }

    /// Fetch the server's protocol version and require an exact match.
    pub fn confirm_server_version(&self) -> Result<(), Error> {
        let reply = self.get("remoteobjects/version", &[], RequestBody::Empty)?;
        let version = reply
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch(format!(
                "server's version `{version}` != `{PROTOCOL_VERSION}`"
            )));
        }
        Ok(())
    }

    pub fn get(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        body: RequestBody,
    ) -> Result<Value, Error> {
        self.request(Method::GET, endpoint, params, body)
    }

    pub fn put(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        body: RequestBody,
    ) -> Result<Value, Error> {
        self.request(Method::PUT, endpoint, params, body)
    }

    pub fn post(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        body: RequestBody,
    ) -> Result<Value, Error> {
        self.request(Method::POST, endpoint, params, body)
    }

    pub fn patch(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        body: RequestBody,
    ) -> Result<Value, Error> {
        self.request(Method::PATCH, endpoint, params, body)
    }

    pub fn delete(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        body: RequestBody,
    ) -> Result<Value, Error> {
        self.request(Method::DELETE, endpoint, params, body)
    }

    /// Multipart file upload, the only body form that is not JSON or a
    /// raw byte stream.
    pub fn put_multipart(
        &self,
        endpoint: &str,
        files: &[(String, PathBuf)],
    ) -> Result<Value, Error> {
        let mut form = multipart::Form::new();
        for (file_key, path) in files {
            form = form.file(file_key.clone(), path).map_err(|err| {
                Error::Transport(format!("failed to read `{}`: {err}", path.display()))
            })?;
        }
        let url = self.url(endpoint);
        debug!(%url, files = files.len(), "PUT multipart");
        let response = self
            .http
            .put(&url)
            .multipart(form)
            .send()
            .map_err(|err| Error::Transport(err.to_string()))?;
        Self::parse_response(response)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.server_uri, endpoint)
    }

    fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, &str)],
        body: RequestBody,
    ) -> Result<Value, Error> {
        let url = self.url(endpoint);
        debug!(%method, %url, "issuing request");
        let mut builder = self.http.request(method, &url).query(params);
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => {
                let encoded = serde_json::to_string(&value)
                    .map_err(|err| Error::Transport(format!("failed to encode body: {err}")))?;
                builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(encoded)
            }
            RequestBody::Bytes(data) => builder
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, data.len())
                .body(data),
        };
        let response = builder
            .send()
            .map_err(|err| Error::Transport(err.to_string()))?;
        Self::parse_response(response)
    }

    fn parse_response(response: Response) -> Result<Value, Error> {
        let status = response.status();
        let text = response
            .text()
            .map_err(|err| Error::Transport(format!("failed to read response body: {err}")))?;
        trace!(%status, body = %text, "response");
        let reply: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !status.is_success() {
            // A failed call may still carry captured log output.
            if let Some(logs) = reply.get("logs").and_then(Value::as_str) {
                if !logs.is_empty() {
                    print!("{logs}");
                }
            }
            return Err(match reply.get("error").and_then(Value::as_str) {
                Some(envelope) => Error::from_envelope(envelope),
                None => Error::Transport(format!("HTTP {status}: {text}")),
            });
        }
        Ok(reply)
    }
}
