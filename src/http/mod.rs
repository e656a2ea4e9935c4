use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::blocking::{Body, Client, ClientBuilder};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode, Url};

use crate::blob::Blob;

/// Value of an `Authorization` header.
#[derive(Clone, PartialEq, Eq)]
pub struct Authorization {
    scheme: String,
    token: String,
}

impl Authorization {
    pub fn from_bearer_token(token: impl Into<String>) -> Authorization {
        Authorization {
            scheme: "Bearer".to_string(),
            token: token.into(),
        }
    }

    pub fn from_basic_credentials(username: &str, secret: &str) -> Authorization {
        Authorization::from_basic_token(STANDARD.encode(format!("{}:{}", username, secret)))
    }

    /// `token` is the already encoded `username:secret` pair.
    pub fn from_basic_token(token: impl Into<String>) -> Authorization {
        Authorization {
            scheme: "Basic".to_string(),
            token: token.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Display for Authorization {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.scheme, self.token)
    }
}

// Tokens stay out of logs.
impl Debug for Authorization {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Authorization({} <redacted>)", self.scheme)
    }
}

pub type ByteCountCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Passes reads through, reporting the size of every chunk read.
pub struct NotifyingReader<R: Read> {
    inner: R,
    callback: Option<ByteCountCallback>,
}

impl<R: Read> NotifyingReader<R> {
    pub fn new(inner: R, callback: Option<ByteCountCallback>) -> NotifyingReader<R> {
        NotifyingReader { inner, callback }
    }
}

impl<R: Read> Read for NotifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            if let Some(callback) = &self.callback {
                callback(read as u64);
            }
        }
        Ok(read)
    }
}

/// A request body backed by a [`Blob`]. The blob is reopened for every send so
/// a request can be retried after authentication.
#[derive(Clone)]
pub struct BlobHttpContent {
    blob: Arc<Blob>,
    content_type: String,
    written_callback: Option<ByteCountCallback>,
}

impl BlobHttpContent {
    pub fn new(blob: Arc<Blob>, content_type: impl Into<String>, written_callback: Option<ByteCountCallback>) -> BlobHttpContent {
        BlobHttpContent {
            blob,
            content_type: content_type.into(),
            written_callback,
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> BlobHttpContent {
        BlobHttpContent::new(Arc::new(Blob::from_bytes(bytes)), content_type, None)
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    fn to_body(&self) -> io::Result<Body> {
        let (reader, length) = self.blob.open_reader()?;
        let reader = NotifyingReader::new(reader, self.written_callback.clone());
        Ok(Body::sized(reader, length))
    }
}

impl Debug for BlobHttpContent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobHttpContent")
            .field("blob", &self.blob)
            .field("content_type", &self.content_type)
            .finish()
    }
}

#[derive(Debug, Default, Clone)]
pub struct Request {
    authorization: Option<Authorization>,
    accept: Vec<String>,
    user_agent: Option<String>,
    body: Option<BlobHttpContent>,
    timeout: Option<Duration>,
}

impl Request {
    pub fn builder() -> Request {
        Request::default()
    }

    pub fn authorization(mut self, authorization: Option<Authorization>) -> Request {
        self.authorization = authorization;
        self
    }

    pub fn accept<S: AsRef<str>>(mut self, accept: &[S]) -> Request {
        self.accept = accept.iter().map(|media_type| media_type.as_ref().to_string()).collect();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Request {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn body(mut self, body: BlobHttpContent) -> Request {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Request {
        self.timeout = Some(timeout);
        self
    }

    pub fn get_authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }
}

pub struct Response {
    inner: reqwest::blocking::Response,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn is_success(&self) -> bool {
        self.inner.status().is_success()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        get_header(self.inner.headers(), name)
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn content_type(&self) -> Option<String> {
        self.header(CONTENT_TYPE.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    pub fn url(&self) -> &Url {
        self.inner.url()
    }

    pub fn bytes(self) -> Result<Bytes> {
        Ok(self.inner.bytes()?)
    }

    /// The body as a reader, for streaming large blobs.
    pub fn into_body(self) -> impl Read + Send {
        self.inner
    }
}

impl Debug for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").field("status", &self.status()).field("url", self.url()).finish()
    }
}

/// Sends requests over a shared blocking client. Redirects are followed and
/// the `Authorization` header is dropped when a redirect leaves the host.
#[derive(Clone)]
pub struct Connection {
    client: Client,
}

impl Connection {
    pub fn new(timeout: Option<Duration>, accept_invalid_certs: bool) -> Result<Connection> {
        let mut builder = ClientBuilder::new()
            .gzip(true)
            .deflate(true)
            .redirect(Policy::limited(10))
            .danger_accept_invalid_certs(accept_invalid_certs);
        builder = match timeout {
            Some(timeout) => builder.timeout(timeout).connect_timeout(timeout),
            None => builder.timeout(None),
        };
        let client = builder.build().context("failed to create the http client")?;
        Ok(Connection { client })
    }

    pub fn get(&self, url: &Url, request: &Request) -> Result<Response> {
        self.send(Method::GET, url, request)
    }

    pub fn head(&self, url: &Url, request: &Request) -> Result<Response> {
        self.send(Method::HEAD, url, request)
    }

    pub fn post(&self, url: &Url, request: &Request) -> Result<Response> {
        self.send(Method::POST, url, request)
    }

    pub fn patch(&self, url: &Url, request: &Request) -> Result<Response> {
        self.send(Method::PATCH, url, request)
    }

    pub fn put(&self, url: &Url, request: &Request) -> Result<Response> {
        self.send(Method::PUT, url, request)
    }

    /// Transport failures come back as a [`reqwest::Error`] inside the
    /// `anyhow::Error`; any status code is a successful send.
    pub fn send(&self, method: Method, url: &Url, request: &Request) -> Result<Response> {
        let mut builder = self.client.request(method, url.clone());
        if let Some(authorization) = &request.authorization {
            builder = builder.header(AUTHORIZATION, authorization.to_string());
        }
        if !request.accept.is_empty() {
            builder = builder.header(ACCEPT, request.accept.join(","));
        }
        if let Some(user_agent) = &request.user_agent {
            builder = builder.header(USER_AGENT, user_agent.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(content) = &request.body {
            builder = builder.header(CONTENT_TYPE, content.content_type()).body(content.to_body()?);
        }
        let response = builder.send()?;
        Ok(Response { inner: response })
    }
}

pub fn get_header(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers.get(header_name).and_then(|value| match value.to_str() {
        Ok(str) => Some(String::from(str)),
        Err(_) => None,
    })
}

/// Whether an error returned by [`Connection::send`] happened before any
/// response was received.
pub fn is_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<reqwest::Error>().is_some())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use httptest::matchers::{all_of, contains, request};
    use httptest::responders::status_code;
    use httptest::{Expectation, Server};

    use super::*;

    #[test]
    fn authorization_renders_scheme_and_token() {
        assert_eq!(Authorization::from_bearer_token("abc").to_string(), "Bearer abc");
        assert_eq!(Authorization::from_basic_credentials("user", "pass").to_string(), "Basic dXNlcjpwYXNz");
        assert_eq!(Authorization::from_basic_token("dXNlcjpwYXNz"), Authorization::from_basic_credentials("user", "pass"));
        assert!(!format!("{:?}", Authorization::from_bearer_token("secret")).contains("secret"));
    }

    #[test]
    fn sends_headers_and_counts_body_bytes() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload"),
                request::headers(contains(("authorization", "Bearer t"))),
                request::headers(contains(("content-type", "application/octet-stream"))),
                request::headers(contains(("accept", "a,b"))),
                request::body("payload"),
            ])
            .respond_with(status_code(201).insert_header("Location", "/done")),
        );

        let written = Arc::new(AtomicU64::new(0));
        let counter = written.clone();
        let content = BlobHttpContent::new(
            Arc::new(Blob::from_bytes(b"payload".to_vec())),
            "application/octet-stream",
            Some(Arc::new(move |count| {
                counter.fetch_add(count, Ordering::SeqCst);
            })),
        );
        let request = Request::builder()
            .authorization(Some(Authorization::from_bearer_token("t")))
            .accept(&["a", "b"])
            .body(content);

        let connection = Connection::new(Some(Duration::from_secs(5)), false).unwrap();
        let url = Url::parse(&server.url_str("/upload")).unwrap();
        let response = connection.put(&url, &request).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.header("location").as_deref(), Some("/done"));
        assert_eq!(written.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn connection_refused_is_a_transport_error() {
        let connection = Connection::new(Some(Duration::from_secs(2)), false).unwrap();
        let url = Url::parse("http://127.0.0.1:1/v2/").unwrap();
        let err = connection.get(&url, &Request::builder()).unwrap_err();
        assert!(is_transport_error(&err));
    }
}
