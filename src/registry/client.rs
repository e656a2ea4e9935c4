use std::io;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use reqwest::{Method, StatusCode, Url};

use crate::blob::digest::{BlobDescriptor, DescriptorDigest};
use crate::blob::digests::compute_digest_of_bytes;
use crate::blob::Blob;
use crate::credential::Credential;
use crate::event::{EventHandlers, LogEvent};
use crate::http::{get_header, is_transport_error, Authorization, BlobHttpContent, ByteCountCallback, Connection, NotifyingReader, Request, Response};
use crate::image::config::ContainerConfigurationTemplate;
use crate::image::manifest::{ManifestTemplate, ManifestTemplateType};
use crate::image::reference::{ImageReference, DEFAULT_IMAGE_HOST, DOCKER_IO_HOST};
use crate::registry::auth::{AuthenticationChallenge, TokenCache, TokenScope, TokenType};
use crate::registry::error::{parse_error_entries, RegistryError, RegistryErrorKind};

pub const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";
const OCTET_STREAM: &str = "application/octet-stream";

pub type SizeCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub struct RegistryCreateInfo {
    pub credential: Option<Credential>,
    pub conn_timeout_second: Option<u64>,
    pub allow_insecure: bool,
    pub user_agent: String,
}

impl Default for RegistryCreateInfo {
    fn default() -> Self {
        RegistryCreateInfo {
            credential: None,
            conn_timeout_second: Some(20),
            allow_insecure: false,
            user_agent: concat!("fibpack/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Talks the distribution API for one repository.
///
/// Requests go out unauthenticated until the registry answers 401; the
/// challenge is then turned into an authorization, the request is retried once
/// and the authorization is reused for later requests of the same scope.
pub struct RegistryClient {
    connection: Connection,
    registry: String,
    repository: String,
    use_https: bool,
    allow_insecure: bool,
    use_plain_http: AtomicBool,
    credential: Option<Credential>,
    user_agent: String,
    event_handlers: EventHandlers,
    challenge: Mutex<Option<AuthenticationChallenge>>,
    token_cache: Mutex<TokenCache>,
}

impl RegistryClient {
    pub fn open(use_https: bool, image_reference: &ImageReference, create_info: RegistryCreateInfo, event_handlers: &EventHandlers) -> Result<RegistryClient> {
        let registry = match image_reference.registry() {
            DOCKER_IO_HOST => DEFAULT_IMAGE_HOST,
            host => host,
        };
        let connection = Connection::new(create_info.conn_timeout_second.map(Duration::from_secs), create_info.allow_insecure)?;
        Ok(RegistryClient {
            connection,
            registry: registry.to_string(),
            repository: image_reference.repository().to_string(),
            use_https,
            allow_insecure: create_info.allow_insecure,
            use_plain_http: AtomicBool::new(!use_https),
            credential: create_info.credential,
            user_agent: create_info.user_agent,
            event_handlers: event_handlers.clone(),
            challenge: Mutex::new(None),
            token_cache: Mutex::new(TokenCache::default()),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    fn image_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Existence of a blob; the size comes from `Content-Length` when sent.
    pub fn check_blob(&self, digest: &DescriptorDigest) -> Result<Option<BlobDescriptor>> {
        self.check_blob_for(digest, &TokenScope::new(&self.repository, TokenType::Pull, None))
    }

    fn check_blob_for(&self, digest: &DescriptorDigest, scope: &TokenScope) -> Result<Option<BlobDescriptor>> {
        let action = format!("check blob {}", digest);
        let path = format!("/v2/{}/blobs/{}", self.repository, digest);
        let response = self.send(&action, scope, Method::HEAD, &path, Request::builder())?;
        match response.status() {
            status if status.is_success() => {
                let size = response
                    .header("Content-Length")
                    .and_then(|length| length.parse::<i64>().ok())
                    .unwrap_or(-1);
                Ok(Some(BlobDescriptor::new(size, digest.clone())))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(self.status_error(&action, response)),
        }
    }

    /// A blob whose contents are downloaded each time it is written.
    ///
    /// `size_callback` receives the `Content-Length` once the response headers
    /// arrive and `bytes_callback` the size of each chunk read. A failed
    /// download surfaces as an `io::Error` wrapping a [`RegistryError`].
    pub fn pull_blob(self: &Arc<Self>, digest: &DescriptorDigest, size_callback: SizeCallback, bytes_callback: ByteCountCallback) -> Blob {
        let client = self.clone();
        let digest = digest.clone();
        Blob::from_writable(
            move |out: &mut dyn Write| {
                client
                    .download_blob(&digest, &size_callback, &bytes_callback, out)
                    .map_err(|err| match err.downcast::<RegistryError>() {
                        Ok(registry_err) => io::Error::new(io::ErrorKind::Other, registry_err),
                        Err(err) => {
                            let kind = err.downcast_ref::<io::Error>().map_or(io::ErrorKind::Other, io::Error::kind);
                            io::Error::new(kind, format!("{:#}", err))
                        }
                    })
            },
            -1,
        )
    }

    fn download_blob(&self, digest: &DescriptorDigest, size_callback: &SizeCallback, bytes_callback: &ByteCountCallback, out: &mut dyn Write) -> Result<()> {
        let action = format!("pull blob {}", digest);
        let path = format!("/v2/{}/blobs/{}", self.repository, digest);
        let scope = TokenScope::new(&self.repository, TokenType::Pull, None);
        let response = self.send(&action, &scope, Method::GET, &path, Request::builder())?;
        if !response.is_success() {
            return Err(self.status_error(&action, response));
        }
        if let Some(length) = response.content_length() {
            size_callback(length);
        }
        let mut reader = ResponseBodyReader::new(NotifyingReader::new(response.into_body(), Some(bytes_callback.clone())));
        match io::copy(&mut reader, out) {
            Ok(_) => Ok(()),
            Err(_) if reader.failure.is_some() => Err(RegistryError::new(
                RegistryErrorKind::Transport,
                action.as_str(),
                self.image_name(),
                format!("download interrupted: {}", reader.failure.take().unwrap_or_default()),
            )
            .into()),
            Err(err) => Err(err).with_context(|| format!("failed to write blob {}", digest)),
        }
    }

    /// The container configuration blob, verified against its digest.
    pub fn pull_config_blob(&self, digest: &DescriptorDigest) -> Result<ContainerConfigurationTemplate> {
        let action = format!("pull container configuration {}", digest);
        let path = format!("/v2/{}/blobs/{}", self.repository, digest);
        let scope = TokenScope::new(&self.repository, TokenType::Pull, None);
        let response = self.send(&action, &scope, Method::GET, &path, Request::builder())?;
        if !response.is_success() {
            return Err(self.status_error(&action, response));
        }
        let body = response.bytes()?;
        let actual = compute_digest_of_bytes(&body);
        if actual.digest() != digest {
            return Err(RegistryError::new(
                RegistryErrorKind::UnexpectedResponse,
                action,
                self.image_name(),
                format!("received content with digest {}", actual.digest()),
            )
            .into());
        }
        serde_json::from_slice::<ContainerConfigurationTemplate>(&body)
            .map_err(|err| RegistryError::new(RegistryErrorKind::UnexpectedResponse, action, self.image_name(), format!("invalid configuration: {}", err)).into())
    }

    /// Pushes a blob unless the registry already has it or can mount it from
    /// `source_repository`. Returns `true` when no upload was needed.
    pub fn push_blob(
        &self,
        digest: &DescriptorDigest,
        blob: Arc<Blob>,
        source_repository: Option<&str>,
        written_callback: Option<ByteCountCallback>,
    ) -> Result<bool> {
        let scope = TokenScope::new(&self.repository, TokenType::PushAndPull, source_repository);
        if self.check_blob_for(digest, &scope)?.is_some() {
            debug!("Blob {} already exists in {}", digest.short_hash(), self.image_name());
            return Ok(true);
        }

        let action = format!("push blob {}", digest);
        let mut path = format!("/v2/{}/blobs/uploads/", self.repository);
        if let Some(source) = &scope.mount_from {
            path = format!("{}?mount={}&from={}", path, digest, source);
        }
        let response = self.send(&action, &scope, Method::POST, &path, Request::builder())?;
        let location = match response.status() {
            StatusCode::CREATED => {
                info!("Mounted blob {} from {}", digest.short_hash(), scope.mount_from.as_deref().unwrap_or_default());
                return Ok(true);
            }
            StatusCode::ACCEPTED => self.location(&action, &response)?,
            _ => return Err(self.status_error(&action, response)),
        };

        let body = BlobHttpContent::new(blob, OCTET_STREAM, written_callback);
        let response = self.send(&action, &scope, Method::PATCH, location.as_str(), Request::builder().body(body))?;
        let mut location = match response.status() {
            StatusCode::ACCEPTED | StatusCode::NO_CONTENT | StatusCode::CREATED => self.location(&action, &response)?,
            _ => return Err(self.status_error(&action, response)),
        };

        location.query_pairs_mut().append_pair("digest", &digest.to_string());
        let response = self.send(&action, &scope, Method::PUT, location.as_str(), Request::builder())?;
        if response.status() != StatusCode::CREATED && !response.is_success() {
            return Err(self.status_error(&action, response));
        }
        Ok(false)
    }

    /// Pulls a manifest of exactly type `T`; any other kind is an error.
    pub fn pull_manifest<T: ManifestTemplateType>(&self, qualifier: &str) -> Result<(T, DescriptorDigest)> {
        let action = format!("pull image manifest for {}", qualifier);
        let (content_type, body) = self.fetch_manifest(&action, qualifier, T::accepted_media_types())?;
        let manifest = ManifestTemplate::from_json(content_type.as_deref(), &body)
            .map_err(|err| RegistryError::new(RegistryErrorKind::UnexpectedResponse, action.as_str(), self.image_name(), format!("{:#}", err)))?;
        let media_type = manifest.media_type().to_string();
        if manifest.schema_version() != T::schema_version() || !T::accepted_media_types().contains(&media_type.as_str()) {
            return Err(RegistryError::new(
                RegistryErrorKind::UnexpectedResponse,
                action,
                self.image_name(),
                format!(
                    "expected manifest of type {} (schema version {}) but the registry returned {} (schema version {})",
                    T::accepted_media_types().join(" or "),
                    T::schema_version(),
                    media_type,
                    manifest.schema_version()
                ),
            )
            .into());
        }
        let template = serde_json::from_slice::<T>(&body)
            .map_err(|err| RegistryError::new(RegistryErrorKind::UnexpectedResponse, action.as_str(), self.image_name(), err.to_string()))?;
        Ok((template, compute_digest_of_bytes(&body).digest().clone()))
    }

    /// Pulls whichever single-image manifest the registry serves.
    pub fn pull_any_manifest(&self, qualifier: &str) -> Result<(ManifestTemplate, DescriptorDigest)> {
        let action = format!("pull image manifest for {}", qualifier);
        let (content_type, body) = self.fetch_manifest(&action, qualifier, &ManifestTemplate::ACCEPTED_MEDIA_TYPES)?;
        let manifest = ManifestTemplate::from_json(content_type.as_deref(), &body)
            .map_err(|err| RegistryError::new(RegistryErrorKind::UnexpectedResponse, action.as_str(), self.image_name(), format!("{:#}", err)))?;
        Ok((manifest, compute_digest_of_bytes(&body).digest().clone()))
    }

    fn fetch_manifest(&self, action: &str, qualifier: &str, accept: &[&str]) -> Result<(Option<String>, bytes::Bytes)> {
        let path = format!("/v2/{}/manifests/{}", self.repository, qualifier);
        let scope = TokenScope::new(&self.repository, TokenType::Pull, None);
        let response = self.send(action, &scope, Method::GET, &path, Request::builder().accept(accept))?;
        if !response.is_success() {
            return Err(self.status_error(action, response));
        }
        let content_type = response.content_type();
        Ok((content_type, response.bytes()?))
    }

    /// Pushes `manifest` under `tag` and returns its digest.
    pub fn push_manifest(&self, manifest: &ManifestTemplate, tag: &str) -> Result<DescriptorDigest> {
        let action = format!("push image manifest for {}", tag);
        let body = serde_json::to_vec(&manifest.to_json_value()?)?;
        let digest = compute_digest_of_bytes(&body).digest().clone();
        let path = format!("/v2/{}/manifests/{}", self.repository, tag);
        let scope = TokenScope::new(&self.repository, TokenType::PushAndPull, None);
        let request = Request::builder().body(BlobHttpContent::from_bytes(body, manifest.media_type()));
        let response = self.send(&action, &scope, Method::PUT, &path, request)?;
        if !response.is_success() {
            return Err(self.status_error(&action, response));
        }
        match response.header(DOCKER_CONTENT_DIGEST) {
            Some(received) if received != digest.to_string() => {
                self.event_handlers.dispatch(LogEvent::warn(format!(
                    "The registry reported digest {} for the manifest of {}:{} but the pushed manifest has digest {}",
                    received,
                    self.image_name(),
                    tag,
                    digest
                )));
            }
            Some(_) => {}
            None => debug!("The registry did not report a digest for the manifest of {}:{}", self.image_name(), tag),
        }
        Ok(digest)
    }

    /// Sends a request, authenticating and retrying once on 401.
    fn send(&self, action: &str, scope: &TokenScope, method: Method, target: &str, request: Request) -> Result<Response> {
        let authorization = self.cached_authorization(scope);
        let response = self.send_once(action, method.clone(), target, request.clone().authorization(authorization.clone()))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = match response.header("WWW-Authenticate") {
            Some(header) => AuthenticationChallenge::parse(&header)
                .map_err(|err| RegistryError::new(RegistryErrorKind::Unauthorized, action, self.image_name(), err.to_string()))?,
            None => return Err(self.status_error(action, response)),
        };
        debug!("{} requires authentication: {:?}", self.image_name(), challenge);
        let (authorization, expires_in) = challenge
            .authorize(&self.connection, self.credential.as_ref(), scope, &self.user_agent)
            .map_err(|err| RegistryError::new(RegistryErrorKind::Unauthorized, action, self.image_name(), format!("{:#}", err)))?;
        if let Ok(mut cached_challenge) = self.challenge.lock() {
            *cached_challenge = Some(challenge);
        }
        if let Ok(mut token_cache) = self.token_cache.lock() {
            token_cache.put(scope, authorization.clone(), expires_in);
        }
        self.send_once(action, method, target, request.authorization(Some(authorization)))
    }

    /// Reuses a cached authorization, or authorizes up front once the
    /// registry's challenge is known.
    fn cached_authorization(&self, scope: &TokenScope) -> Option<Authorization> {
        if let Some(authorization) = self.token_cache.lock().ok().and_then(|mut token_cache| token_cache.get(scope)) {
            return Some(authorization);
        }
        let challenge = self.challenge.lock().ok().and_then(|challenge| challenge.clone())?;
        match challenge.authorize(&self.connection, self.credential.as_ref(), scope, &self.user_agent) {
            Ok((authorization, expires_in)) => {
                if let Ok(mut token_cache) = self.token_cache.lock() {
                    token_cache.put(scope, authorization.clone(), expires_in);
                }
                Some(authorization)
            }
            Err(err) => {
                debug!("Authorizing {:?} up front failed: {:#}", scope, err);
                None
            }
        }
    }

    fn send_once(&self, action: &str, method: Method, target: &str, request: Request) -> Result<Response> {
        let request = request.user_agent(self.user_agent.as_str());
        let url = self.resolve(action, target)?;
        match self.connection.send(method.clone(), &url, &request) {
            Ok(response) => Ok(response),
            Err(err) if is_transport_error(&err) && self.should_fall_back(&url) => {
                self.event_handlers.dispatch(LogEvent::warn(format!(
                    "Failed to connect to {} over HTTPS, falling back to HTTP: {:#}",
                    self.registry, err
                )));
                self.use_plain_http.store(true, Ordering::SeqCst);
                let url = self.resolve(action, target)?;
                self.connection
                    .send(method, &url, &request)
                    .map_err(|err| self.transport_error(action, err))
            }
            Err(err) => Err(self.transport_error(action, err)),
        }
    }

    fn should_fall_back(&self, url: &Url) -> bool {
        self.use_https && self.allow_insecure && url.scheme() == "https" && !self.use_plain_http.load(Ordering::SeqCst)
    }

    fn base_url(&self) -> Result<Url> {
        let scheme = if self.use_plain_http.load(Ordering::SeqCst) { "http" } else { "https" };
        Ok(Url::parse(&format!("{}://{}/", scheme, self.registry))?)
    }

    /// Paths are relative to the registry; upload locations may be absolute.
    fn resolve(&self, action: &str, target: &str) -> Result<Url> {
        self.base_url()?.join(target).map_err(|err| {
            RegistryError::new(RegistryErrorKind::UnexpectedResponse, action, self.image_name(), format!("invalid url '{}': {}", target, err)).into()
        })
    }

    fn location(&self, action: &str, response: &Response) -> Result<Url> {
        let location = get_header(response.headers(), "Location").ok_or_else(|| {
            anyhow::Error::from(RegistryError::new(
                RegistryErrorKind::UnexpectedResponse,
                action,
                self.image_name(),
                format!("{} without a Location header", response.status()),
            ))
        })?;
        response.url().join(&location).map_err(|err| anyhow!("invalid upload location '{}': {}", location, err))
    }

    fn transport_error(&self, action: &str, err: anyhow::Error) -> anyhow::Error {
        RegistryError::new(RegistryErrorKind::Transport, action, self.image_name(), format!("{:#}", err)).into()
    }

    fn status_error(&self, action: &str, response: Response) -> anyhow::Error {
        let status = response.status();
        let kind = match status {
            StatusCode::UNAUTHORIZED => RegistryErrorKind::Unauthorized,
            StatusCode::FORBIDDEN => RegistryErrorKind::Forbidden,
            StatusCode::NOT_FOUND => RegistryErrorKind::NotFound,
            _ => RegistryErrorKind::UnexpectedResponse,
        };
        let body = response.bytes().unwrap_or_default();
        RegistryError::new(kind, action, self.image_name(), status.to_string())
            .with_status(status.as_u16())
            .with_errors(parse_error_entries(&body))
            .into()
    }
}

/// Keeps read failures of a response body apart from failures of the sink
/// the body is copied into.
struct ResponseBodyReader<R: Read> {
    inner: R,
    failure: Option<String>,
}

impl<R: Read> ResponseBodyReader<R> {
    fn new(inner: R) -> ResponseBodyReader<R> {
        ResponseBodyReader { inner, failure: None }
    }
}

impl<R: Read> Read for ResponseBodyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|err| {
            self.failure = Some(err.to_string());
            err
        })
    }
}
