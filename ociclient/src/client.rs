use std::str::FromStr;

use crate::digest::OciDigest;
use crate::models::{Descriptor, ImageManifest, MEDIA_TYPE_IMAGE_MANIFEST};
use anyhow::Result;
use base64::Engine;
use bytes::Bytes;
use reqwest::{header, Client as ReqwestClient, Method, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

/// Credentials presented to a registry.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Base64 encoded `user:password`
    Basic(String),
    /// Opaque bearer token
    Bearer(String),
}

impl Credentials {
    /// Build basic credentials from a user name and password.
    pub fn basic(username: &str, password: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
        Credentials::Basic(encoded)
    }

    /// Parse the value of an `Authorization` header.
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(token) = value.strip_prefix("Bearer ") {
            Some(Credentials::Bearer(token.trim().to_string()))
        } else if let Some(basic) = value.strip_prefix("Basic ") {
            Some(Credentials::Basic(basic.trim().to_string()))
        } else {
            None
        }
    }

    /// Render as an `Authorization` header value.
    pub fn header_value(&self) -> String {
        match self {
            Credentials::Basic(basic) => format!("Basic {}", basic),
            Credentials::Bearer(token) => format!("Bearer {}", token),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic(_) => write!(f, "Basic(***)"),
            Credentials::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

/// A manifest as served by the registry, with the digest of its exact bytes.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub digest: OciDigest,
    pub size: u64,
    pub media_type: String,
    pub manifest: ImageManifest,
}

/// A client for interacting with an OCI registry.
pub struct Client {
    registry_url: String,
    auth: Option<Credentials>,
    client: ReqwestClient,
}

impl Client {
    /// Create a new client for the given registry URL.
    pub fn new(registry_url: String, auth: Option<Credentials>) -> Self {
        Self {
            registry_url: registry_url.trim_end_matches('/').to_string(),
            auth,
            client: ReqwestClient::new(),
        }
    }

    /// Create a new session for the given repository.
    pub fn new_session(&self, repository: String) -> ClientSession {
        ClientSession {
            repository,
            registry_url: self.registry_url.clone(),
            client: self.client.clone(),
            auth: self.auth.clone(),
            token: None,
        }
    }
}

/// A session for interacting with a specific repository in an OCI registry.
pub struct ClientSession {
    repository: String,
    registry_url: String,
    client: ReqwestClient,
    auth: Option<Credentials>,
    token: Option<String>,
}

// Token authentication response from the auth service
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// Parameters of a `WWW-Authenticate: Bearer` challenge
#[derive(Debug, Default, PartialEq)]
struct BearerChallenge {
    realm: Option<String>,
    service: Option<String>,
    scope: Option<String>,
}

fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let params = value.strip_prefix("Bearer ")?;
    let mut challenge = BearerChallenge::default();

    for part in params.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim_matches('"').to_string();
            match key {
                "realm" => challenge.realm = Some(value),
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
    }

    Some(challenge)
}

fn status_error(action: &str, status: StatusCode) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        anyhow::anyhow!("{}: unauthorized ({})", action, status)
    } else {
        anyhow::anyhow!("{}: {}", action, status)
    }
}

impl ClientSession {
    /// `/v2/<repository>/<path>` on this session's registry.
    fn endpoint(&self, path: impl std::fmt::Display) -> String {
        format!("{}/v2/{}/{}", self.registry_url, self.repository, path)
    }

    fn request(&self, method: Method, url: &str, headers: &header::HeaderMap, body: Option<&Bytes>) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, url).headers(headers.clone());

        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        } else if let Some(auth) = &self.auth {
            request = request.header(header::AUTHORIZATION, auth.header_value());
        }

        if let Some(body) = body {
            request = request.body(body.clone());
        }

        request
    }

    /// Send a request, obtaining a token if the registry asks for one.
    async fn authenticate_request(
        &mut self,
        method: Method,
        url: &str,
        headers: header::HeaderMap,
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let response = self.request(method.clone(), url, &headers, body.as_ref()).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge);

        let Some(BearerChallenge { realm: Some(realm), service, scope }) = challenge else {
            return Ok(response);
        };

        // Build the token request URL
        let mut token_url = reqwest::Url::parse(&realm)?;
        if let Some(service) = service {
            token_url.query_pairs_mut().append_pair("service", &service);
        }
        if let Some(scope) = scope {
            token_url.query_pairs_mut().append_pair("scope", &scope);
        }

        let mut token_request = self.client.get(token_url);
        if let Some(auth) = self.auth.as_ref().filter(|auth| matches!(auth, Credentials::Basic(_))) {
            token_request = token_request.header(header::AUTHORIZATION, auth.header_value());
        }

        let token_response = token_request.send().await?;
        if !token_response.status().is_success() {
            debug!("Token request for {} failed: {}", self.repository, token_response.status());
            return Ok(response);
        }

        let token_data: TokenResponse = token_response.json().await?;
        self.token = Some(token_data.token);

        // Retry the original request with the token
        Ok(self.request(method, url, &headers, body.as_ref()).send().await?)
    }

    fn upload_target(&self, location: &str) -> String {
        if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}{}", self.registry_url, location)
        }
    }

    fn location(response: &reqwest::Response) -> Result<String> {
        Ok(response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| anyhow::anyhow!("No location header in response"))?
            .to_str()?
            .to_string())
    }

    fn with_digest(upload_url: &str, digest: &OciDigest) -> String {
        let separator = if upload_url.contains('?') { '&' } else { '?' };
        format!("{}{}digest={}", upload_url, separator, digest)
    }

    /// Start a blob upload, returning the upload URL.
    async fn start_upload(&mut self) -> Result<String> {
        let start_url = self.endpoint("blobs/uploads/");
        debug!("Starting upload with URL: {}", start_url);

        let start_response = self
            .authenticate_request(Method::POST, &start_url, header::HeaderMap::new(), Some(Bytes::new()))
            .await?;

        if start_response.status() != StatusCode::ACCEPTED {
            return Err(status_error("Failed to start upload", start_response.status()));
        }

        let location = Self::location(&start_response)?;
        Ok(self.upload_target(&location))
    }

    /// Upload content from a byte slice in a single request.
    pub async fn upload_bytes(&mut self, media_type: String, content: &[u8]) -> Result<Descriptor> {
        let descriptor = Descriptor::for_content(media_type, content);

        if self.blob_exists(&descriptor.digest).await? {
            debug!("Blob {} already present in {}", descriptor.digest, self.repository);
            return Ok(descriptor);
        }

        let upload_url = self.start_upload().await?;

        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/octet-stream"));

        let complete_url = Self::with_digest(&upload_url, &descriptor.digest);
        let complete_response = self
            .authenticate_request(Method::PUT, &complete_url, headers, Some(Bytes::copy_from_slice(content)))
            .await?;

        if complete_response.status() != StatusCode::CREATED {
            return Err(status_error("Failed to complete upload", complete_response.status()));
        }

        Ok(descriptor)
    }

    /// Upload the content of a file in chunks. The digest and size must be
    /// known up front.
    pub async fn upload_file(
        &mut self,
        descriptor: &Descriptor,
        file: &mut tokio::fs::File,
        chunk_size: usize,
    ) -> Result<()> {
        if self.blob_exists(&descriptor.digest).await? {
            debug!("Blob {} already present in {}", descriptor.digest, self.repository);
            return Ok(());
        }

        let mut upload_url = self.start_upload().await?;
        let mut offset: u64 = 0;
        let mut buffer = vec![0u8; chunk_size.max(1)];

        loop {
            let mut filled = 0;
            while filled < buffer.len() {
                let read = file.read(&mut buffer[filled..]).await?;
                if read == 0 {
                    break;
                }
                filled += read;
            }
            if filled == 0 {
                break;
            }

            let end = offset + filled as u64;
            let mut headers = header::HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/octet-stream"));
            headers.insert(header::CONTENT_RANGE, format!("{}-{}", offset, end - 1).parse()?);

            let chunk_response = self
                .authenticate_request(Method::PATCH, &upload_url, headers, Some(Bytes::copy_from_slice(&buffer[..filled])))
                .await?;

            if chunk_response.status() != StatusCode::ACCEPTED {
                return Err(status_error("Failed to upload chunk", chunk_response.status()));
            }

            // Registries may hand out a new location after each chunk
            if let Ok(location) = Self::location(&chunk_response) {
                upload_url = self.upload_target(&location);
            }

            offset = end;
        }

        if offset != descriptor.size {
            return Err(anyhow::anyhow!(
                "Uploaded {} bytes but descriptor declares {}",
                offset,
                descriptor.size
            ));
        }

        let complete_url = Self::with_digest(&upload_url, &descriptor.digest);
        let complete_response = self
            .authenticate_request(Method::PUT, &complete_url, header::HeaderMap::new(), Some(Bytes::new()))
            .await?;

        if complete_response.status() != StatusCode::CREATED {
            return Err(status_error("Failed to complete upload", complete_response.status()));
        }

        Ok(())
    }

    /// Check if a blob with the given digest exists.
    pub async fn blob_exists(&mut self, digest: &OciDigest) -> Result<bool> {
        let url = self.endpoint(format_args!("blobs/{}", digest));
        let response = self.authenticate_request(Method::HEAD, &url, header::HeaderMap::new(), None).await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error("Failed to check blob", status)),
        }
    }

    /// Stream a blob into a file, verifying its digest on the way.
    pub async fn fetch_blob_to(&mut self, digest: &OciDigest, file: &mut tokio::fs::File) -> Result<u64> {
        let url = self.endpoint(format_args!("blobs/{}", digest));
        let mut response = self.authenticate_request(Method::GET, &url, header::HeaderMap::new(), None).await?;

        if response.status() != StatusCode::OK {
            return Err(status_error("Failed to fetch blob", response.status()));
        }

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        let actual = OciDigest::from_hasher(hasher);
        if &actual != digest {
            return Err(anyhow::anyhow!("Digest mismatch: expected {}, got {}", digest, actual));
        }

        Ok(written)
    }

    /// Register a manifest with the given reference, returning its digest.
    pub async fn register_manifest(&mut self, reference: &str, manifest: &ImageManifest) -> Result<OciDigest> {
        let url = self.endpoint(format_args!("manifests/{}", reference));

        let body = Bytes::from(serde_json::to_vec(manifest)?);
        let digest = OciDigest::sha256_of(&body);
        let media_type = manifest.media_type.as_deref().unwrap_or(MEDIA_TYPE_IMAGE_MANIFEST);

        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, media_type.parse()?);

        let response = self.authenticate_request(Method::PUT, &url, headers, Some(body)).await?;

        if response.status() != StatusCode::CREATED && response.status() != StatusCode::OK {
            return Err(status_error("Failed to register manifest", response.status()));
        }

        Ok(digest)
    }

    /// Query a manifest with the given reference.
    pub async fn query_manifest(&mut self, reference: &str) -> Result<Option<ManifestResponse>> {
        let url = self.endpoint(format_args!("manifests/{}", reference));

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(MANIFEST_ACCEPT));

        let response = self.authenticate_request(Method::GET, &url, headers, None).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if response.status() != StatusCode::OK {
            return Err(status_error("Failed to query manifest", response.status()));
        }

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(MEDIA_TYPE_IMAGE_MANIFEST)
            .to_string();
        let header_digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| OciDigest::from_str(value).ok());

        let body = response.bytes().await?;
        let digest = header_digest.unwrap_or_else(|| OciDigest::sha256_of(&body));
        let manifest = serde_json::from_slice(&body)?;

        Ok(Some(ManifestResponse {
            digest,
            size: body.len() as u64,
            media_type,
            manifest,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = parse_bearer_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:app:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm.as_deref(), Some("https://auth.example.com/token"));
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:app:pull"));

        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
    }

    #[test]
    fn test_credentials_header_roundtrip() {
        let basic = Credentials::basic("user", "secret");
        assert_eq!(basic.header_value(), "Basic dXNlcjpzZWNyZXQ=");
        assert_eq!(Credentials::from_header(&basic.header_value()), Some(basic));

        let bearer = Credentials::from_header("Bearer abc").unwrap();
        assert_eq!(bearer, Credentials::Bearer("abc".to_string()));
        assert!(Credentials::from_header("Digest abc").is_none());
    }

    #[test]
    fn test_status_error_marks_unauthorized() {
        let err = status_error("Failed to query manifest", StatusCode::UNAUTHORIZED);
        assert!(err.to_string().contains("unauthorized"));
        let err = status_error("Failed to query manifest", StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.to_string().contains("unauthorized"));
    }

    #[test]
    fn test_digest_query_separator() {
        let digest = OciDigest::sha256_of(b"");
        assert_eq!(
            ClientSession::with_digest("http://r/upload?_state=x", &digest),
            format!("http://r/upload?_state=x&digest={}", digest)
        );
        assert_eq!(
            ClientSession::with_digest("http://r/upload", &digest),
            format!("http://r/upload?digest={}", digest)
        );
    }
}
