//! Registry v2 client for upstream registries, with bearer token challenges.

use std::collections::HashMap;
use std::time::Duration;

use futures::TryStreamExt as _;
use parking_lot::Mutex;
use reqwest::{Client, Method, Response, header};
use secret::Secret;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use url::Url;

use super::{ManifestHead, RemoteBlob, RemoteError, RemoteManifest, RemoteRegistry};
use crate::digest::Digest;
use crate::headers::DOCKER_CONTENT_DIGEST;

const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json, ",
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json"
);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an upstream registry lives and how to log in.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UpstreamConfig {
    /// Base URL, e.g. `https://registry-1.docker.io`.
    pub url: Url,
    /// Account for token requests.
    #[serde(default)]
    pub username: Option<String>,
    /// Password for token requests.
    #[serde(default)]
    pub password: Option<Secret>,
    /// Prefix single-component image names with `library/`.
    #[serde(default)]
    pub docker_hub_library: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Challenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl Challenge {
    /// Parse `Bearer realm="..",service="..",scope=".."`.
    fn parse(header: &str) -> Option<Self> {
        let params = header.strip_prefix("Bearer ")?;
        let mut challenge = Challenge::default();
        for part in params.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            let value = value.trim_matches('"').to_owned();
            match key {
                "realm" => challenge.realm = value,
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
        (!challenge.realm.is_empty()).then_some(challenge)
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// An upstream registry over HTTP.
#[derive(Debug)]
pub struct HttpRemote {
    client: Client,
    config: UpstreamConfig,
    /// Bearer tokens by upstream repository.
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpRemote {
    /// A client for the configured upstream.
    pub fn new(config: UpstreamConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .user_agent(concat!("oci-registry/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            config,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// The upstream repository name for an image.
    fn repository(&self, image: &str) -> String {
        if self.config.docker_hub_library && !image.contains('/') {
            format!("library/{image}")
        } else {
            image.to_owned()
        }
    }

    fn endpoint(&self, repository: &str, rest: &str) -> Result<Url, RemoteError> {
        Ok(self.config.url.join(&format!("/v2/{repository}/{rest}"))?)
    }

    async fn send(&self, method: Method, url: &Url, token: Option<&str>) -> Result<Response, RemoteError> {
        let mut request = self
            .client
            .request(method, url.clone())
            .header(header::ACCEPT, ACCEPT_MANIFEST);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        Ok(request.send().await?)
    }

    /// Send a request, answering one bearer challenge if the upstream asks.
    #[tracing::instrument(skip(self), fields(upstream = %self.config.url))]
    async fn request(&self, method: Method, url: &Url, repository: &str) -> Result<Response, RemoteError> {
        let cached = self.tokens.lock().get(repository).cloned();
        if let Some(token) = cached {
            let response = self.send(method.clone(), url, Some(&token)).await?;
            if response.status() != reqwest::StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            self.tokens.lock().remove(repository);
        }

        let response = self.send(method.clone(), url, None).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse)
            .ok_or_else(|| RemoteError::Unauthorized(format!("{repository}: no bearer challenge")))?;
        let token = self.token(&challenge).await?;
        self.tokens
            .lock()
            .insert(repository.to_owned(), token.clone());

        self.send(method, url, Some(&token)).await
    }

    async fn token(&self, challenge: &Challenge) -> Result<String, RemoteError> {
        let mut url = Url::parse(&challenge.realm)?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair("service", service);
            }
            if let Some(scope) = &challenge.scope {
                query.append_pair("scope", scope);
            }
            if let Some(username) = &self.config.username {
                query.append_pair("account", username);
            }
        }
        tracing::debug!(realm = %challenge.realm, "requesting upstream token");

        let mut request = self.client.get(url);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            let credentials = password
                .basic(username)
                .map_err(|_| RemoteError::Unauthorized("credentials are not valid header text".into()))?;
            request = request.header(header::AUTHORIZATION, credentials);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Unauthorized(format!("token request failed ({status}): {message}")));
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| RemoteError::Unauthorized("token response had no token".into()))
    }

    async fn check(response: Response, what: &str) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status, what, message))
    }

    fn content_type(response: &Response) -> String {
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    }

    fn digest_header(response: &Response) -> Option<Digest> {
        response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

#[async_trait::async_trait]
impl RemoteRegistry for HttpRemote {
    async fn manifest_exist(&self, image: &str, reference: &str) -> Result<ManifestHead, RemoteError> {
        let repository = self.repository(image);
        let url = self.endpoint(&repository, &format!("manifests/{reference}"))?;
        let response = self.request(Method::HEAD, &url, &repository).await?;
        let response = Self::check(response, &format!("{repository}:{reference}")).await?;
        Ok(ManifestHead {
            digest: Self::digest_header(&response),
            media_type: Self::content_type(&response),
            size: response
                .headers()
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
        })
    }

    async fn manifest(&self, image: &str, reference: &str) -> Result<RemoteManifest, RemoteError> {
        let repository = self.repository(image);
        let url = self.endpoint(&repository, &format!("manifests/{reference}"))?;
        let response = self.request(Method::GET, &url, &repository).await?;
        let response = Self::check(response, &format!("{repository}:{reference}")).await?;

        let media_type = Self::content_type(&response);
        let digest = Self::digest_header(&response);
        let payload = response.bytes().await?;
        tracing::trace!(%media_type, size = payload.len(), "fetched upstream manifest");

        Ok(RemoteManifest {
            media_type,
            digest,
            payload,
        })
    }

    async fn blob_reader(&self, image: &str, digest: &Digest) -> Result<RemoteBlob, RemoteError> {
        let repository = self.repository(image);
        let url = self.endpoint(&repository, &format!("blobs/{digest}"))?;
        let response = self.request(Method::GET, &url, &repository).await?;
        let response = Self::check(response, &format!("{repository}@{digest}")).await?;

        let size = response.content_length();
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(RemoteBlob {
            size,
            reader: Box::new(StreamReader::new(Box::pin(stream))),
        })
    }

    async fn list_tags(&self, image: &str) -> Result<Vec<String>, RemoteError> {
        let repository = self.repository(image);
        let url = self.endpoint(&repository, "tags/list")?;
        let response = self.request(Method::GET, &url, &repository).await?;
        let response = Self::check(response, &repository).await?;
        let list: TagList = response.json().await?;
        Ok(list.tags.unwrap_or_default())
    }
}
