//! Image existence checks against OCI distribution registries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
#[cfg(test)]
use mockall::automock;
use regex::Regex;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::api::ModuleLoaderData;
use crate::client::KubeClient;
use crate::types::RegistryTls;

const DOCKER_HUB: &str = "docker.io";
const DOCKER_HUB_API: &str = "registry-1.docker.io";

const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
const DOCKER_CFG_KEY: &str = ".dockercfg";

const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { url: String, status: u16 },
    #[error("unsupported authentication challenge {0:?}")]
    UnsupportedChallenge(String),
    #[error("failed to get pull secret {namespace}/{name}: {source}")]
    GetSecretFailed {
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("pull secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },
    #[error("pull secret {0} holds no docker configuration")]
    MissingDockerConfig(String),
    #[error("failed to parse docker configuration: {0}")]
    ParseDockerConfig(#[from] serde_json::Error),
    #[error("failed to decode registry auth: {0}")]
    DecodeAuth(#[from] base64::DecodeError),
    #[error("registry auth is not of the form user:password")]
    MalformedAuth,
}

/// Image existence check. Absence is `Ok(false)`, not an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    async fn image_exists(
        &self,
        image: &str,
        tls: &RegistryTls,
        auth: &RegistryAuthGetter,
    ) -> Result<bool, RegistryError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    /// Tag or digest.
    pub reference: String,
}

impl ImageReference {
    pub fn parse(image: &str) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidReference(image.to_string());
        if image.is_empty() || image.contains(char::is_whitespace) {
            return Err(invalid());
        }

        let (name, reference) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => match image.rfind(':') {
                Some(idx) if !image[idx..].contains('/') => {
                    (&image[..idx], image[idx + 1..].to_string())
                }
                _ => (image, "latest".to_string()),
            },
        };
        if name.is_empty() || reference.is_empty() {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), name.to_string()),
            None => (DOCKER_HUB.to_string(), format!("library/{}", name)),
        };
        if repository.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB {
            DOCKER_HUB_API
        } else {
            &self.registry
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Lazily resolved registry credentials of one Module.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryAuthGetter {
    pub namespace: String,
    pub secret_name: Option<String>,
}

impl RegistryAuthGetter {
    pub fn from_mld(mld: &ModuleLoaderData) -> Self {
        Self {
            namespace: mld.namespace.clone(),
            secret_name: mld
                .image_repo_secret
                .as_ref()
                .and_then(|secret| secret.name.clone())
                .filter(|name| !name.is_empty()),
        }
    }

    pub async fn credentials(
        &self,
        client: &dyn KubeClient,
        registry: &str,
    ) -> Result<Option<Credentials>, RegistryError> {
        let name = match &self.secret_name {
            Some(name) => name,
            None => return Ok(None),
        };

        let secret = client
            .get_secret(&self.namespace, name)
            .await
            .map_err(|source| RegistryError::GetSecretFailed {
                namespace: self.namespace.clone(),
                name: name.clone(),
                source,
            })?
            .ok_or_else(|| RegistryError::SecretNotFound {
                namespace: self.namespace.clone(),
                name: name.clone(),
            })?;

        let data = secret.data.unwrap_or_default();
        let auths = if let Some(raw) = data.get(DOCKER_CONFIG_JSON_KEY) {
            serde_json::from_slice::<DockerConfigJson>(&raw.0)?.auths
        } else if let Some(raw) = data.get(DOCKER_CFG_KEY) {
            serde_json::from_slice::<BTreeMap<String, DockerAuth>>(&raw.0)?
        } else {
            return Err(RegistryError::MissingDockerConfig(name.clone()));
        };

        auths
            .iter()
            .find(|(host, _)| same_registry(host, registry))
            .map(|(_, auth)| auth.credentials())
            .transpose()
    }
}

#[derive(Deserialize)]
struct DockerConfigJson {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerAuth {
    fn credentials(&self) -> Result<Credentials, RegistryError> {
        if let Some(auth) = self.auth.as_deref().filter(|auth| !auth.is_empty()) {
            let decoded = base64::engine::general_purpose::STANDARD.decode(auth)?;
            let decoded = String::from_utf8_lossy(&decoded);
            let (username, password) = decoded.split_once(':').ok_or(RegistryError::MalformedAuth)?;
            return Ok(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        Ok(Credentials {
            username: self.username.clone().unwrap_or_default(),
            password: self.password.clone().unwrap_or_default(),
        })
    }
}

/// Docker config keys may be bare hosts or URLs such as `https://index.docker.io/v1/`.
fn same_registry(config_key: &str, registry: &str) -> bool {
    fn normalize(host: &str) -> &str {
        let host = host
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let host = host.split('/').next().unwrap_or(host);
        match host {
            "index.docker.io" | DOCKER_HUB_API => DOCKER_HUB,
            other => other,
        }
    }
    normalize(config_key) == normalize(registry)
}

/// Parses the parameters of a `WWW-Authenticate` header.
fn parse_challenge(header: &str) -> Option<(String, BTreeMap<String, String>)> {
    let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
    let re = Regex::new(r#"(\w+)="([^"]*)""#).ok()?;
    let params = re
        .captures_iter(params)
        .map(|caps| (caps[1].to_lowercase(), caps[2].to_string()))
        .collect();
    Some((scheme.to_lowercase(), params))
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

enum Authorization {
    Basic(Credentials),
    Bearer(String),
}

pub struct HttpRegistry {
    client: Arc<dyn KubeClient>,
    http: reqwest::Client,
    http_skip_verify: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(client: Arc<dyn KubeClient>, timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let http_skip_verify = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            http,
            http_skip_verify,
        })
    }

    async fn head_manifest(
        &self,
        http: &reqwest::Client,
        url: &str,
        authorization: Option<&Authorization>,
    ) -> Result<reqwest::Response, RegistryError> {
        let mut request = http.head(url).header("Accept", MANIFEST_MEDIA_TYPES.join(", "));
        match authorization {
            Some(Authorization::Basic(credentials)) => {
                request = request.basic_auth(&credentials.username, Some(&credentials.password));
            }
            Some(Authorization::Bearer(token)) => {
                request = request.bearer_auth(token);
            }
            None => {}
        }
        Ok(request.send().await?)
    }

    async fn answer_challenge(
        &self,
        http: &reqwest::Client,
        challenge: &str,
        credentials: Option<Credentials>,
    ) -> Result<Authorization, RegistryError> {
        let unsupported = || RegistryError::UnsupportedChallenge(challenge.to_string());
        let (scheme, params) = parse_challenge(challenge).ok_or_else(unsupported)?;

        match scheme.as_str() {
            "basic" => credentials.map(Authorization::Basic).ok_or_else(unsupported),
            "bearer" => {
                let realm = params.get("realm").ok_or_else(unsupported)?;
                let query: Vec<(&str, &str)> = ["service", "scope"]
                    .iter()
                    .filter_map(|key| params.get(*key).map(|value| (*key, value.as_str())))
                    .collect();

                let mut request = http.get(realm).query(&query);
                if let Some(credentials) = &credentials {
                    request = request.basic_auth(&credentials.username, Some(&credentials.password));
                }
                let response = request.send().await?;
                if !response.status().is_success() {
                    return Err(RegistryError::UnexpectedStatus {
                        url: realm.clone(),
                        status: response.status().as_u16(),
                    });
                }
                let token: TokenResponse = response.json().await?;
                token
                    .token
                    .or(token.access_token)
                    .map(Authorization::Bearer)
                    .ok_or_else(unsupported)
            }
            _ => Err(unsupported()),
        }
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn image_exists(
        &self,
        image: &str,
        tls: &RegistryTls,
        auth: &RegistryAuthGetter,
    ) -> Result<bool, RegistryError> {
        let reference = ImageReference::parse(image)?;
        let http = if tls.insecure_skip_tls_verify {
            &self.http_skip_verify
        } else {
            &self.http
        };
        let scheme = if tls.insecure { "http" } else { "https" };
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme,
            reference.api_host(),
            reference.repository,
            reference.reference
        );

        let mut response = self.head_manifest(http, &url, None).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let credentials = auth
                .credentials(self.client.as_ref(), &reference.registry)
                .await?;
            let authorization = self.answer_challenge(http, &challenge, credentials).await?;
            response = self.head_manifest(http, &url, Some(&authorization)).await?;
        }

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => {
                tracing::debug!(%image, "image not found in registry");
                Ok(false)
            }
            status => Err(RegistryError::UnexpectedStatus {
                url,
                status: status.as_u16(),
            }),
        }
    }
}
