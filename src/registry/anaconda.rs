//! The anaconda.org REST API.

use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

use async_trait::async_trait;
use rattler_conda_types::Version;
use reqwest::{Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use url::Url;

use super::{Artifact, CopyRequest, Registry, RegistryError, RegistrySnapshot};
use crate::package::InterpreterTag;

/// Channels are copied from and to the `main` label.
const MAIN_LABEL: &str = "main";

#[derive(Debug, Deserialize)]
struct PackageResponse {
    latest_version: String,
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default)]
    files: Vec<FileResponse>,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    basename: String,
    version: String,
    #[serde(default)]
    attrs: FileAttrs,
}

#[derive(Debug, Default, Deserialize)]
struct FileAttrs {
    subdir: Option<String>,
    build: Option<String>,
}

/// A [`Registry`] backed by anaconda.org (or a compatible server).
#[derive(Clone, Debug)]
pub struct AnacondaRegistry {
    client: ClientWithMiddleware,
    api_url: Url,
    token: Option<String>,
}

impl AnacondaRegistry {
    pub fn new(client: ClientWithMiddleware, api_url: Url, token: Option<String>) -> Self {
        // `Url::join` drops the last segment unless the base ends in a slash
        let api_url = if api_url.path().ends_with('/') {
            api_url
        } else {
            let mut api_url = api_url;
            api_url.set_path(&format!("{}/", api_url.path()));
            api_url
        };
        Self {
            client,
            api_url,
            token,
        }
    }

    fn request(&self, method: Method, url: Url) -> reqwest_middleware::RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, format!("token {token}")),
            None => request,
        }
    }
}

fn snapshot_from_response(
    name: &str,
    response: PackageResponse,
) -> Result<RegistrySnapshot, RegistryError> {
    let parse = |version: &str| {
        Version::from_str(version).map_err(|source| RegistryError::InvalidVersion {
            name: name.to_string(),
            version: version.to_string(),
            source,
        })
    };

    let latest_version = parse(&response.latest_version)?;

    let mut artifacts_by_version: BTreeMap<Version, Vec<Artifact>> = BTreeMap::new();
    for file in response.files {
        let version = match parse(&file.version) {
            Ok(version) => version,
            Err(err) => {
                tracing::warn!("Ignoring {}: {}", file.basename, err);
                continue;
            }
        };
        let platform = file
            .attrs
            .subdir
            .or_else(|| file.basename.split_once('/').map(|(subdir, _)| subdir.to_string()))
            .unwrap_or_default();
        let interpreter_tag = file
            .attrs
            .build
            .as_deref()
            .and_then(InterpreterTag::from_build_string);

        artifacts_by_version.entry(version).or_default().push(Artifact {
            platform,
            interpreter_tag,
            filename: file.basename,
        });
    }

    Ok(RegistrySnapshot {
        latest_version,
        known_versions: response.versions.into_iter().collect::<BTreeSet<_>>(),
        artifacts_by_version,
    })
}

#[async_trait]
impl Registry for AnacondaRegistry {
    async fn package_info(
        &self,
        channel: &str,
        name: &str,
    ) -> Result<RegistrySnapshot, RegistryError> {
        let url = self.api_url.join(&format!("package/{channel}/{name}"))?;
        tracing::debug!("Fetching package info from {}", url);

        let response = self
            .request(Method::GET, url.clone())
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(RegistryError::NotFound {
                    channel: channel.to_string(),
                    name: name.to_string(),
                });
            }
            status if !status.is_success() => {
                return Err(RegistryError::Status {
                    url: url.to_string(),
                    status,
                    body: response.text().await.unwrap_or_default(),
                });
            }
            _ => {}
        }

        let body = response
            .json::<PackageResponse>()
            .await
            .map_err(|source| RegistryError::Decode {
                url: url.to_string(),
                source,
            })?;
        snapshot_from_response(name, body)
    }

    async fn copy(&self, request: &CopyRequest) -> Result<(), RegistryError> {
        let mut path = format!(
            "copy/package/{}/{}/{}",
            request.source_channel, request.name, request.version
        );
        if let Some(filename) = &request.filename {
            path.push('/');
            path.push_str(filename);
        }
        let url = self.api_url.join(&path)?;

        if self.token.is_none() {
            return Err(RegistryError::Unauthorized {
                url: url.to_string(),
                reason: "no API token was configured".to_string(),
            });
        }

        let payload = serde_json::json!({
            "to_owner": request.dest_channel,
            "from_channel": MAIN_LABEL,
            "to_channel": MAIN_LABEL,
        });

        let response = self
            .request(Method::POST, url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.to_string(),
                source,
            })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RegistryError::Unauthorized {
                url: url.to_string(),
                reason: response.text().await.unwrap_or_default(),
            }),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound {
                channel: request.source_channel.clone(),
                name: request.name.clone(),
            }),
            status => Err(RegistryError::Status {
                url: url.to_string(),
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_mirror_networking::BaseClient;
    use pretty_assertions::assert_eq;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    fn registry_for(server: &MockServer, token: Option<&str>) -> AnacondaRegistry {
        let client = BaseClient::builder().timeout(5).build().unwrap();
        AnacondaRegistry::new(
            client.get_client().clone(),
            Url::parse(&server.uri()).unwrap(),
            token.map(str::to_string),
        )
    }

    fn sep_copy(filename: Option<&str>) -> CopyRequest {
        CopyRequest {
            source_channel: "conda-forge".to_string(),
            dest_channel: "astropy".to_string(),
            name: "sep".to_string(),
            version: "1.2.1".to_string(),
            filename: filename.map(str::to_string),
        }
    }

    const SEP_RESPONSE: &str = r#"{
        "name": "sep",
        "latest_version": "1.2.1",
        "versions": ["1.2.0", "1.2.1"],
        "files": [
            {
                "basename": "linux-64/sep-1.2.1-py312h1d5aa0c_0.conda",
                "version": "1.2.1",
                "attrs": {"subdir": "linux-64", "build": "py312h1d5aa0c_0"}
            },
            {
                "basename": "osx-64/sep-1.2.1-py313h2b3c4d5_0.conda",
                "version": "1.2.1",
                "attrs": {"subdir": "osx-64", "build": "py313h2b3c4d5_0"}
            },
            {
                "basename": "linux-64/sep-1.2.0-py312h1d5aa0c_0.tar.bz2",
                "version": "1.2.0",
                "attrs": {"build": "py312h1d5aa0c_0"}
            },
            {
                "basename": "linux-64/sep-bogus.tar.bz2",
                "version": "not a version!",
                "attrs": {}
            }
        ]
    }"#;

    #[test]
    fn response_becomes_snapshot() {
        let response: PackageResponse = serde_json::from_str(SEP_RESPONSE).unwrap();
        let snapshot = snapshot_from_response("sep", response).unwrap();

        assert_eq!(snapshot.latest_version, Version::from_str("1.2.1").unwrap());
        assert_eq!(
            snapshot.known_versions,
            BTreeSet::from(["1.2.0".to_string(), "1.2.1".to_string()])
        );

        let latest = snapshot.artifacts_for(&snapshot.latest_version);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].platform, "linux-64");
        assert_eq!(latest[0].interpreter_tag, Some(InterpreterTag::new(3, 12)));
        assert_eq!(latest[1].interpreter_tag, Some(InterpreterTag::new(3, 13)));

        // subdir falls back to the basename prefix
        let older = snapshot.artifacts_for(&Version::from_str("1.2.0").unwrap());
        assert_eq!(older[0].platform, "linux-64");
        assert_eq!(snapshot.artifacts_by_version.len(), 2);
    }

    #[test]
    fn invalid_latest_version_is_an_error() {
        let response = PackageResponse {
            latest_version: "not a version!".to_string(),
            versions: vec![],
            files: vec![],
        };
        let err = snapshot_from_response("sep", response).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidVersion { .. }));
    }

    #[test]
    fn api_url_gets_a_trailing_slash() {
        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
        let registry = AnacondaRegistry::new(
            client,
            Url::parse("https://api.anaconda.org/v1").unwrap(),
            None,
        );
        assert_eq!(
            registry.api_url.join("package/astropy/sep").unwrap().as_str(),
            "https://api.anaconda.org/v1/package/astropy/sep"
        );
    }

    #[tokio::test]
    async fn copy_without_token_is_refused() {
        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
        let registry = AnacondaRegistry::new(
            client,
            Url::parse("https://api.anaconda.org").unwrap(),
            None,
        );
        let err = registry
            .copy(&CopyRequest {
                source_channel: "conda-forge".to_string(),
                dest_channel: "astropy".to_string(),
                name: "sep".to_string(),
                version: "1.2.1".to_string(),
                filename: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn missing_package_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/package/astropy/sep"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = registry_for(&server, None)
            .package_info("astropy", "sep")
            .await
            .unwrap_err();
        assert!(
            matches!(&err, RegistryError::NotFound { channel, name } if channel == "astropy" && name == "sep"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn package_info_survives_one_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/package/conda-forge/sep"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/package/conda-forge/sep"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SEP_RESPONSE))
            .mount(&server)
            .await;

        let snapshot = registry_for(&server, None)
            .package_info("conda-forge", "sep")
            .await
            .unwrap();
        assert_eq!(snapshot.latest_version, Version::from_str("1.2.1").unwrap());
    }

    #[tokio::test]
    async fn other_statuses_keep_the_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/package/astropy/sep"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let err = registry_for(&server, None)
            .package_info("astropy", "sep")
            .await
            .unwrap_err();
        assert!(
            matches!(&err, RegistryError::Status { status, body, .. } if *status == StatusCode::BAD_REQUEST && body == "bad request"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn forbidden_copy_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/copy/package/conda-forge/sep/1.2.1"))
            .and(header("authorization", "token secret"))
            .respond_with(ResponseTemplate::new(403).set_body_string("no write access"))
            .mount(&server)
            .await;

        let err = registry_for(&server, Some("secret"))
            .copy(&sep_copy(None))
            .await
            .unwrap_err();
        assert!(
            matches!(&err, RegistryError::Unauthorized { reason, .. } if reason == "no write access"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn single_file_copy_targets_the_basename() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/copy/package/conda-forge/sep/1.2.1/linux-64/sep-1.2.1-py312_0.conda"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        registry_for(&server, Some("secret"))
            .copy(&sep_copy(Some("linux-64/sep-1.2.1-py312_0.conda")))
            .await
            .unwrap();
    }
}
