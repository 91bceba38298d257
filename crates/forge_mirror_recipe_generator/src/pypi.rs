use std::collections::HashMap;

use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use url::Url;

use crate::serialize::{PythonTest, PythonTestInner, Recipe, UrlSourceElement};

/// Errors raised while talking to a PyPI index.
#[derive(Debug, thiserror::Error)]
pub enum PyPiError {
    /// The package (or the requested release) does not exist on any index.
    #[error("{package}{} was not found on any configured PyPI index", version_suffix(.version))]
    NotFound {
        package: String,
        version: Option<String>,
    },

    /// The release exists but publishes no source distribution.
    #[error("no source distribution is published for {package} {version}")]
    NoSourceDistribution { package: String, version: String },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest_middleware::Error,
    },

    #[error("{url} responded with status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("could not decode the response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid PyPI index url '{0}': {1}")]
    InvalidIndexUrl(String, url::ParseError),

    #[error("failed to fetch metadata from all PyPI indexes:\n- {}", .0.join("\n- "))]
    AllIndexesFailed(Vec<String>),
}

fn version_suffix(version: &Option<String>) -> String {
    version
        .as_ref()
        .map(|v| format!(" {v}"))
        .unwrap_or_default()
}

/// One downloadable file of a PyPI release.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct PyPiFile {
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub digests: HashMap<String, String>,
    #[serde(default)]
    pub packagetype: String,
}

impl PyPiFile {
    fn is_sdist(&self) -> bool {
        self.packagetype == "sdist"
            || self.filename.ends_with(".tar.gz")
            || self.filename.ends_with(".zip")
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PyPiInfo {
    pub name: String,
    pub version: String,
    pub summary: Option<String>,
    pub home_page: Option<String>,
    pub license: Option<String>,
    pub license_expression: Option<String>,
    pub requires_dist: Option<Vec<String>>,
    pub project_urls: Option<HashMap<String, String>>,
    pub requires_python: Option<String>,
}

/// Metadata about one PyPI release, as returned by the JSON API.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct PyPiMetadata {
    pub info: PyPiInfo,
    #[serde(default)]
    pub urls: Vec<PyPiFile>,
}

impl PyPiMetadata {
    /// The source distribution of this release, if one was uploaded.
    pub fn sdist(&self) -> Option<&PyPiFile> {
        self.urls
            .iter()
            .find(|f| f.packagetype == "sdist")
            .or_else(|| self.urls.iter().find(|f| f.is_sdist()))
    }

    /// All wheels are `none-any`, so the package can be built as `noarch: python`.
    fn is_pure_python(&self) -> bool {
        let mut wheels = self
            .urls
            .iter()
            .filter(|f| f.filename.ends_with(".whl"))
            .peekable();

        // Conservative: if no wheels found, assume arch-specific
        wheels.peek().is_some() && wheels.all(|w| w.filename.ends_with("-none-any.whl"))
    }
}

/// Client for the PyPI JSON API, trying each configured index in turn.
#[derive(Clone, Debug)]
pub struct PyPiClient {
    client: ClientWithMiddleware,
    index_urls: Vec<Url>,
}

impl PyPiClient {
    pub fn new(client: ClientWithMiddleware, index_urls: &[String]) -> Result<Self, PyPiError> {
        let index_urls = index_urls
            .iter()
            .map(|raw| {
                let with_slash = if raw.ends_with('/') {
                    raw.clone()
                } else {
                    format!("{raw}/")
                };
                Url::parse(&with_slash).map_err(|e| PyPiError::InvalidIndexUrl(raw.clone(), e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { client, index_urls })
    }

    /// Fetch the metadata of `package` at `version`, or of its latest release.
    ///
    /// `package` is used verbatim; PyPI names are case-insensitive but the
    /// caller passes the upstream spelling.
    pub async fn fetch_metadata(
        &self,
        package: &str,
        version: Option<&str>,
    ) -> Result<PyPiMetadata, PyPiError> {
        let mut errors = Vec::new();
        let mut not_found = 0;

        for base_url in &self.index_urls {
            match self.fetch_from_index(base_url, package, version).await {
                Ok(metadata) => {
                    tracing::debug!("Fetched metadata for {} from {}", package, base_url);
                    return Ok(metadata);
                }
                Err(PyPiError::NotFound { .. }) => not_found += 1,
                Err(err) => {
                    tracing::warn!("Failed to fetch from {}: {}", base_url, err);
                    errors.push(format!("{base_url}: {err}"));
                }
            }
        }

        if not_found == self.index_urls.len() {
            return Err(PyPiError::NotFound {
                package: package.to_string(),
                version: version.map(str::to_string),
            });
        }
        Err(PyPiError::AllIndexesFailed(errors))
    }

    async fn fetch_from_index(
        &self,
        base_url: &Url,
        package: &str,
        version: Option<&str>,
    ) -> Result<PyPiMetadata, PyPiError> {
        let path = match version {
            Some(version) => format!("{package}/{version}/json"),
            None => format!("{package}/json"),
        };
        let url = base_url
            .join(&path)
            .map_err(|e| PyPiError::InvalidIndexUrl(base_url.to_string(), e))?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| PyPiError::Request {
                url: url.to_string(),
                source,
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PyPiError::NotFound {
                package: package.to_string(),
                version: version.map(str::to_string),
            });
        }
        if !response.status().is_success() {
            return Err(PyPiError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        response
            .json::<PyPiMetadata>()
            .await
            .map_err(|source| PyPiError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

/// Knobs that turn a plain PyPI skeleton into the recipe we want to build.
#[derive(Debug, Clone, Default)]
pub struct SkeletonOptions {
    /// Constraint on the interpreter, e.g. `>=3.10`.
    pub python_requirement: Option<String>,
    /// The package compiles against the numpy C API.
    pub numpy_compiled_extensions: bool,
    /// Constraint on numpy at build time, e.g. `>=1.26`.
    pub numpy_requirement: Option<String>,
    /// Turn the optional `extra == ...` requirements into real run requirements.
    pub include_extras: bool,
    /// Extra arguments appended to the pip install invocation.
    pub setup_options: Option<String>,
}

const MARKER: &str = ";MARKER;";

pub(crate) fn format_requirement(req: &str, include_extras: bool) -> String {
    let req = req.trim();
    let (spec, marker) = match req.split_once(';') {
        Some((spec, marker)) => (spec.trim(), Some(marker.trim())),
        None => (req, None),
    };

    // Split package name from version specifiers
    let (name, version) = match spec
        .find(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_')
    {
        Some(pos) => (&spec[..pos], &spec[pos..]),
        None => (spec, ""),
    };

    // drop `[extra]` selections and the legacy `(>=1.0)` form
    let version = match version.trim().strip_prefix('[') {
        Some(rest) => rest.split_once(']').map(|(_, v)| v).unwrap_or(""),
        None => version,
    };
    let version = version
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim();

    let formatted = format!("{} {}", name.to_lowercase(), version);
    let formatted = formatted.trim_end().to_string();

    match marker {
        Some(marker) if include_extras && marker.contains("extra") => formatted,
        Some(marker) => format!("{formatted} {MARKER} {marker}"),
        None => formatted,
    }
}

/// Requirements with environment markers cannot be expressed in the recipe;
/// they are kept as commented-out entries for a human to look at.
fn post_process_markers(recipe_yaml: String) -> String {
    recipe_yaml
        .lines()
        .map(|line| {
            if line.contains(MARKER) {
                line.replacen("- ", "# - ", 1).replace(MARKER, "#")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_license(info: &PyPiInfo) -> Option<String> {
    if let Some(expr) = info.license_expression.as_deref().map(str::trim)
        && !expr.is_empty()
    {
        return Some(expr.to_string());
    }

    // Skip the legacy field when it holds a full license text.
    info.license
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty() && l.len() < 100 && !l.contains('\n'))
        .map(str::to_string)
}

/// Build a skeleton recipe from PyPI metadata.
pub fn create_recipe(metadata: &PyPiMetadata, opts: &SkeletonOptions) -> Result<Recipe, PyPiError> {
    let info = &metadata.info;
    let sdist = metadata
        .sdist()
        .ok_or_else(|| PyPiError::NoSourceDistribution {
            package: info.name.clone(),
            version: info.version.clone(),
        })?;

    let mut recipe = Recipe::default();
    recipe
        .context
        .insert("version".to_string(), info.version.clone());
    recipe.package.name = info.name.to_lowercase();
    recipe.package.version = "${{ version }}".to_string();
    recipe.build.number = "0".to_string();

    recipe.source.push(UrlSourceElement {
        url: vec![sdist.url.replace(info.version.as_str(), "${{ version }}")],
        sha256: sdist.digests.get("sha256").cloned(),
        md5: sdist
            .digests
            .get("sha256")
            .is_none()
            .then(|| sdist.digests.get("md5").cloned())
            .flatten(),
    });

    if metadata.is_pure_python() && !opts.numpy_compiled_extensions {
        recipe.build.noarch = Some("python".to_string());
    }

    let mut script = "${{ PYTHON }} -m pip install . -vv --no-deps --no-build-isolation".to_string();
    if let Some(setup_options) = opts.setup_options.as_deref().map(str::trim)
        && !setup_options.is_empty()
    {
        script.push(' ');
        script.push_str(setup_options);
    }
    recipe.build.script = script;

    let python = match opts
        .python_requirement
        .as_deref()
        .or(info.requires_python.as_deref())
    {
        Some(spec) => format!("python {}", spec.trim()),
        None => "python".to_string(),
    };
    recipe.requirements.host.push(python.clone());
    recipe.requirements.host.push("pip".to_string());
    recipe.requirements.host.push("setuptools".to_string());
    recipe.requirements.run.push(python);

    if opts.numpy_compiled_extensions {
        let numpy = match opts.numpy_requirement.as_deref().map(str::trim) {
            Some(spec) if !spec.is_empty() => format!("numpy {spec}"),
            _ => "numpy".to_string(),
        };
        recipe
            .requirements
            .build
            .push("${{ compiler('c') }}".to_string());
        recipe.requirements.host.push(numpy);
        recipe
            .requirements
            .run
            .push("${{ pin_compatible('numpy') }}".to_string());
    }

    for req in info.requires_dist.iter().flatten() {
        let formatted = format_requirement(req, opts.include_extras);
        if formatted.split_whitespace().next() == Some("numpy") && opts.numpy_compiled_extensions {
            continue;
        }
        recipe.requirements.run.push(formatted);
    }

    recipe.tests.push(PythonTest {
        python: PythonTestInner {
            imports: vec![info.name.replace('-', "_").to_lowercase()],
            pip_check: true,
        },
    });

    recipe.about.summary = info.summary.clone();
    recipe.about.homepage = info.home_page.clone().filter(|h| !h.is_empty());
    recipe.about.license = extract_license(info);
    if let Some(urls) = &info.project_urls {
        recipe.about.repository = urls.get("Source Code").or(urls.get("Source")).cloned();
        recipe.about.documentation = urls.get("Documentation").cloned();
    }

    Ok(recipe)
}

/// Render a generated recipe to YAML text.
pub fn format_recipe(recipe: &Recipe) -> String {
    let mut text = post_process_markers(recipe.to_string());
    text.push('\n');
    text
}
