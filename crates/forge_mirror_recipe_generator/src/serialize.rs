use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;
use serde_with::{OneOrMany, formats::PreferOne, serde_as};

#[serde_as]
#[derive(Default, Debug, Serialize)]
pub struct UrlSourceElement {
    #[serde_as(as = "OneOrMany<_, PreferOne>")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub url: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

#[derive(Default, Debug, Serialize)]
pub struct Build {
    pub number: String,
    pub script: String,
    #[serde(skip_serializing_if = "Python::is_default")]
    pub python: Python,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noarch: Option<String>,
}

#[derive(Default, Debug, Serialize)]
pub struct Python {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
}

impl Python {
    fn is_default(&self) -> bool {
        self.entry_points.is_empty()
    }
}

#[derive(Default, Debug, Serialize)]
pub struct About {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
}

#[derive(Default, Debug, Serialize)]
pub struct Package {
    pub name: String,
    pub version: String,
}

#[derive(Default, Debug, Serialize)]
pub struct PythonTestInner {
    pub imports: Vec<String>,
    pub pip_check: bool,
}

#[derive(Default, Debug, Serialize)]
pub struct PythonTest {
    pub python: PythonTestInner,
}

#[derive(Default, Debug, Serialize)]
pub struct Requirements {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub build: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub run: Vec<String>,
}

/// A generated `recipe.yaml`.
#[derive(Default, Debug, Serialize)]
pub struct Recipe {
    pub context: IndexMap<String, String>,
    pub package: Package,
    pub source: Vec<UrlSourceElement>,
    pub build: Build,
    pub requirements: Requirements,
    pub tests: Vec<PythonTest>,
    pub about: About,
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let string = serde_yaml::to_string(self).map_err(|_| fmt::Error)?;
        // add a newline before every top-level key
        let mut first_line = true;
        for line in string.lines() {
            if line.chars().next().is_some_and(|c| c.is_alphabetic()) && !first_line {
                writeln!(f)?;
            }
            first_line = false;
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}
