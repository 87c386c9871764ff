//! Imported skill packages.
//!
//! A skill package is a JSON manifest declaring one or more skills, each
//! backed by an HTTP endpoint that receives the call arguments as a JSON
//! POST body. Packages are imported at startup from configured directories;
//! a malformed manifest is skipped with a warning and never takes the rest
//! of the import down.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use toolmesh_core::error::ToolError;
use toolmesh_core::tool::{Callable, ToolResult};

/// A parsed skill-package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPackage {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub skills: Vec<PackagedSkillSpec>,
}

/// One skill declared inside a package manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagedSkillSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    /// HTTP endpoint invoked with the call arguments as a JSON body.
    pub endpoint: String,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// A `Callable` bound to a packaged skill's endpoint.
pub struct PackagedSkill {
    spec: PackagedSkillSpec,
    client: reqwest::Client,
}

impl PackagedSkill {
    pub fn new(spec: PackagedSkillSpec) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { spec, client }
    }
}

#[async_trait]
impl Callable for PackagedSkill {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.spec.parameters.clone()
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let response = self
            .client
            .post(&self.spec.endpoint)
            .json(&arguments)
            .send()
            .await
            .map_err(|e| ToolError::Transport {
                tool: self.spec.name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            // The endpoint answered; this is the skill refusing, not the
            // wire breaking.
            return Ok(ToolResult::error(
                "",
                format!("skill endpoint returned {status}: {body}"),
            ));
        }

        Ok(ToolResult::ok("", body))
    }
}

/// Load every `*.json` manifest in `dir` into ready-to-register callables.
///
/// Returns the successfully imported skills; malformed files are logged and
/// skipped.
pub fn load_packages_from_dir(dir: &Path) -> Vec<Arc<dyn Callable>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read skill package directory");
            return Vec::new();
        }
    };

    let mut skills: Vec<Arc<dyn Callable>> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match load_manifest(&path) {
            Ok(package) => {
                debug!(
                    package = %package.name,
                    skills = package.skills.len(),
                    "Imported skill package"
                );
                for spec in package.skills {
                    skills.push(Arc::new(PackagedSkill::new(spec)));
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed skill package");
            }
        }
    }
    skills
}

fn load_manifest(path: &Path) -> Result<SkillPackage, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let package: SkillPackage = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
    if package.skills.is_empty() {
        return Err("package declares no skills".into());
    }
    Ok(package)
}
