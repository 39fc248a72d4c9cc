use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An open, string-keyed mapping of dynamically-typed values.
///
/// Plugins and the host exchange configuration and outputs through these
/// bags; there is no fixed schema and key order carries no meaning. Each
/// contract method validates the keys it cares about on receipt.
pub type ValueBag = serde_json::Map<String, serde_json::Value>;

/// A plugin as declared in the host manifest.
///
/// Descriptors are passed by value into contract calls and are never
/// mutated by the plugin in place; outputs come back through return
/// values, not writes into `plugin.output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub repo_url: String,
    pub version: String,
    pub plugin: PluginSpec,
}

/// Per-plugin configuration and recorded outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PluginSpec {
    pub label: String,
    #[serde(default)]
    pub config: ValueBag,
    #[serde(default)]
    pub output: ValueBag,
}

/// The pipeline description handed to Connector plugins.
///
/// `steps` order is pipeline execution order and MUST survive every
/// transformation a connector applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepsFile {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
    pub repo_url: String,
    #[serde(default)]
    pub config: ValueBag,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A single pipeline step plus the placeholder values substituted into the
/// generated script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step: String,
    #[serde(default)]
    pub placeholders: ValueBag,
}

/// Success value of `Connector::connect_repo`.
///
/// An empty `action_url` means the repository is connected; a non-empty
/// one is a manual step the operator must complete before the connection
/// is usable. Pending is neither success-without-caveats nor failure, and
/// hosts must treat it as its own outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActionRequired {
    #[serde(default)]
    pub action_url: String,
}

impl ActionRequired {
    /// The repository is connected; nothing left for the operator to do.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            action_url: url.into(),
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.action_url.is_empty()
    }
}

/// A generated pipeline script, returned by `Connector::generate_script`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile(pub Vec<u8>);

impl GeneratedFile {
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self(contents.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for GeneratedFile {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Status record a connector-backed pipeline reports about a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineNotification {
    pub cicd_type: String,
    pub repo_url: String,
    pub branch: String,
    pub status: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_file_kind_uses_wire_name_type() {
        let steps = StepsFile {
            kind: "cloudbuild".into(),
            version: "1".into(),
            repo_url: "https://example.com/org/repo".into(),
            config: ValueBag::new(),
            steps: Vec::new(),
        };
        let json = serde_json::to_string(&steps).unwrap();
        assert!(json.contains("\"type\":\"cloudbuild\""));
        assert!(!json.contains("\"kind\""));
    }

    #[test]
    fn missing_bags_default_to_empty() {
        let json = r#"{"type":"cloudbuild","version":"1","repo_url":"https://x/y"}"#;
        let steps: StepsFile = serde_json::from_str(json).unwrap();
        assert!(steps.config.is_empty());
        assert!(steps.steps.is_empty());
    }

    #[test]
    fn action_required_pending_only_with_url() {
        assert!(!ActionRequired::none().is_pending());
        assert!(ActionRequired::with_url("https://auth/flow").is_pending());
    }

    #[test]
    fn pipeline_notification_accepts_webhook_payloads() {
        let json = r#"{
            "cicd_type": "cloudbuild",
            "repo_url": "https://github.com/acme/app",
            "branch": "main",
            "status": "SUCCESS"
        }"#;
        let notification: PipelineNotification = serde_json::from_str(json).unwrap();
        assert_eq!(notification.status, "SUCCESS");
        assert!(notification.metadata.is_empty());
    }
}
