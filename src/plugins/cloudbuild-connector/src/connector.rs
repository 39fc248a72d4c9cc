//! Connector contract implementation for Google Cloud Build.

use pipewright_core::contract::{Connector, ContractError, ContractResult};
use pipewright_core::models::{ActionRequired, GeneratedFile, Step, StepsFile, ValueBag};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;

/// Where the operator installs the Cloud Build GitHub app when the
/// repository has no connection yet.
const APP_INSTALL_URL: &str = "https://github.com/apps/google-cloud-build/installations/new";

/// Builder image used when a step does not name one.
const DEFAULT_BUILDER: &str = "gcr.io/cloud-builders/gcloud";

pub struct CloudBuildConnector;

impl CloudBuildConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CloudBuildConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for CloudBuildConnector {
    fn connect_repo(&self, steps_file: &StepsFile) -> ContractResult<ActionRequired> {
        if config_str(&steps_file.config, "connection").is_some() {
            tracing::info!(repo = %steps_file.repo_url, "repository already connected");
            return Ok(ActionRequired::none());
        }

        // No connection recorded: the operator has to install the Cloud
        // Build app on the repository before triggers can be created.
        tracing::info!(repo = %steps_file.repo_url, "repository requires app installation");
        Ok(ActionRequired::with_url(APP_INSTALL_URL))
    }

    fn create_trigger(&self, steps_file: &StepsFile) -> ContractResult<()> {
        let connection = config_str(&steps_file.config, "connection").ok_or_else(|| {
            ContractError::other("repository is not connected; run connect first")
        })?;
        let (owner, name) = parse_repo(&steps_file.repo_url)?;
        let branch = config_str(&steps_file.config, "branch").unwrap_or("main");

        let trigger = json!({
            "name": format!("{name}-{branch}-push"),
            "description": format!("Pipewright trigger for {}", steps_file.repo_url),
            "github": {
                "owner": owner,
                "name": name,
                "push": { "branch": format!("^{branch}$") },
            },
            "filename": "cloudbuild.yaml",
            "substitutions": { "_CONNECTION": connection },
        });

        let path = trigger_path(&steps_file.config, &name);
        let contents = serde_json::to_vec_pretty(&trigger)
            .map_err(|err| ContractError::other(format!("failed to encode trigger: {err}")))?;
        std::fs::write(&path, contents).map_err(|err| {
            ContractError::other(format!("failed to write trigger file {}: {err}", path.display()))
        })?;

        tracing::info!(
            trigger = %path.display(),
            "trigger definition written; import it with `gcloud builds triggers import`"
        );
        Ok(())
    }

    fn generate_script(&self, steps_file: &StepsFile) -> ContractResult<GeneratedFile> {
        if steps_file.steps.is_empty() {
            return Err(ContractError::invalid_config("steps file has no steps"));
        }

        let steps = steps_file
            .steps
            .iter()
            .map(build_step)
            .collect::<ContractResult<Vec<BuildStep>>>()?;

        let script = BuildScript { steps };
        let yaml = serde_yaml::to_string(&script)
            .map_err(|err| ContractError::other(format!("failed to render script: {err}")))?;
        Ok(GeneratedFile::new(yaml))
    }
}

#[derive(Debug, Serialize)]
struct BuildScript {
    steps: Vec<BuildStep>,
}

#[derive(Debug, Serialize)]
struct BuildStep {
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    entrypoint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
}

/// Substitute the step's placeholders into a build step entry.
fn build_step(step: &Step) -> ContractResult<BuildStep> {
    let image = config_str(&step.placeholders, "image").unwrap_or(DEFAULT_BUILDER);
    let entrypoint = config_str(&step.placeholders, "entrypoint").map(str::to_owned);

    let args = match step.placeholders.get("args") {
        None => Vec::new(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item.as_str() {
                Some(text) => text.to_owned(),
                None => item.to_string(),
            })
            .collect(),
        Some(_) => {
            return Err(ContractError::invalid_config(format!(
                "step {}: args placeholder must be an array",
                step.step
            )))
        }
    };

    Ok(BuildStep {
        id: step.step.clone(),
        name: image.to_owned(),
        entrypoint,
        args,
    })
}

fn config_str<'a>(bag: &'a ValueBag, key: &str) -> Option<&'a str> {
    bag.get(key)
        .and_then(|value| value.as_str())
        .filter(|text| !text.is_empty())
}

/// Extract `(owner, name)` from an HTTPS repository URL.
fn parse_repo(repo_url: &str) -> ContractResult<(String, String)> {
    let trimmed = repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git");
    let mut segments = trimmed.rsplit('/');
    let name = segments.next().filter(|s| !s.is_empty());
    let owner = segments.next().filter(|s| !s.is_empty() && !s.contains(':'));
    match (owner, name) {
        (Some(owner), Some(name)) => Ok((owner.to_owned(), name.to_owned())),
        _ => Err(ContractError::invalid_config(format!(
            "cannot derive owner/name from repo url {repo_url}"
        ))),
    }
}

fn trigger_path(config: &ValueBag, repo_name: &str) -> PathBuf {
    config_str(config, "trigger_file")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{repo_name}-trigger.json")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::connector_contract::{
        run_connector_contract, ConnectorContractExpectations,
    };
    use serde_json::json;

    fn steps_file(connected: bool, steps: Vec<Step>) -> StepsFile {
        let mut config = ValueBag::new();
        if connected {
            config.insert("connection".into(), json!("projects/acme/connections/gh"));
        }
        config.insert("branch".into(), json!("main"));
        StepsFile {
            kind: "cloudbuild".into(),
            version: "1".into(),
            repo_url: "https://github.com/acme/app".into(),
            config,
            steps,
        }
    }

    fn build_steps() -> Vec<Step> {
        let mut test_placeholders = ValueBag::new();
        test_placeholders.insert("image".into(), json!("rust:1.79"));
        test_placeholders.insert("entrypoint".into(), json!("cargo"));
        test_placeholders.insert("args".into(), json!(["test", "--workspace"]));

        let mut deploy_placeholders = ValueBag::new();
        deploy_placeholders.insert("args".into(), json!(["run", "deploy"]));

        vec![
            Step {
                step: "unit-test".into(),
                placeholders: test_placeholders,
            },
            Step {
                step: "deploy".into(),
                placeholders: deploy_placeholders,
            },
        ]
    }

    #[test]
    fn passes_the_shared_connector_contract() {
        let connector = CloudBuildConnector::new();
        let expectations = ConnectorContractExpectations {
            steps_file: steps_file(true, build_steps()),
            expect_pending_action: false,
            step_markers: vec!["unit-test".into(), "deploy".into()],
        };
        let result = run_connector_contract(&connector, &expectations);
        assert!(result.is_ok(), "contract failed: {result:?}");
    }

    #[test]
    fn unconnected_repo_requires_app_installation() {
        let connector = CloudBuildConnector::new();
        let outcome = connector
            .connect_repo(&steps_file(false, Vec::new()))
            .expect("pending action is not an error");
        assert!(outcome.is_pending());
        assert!(outcome.action_url.starts_with("https://"));
    }

    #[test]
    fn generated_script_substitutes_placeholders_in_order() {
        let connector = CloudBuildConnector::new();
        let file = connector
            .generate_script(&steps_file(true, build_steps()))
            .unwrap();
        let yaml = String::from_utf8(file.0).unwrap();

        let test_pos = yaml.find("id: unit-test").expect("test step present");
        let deploy_pos = yaml.find("id: deploy").expect("deploy step present");
        assert!(test_pos < deploy_pos, "steps reordered:\n{yaml}");
        assert!(yaml.contains("name: rust:1.79"));
        assert!(yaml.contains("entrypoint: cargo"));
        assert!(yaml.contains(&format!("name: {DEFAULT_BUILDER}")));
    }

    #[test]
    fn empty_steps_are_rejected() {
        let connector = CloudBuildConnector::new();
        let err = connector
            .generate_script(&steps_file(true, Vec::new()))
            .unwrap_err();
        assert!(matches!(err, ContractError::InvalidConfig { .. }));
    }

    #[test]
    fn trigger_requires_connection() {
        let connector = CloudBuildConnector::new();
        let err = connector
            .create_trigger(&steps_file(false, build_steps()))
            .unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[test]
    fn trigger_definition_lands_in_the_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let trigger_file = dir.path().join("trigger.json");

        let mut file = steps_file(true, build_steps());
        file.config.insert(
            "trigger_file".into(),
            json!(trigger_file.to_string_lossy()),
        );

        CloudBuildConnector::new().create_trigger(&file).unwrap();

        let trigger: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&trigger_file).unwrap()).unwrap();
        assert_eq!(trigger["github"]["owner"], "acme");
        assert_eq!(trigger["github"]["name"], "app");
        assert_eq!(trigger["github"]["push"]["branch"], "^main$");
    }

    #[test]
    fn repo_urls_with_git_suffix_parse() {
        let (owner, name) = parse_repo("https://github.com/acme/app.git").unwrap();
        assert_eq!((owner.as_str(), name.as_str()), ("acme", "app"));
        assert!(parse_repo("not-a-url").is_err());
    }
}
