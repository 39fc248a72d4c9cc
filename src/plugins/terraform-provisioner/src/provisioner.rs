//! Provisioner contract implementation driving the terraform engine.
//!
//! Lifecycle per instance: `parse_config` → `setup_plugin` → `get_output`
//! (repeatable) → `destroy` (terminal). The protocol layer does not
//! enforce this; this implementation does, and reports violations as
//! ordering errors. Because state lives in the remote backend,
//! `get_output` and `destroy` can also run in a fresh instance that has
//! only parsed its configuration; they re-initialize the workspace from
//! the backend first.

use gcs_backend::GcsBackend;
use pipewright_core::contract::{ContractError, ContractResult, Provisioner};
use pipewright_core::models::{PluginDescriptor, ValueBag};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use terraform_engine::{BackendConfig, Terraform, TerraformFiles};

/// Environment variable holding a bearer token for the storage API, for
/// hosts running outside GCP.
const AUTH_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

#[derive(Debug, Clone)]
struct ParsedConfig {
    project_id: String,
    source_dir: PathBuf,
    work_root: PathBuf,
    state_bucket: String,
    vars: ValueBag,
}

impl ParsedConfig {
    fn backend_for(&self, label: &str) -> BackendConfig {
        BackendConfig {
            bucket: self.state_bucket.clone(),
            prefix: format!("terraform/state/{label}.tfstate"),
        }
    }
}

enum Lifecycle {
    Created,
    Parsed(ParsedConfig),
    Destroyed,
}

pub struct TerraformProvisioner {
    state: RwLock<Lifecycle>,
}

impl TerraformProvisioner {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Lifecycle::Created),
        }
    }

    /// Current parsed configuration, or the ordering error for the given
    /// operation.
    fn parsed(&self, operation: &str) -> ContractResult<ParsedConfig> {
        match &*self.state.read().unwrap() {
            Lifecycle::Parsed(config) => Ok(config.clone()),
            Lifecycle::Created => Err(ContractError::out_of_order(format!(
                "{operation} requires parse_config first"
            ))),
            Lifecycle::Destroyed => Err(ContractError::out_of_order(
                "plugin instance is destroyed",
            )),
        }
    }

    /// Materialize the workspace and point it at the remote state.
    fn engine_for(&self, config: &ParsedConfig, label: &str) -> ContractResult<Terraform> {
        let files = load_terraform_files(&config.source_dir)?;
        let engine = Terraform::create(&config.work_root, &config.vars, &files, label)
            .map_err(engine_error)?;
        engine
            .init(&config.backend_for(label))
            .map_err(engine_error)?;
        Ok(engine)
    }
}

impl Default for TerraformProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Provisioner for TerraformProvisioner {
    fn parse_config(&self, config: &ValueBag) -> ContractResult<()> {
        let mut state = self.state.write().unwrap();
        if matches!(*state, Lifecycle::Destroyed) {
            return Err(ContractError::out_of_order(
                "plugin instance is destroyed; parse_config is no longer valid",
            ));
        }

        let parsed = validate_config(config)?;
        tracing::info!(
            project = %parsed.project_id,
            source = %parsed.source_dir.display(),
            "configuration parsed"
        );
        *state = Lifecycle::Parsed(parsed);
        Ok(())
    }

    fn setup_plugin(&self, descriptor: &PluginDescriptor) -> ContractResult<()> {
        let config = self.parsed("setup_plugin")?;
        let label = &descriptor.plugin.label;

        let mut backend_client = GcsBackend::new();
        if let Ok(token) = std::env::var(AUTH_TOKEN_ENV) {
            backend_client = backend_client.with_auth_token(token);
        }
        backend_client
            .ensure_bucket(&config.state_bucket, &config.project_id)
            .map_err(|err| ContractError::other(err.to_string()))?;

        let engine = self.engine_for(&config, label)?;
        engine.plan().map_err(engine_error)?;
        engine.apply().map_err(engine_error)?;

        tracing::info!(label = %label, "resources materialized");
        Ok(())
    }

    fn get_output(&self, descriptor: &PluginDescriptor) -> ContractResult<ValueBag> {
        let config = self.parsed("get_output")?;
        let engine = self.engine_for(&config, &descriptor.plugin.label)?;
        engine.output().map_err(engine_error)
    }

    fn destroy(&self, descriptor: &PluginDescriptor) -> ContractResult<()> {
        let config = self.parsed("destroy")?;
        let label = &descriptor.plugin.label;

        let engine = self.engine_for(&config, label)?;
        engine.destroy().map_err(engine_error)?;
        engine.clean_up().map_err(engine_error)?;

        tracing::info!(label = %label, "resources destroyed");
        *self.state.write().unwrap() = Lifecycle::Destroyed;
        Ok(())
    }
}

fn validate_config(config: &ValueBag) -> ContractResult<ParsedConfig> {
    let project_id = required_str(config, "project_id")?;
    let source_dir = PathBuf::from(required_str(config, "source_dir")?);

    if !source_dir.is_dir() {
        return Err(ContractError::invalid_config(format!(
            "source_dir {} does not exist",
            source_dir.display()
        )));
    }
    for name in ["main.tf", "variables.tf", "output.tf"] {
        if !source_dir.join(name).is_file() {
            return Err(ContractError::invalid_config(format!(
                "source_dir is missing {name}"
            )));
        }
    }

    let work_root = config
        .get("work_dir")
        .and_then(|value| value.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("terraform"));

    let state_bucket = config
        .get("state_bucket")
        .and_then(|value| value.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("{project_id}-terraform-state-bucket"));

    let vars = match config.get("variables") {
        None => ValueBag::new(),
        Some(serde_json::Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(ContractError::invalid_config(
                "variables must be an object",
            ))
        }
    };

    Ok(ParsedConfig {
        project_id: project_id.to_owned(),
        source_dir,
        work_root,
        state_bucket,
        vars,
    })
}

fn required_str<'a>(config: &'a ValueBag, key: &str) -> ContractResult<&'a str> {
    config
        .get(key)
        .and_then(|value| value.as_str())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| ContractError::invalid_config(format!("missing required key {key}")))
}

fn load_terraform_files(source_dir: &Path) -> ContractResult<TerraformFiles> {
    let read = |name: &str| {
        std::fs::read(source_dir.join(name)).map_err(|err| {
            ContractError::invalid_config(format!("failed to read {name}: {err}"))
        })
    };
    Ok(TerraformFiles {
        main_tf: read("main.tf")?,
        variables_tf: read("variables.tf")?,
        output_tf: read("output.tf")?,
    })
}

fn engine_error(err: terraform_engine::EngineError) -> ContractError {
    ContractError::other(err.to_string())
}
