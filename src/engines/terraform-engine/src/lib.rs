//! Provisioning driver that shells out to the `terraform` CLI.
//!
//! Given a variable bag and the three declaration payloads, the engine
//! materializes a working directory, writes a JSON variables file, and
//! exposes the init/plan/apply/output/destroy/clean_up sequence the
//! provisioner plugins drive.

use pipewright_core::models::ValueBag;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output};
use thiserror::Error;

const VAR_FILE: &str = "variables.tfvars.json";

/// The three declaration payloads a provisioner plugin ships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerraformFiles {
    pub main_tf: Vec<u8>,
    pub variables_tf: Vec<u8>,
    pub output_tf: Vec<u8>,
}

/// Remote state location passed to `terraform init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub bucket: String,
    pub prefix: String,
}

impl BackendConfig {
    /// The conventional state location for one plugin instance.
    pub fn for_plugin(project_id: &str, label: &str) -> Self {
        Self {
            bucket: format!("{project_id}-terraform-state-bucket"),
            prefix: format!("terraform/state/{label}.tfstate"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("terraform executable not found in PATH")]
    ExecutableNotFound,
    #[error("failed to prepare working directory {path}: {source}")]
    Workspace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode variables file: {0}")]
    EncodeVars(serde_json::Error),
    #[error("failed to run terraform {operation}: {source}")]
    Spawn {
        operation: &'static str,
        source: std::io::Error,
    },
    #[error("terraform {operation} failed ({status}): {stderr}")]
    CommandFailed {
        operation: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("failed to parse terraform output: {0}")]
    ParseOutput(serde_json::Error),
    #[error("failed to remove working directory {path}: {source}")]
    CleanUp {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One terraform workspace, rooted at `<work_root>/<label>`.
pub struct Terraform {
    exec_path: PathBuf,
    work_dir: PathBuf,
}

impl Terraform {
    /// Materialize the working directory and locate the terraform
    /// executable on PATH.
    pub fn create(
        work_root: &Path,
        vars: &ValueBag,
        files: &TerraformFiles,
        label: &str,
    ) -> Result<Self, EngineError> {
        let exec_path = find_in_path("terraform").ok_or(EngineError::ExecutableNotFound)?;
        Self::with_executable(exec_path, work_root, vars, files, label)
    }

    /// Like [`Terraform::create`] but with an explicit executable path;
    /// used by tests and by hosts that pin a terraform version.
    pub fn with_executable(
        exec_path: PathBuf,
        work_root: &Path,
        vars: &ValueBag,
        files: &TerraformFiles,
        label: &str,
    ) -> Result<Self, EngineError> {
        let work_dir = work_root.join(label);
        std::fs::create_dir_all(&work_dir).map_err(|source| EngineError::Workspace {
            path: work_dir.clone(),
            source,
        })?;

        write_file(&work_dir.join("main.tf"), &files.main_tf)?;
        write_file(&work_dir.join("variables.tf"), &files.variables_tf)?;
        write_file(&work_dir.join("output.tf"), &files.output_tf)?;

        let vars_json = serde_json::to_vec_pretty(vars).map_err(EngineError::EncodeVars)?;
        write_file(&work_dir.join(VAR_FILE), &vars_json)?;

        Ok(Self {
            exec_path,
            work_dir,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn init(&self, backend: &BackendConfig) -> Result<(), EngineError> {
        self.run(
            "init",
            &[
                "init".to_owned(),
                "-input=false".to_owned(),
                format!("-backend-config=bucket={}", backend.bucket),
                format!("-backend-config=prefix={}", backend.prefix),
            ],
        )?;
        Ok(())
    }

    pub fn plan(&self) -> Result<(), EngineError> {
        self.run(
            "plan",
            &[
                "plan".to_owned(),
                "-input=false".to_owned(),
                format!("-var-file={VAR_FILE}"),
            ],
        )?;
        Ok(())
    }

    pub fn apply(&self) -> Result<(), EngineError> {
        self.run(
            "apply",
            &[
                "apply".to_owned(),
                "-input=false".to_owned(),
                "-auto-approve".to_owned(),
                format!("-var-file={VAR_FILE}"),
            ],
        )?;
        Ok(())
    }

    /// Read the output values from state. Sensitive values are passed
    /// through but never logged.
    pub fn output(&self) -> Result<ValueBag, EngineError> {
        let raw = self.run("output", &["output".to_owned(), "-json".to_owned()])?;

        #[derive(Deserialize)]
        struct OutputMeta {
            #[serde(default)]
            sensitive: bool,
            value: serde_json::Value,
        }

        let outputs: std::collections::BTreeMap<String, OutputMeta> =
            serde_json::from_slice(&raw.stdout).map_err(EngineError::ParseOutput)?;

        let mut bag = ValueBag::new();
        for (key, meta) in outputs {
            if meta.sensitive {
                tracing::info!("output {key} = <sensitive>");
            } else {
                tracing::info!("output {key} = {}", meta.value);
            }
            bag.insert(key, meta.value);
        }
        Ok(bag)
    }

    pub fn destroy(&self) -> Result<(), EngineError> {
        self.run(
            "destroy",
            &[
                "destroy".to_owned(),
                "-auto-approve".to_owned(),
                format!("-var-file={VAR_FILE}"),
            ],
        )?;
        Ok(())
    }

    pub fn clean_up(&self) -> Result<(), EngineError> {
        std::fs::remove_dir_all(&self.work_dir).map_err(|source| EngineError::CleanUp {
            path: self.work_dir.clone(),
            source,
        })
    }

    fn run(&self, operation: &'static str, args: &[String]) -> Result<Output, EngineError> {
        tracing::info!(
            work_dir = %self.work_dir.display(),
            "running terraform {operation}"
        );
        let output = Command::new(&self.exec_path)
            .args(args)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|source| EngineError::Spawn { operation, source })?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                operation,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        tracing::debug!("terraform {operation} finished");
        Ok(output)
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), EngineError> {
    std::fs::write(path, contents).map_err(|source| EngineError::Workspace {
        path: path.to_path_buf(),
        source,
    })
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
