use crate::contract::Connector;
use crate::models::{StepsFile, ValueBag};
use thiserror::Error;

/// Expectations supplied by a connector implementation to run the shared
/// contract suite.
#[derive(Debug, Clone)]
pub struct ConnectorContractExpectations {
    /// Steps file handed to every contract call.
    pub steps_file: StepsFile,
    /// Whether `connect_repo` is expected to return a pending manual step
    /// for this steps file.
    pub expect_pending_action: bool,
    /// One marker string per step, in step order; the generated script
    /// must contain them in the same order.
    pub step_markers: Vec<String>,
}

/// Errors surfaced by the connector contract test harness.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectorContractError {
    #[error("connect_repo failed: {0}")]
    ConnectFailed(String),
    #[error("connect_repo returned pending={actual}, expected pending={expected}")]
    WrongPendingOutcome { expected: bool, actual: bool },
    #[error("connect_repo returned a pending action with an empty url")]
    EmptyActionUrl,
    #[error("generate_script failed: {0}")]
    GenerateFailed(String),
    #[error("generated script is empty")]
    EmptyScript,
    #[error("generated script is not valid UTF-8")]
    ScriptNotUtf8,
    #[error("generated script is missing marker for step {step}")]
    MissingStepMarker { step: String },
    #[error("generated script reorders steps: {first} appears after {second}")]
    StepOrderViolated { first: String, second: String },
}

/// Run the shared connector contract suite against an implementation.
///
/// Connectors should call this from their crate-level tests with a steps
/// file whose markers are known to appear verbatim in the generated
/// script.
pub fn run_connector_contract<C: Connector>(
    connector: &C,
    expectations: &ConnectorContractExpectations,
) -> Result<(), ConnectorContractError> {
    verify_connect(connector, expectations)?;
    verify_generate(connector, expectations)?;
    Ok(())
}

fn verify_connect<C: Connector>(
    connector: &C,
    expectations: &ConnectorContractExpectations,
) -> Result<(), ConnectorContractError> {
    let outcome = connector
        .connect_repo(&expectations.steps_file)
        .map_err(|e| ConnectorContractError::ConnectFailed(e.to_string()))?;

    if outcome.is_pending() != expectations.expect_pending_action {
        return Err(ConnectorContractError::WrongPendingOutcome {
            expected: expectations.expect_pending_action,
            actual: outcome.is_pending(),
        });
    }

    if outcome.is_pending() && outcome.action_url.trim().is_empty() {
        return Err(ConnectorContractError::EmptyActionUrl);
    }

    Ok(())
}

fn verify_generate<C: Connector>(
    connector: &C,
    expectations: &ConnectorContractExpectations,
) -> Result<(), ConnectorContractError> {
    let file = connector
        .generate_script(&expectations.steps_file)
        .map_err(|e| ConnectorContractError::GenerateFailed(e.to_string()))?;

    if file.as_bytes().is_empty() {
        return Err(ConnectorContractError::EmptyScript);
    }

    let text = std::str::from_utf8(file.as_bytes())
        .map_err(|_| ConnectorContractError::ScriptNotUtf8)?;

    let mut last_position = 0usize;
    let mut last_marker: Option<&str> = None;
    for marker in &expectations.step_markers {
        let position = text.find(marker.as_str()).ok_or_else(|| {
            ConnectorContractError::MissingStepMarker {
                step: marker.clone(),
            }
        })?;
        if let Some(previous) = last_marker {
            if position < last_position {
                return Err(ConnectorContractError::StepOrderViolated {
                    first: previous.to_owned(),
                    second: marker.clone(),
                });
            }
        }
        last_position = position;
        last_marker = Some(marker);
    }

    Ok(())
}

/// Convenience builder for a steps file used in contract tests.
pub fn steps_file_with(kind: &str, repo_url: &str, steps: Vec<crate::models::Step>) -> StepsFile {
    StepsFile {
        kind: kind.to_owned(),
        version: "1".to_owned(),
        repo_url: repo_url.to_owned(),
        config: ValueBag::new(),
        steps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractError, ContractResult};
    use crate::models::{ActionRequired, GeneratedFile, Step};

    struct FakeConnector {
        pending_url: Option<String>,
        reverse_steps: bool,
    }

    impl Connector for FakeConnector {
        fn connect_repo(&self, _steps_file: &StepsFile) -> ContractResult<ActionRequired> {
            Ok(match &self.pending_url {
                Some(url) => ActionRequired::with_url(url.clone()),
                None => ActionRequired::none(),
            })
        }

        fn create_trigger(&self, _steps_file: &StepsFile) -> ContractResult<()> {
            Ok(())
        }

        fn generate_script(&self, steps_file: &StepsFile) -> ContractResult<GeneratedFile> {
            let mut names: Vec<&str> = steps_file.steps.iter().map(|s| s.step.as_str()).collect();
            if self.reverse_steps {
                names.reverse();
            }
            if names.is_empty() {
                return Err(ContractError::other("no steps"));
            }
            Ok(GeneratedFile::new(names.join("\n")))
        }
    }

    fn two_step_file() -> StepsFile {
        steps_file_with(
            "fake",
            "https://example.com/org/repo",
            vec![
                Step {
                    step: "build".into(),
                    placeholders: ValueBag::new(),
                },
                Step {
                    step: "deploy".into(),
                    placeholders: ValueBag::new(),
                },
            ],
        )
    }

    #[test]
    fn contract_passes_for_order_preserving_connector() {
        let connector = FakeConnector {
            pending_url: None,
            reverse_steps: false,
        };
        let expectations = ConnectorContractExpectations {
            steps_file: two_step_file(),
            expect_pending_action: false,
            step_markers: vec!["build".into(), "deploy".into()],
        };
        let result = run_connector_contract(&connector, &expectations);
        assert!(result.is_ok(), "expected contract to pass: {result:?}");
    }

    #[test]
    fn contract_catches_reordered_steps() {
        let connector = FakeConnector {
            pending_url: None,
            reverse_steps: true,
        };
        let expectations = ConnectorContractExpectations {
            steps_file: two_step_file(),
            expect_pending_action: false,
            step_markers: vec!["build".into(), "deploy".into()],
        };
        assert!(matches!(
            run_connector_contract(&connector, &expectations),
            Err(ConnectorContractError::StepOrderViolated { .. })
        ));
    }

    #[test]
    fn contract_validates_pending_expectation() {
        let connector = FakeConnector {
            pending_url: Some("https://auth/flow".into()),
            reverse_steps: false,
        };
        let expectations = ConnectorContractExpectations {
            steps_file: two_step_file(),
            expect_pending_action: false,
            step_markers: vec!["build".into()],
        };
        assert!(matches!(
            run_connector_contract(&connector, &expectations),
            Err(ConnectorContractError::WrongPendingOutcome { .. })
        ));
    }
}
