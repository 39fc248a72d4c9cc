use crate::models::{ActionRequired, GeneratedFile, PluginDescriptor, StepsFile, ValueBag};
use thiserror::Error;

/// Common categories of contract failures surfaced to the host.
///
/// `Transport` and `Decode` are only ever produced on the host side of the
/// plugin boundary; plugin implementations report their own failures
/// through the remaining variants. Keeping the categories in the type lets
/// callers tell "the plugin said no" apart from "the plugin process died"
/// without parsing message text.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[error("operation called out of order: {message}")]
    OutOfOrder { message: String },
    #[error("transport fault: {message}")]
    Transport { message: String },
    #[error("decode fault: {message}")]
    Decode { message: String },
    #[error("{message}")]
    Other { message: String },
}

impl ContractError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn out_of_order(message: impl Into<String>) -> Self {
        Self::OutOfOrder {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// True when the failure came from the process boundary rather than
    /// from plugin logic; retrying such a call is the host's decision and
    /// is safe for idempotent operations.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_decode_fault(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }
}

pub type ContractResult<T> = Result<T, ContractError>;

/// Operations a CI/CD connector plugin must implement.
///
/// `connect_repo` is idempotent from the host's perspective. Ordering
/// between `connect_repo` and `create_trigger` is a caller obligation;
/// `generate_script` has no ordering dependency on either.
pub trait Connector: Send + Sync {
    /// Wire the repository named by the steps file into the CI/CD system.
    /// A pending [`ActionRequired`] is not an error.
    fn connect_repo(&self, steps_file: &StepsFile) -> ContractResult<ActionRequired>;

    /// Register a trigger on the connected repository.
    fn create_trigger(&self, steps_file: &StepsFile) -> ContractResult<()>;

    /// Produce the pipeline script for the ordered steps.
    fn generate_script(&self, steps_file: &StepsFile) -> ContractResult<GeneratedFile>;
}

/// Operations an infrastructure provisioner plugin must implement.
///
/// The lifecycle is sequential per plugin instance: `parse_config` →
/// `setup_plugin` → `get_output` (repeatable) → `destroy` (terminal). The
/// protocol layer imposes no state machine; implementations enforce the
/// sequencing themselves and report violations as [`ContractError::OutOfOrder`].
pub trait Provisioner: Send + Sync {
    /// Validate and normalize the raw configuration bag.
    fn parse_config(&self, config: &ValueBag) -> ContractResult<()>;

    /// Materialize the plugin's resources.
    fn setup_plugin(&self, descriptor: &PluginDescriptor) -> ContractResult<()>;

    /// Query resulting values. On success the bag may be empty but is
    /// always present.
    fn get_output(&self, descriptor: &PluginDescriptor) -> ContractResult<ValueBag>;

    /// Tear everything down.
    fn destroy(&self, descriptor: &PluginDescriptor) -> ContractResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_faults_are_distinguishable() {
        let transport = ContractError::Transport {
            message: "plugin process terminated".into(),
        };
        let app = ContractError::other("quota exceeded");
        assert!(transport.is_transport_fault());
        assert!(!app.is_transport_fault());
        assert!(!app.is_decode_fault());
    }

    #[test]
    fn messages_render_without_variant_noise() {
        let err = ContractError::other("quota exceeded");
        assert_eq!(err.to_string(), "quota exceeded");
        let err = ContractError::invalid_config("missing project_id");
        assert_eq!(err.to_string(), "invalid configuration: missing project_id");
    }
}
