//! Host-side capability stubs that implement the contract traits over a
//! live transport session.

use crate::host::{HostError, LaunchConfig, PluginHost};
use crate::protocol::{
    AckResult, ActionRequiredResult, CodecError, Envelope, GeneratedFileResult, OutputResult,
    method,
};
use pipewright_core::contract::{Connector, ContractError, ContractResult, Provisioner};
use pipewright_core::models::{
    ActionRequired, GeneratedFile, PluginDescriptor, StepsFile, ValueBag,
};

/// A connector backed by an external plugin process.
pub struct RemoteConnector {
    host: PluginHost,
}

impl RemoteConnector {
    /// Launch the subprocess and validate its handshake.
    pub fn launch(config: LaunchConfig) -> Result<Self, HostError> {
        let host = PluginHost::new(config);
        host.start()?;
        Ok(Self { host })
    }

    pub fn stop(&self) {
        self.host.stop();
    }

    pub fn is_running(&self) -> bool {
        self.host.is_running()
    }
}

impl Connector for RemoteConnector {
    fn connect_repo(&self, steps_file: &StepsFile) -> ContractResult<ActionRequired> {
        let args = Envelope::encode(steps_file).map_err(codec_fault)?;
        let result = self
            .host
            .call(method::CONNECT_REPO, args, self.host.call_timeout())
            .map_err(map_host_error)?;
        let wire: ActionRequiredResult = result.decode().map_err(codec_fault)?;
        wire.into_contract()
    }

    fn create_trigger(&self, steps_file: &StepsFile) -> ContractResult<()> {
        let args = Envelope::encode(steps_file).map_err(codec_fault)?;
        let result = self
            .host
            .call(method::CREATE_TRIGGER, args, self.host.call_timeout())
            .map_err(map_host_error)?;
        let wire: AckResult = result.decode().map_err(codec_fault)?;
        wire.into_contract()
    }

    fn generate_script(&self, steps_file: &StepsFile) -> ContractResult<GeneratedFile> {
        let args = Envelope::encode(steps_file).map_err(codec_fault)?;
        let result = self
            .host
            .call(method::GENERATE_SCRIPT, args, self.host.call_timeout())
            .map_err(map_host_error)?;
        let wire: GeneratedFileResult = result.decode().map_err(codec_fault)?;
        wire.into_contract()
    }
}

/// A provisioner backed by an external plugin process.
pub struct RemoteProvisioner {
    host: PluginHost,
}

impl RemoteProvisioner {
    pub fn launch(config: LaunchConfig) -> Result<Self, HostError> {
        let host = PluginHost::new(config);
        host.start()?;
        Ok(Self { host })
    }

    pub fn stop(&self) {
        self.host.stop();
    }

    pub fn is_running(&self) -> bool {
        self.host.is_running()
    }
}

impl Provisioner for RemoteProvisioner {
    fn parse_config(&self, config: &ValueBag) -> ContractResult<()> {
        let args = Envelope::encode(config).map_err(codec_fault)?;
        let result = self
            .host
            .call(method::PARSE_CONFIG, args, self.host.call_timeout())
            .map_err(map_host_error)?;
        let wire: AckResult = result.decode().map_err(codec_fault)?;
        wire.into_contract()
    }

    fn setup_plugin(&self, descriptor: &PluginDescriptor) -> ContractResult<()> {
        let args = Envelope::encode(descriptor).map_err(codec_fault)?;
        let result = self
            .host
            .call(method::SETUP_PLUGIN, args, self.host.call_timeout())
            .map_err(map_host_error)?;
        let wire: AckResult = result.decode().map_err(codec_fault)?;
        wire.into_contract()
    }

    fn get_output(&self, descriptor: &PluginDescriptor) -> ContractResult<ValueBag> {
        let args = Envelope::encode(descriptor).map_err(codec_fault)?;
        let result = self
            .host
            .call(method::GET_OUTPUT, args, self.host.call_timeout())
            .map_err(map_host_error)?;
        let wire: OutputResult = result.decode().map_err(codec_fault)?;
        wire.into_contract()
    }

    fn destroy(&self, descriptor: &PluginDescriptor) -> ContractResult<()> {
        let args = Envelope::encode(descriptor).map_err(codec_fault)?;
        let result = self
            .host
            .call(method::DESTROY, args, self.host.call_timeout())
            .map_err(map_host_error)?;
        let wire: AckResult = result.decode().map_err(codec_fault)?;
        wire.into_contract()
    }
}

/// Keep the taxonomy: boundary failures become `Transport`, malformed
/// traffic becomes `Decode`. Application errors never reach this path;
/// they arrive inside the decoded result shape.
fn map_host_error(err: HostError) -> ContractError {
    match err {
        HostError::Codec(_) | HostError::IdMismatch { .. } => ContractError::Decode {
            message: err.to_string(),
        },
        other => ContractError::Transport {
            message: other.to_string(),
        },
    }
}

fn codec_fault(err: CodecError) -> ContractError {
    ContractError::Decode {
        message: err.to_string(),
    }
}
