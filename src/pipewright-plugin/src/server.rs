//! Plugin-side capability server: the decode → dispatch → encode loop a
//! plugin binary runs over its stdio, plus the registration shim that
//! binds a contract implementation to it.

use crate::protocol::{
    AckResult, ActionRequiredResult, CodecError, Envelope, GeneratedFileResult, Handshake,
    OutputResult, PluginRequest, PluginResponse, WireError, method, MAGIC_COOKIE_KEY,
    MAGIC_COOKIE_VALUE,
};
use pipewright_core::contract::{Connector, ContractError, ContractResult, Provisioner};
use pipewright_core::models::{PluginDescriptor, StepsFile, ValueBag};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// A contract implementation bound for serving.
pub enum ServedPlugin {
    Connector(Box<dyn Connector>),
    Provisioner(Box<dyn Provisioner>),
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("this binary is a pipewright plugin and must be launched by the pipewright host")]
    NotLaunchedByHost,
    #[error("failed to write to host: {0}")]
    Write(std::io::Error),
    #[error("failed to read from host: {0}")]
    Read(std::io::Error),
}

/// Serve a [`Connector`] implementation over stdio. Blocks until the host
/// closes the connection or sends a shutdown request.
pub fn serve_connector<C: Connector + 'static>(connector: C) -> Result<(), ServeError> {
    serve(ServedPlugin::Connector(Box::new(connector)))
}

/// Serve a [`Provisioner`] implementation over stdio.
pub fn serve_provisioner<P: Provisioner + 'static>(provisioner: P) -> Result<(), ServeError> {
    serve(ServedPlugin::Provisioner(Box::new(provisioner)))
}

/// Trust gate plus serve loop. The cookie check runs before anything is
/// written: a plugin binary launched outside the host refuses to speak.
pub fn serve(plugin: ServedPlugin) -> Result<(), ServeError> {
    let cookie = std::env::var(MAGIC_COOKIE_KEY).unwrap_or_default();
    if cookie != MAGIC_COOKIE_VALUE {
        return Err(ServeError::NotLaunchedByHost);
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run(&plugin, stdin.lock(), stdout.lock())
}

/// The serve loop, generic over its streams so tests can drive it with
/// in-memory pipes.
pub(crate) fn run<R: BufRead, W: Write>(
    plugin: &ServedPlugin,
    reader: R,
    mut writer: W,
) -> Result<(), ServeError> {
    write_line(&mut writer, &Handshake::current())?;

    for line in reader.lines() {
        let line = line.map_err(ServeError::Read)?;
        if line.trim().is_empty() {
            continue;
        }

        let request: PluginRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                // Without a frame there is no id to answer on; drop it.
                tracing::warn!("discarding malformed request frame: {err}");
                continue;
            }
        };

        if request.method == method::SHUTDOWN {
            let response = PluginResponse {
                id: request.id,
                result: encode_result(&AckResult::ok()),
            };
            write_line(&mut writer, &response)?;
            return Ok(());
        }

        let response = PluginResponse {
            id: request.id,
            result: dispatch(plugin, &request.method, &request.args),
        };
        write_line(&mut writer, &response)?;
    }

    Ok(())
}

fn write_line<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<(), ServeError> {
    let line = serde_json::to_string(value).map_err(|err| {
        ServeError::Write(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    })?;
    writeln!(writer, "{line}").map_err(ServeError::Write)?;
    writer.flush().map_err(ServeError::Write)
}

/// Decode, invoke, encode. Always yields a response envelope: decode
/// failures and panics come back as carrier errors on the result shape the
/// caller expects, never as broken frames.
fn dispatch(plugin: &ServedPlugin, method_name: &str, args: &Envelope) -> Envelope {
    match plugin {
        ServedPlugin::Connector(connector) => match method_name {
            method::CONNECT_REPO => {
                let steps: StepsFile = match args.decode() {
                    Ok(steps) => steps,
                    Err(err) => {
                        return encode_result(&ActionRequiredResult::from_contract(Err(
                            decode_fault(err),
                        )))
                    }
                };
                let result = guard(|| connector.connect_repo(&steps));
                encode_result(&ActionRequiredResult::from_contract(result))
            }
            method::CREATE_TRIGGER => {
                let steps: StepsFile = match args.decode() {
                    Ok(steps) => steps,
                    Err(err) => return encode_result(&AckResult::from_contract(Err(decode_fault(err)))),
                };
                let result = guard(|| connector.create_trigger(&steps));
                encode_result(&AckResult::from_contract(result))
            }
            method::GENERATE_SCRIPT => {
                let steps: StepsFile = match args.decode() {
                    Ok(steps) => steps,
                    Err(err) => {
                        return encode_result(&GeneratedFileResult::from_contract(Err(
                            decode_fault(err),
                        )))
                    }
                };
                let result = guard(|| connector.generate_script(&steps));
                encode_result(&GeneratedFileResult::from_contract(result))
            }
            other => unknown_method(other),
        },
        ServedPlugin::Provisioner(provisioner) => match method_name {
            method::PARSE_CONFIG => {
                let config: ValueBag = match args.decode() {
                    Ok(config) => config,
                    Err(err) => return encode_result(&AckResult::from_contract(Err(decode_fault(err)))),
                };
                let result = guard(|| provisioner.parse_config(&config));
                encode_result(&AckResult::from_contract(result))
            }
            method::SETUP_PLUGIN => {
                let descriptor: PluginDescriptor = match args.decode() {
                    Ok(descriptor) => descriptor,
                    Err(err) => return encode_result(&AckResult::from_contract(Err(decode_fault(err)))),
                };
                let result = guard(|| provisioner.setup_plugin(&descriptor));
                encode_result(&AckResult::from_contract(result))
            }
            method::GET_OUTPUT => {
                let descriptor: PluginDescriptor = match args.decode() {
                    Ok(descriptor) => descriptor,
                    Err(err) => {
                        return encode_result(&OutputResult::from_contract(Err(decode_fault(err))))
                    }
                };
                let result = guard(|| provisioner.get_output(&descriptor));
                encode_result(&OutputResult::from_contract(result))
            }
            method::DESTROY => {
                let descriptor: PluginDescriptor = match args.decode() {
                    Ok(descriptor) => descriptor,
                    Err(err) => return encode_result(&AckResult::from_contract(Err(decode_fault(err)))),
                };
                let result = guard(|| provisioner.destroy(&descriptor));
                encode_result(&AckResult::from_contract(result))
            }
            other => unknown_method(other),
        },
    }
}

/// Run one handler invocation, converting a panic into a per-call error
/// instead of letting it take the serve loop down.
fn guard<T>(call: impl FnOnce() -> ContractResult<T>) -> ContractResult<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(text) = payload.downcast_ref::<&str>() {
                (*text).to_owned()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                "unknown panic".to_owned()
            };
            Err(ContractError::other(format!("plugin panicked: {message}")))
        }
    }
}

fn decode_fault(err: CodecError) -> ContractError {
    ContractError::Decode {
        message: err.to_string(),
    }
}

fn unknown_method(name: &str) -> Envelope {
    encode_result(&AckResult {
        error: Some(WireError::new(format!("unknown method {name}"))),
    })
}

fn encode_result<T: Serialize>(value: &T) -> Envelope {
    Envelope::encode(value).unwrap_or_else(|err| {
        tracing::error!("failed to encode response payload: {err}");
        Envelope {
            data: r#"{"error":{"message":"failed to encode response payload"}}"#.to_owned(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::models::{ActionRequired, GeneratedFile};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeConnector;

    impl Connector for FakeConnector {
        fn connect_repo(&self, steps_file: &StepsFile) -> ContractResult<ActionRequired> {
            if steps_file.config.contains_key("connection") {
                Ok(ActionRequired::none())
            } else {
                Ok(ActionRequired::with_url("https://auth/flow"))
            }
        }

        fn create_trigger(&self, _steps_file: &StepsFile) -> ContractResult<()> {
            Err(ContractError::other("repo not connected"))
        }

        fn generate_script(&self, steps_file: &StepsFile) -> ContractResult<GeneratedFile> {
            let names: Vec<&str> = steps_file.steps.iter().map(|s| s.step.as_str()).collect();
            Ok(GeneratedFile::new(names.join("\n")))
        }
    }

    struct FakeProvisioner {
        invoked: Arc<AtomicBool>,
        panic_on_setup: bool,
    }

    impl Provisioner for FakeProvisioner {
        fn parse_config(&self, config: &ValueBag) -> ContractResult<()> {
            self.invoked.store(true, Ordering::SeqCst);
            if config.contains_key("project_id") {
                Ok(())
            } else {
                Err(ContractError::invalid_config("missing project_id"))
            }
        }

        fn setup_plugin(&self, _descriptor: &PluginDescriptor) -> ContractResult<()> {
            self.invoked.store(true, Ordering::SeqCst);
            if self.panic_on_setup {
                panic!("index out of bounds in plugin");
            }
            Err(ContractError::other("quota exceeded"))
        }

        fn get_output(&self, _descriptor: &PluginDescriptor) -> ContractResult<ValueBag> {
            self.invoked.store(true, Ordering::SeqCst);
            Ok(ValueBag::new())
        }

        fn destroy(&self, _descriptor: &PluginDescriptor) -> ContractResult<()> {
            self.invoked.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn provisioner(panic_on_setup: bool) -> (ServedPlugin, Arc<AtomicBool>) {
        let invoked = Arc::new(AtomicBool::new(false));
        let plugin = ServedPlugin::Provisioner(Box::new(FakeProvisioner {
            invoked: invoked.clone(),
            panic_on_setup,
        }));
        (plugin, invoked)
    }

    fn descriptor() -> PluginDescriptor {
        PluginDescriptor {
            id: "p".into(),
            repo_url: "https://example.com/r".into(),
            version: "1".into(),
            plugin: Default::default(),
        }
    }

    fn request(id: u64, method_name: &str, args: Envelope) -> String {
        serde_json::to_string(&PluginRequest {
            id,
            method: method_name.to_owned(),
            args,
        })
        .unwrap()
    }

    /// Drive the serve loop with request lines; return handshake and
    /// responses.
    fn drive(plugin: &ServedPlugin, requests: &[String]) -> (Handshake, Vec<PluginResponse>) {
        let input = requests.join("\n");
        let mut output = Vec::new();
        run(plugin, input.as_bytes(), &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        let mut lines = text.lines();
        let handshake: Handshake = serde_json::from_str(lines.next().unwrap()).unwrap();
        let responses = lines
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (handshake, responses)
    }

    #[test]
    fn serve_loop_emits_handshake_first() {
        let (plugin, _) = provisioner(false);
        let (handshake, responses) = drive(&plugin, &[]);
        assert_eq!(handshake, Handshake::current());
        assert!(responses.is_empty());
    }

    #[test]
    fn connect_repo_pending_action_is_not_an_error() {
        let plugin = ServedPlugin::Connector(Box::new(FakeConnector));
        let steps = Envelope::encode(&StepsFile {
            kind: "fake".into(),
            version: "1".into(),
            repo_url: "https://x/y".into(),
            config: ValueBag::new(),
            steps: Vec::new(),
        })
        .unwrap();

        let (_, responses) = drive(&plugin, &[request(1, method::CONNECT_REPO, steps)]);
        let result: ActionRequiredResult = responses[0].result.decode().unwrap();
        assert_eq!(result.action_url, "https://auth/flow");
        assert!(result.error.is_none());
    }

    #[test]
    fn decode_failure_answers_with_carrier_and_skips_impl() {
        let (plugin, invoked) = provisioner(false);
        let bad_args = Envelope {
            data: "{not json".into(),
        };

        let (_, responses) = drive(&plugin, &[request(1, method::SETUP_PLUGIN, bad_args)]);
        let ack: AckResult = responses[0].result.decode().unwrap();
        let message = ack.error.unwrap().message;
        assert!(message.contains("failed to decode payload"), "{message}");
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn panic_is_contained_to_the_call() {
        let (plugin, _) = provisioner(true);
        let setup = request(1, method::SETUP_PLUGIN, Envelope::encode(&descriptor()).unwrap());
        let output = request(2, method::GET_OUTPUT, Envelope::encode(&descriptor()).unwrap());

        let (_, responses) = drive(&plugin, &[setup, output]);
        assert_eq!(responses.len(), 2, "loop must survive the panic");

        let ack: AckResult = responses[0].result.decode().unwrap();
        let message = ack.error.unwrap().message;
        assert!(message.contains("plugin panicked"), "{message}");
        assert!(message.contains("index out of bounds"), "{message}");

        let out: OutputResult = responses[1].result.decode().unwrap();
        assert!(out.error.is_none());
        assert_eq!(out.output_json, "{}");
    }

    #[test]
    fn application_error_crosses_as_carrier() {
        let (plugin, _) = provisioner(false);
        let setup = request(1, method::SETUP_PLUGIN, Envelope::encode(&descriptor()).unwrap());

        let (_, responses) = drive(&plugin, &[setup]);
        let ack: AckResult = responses[0].result.decode().unwrap();
        assert_eq!(ack.error.unwrap().message, "quota exceeded");
    }

    #[test]
    fn unknown_method_answers_instead_of_hanging() {
        let (plugin, _) = provisioner(false);
        let (_, responses) = drive(&plugin, &[request(4, "Plugin.Nope", Envelope::empty())]);
        let ack: AckResult = responses[0].result.decode().unwrap();
        assert!(ack.error.unwrap().message.contains("Plugin.Nope"));
    }

    #[test]
    fn contract_methods_of_the_other_capability_are_unknown() {
        let plugin = ServedPlugin::Connector(Box::new(FakeConnector));
        let (_, responses) = drive(&plugin, &[request(5, method::GET_OUTPUT, Envelope::empty())]);
        let ack: AckResult = responses[0].result.decode().unwrap();
        assert!(ack.error.unwrap().message.contains(method::GET_OUTPUT));
    }

    #[test]
    fn shutdown_acknowledges_and_stops_serving() {
        let (plugin, invoked) = provisioner(false);
        let shutdown = request(1, method::SHUTDOWN, Envelope::empty());
        let late = request(2, method::GET_OUTPUT, Envelope::encode(&descriptor()).unwrap());

        let (_, responses) = drive(&plugin, &[shutdown, late]);
        assert_eq!(responses.len(), 1);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let (plugin, _) = provisioner(false);
        let good = request(2, method::GET_OUTPUT, Envelope::encode(&descriptor()).unwrap());
        let (_, responses) = drive(&plugin, &["garbage".to_owned(), good]);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, 2);
    }
}
