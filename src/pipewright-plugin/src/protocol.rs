//! Wire protocol for Pipewright extension plugins.
//!
//! The transport frames one JSON request/response pair per line over the
//! plugin's stdio. The framing record is fixed; every contract payload is
//! itself serialized to JSON text and carried inside an [`Envelope`], so
//! payload shapes can evolve without touching the frames. Errors cross the
//! boundary only as [`WireError`] — the single error shape the result
//! records admit.

use pipewright_core::contract::{ContractError, ContractResult};
use pipewright_core::models::{ActionRequired, GeneratedFile, ValueBag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol version negotiated at handshake. Payload evolution happens
/// inside envelopes; this number only moves when the framing or the
/// handshake itself changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Environment variable the host sets on every plugin subprocess.
pub const MAGIC_COOKIE_KEY: &str = "PIPEWRIGHT_PLUGIN_COOKIE";

/// Expected value of [`MAGIC_COOKIE_KEY`]. Not a secret: it exists to stop
/// a user from launching a plugin binary by hand and to reject executables
/// that are not Pipewright plugins at all.
pub const MAGIC_COOKIE_VALUE: &str = "f1d6a4e8c02b";

/// Stable method name strings used as the routing key on the session.
pub mod method {
    pub const CONNECT_REPO: &str = "Plugin.ConnectRepo";
    pub const CREATE_TRIGGER: &str = "Plugin.CreateTrigger";
    pub const GENERATE_SCRIPT: &str = "Plugin.GenerateScript";
    pub const PARSE_CONFIG: &str = "Plugin.ParseConfig";
    pub const SETUP_PLUGIN: &str = "Plugin.SetupPlugin";
    pub const GET_OUTPUT: &str = "Plugin.GetOutput";
    pub const DESTROY: &str = "Plugin.Destroy";
    pub const SHUTDOWN: &str = "Plugin.Shutdown";
}

/// First line a plugin writes on stdout, before any request is served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic_cookie: String,
    pub protocol_version: u32,
}

impl Handshake {
    pub fn current() -> Self {
        Self {
            magic_cookie: MAGIC_COOKIE_VALUE.to_owned(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Errors from envelope encoding/decoding.
///
/// Decode failures are kept distinct from plugin-logic errors everywhere:
/// a malformed payload is a fault of the bridge, not an answer from the
/// plugin.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode payload: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(serde_json::Error),
}

/// The transport-native wrapper: a single field carrying JSON text.
///
/// The framing codec only ever sees this fixed shape; dynamic value-bags
/// and the union-like result records live inside `data` as a
/// self-contained JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub data: String,
}

impl Envelope {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, CodecError> {
        let data = serde_json::to_string(value).map_err(CodecError::Encode)?;
        Ok(Self { data })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_str(&self.data).map_err(CodecError::Decode)
    }

    /// An envelope carrying the empty object, for methods without
    /// arguments.
    pub fn empty() -> Self {
        Self {
            data: "{}".to_owned(),
        }
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::empty()
    }
}

/// Request frame sent from the host to a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Correlation id; responses echo it back.
    pub id: u64,
    /// One of the [`method`] constants.
    pub method: String,
    #[serde(default)]
    pub args: Envelope,
}

/// Response frame sent from a plugin to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginResponse {
    pub id: u64,
    pub result: Envelope,
}

/// The one and only error shape guaranteed to deserialize across the
/// boundary.
///
/// Result records type their error field as `Option<WireError>`; any other
/// error representation placed there fails to decode on the receiving
/// side, surfacing as a decode fault rather than an application error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WireError {}

impl From<&ContractError> for WireError {
    fn from(err: &ContractError) -> Self {
        Self::new(err.to_string())
    }
}

/// Wire result of `Plugin.ConnectRepo`. Value and error are mutually
/// exclusive; conversion enforces it in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequiredResult {
    #[serde(default)]
    pub action_url: String,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl ActionRequiredResult {
    pub fn from_contract(result: ContractResult<ActionRequired>) -> Self {
        match result {
            Ok(outcome) => Self {
                action_url: outcome.action_url,
                error: None,
            },
            Err(err) => Self {
                action_url: String::new(),
                error: Some(WireError::from(&err)),
            },
        }
    }

    pub fn into_contract(self) -> ContractResult<ActionRequired> {
        match self.error {
            Some(err) => Err(ContractError::Other {
                message: err.message,
            }),
            None => Ok(ActionRequired {
                action_url: self.action_url,
            }),
        }
    }
}

/// Wire result of methods whose only logical return value is an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AckResult {
    #[serde(default)]
    pub error: Option<WireError>,
}

impl AckResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn from_contract(result: ContractResult<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(err) => Self {
                error: Some(WireError::from(&err)),
            },
        }
    }

    pub fn into_contract(self) -> ContractResult<()> {
        match self.error {
            Some(err) => Err(ContractError::Other {
                message: err.message,
            }),
            None => Ok(()),
        }
    }
}

/// Wire result of `Plugin.GenerateScript`. Payload and error are mutually
/// exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFileResult {
    #[serde(default)]
    pub file_script: Option<Vec<u8>>,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl GeneratedFileResult {
    pub fn from_contract(result: ContractResult<GeneratedFile>) -> Self {
        match result {
            Ok(file) => Self {
                file_script: Some(file.0),
                error: None,
            },
            Err(err) => Self {
                file_script: None,
                error: Some(WireError::from(&err)),
            },
        }
    }

    pub fn into_contract(self) -> ContractResult<GeneratedFile> {
        match (self.file_script, self.error) {
            (_, Some(err)) => Err(ContractError::Other {
                message: err.message,
            }),
            (Some(bytes), None) => Ok(GeneratedFile(bytes)),
            (None, None) => Err(ContractError::Decode {
                message: "generated file result carried neither payload nor error".to_owned(),
            }),
        }
    }
}

/// Wire result of `Plugin.GetOutput`.
///
/// The output bag rides as a JSON-encoded string sub-payload so the wire
/// field is always present; an absent or empty bag encodes as the
/// empty-object string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputResult {
    #[serde(default = "empty_object_text")]
    pub output_json: String,
    #[serde(default)]
    pub error: Option<WireError>,
}

impl OutputResult {
    pub fn from_contract(result: ContractResult<ValueBag>) -> Self {
        match result {
            Ok(bag) => match serde_json::to_string(&bag) {
                Ok(output_json) => Self {
                    output_json,
                    error: None,
                },
                Err(err) => Self {
                    output_json: empty_object_text(),
                    error: Some(WireError::new(format!("failed to encode output: {err}"))),
                },
            },
            Err(err) => Self {
                output_json: empty_object_text(),
                error: Some(WireError::from(&err)),
            },
        }
    }

    pub fn into_contract(self) -> ContractResult<ValueBag> {
        if let Some(err) = self.error {
            return Err(ContractError::Other {
                message: err.message,
            });
        }
        if self.output_json.is_empty() {
            return Ok(ValueBag::new());
        }
        serde_json::from_str(&self.output_json).map_err(|err| ContractError::Decode {
            message: format!("failed to decode output bag: {err}"),
        })
    }
}

fn empty_object_text() -> String {
    "{}".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::models::{Step, StepsFile};
    use serde_json::json;

    fn sample_steps_file() -> StepsFile {
        let mut config = ValueBag::new();
        config.insert("branch".into(), json!("main"));
        let mut placeholders = ValueBag::new();
        placeholders.insert("image".into(), json!("rust:1.79"));
        placeholders.insert("retries".into(), json!(3));
        StepsFile {
            kind: "cloudbuild".into(),
            version: "1".into(),
            repo_url: "https://github.com/example/app".into(),
            config,
            steps: vec![
                Step {
                    step: "test".into(),
                    placeholders,
                },
                Step {
                    step: "deploy".into(),
                    placeholders: ValueBag::new(),
                },
            ],
        }
    }

    #[test]
    fn envelope_round_trips_steps_file() {
        let steps = sample_steps_file();
        let envelope = Envelope::encode(&steps).unwrap();
        let decoded: StepsFile = envelope.decode().unwrap();
        assert_eq!(decoded, steps);
    }

    #[test]
    fn envelope_round_trips_nested_value_bag() {
        let mut bag = ValueBag::new();
        bag.insert("instance".into(), json!({"name": "db-1", "zones": ["a", "b"]}));
        bag.insert("ready".into(), json!(true));
        let envelope = Envelope::encode(&bag).unwrap();
        let decoded: ValueBag = envelope.decode().unwrap();
        assert_eq!(decoded, bag);
    }

    #[test]
    fn envelope_decode_rejects_malformed_text() {
        let envelope = Envelope {
            data: "{not json".into(),
        };
        assert!(matches!(
            envelope.decode::<ValueBag>(),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn request_frame_has_stable_wire_shape() {
        let request = PluginRequest {
            id: 7,
            method: method::CONNECT_REPO.into(),
            args: Envelope::empty(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"method\":\"Plugin.ConnectRepo\""));
        assert!(json.contains("\"data\":\"{}\""));
        let back: PluginRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn action_required_error_forces_empty_url() {
        let wire = ActionRequiredResult::from_contract(Err(ContractError::other("boom")));
        assert!(wire.action_url.is_empty());
        assert!(wire.error.is_some());

        let ok = ActionRequiredResult::from_contract(Ok(ActionRequired::with_url("https://auth")));
        assert_eq!(ok.action_url, "https://auth");
        assert!(ok.error.is_none());
    }

    #[test]
    fn generated_file_error_forces_nil_payload() {
        let wire = GeneratedFileResult::from_contract(Err(ContractError::other("no template")));
        assert!(wire.file_script.is_none());
        assert!(wire.error.is_some());
        assert!(wire.into_contract().is_err());
    }

    #[test]
    fn generated_file_round_trips_bytes() {
        let wire = GeneratedFileResult::from_contract(Ok(GeneratedFile::new("steps: []\n")));
        let file = wire.into_contract().unwrap();
        assert_eq!(file.as_bytes(), b"steps: []\n");
    }

    #[test]
    fn empty_output_encodes_as_empty_object_string() {
        let wire = OutputResult::from_contract(Ok(ValueBag::new()));
        assert_eq!(wire.output_json, "{}");
        let bag = wire.into_contract().unwrap();
        assert!(bag.is_empty());
    }

    #[test]
    fn output_result_defaults_when_field_absent() {
        let wire: OutputResult = serde_json::from_str("{}").unwrap();
        assert_eq!(wire.output_json, "{}");
        let bag = wire.into_contract().unwrap();
        assert!(bag.is_empty());
    }

    #[test]
    fn output_round_trips_nested_values() {
        let mut bag = ValueBag::new();
        bag.insert("bucket_url".into(), json!("gs://state"));
        bag.insert("replicas".into(), json!([1, 2, 3]));
        let wire = OutputResult::from_contract(Ok(bag.clone()));
        assert_eq!(wire.into_contract().unwrap(), bag);
    }

    #[test]
    fn unregistered_error_shape_fails_to_decode() {
        // A plugin that puts anything but the carrier into an error field
        // produces a decode failure, not an application error.
        let raw = r#"{"error":"quota exceeded"}"#;
        assert!(serde_json::from_str::<AckResult>(raw).is_err());

        let carrier = r#"{"error":{"message":"quota exceeded"}}"#;
        let ack: AckResult = serde_json::from_str(carrier).unwrap();
        let err = ack.into_contract().unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
        assert!(!err.is_transport_fault());
    }

    #[test]
    fn every_result_shape_tolerates_bare_error_form() {
        let bare = r#"{"error":{"message":"unknown method"}}"#;
        assert!(serde_json::from_str::<ActionRequiredResult>(bare)
            .unwrap()
            .into_contract()
            .is_err());
        assert!(serde_json::from_str::<GeneratedFileResult>(bare)
            .unwrap()
            .into_contract()
            .is_err());
        assert!(serde_json::from_str::<OutputResult>(bare)
            .unwrap()
            .into_contract()
            .is_err());
    }

    #[test]
    fn handshake_round_trips() {
        let handshake = Handshake::current();
        let line = serde_json::to_string(&handshake).unwrap();
        let back: Handshake = serde_json::from_str(&line).unwrap();
        assert_eq!(back, handshake);
        assert_eq!(back.protocol_version, PROTOCOL_VERSION);
    }
}
