//! Plugin RPC bridge for Pipewright extension plugins.
//!
//! This crate provides:
//! - A JSON-line protocol with an envelope codec for dynamic payloads and
//!   a single registered error carrier
//! - A transport session that spawns a plugin subprocess, validates its
//!   handshake, and exchanges request/response frames with deadlines
//! - Host-side stubs implementing the Connector/Provisioner contracts
//! - The plugin-side serve loop and registration shim
//!
//! # Protocol
//!
//! The host launches the plugin executable with a trust cookie in the
//! environment. The plugin refuses to serve without it, and opens the
//! conversation with a handshake line on stdout:
//!
//! ```text
//! {"magic_cookie":"...","protocol_version":1}
//! ```
//!
//! After validation, the host writes one [`PluginRequest`] per line to the
//! plugin's stdin and reads one [`PluginResponse`] per line from its
//! stdout. Contract payloads ride inside [`Envelope`]s as self-contained
//! JSON text, so the frames never change shape when payloads evolve.
//!
//! # Writing a plugin
//!
//! ```rust,ignore
//! use pipewright_core::contract::Connector;
//! use pipewright_plugin::serve_connector;
//!
//! fn main() -> anyhow::Result<()> {
//!     serve_connector(MyConnector::default())?;
//!     Ok(())
//! }
//! ```
//!
//! # Driving a plugin
//!
//! ```rust,ignore
//! use pipewright_plugin::{LaunchConfig, RemoteConnector};
//!
//! let config = LaunchConfig::new("/path/to/plugin");
//! let connector = RemoteConnector::launch(config)?;
//! let outcome = connector.connect_repo(&steps_file)?;
//! if outcome.is_pending() {
//!     println!("complete this step first: {}", outcome.action_url);
//! }
//! ```

mod adapter;
mod host;
pub mod protocol;
mod server;

pub use adapter::{RemoteConnector, RemoteProvisioner};
pub use host::{HostError, LaunchConfig, PluginHost};
pub use protocol::{
    AckResult, ActionRequiredResult, CodecError, Envelope, GeneratedFileResult, Handshake,
    OutputResult, PluginRequest, PluginResponse, WireError, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE,
    PROTOCOL_VERSION,
};
pub use server::{serve, serve_connector, serve_provisioner, ServeError, ServedPlugin};
