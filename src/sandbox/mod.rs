/// Widget Script Sandbox
///
/// Restricted Lua execution for widget scripts:
/// - `runner`: one invocation in a fresh interpreter -> `ExecutionOutcome`
/// - `bindings`: properties and parameters resolved into script globals
/// - `rewrite`: cooperative cancellation checks at block entries and gotos
/// - `capabilities`: the explicit host capability set (HTTP, json, print)
/// - `secrets`: secret codec seam and log masking
/// - `error`: typed failures and fatal/recoverable classification

pub mod bindings;
pub mod capabilities;
pub mod error;
pub mod rewrite;
pub mod runner;
pub mod secrets;

pub use capabilities::{HttpCapability, ReqwestHttp, SandboxCapabilities};
pub use error::{is_fatal, HostError, SandboxError};
pub use runner::SandboxRunner;
pub use secrets::{mask_secrets, PassthroughCodec, SecretCodec, SECRET_MASK};
