/// Sandbox failures
///
/// Typed errors raised while running a widget script, and the table deciding
/// which of them are fatal.

use thiserror::Error;

/// Failure raised by a host capability on behalf of a script
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    /// The remote service answered with an error
    #[error("remote service error: {message}")]
    RemoteService { status: Option<u16>, message: String },

    #[error("unable to resolve host {0}")]
    HostResolution(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Request(String),
}

/// Everything that can end a script invocation without a result
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    /// Script reached for a withheld host capability
    #[error("access denied: {0} is not available to widget scripts")]
    AccessDenied(String),

    #[error("{0} is not defined")]
    NotDefined(String),

    /// Cancellation token observed by an injected check
    #[error("script execution interrupted")]
    Interrupted,

    #[error("script does not define a '{0}' function")]
    MissingEntryFunction(String),

    #[error("script returned an invalid result: {0}")]
    InvalidResult(String),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("{0}")]
    Secret(String),

    /// Compile or runtime error raised by the script itself
    #[error("{0}")]
    Script(String),
}

const INTERPRETER_PREFIXES: [&str; 3] = ["runtime error: ", "syntax error: ", "callback error: "];

/// Strip interpreter framing from an error message
pub fn strip_prefixes(message: &str) -> String {
    let mut message = message.trim();
    loop {
        match INTERPRETER_PREFIXES.iter().find(|p| message.starts_with(*p)) {
            Some(prefix) => message = &message[prefix.len()..],
            None => return message.to_string(),
        }
    }
}

impl SandboxError {
    /// Walk an interpreter error down to its root cause
    ///
    /// Errors raised by host callbacks travel through Lua wrapped in
    /// callback/context layers; typed causes are recovered by downcasting.
    pub fn from_lua(error: &mlua::Error) -> SandboxError {
        match error {
            mlua::Error::CallbackError { cause, .. } => SandboxError::from_lua(cause),
            mlua::Error::WithContext { cause, .. } => SandboxError::from_lua(cause),
            mlua::Error::ExternalError(inner) => {
                if let Some(sandbox) = inner.downcast_ref::<SandboxError>() {
                    sandbox.clone()
                } else if let Some(host) = inner.downcast_ref::<HostError>() {
                    SandboxError::Host(host.clone())
                } else {
                    SandboxError::Script(strip_prefixes(&inner.to_string()))
                }
            }
            mlua::Error::RuntimeError(message) => SandboxError::Script(strip_prefixes(message)),
            mlua::Error::SyntaxError { message, .. } => SandboxError::Script(strip_prefixes(message)),
            other => SandboxError::Script(strip_prefixes(&other.to_string())),
        }
    }

    /// Wrap for raising from a host callback
    pub fn into_lua_error(self) -> mlua::Error {
        mlua::Error::external(self)
    }
}

impl From<mlua::Error> for SandboxError {
    fn from(error: mlua::Error) -> Self {
        SandboxError::from_lua(&error)
    }
}

/// Decide whether a failed invocation stops the widget
///
/// Sandbox violations, interruptions and secret failures always stop it.
/// Remote, DNS and timeout failures never do. Anything else is tolerated only
/// when the previous run succeeded.
pub fn is_fatal(error: &SandboxError, prior_outcome_was_success: bool) -> bool {
    match error {
        SandboxError::AccessDenied(_) | SandboxError::Interrupted | SandboxError::Secret(_) => {
            return true
        }
        SandboxError::Host(
            HostError::RemoteService { .. } | HostError::HostResolution(_) | HostError::Timeout(_),
        ) => return false,
        _ => {}
    }

    if error.to_string().to_lowercase().contains("timeout") {
        return false;
    }

    !prior_outcome_was_success
}
