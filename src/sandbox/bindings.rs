/// Property resolution
///
/// Merged widget properties and declared params become uppercase script
/// globals. Secret values are decrypted before binding.

use crate::sandbox::error::SandboxError;
use crate::sandbox::secrets::SecretCodec;
use crate::widget::{ExecutionDescriptor, ParamKind, WidgetParam};

/// Global holding the previous successful JSON payload
pub const PREVIOUS_RESULT_GLOBAL: &str = "WIDGET_PREVIOUS";

/// Global holding the widget instance id
pub const INSTANCE_ID_GLOBAL: &str = "WIDGET_INSTANCE_ID";

/// Typed value bound as a script global
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Text(String),
    Integer(i64),
    Number(f64),
    Boolean(bool),
    /// Declared but absent: reading it yields nil instead of an error
    Null,
}

/// Globals for one invocation plus the plaintexts that must never be logged
#[derive(Debug, Default)]
pub struct ResolvedBindings {
    pub globals: Vec<(String, Binding)>,
    pub secrets: Vec<String>,
}

impl ResolvedBindings {
    fn bind(&mut self, name: String, value: Binding) {
        match self.globals.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.globals.push((name, value)),
        }
    }

    /// Names declared without a value
    pub fn null_names(&self) -> impl Iterator<Item = &str> {
        self.globals
            .iter()
            .filter(|(_, value)| matches!(value, Binding::Null))
            .map(|(name, _)| name.as_str())
    }
}

fn find_param<'a>(params: &'a [WidgetParam], key: &str) -> Option<&'a WidgetParam> {
    params.iter().find(|p| p.name.eq_ignore_ascii_case(key))
}

fn typed(kind: ParamKind, raw: String) -> Binding {
    match kind {
        ParamKind::Number => {
            if let Ok(i) = raw.trim().parse::<i64>() {
                Binding::Integer(i)
            } else if let Ok(f) = raw.trim().parse::<f64>() {
                Binding::Number(f)
            } else {
                Binding::Text(raw)
            }
        }
        ParamKind::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Binding::Boolean(true),
            "false" => Binding::Boolean(false),
            _ => Binding::Text(raw),
        },
        _ => Binding::Text(raw),
    }
}

/// Resolve every property and declared parameter into uppercase globals
///
/// Secret parameters are decrypted through the codec; a value that cannot be
/// decrypted fails the invocation. Declared parameters missing from the
/// properties bind their default when required and nil otherwise.
pub fn resolve(descriptor: &ExecutionDescriptor, codec: &dyn SecretCodec) -> Result<ResolvedBindings, SandboxError> {
    let mut resolved = ResolvedBindings::default();

    for (key, value) in descriptor.properties.iter() {
        let name = key.to_uppercase();
        let binding = match find_param(&descriptor.params, key) {
            Some(param) if param.is_secret() => {
                let plaintext = codec.decrypt(value).map_err(|e| {
                    tracing::warn!("🔐 Secret property {} failed to decrypt: {}", name, e);
                    SandboxError::Secret(format!("unable to decrypt secret property {}", name))
                })?;
                resolved.secrets.push(plaintext.clone());
                Binding::Text(plaintext)
            }
            Some(param) => typed(param.kind, value.to_string()),
            None => Binding::Text(value.to_string()),
        };
        resolved.bind(name, binding);
    }

    for param in &descriptor.params {
        if descriptor.properties.iter().any(|(key, _)| key.eq_ignore_ascii_case(&param.name)) {
            continue;
        }
        let binding = match (&param.default_value, param.required) {
            (Some(default), true) => typed(param.kind, default.clone()),
            _ => Binding::Null,
        };
        resolved.bind(param.name.to_uppercase(), binding);
    }

    resolved.bind(
        PREVIOUS_RESULT_GLOBAL.to_string(),
        descriptor
            .previous_result
            .clone()
            .map(Binding::Text)
            .unwrap_or(Binding::Null),
    );
    resolved.bind(
        INSTANCE_ID_GLOBAL.to_string(),
        Binding::Integer(descriptor.widget_instance_id),
    );

    Ok(resolved)
}
