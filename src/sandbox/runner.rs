/// Script Sandbox Runner
///
/// Runs one widget script invocation in a fresh, restricted Lua interpreter
/// and folds every way it can end into an [`ExecutionOutcome`]. Blocking:
/// callers run it on a worker thread.

use crate::sandbox::bindings::{self, Binding, ResolvedBindings};
use crate::sandbox::capabilities::SandboxCapabilities;
use crate::sandbox::error::{is_fatal, strip_prefixes, HostError, SandboxError};
use crate::sandbox::rewrite::{self, INTERRUPT_CHECK};
use crate::sandbox::secrets::{mask_secrets, SecretCodec};
use crate::widget::{ExecutionDescriptor, ExecutionOutcome, FailureKind};
use chrono::Utc;
use mlua::{Lua, LuaOptions, LuaSerdeExt, StdLib};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Global function every widget script must define
pub const ENTRY_FUNCTION: &str = "run";

/// Host capabilities that exist in stock Lua but are withheld here
pub const WITHHELD_GLOBALS: [&str; 10] = [
    "os",
    "io",
    "debug",
    "package",
    "require",
    "load",
    "loadfile",
    "dofile",
    "loadstring",
    "collectgarbage",
];

// Installed before the widget chunk: captured print and strict globals
const PRELUDE: &str = r#"
local missing = __sandbox_missing
local write = __sandbox_write
local select, tostring, concat = select, tostring, table.concat
__sandbox_missing = nil
__sandbox_write = nil
print = function(...)
  local parts = {}
  for i = 1, select('#', ...) do
    parts[i] = tostring((select(i, ...)))
  end
  write(concat(parts, '\t'))
end
setmetatable(_G, { __index = function(_, name) return missing(name) end, __metatable = false })
"#;

/// Executes widget scripts in isolated interpreters
pub struct SandboxRunner {
    codec: Arc<dyn SecretCodec>,
    capabilities: SandboxCapabilities,
    memory_limit: Option<usize>,
}

impl SandboxRunner {
    pub fn new(codec: Arc<dyn SecretCodec>, capabilities: SandboxCapabilities) -> Self {
        Self {
            codec,
            capabilities,
            memory_limit: None,
        }
    }

    /// Cap interpreter memory (bytes) for every invocation
    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Run one invocation; never fails, every error ends up in the outcome
    pub fn execute(&self, descriptor: &ExecutionDescriptor, token: &CancellationToken) -> ExecutionOutcome {
        let launched_at = Utc::now();
        let started = std::time::Instant::now();
        let output = Rc::new(RefCell::new(String::new()));
        let mut secrets = Vec::new();

        tracing::debug!("🧪 Running script for widget instance {}", descriptor.widget_instance_id);

        let result = self.run_script(descriptor, token, &mut secrets, Rc::clone(&output));

        let (data, log, failure_kind) = match result {
            Ok(data) => {
                let captured = output.borrow();
                let log = (!captured.is_empty()).then(|| mask_secrets(captured.trim_end(), &secrets));
                (Some(data), log, FailureKind::None)
            }
            Err(error) => {
                let kind = if is_fatal(&error, descriptor.prior_outcome_was_success) {
                    FailureKind::Fatal
                } else {
                    FailureKind::Recoverable
                };
                let message = mask_secrets(&error.to_string(), &secrets);
                tracing::warn!(
                    "⚠️ Widget instance {} failed ({:?}): {}",
                    descriptor.widget_instance_id,
                    kind,
                    message
                );
                (None, Some(message), kind)
            }
        };

        tracing::debug!(
            "⏱️ Widget instance {} finished in {:?}",
            descriptor.widget_instance_id,
            started.elapsed()
        );

        ExecutionOutcome {
            project_id: descriptor.project_id,
            widget_instance_id: descriptor.widget_instance_id,
            data,
            log,
            failure_kind,
            launched_at,
        }
    }

    fn run_script(
        &self,
        descriptor: &ExecutionDescriptor,
        token: &CancellationToken,
        secrets: &mut Vec<String>,
        output: Rc<RefCell<String>>,
    ) -> Result<String, SandboxError> {
        let resolved = bindings::resolve(descriptor, self.codec.as_ref())?;
        secrets.extend(resolved.secrets.iter().cloned());

        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8,
            LuaOptions::default(),
        )?;
        if let Some(limit) = self.memory_limit {
            lua.set_memory_limit(limit)?;
        }

        self.install(&lua, &resolved, token, output)?;

        let source = rewrite::instrument(&descriptor.script);
        lua.load(source.as_str())
            .set_name(format!("=widget-{}", descriptor.widget_instance_id))
            .exec()?;

        let entry: Option<mlua::Function> = lua.globals().raw_get(ENTRY_FUNCTION)?;
        let entry = entry.ok_or_else(|| SandboxError::MissingEntryFunction(ENTRY_FUNCTION.to_string()))?;

        let value: mlua::Value = entry.call(())?;
        result_to_json(&lua, value)
    }

    /// Bind properties and capabilities, then lock down the global table
    fn install(
        &self,
        lua: &Lua,
        resolved: &ResolvedBindings,
        token: &CancellationToken,
        output: Rc<RefCell<String>>,
    ) -> mlua::Result<()> {
        let globals = lua.globals();

        for name in WITHHELD_GLOBALS {
            globals.set(name, mlua::Nil)?;
        }

        for (name, value) in &resolved.globals {
            match value {
                Binding::Text(text) => globals.set(name.as_str(), text.as_str())?,
                Binding::Integer(i) => globals.set(name.as_str(), *i)?,
                Binding::Number(f) => globals.set(name.as_str(), *f)?,
                Binding::Boolean(b) => globals.set(name.as_str(), *b)?,
                Binding::Null => {}
            }
        }

        let nulls: HashSet<String> = resolved.null_names().map(String::from).collect();
        globals.set(
            "__sandbox_missing",
            lua.create_function(move |_, name: String| -> mlua::Result<mlua::Value> {
                if WITHHELD_GLOBALS.contains(&name.as_str()) {
                    tracing::warn!("🚨 Widget script tried to reach {}", name);
                    Err(SandboxError::AccessDenied(name).into_lua_error())
                } else if nulls.contains(&name) {
                    Ok(mlua::Value::Nil)
                } else {
                    Err(SandboxError::NotDefined(name).into_lua_error())
                }
            })?,
        )?;

        globals.set(
            "__sandbox_write",
            lua.create_function(move |_, line: String| {
                let mut buffer = output.borrow_mut();
                buffer.push_str(&line);
                buffer.push('\n');
                Ok(())
            })?,
        )?;

        let token = token.clone();
        globals.set(
            INTERRUPT_CHECK,
            lua.create_function(move |_, ()| {
                if token.is_cancelled() {
                    Err(SandboxError::Interrupted.into_lua_error())
                } else {
                    Ok(())
                }
            })?,
        )?;

        globals.set(
            "remote_error",
            lua.create_function(|_, message: String| -> mlua::Result<()> {
                Err(mlua::Error::external(HostError::RemoteService { status: None, message }))
            })?,
        )?;

        let json = lua.create_table()?;
        json.set(
            "encode",
            lua.create_function(|lua, value: mlua::Value| {
                let value: serde_json::Value = lua.from_value(value)?;
                serde_json::to_string(&value).map_err(mlua::Error::external)
            })?,
        )?;
        json.set(
            "decode",
            lua.create_function(|lua, text: String| {
                let value: serde_json::Value = serde_json::from_str(&text).map_err(mlua::Error::external)?;
                lua.to_value(&value)
            })?,
        )?;
        globals.set("json", json)?;

        if let Some(http) = &self.capabilities.http {
            let table = lua.create_table()?;

            let client = Arc::clone(http);
            table.set(
                "get",
                lua.create_function(move |_, (url, headers): (String, Option<mlua::Table>)| {
                    let headers = header_pairs(headers)?;
                    client.get(&url, &headers).map_err(mlua::Error::external)
                })?,
            )?;

            let client = Arc::clone(http);
            table.set(
                "post",
                lua.create_function(
                    move |_, (url, body, headers): (String, String, Option<mlua::Table>)| {
                        let headers = header_pairs(headers)?;
                        client.post(&url, &headers, &body).map_err(mlua::Error::external)
                    },
                )?,
            )?;

            globals.set("http", table)?;
        }

        lua.load(PRELUDE).set_name("=sandbox").exec()
    }
}

fn header_pairs(headers: Option<mlua::Table>) -> mlua::Result<Vec<(String, String)>> {
    match headers {
        Some(table) => table.pairs::<String, String>().collect(),
        None => Ok(Vec::new()),
    }
}

/// Accept a JSON string or a table serialisable as JSON
fn result_to_json(lua: &Lua, value: mlua::Value) -> Result<String, SandboxError> {
    match value {
        mlua::Value::String(text) => {
            let text = text.to_str()?.to_string();
            serde_json::from_str::<serde_json::Value>(&text)
                .map_err(|e| SandboxError::InvalidResult(format!("not valid JSON ({})", e)))?;
            Ok(text)
        }
        mlua::Value::Table(_) => {
            let json: serde_json::Value = lua
                .from_value(value)
                .map_err(|e| SandboxError::InvalidResult(strip_prefixes(&e.to_string())))?;
            serde_json::to_string(&json).map_err(|e| SandboxError::InvalidResult(e.to_string()))
        }
        other => Err(SandboxError::InvalidResult(format!(
            "expected a JSON string or table, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::capabilities::HttpCapability;
    use crate::sandbox::secrets::{PassthroughCodec, SECRET_MASK};
    use crate::widget::{HealthState, ParamKind, Properties, WidgetParam};
    use std::time::Duration;

    fn runner() -> SandboxRunner {
        SandboxRunner::new(Arc::new(PassthroughCodec), SandboxCapabilities::offline())
    }

    fn descriptor(script: &str) -> ExecutionDescriptor {
        ExecutionDescriptor {
            project_id: 1,
            widget_instance_id: 7,
            script: script.to_string(),
            properties: Properties::new(),
            params: Vec::new(),
            previous_result: None,
            delay_seconds: 0,
            timeout_seconds: None,
            prior_outcome_was_success: false,
            current_health_state: HealthState::Stopped,
        }
    }

    fn run(descriptor: &ExecutionDescriptor) -> ExecutionOutcome {
        runner().execute(descriptor, &CancellationToken::new())
    }

    #[test]
    fn minimal_script_succeeds() {
        let outcome = run(&descriptor("function run() return '{}' end"));
        assert_eq!(outcome.failure_kind, FailureKind::None);
        assert_eq!(outcome.data.as_deref(), Some("{}"));
        assert_eq!(outcome.log, None);
        assert_eq!(outcome.widget_instance_id, 7);
    }

    #[test]
    fn tables_are_serialised_and_output_captured() {
        let outcome = run(&descriptor(
            "function run()\n  print('fetching', 3)\n  return { count = 3 }\nend",
        ));
        assert_eq!(outcome.failure_kind, FailureKind::None);
        assert_eq!(outcome.data.as_deref(), Some("{\"count\":3}"));
        assert_eq!(outcome.log.as_deref(), Some("fetching\t3"));
    }

    #[test]
    fn undeclared_global_is_fatal() {
        let outcome = run(&descriptor("function run() return UNKNOWN_THING end"));
        assert_eq!(outcome.failure_kind, FailureKind::Fatal);
        assert!(outcome.log.unwrap().contains("not defined"));
        assert!(outcome.data.is_none());
    }

    #[test]
    fn withheld_capability_is_fatal_even_after_success() {
        let mut d = descriptor("function run() return os.time() end");
        d.prior_outcome_was_success = true;
        let outcome = run(&d);
        assert_eq!(outcome.failure_kind, FailureKind::Fatal);
        assert!(outcome.log.unwrap().contains("access denied: os"));
    }

    #[test]
    fn remote_errors_are_recoverable_without_prior_success() {
        let outcome = run(&descriptor("function run() remote_error('jenkins is down') end"));
        assert_eq!(outcome.failure_kind, FailureKind::Recoverable);
        assert_eq!(outcome.log.as_deref(), Some("remote service error: jenkins is down"));
    }

    #[test]
    fn defects_are_recoverable_after_prior_success() {
        let mut d = descriptor("function run() return 'not json' end");
        assert_eq!(run(&d).failure_kind, FailureKind::Fatal);
        d.prior_outcome_was_success = true;
        assert_eq!(run(&d).failure_kind, FailureKind::Recoverable);
    }

    #[test]
    fn timeout_messages_are_recoverable() {
        let outcome = run(&descriptor("function run() error('upstream Timeout while polling') end"));
        assert_eq!(outcome.failure_kind, FailureKind::Recoverable);
    }

    #[test]
    fn missing_entry_function() {
        let outcome = run(&descriptor("local x = 1"));
        assert_eq!(outcome.failure_kind, FailureKind::Fatal);
        assert!(outcome.log.unwrap().contains("'run'"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        let outcome = run(&descriptor("function run( return end"));
        assert_eq!(outcome.failure_kind, FailureKind::Fatal);
        assert!(outcome.log.unwrap().contains("widget-7"));
    }

    #[test]
    fn secrets_are_masked_in_logs() {
        let mut d = descriptor("function run()\n  print('using ' .. API_KEY)\n  error('rejected key ' .. API_KEY)\nend");
        d.properties = Properties::parse("API_KEY=hunter2");
        d.params = vec![WidgetParam {
            name: "API_KEY".into(),
            description: None,
            default_value: None,
            kind: ParamKind::Password,
            required: true,
        }];
        let outcome = run(&d);
        let log = outcome.log.unwrap();
        assert!(!log.contains("hunter2"));
        assert!(log.contains(SECRET_MASK));
    }

    #[test]
    fn reserved_globals_and_declared_nulls() {
        let mut d = descriptor(
            "function run()\n  local prev = json.decode(WIDGET_PREVIOUS)\n  return { prev = prev.n, id = WIDGET_INSTANCE_ID, filtered = FILTER ~= nil }\nend",
        );
        d.previous_result = Some("{\"n\":5}".into());
        d.params = vec![WidgetParam {
            name: "filter".into(),
            description: None,
            default_value: None,
            kind: ParamKind::Text,
            required: false,
        }];
        let outcome = run(&d);
        assert_eq!(outcome.failure_kind, FailureKind::None, "{:?}", outcome.log);
        let data: serde_json::Value = serde_json::from_str(outcome.data.as_deref().unwrap()).unwrap();
        assert_eq!(data, serde_json::json!({"prev": 5, "id": 7, "filtered": false}));
    }

    #[test]
    fn runaway_loop_is_interrupted() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let outcome = runner().execute(&descriptor("function run() while true do end end"), &token);
        handle.join().unwrap();

        assert_eq!(outcome.failure_kind, FailureKind::Fatal);
        assert_eq!(outcome.log.as_deref(), Some("script execution interrupted"));
    }

    #[test]
    fn goto_loop_is_interrupted() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let outcome = runner().execute(&descriptor("function run() ::top:: goto top end"), &token);
        handle.join().unwrap();

        assert_eq!(outcome.failure_kind, FailureKind::Fatal);
        assert_eq!(outcome.log.as_deref(), Some("script execution interrupted"));
    }

    #[test]
    fn goto_continue_still_compiles() {
        let outcome = run(&descriptor(
            "function run() local n = 0 for i = 1, 4 do if i % 2 == 0 then goto continue end local odd = i n = n + odd ::continue:: end return { n = n } end",
        ));
        assert_eq!(outcome.failure_kind, FailureKind::None, "{:?}", outcome.log);
        assert_eq!(outcome.data.as_deref(), Some("{\"n\":4}"));
    }

    struct FakeHttp;

    impl HttpCapability for FakeHttp {
        fn get(&self, url: &str, headers: &[(String, String)]) -> Result<String, HostError> {
            if url.contains("unknown.invalid") {
                return Err(HostError::HostResolution("unknown.invalid".into()));
            }
            Ok(serde_json::json!({ "url": url, "headers": headers.len() }).to_string())
        }

        fn post(&self, _url: &str, _headers: &[(String, String)], body: &str) -> Result<String, HostError> {
            Ok(body.to_string())
        }
    }

    #[test]
    fn http_capability_is_exposed() {
        let runner = SandboxRunner::new(
            Arc::new(PassthroughCodec),
            SandboxCapabilities::with_http(Arc::new(FakeHttp)),
        );
        let token = CancellationToken::new();

        let outcome = runner.execute(
            &descriptor("function run() return http.get('https://ci/api', { Accept = 'application/json' }) end"),
            &token,
        );
        assert_eq!(outcome.failure_kind, FailureKind::None);
        assert!(outcome.data.unwrap().contains("\"headers\":1"));

        let outcome = runner.execute(
            &descriptor("function run() return http.post('https://ci/api', '{\"ok\":true}') end"),
            &token,
        );
        assert_eq!(outcome.data.as_deref(), Some("{\"ok\":true}"));

        let outcome = runner.execute(
            &descriptor("function run() return http.get('https://unknown.invalid/') end"),
            &token,
        );
        assert_eq!(outcome.failure_kind, FailureKind::Recoverable);
    }

    #[test]
    fn http_is_absent_when_offline() {
        let outcome = run(&descriptor("function run() return http.get('https://ci') end"));
        assert_eq!(outcome.failure_kind, FailureKind::Fatal);
        assert!(outcome.log.unwrap().contains("http is not defined"));
    }
}
