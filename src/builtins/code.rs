use crate::builtins::{BuiltinTool, BuiltinToolResult, UserContext, required_str};
use crate::config::BuiltinSettings;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Marker separating user stdout from the structured result line.
const RESULT_MARKER: &str = "__TOOLGATE_RESULT__";

/// Interpreter prelude: guarded imports, disabled filesystem/process
/// builtins, isolated namespace, stdout capture, and result extraction
/// (the `result` variable, else the value of a trailing expression).
///
/// The sandbox is not a security boundary against a hostile kernel; it is
/// defence-in-depth against routine misuse. The subprocess gives us the
/// timeout and memory isolation.
const SANDBOX_PRELUDE: &str = r#"
import ast, builtins, contextlib, io, json, sys

ALLOWED_MODULES = {
    "math", "json", "re", "datetime", "random", "statistics",
    "itertools", "functools", "collections", "string", "textwrap",
}
_real_import = builtins.__import__

def _guarded_import(name, *args, **kwargs):
    if name.split(".")[0] not in ALLOWED_MODULES:
        raise ImportError("import of %r is not allowed" % name)
    return _real_import(name, *args, **kwargs)

builtins.__import__ = _guarded_import

# Keep working references for the harness itself before the names are blocked.
_compile, _exec, _eval = compile, exec, eval

def _blocked(*args, **kwargs):
    raise RuntimeError("this builtin is disabled")
for _name in ("open", "input", "exec", "eval", "compile", "breakpoint", "exit", "quit"):
    setattr(builtins, _name, _blocked)

_code = sys.stdin.read()
_namespace = {"__name__": "__tool__"}
_stdout = io.StringIO()
_result = None
try:
    _tree = ast.parse(_code, mode="exec")
    _trailing = None
    if _tree.body and isinstance(_tree.body[-1], ast.Expr):
        _trailing = ast.Expression(_tree.body.pop().value)
    with contextlib.redirect_stdout(_stdout):
        _exec(_compile(_tree, "<tool>", "exec"), _namespace)
        if _trailing is not None:
            _result = _eval(_compile(_trailing, "<tool>", "eval"), _namespace)
    if "result" in _namespace:
        _result = _namespace["result"]
    _payload = {"ok": True, "stdout": _stdout.getvalue()}
    try:
        json.dumps(_result)
        _payload["result"] = _result
    except (TypeError, ValueError):
        _payload["result"] = repr(_result)
except Exception as exc:  # noqa: BLE001
    _payload = {"ok": False, "stdout": _stdout.getvalue(), "error": "%s: %s" % (type(exc).__name__, exc)}

sys.__stdout__.write("__TOOLGATE_RESULT__" + json.dumps(_payload))
"#;

/// Run user-supplied Python in a restricted subprocess sandbox.
pub struct ExecutePythonTool {
    timeout: Duration,
    interpreter: String,
}

impl ExecutePythonTool {
    pub fn new(settings: &BuiltinSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.sandbox_timeout_secs),
            interpreter: "python3".to_string(),
        }
    }

    async fn run(&self, code: &str) -> Result<Value, String> {
        // The prelude itself execs the blocked-builtin guards, so it must run
        // via `-c` before user code arrives on stdin.
        let mut child = Command::new(&self.interpreter)
            .arg("-I") // isolated mode: no site-packages, no env injection
            .arg("-c")
            .arg(SANDBOX_PRELUDE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("cannot start sandbox interpreter: {}", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(code.as_bytes())
                .await
                .map_err(|e| format!("cannot pass code to sandbox: {}", e))?;
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("execution timed out after {}s", self.timeout.as_secs()))?
            .map_err(|e| format!("sandbox failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(payload) = stdout.split(RESULT_MARKER).nth(1) else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "sandbox produced no result (stderr: {})",
                crate::errors::truncate_body(stderr.trim())
            ));
        };
        serde_json::from_str(payload.trim()).map_err(|e| format!("unparsable sandbox result: {}", e))
    }
}

#[async_trait]
impl BuiltinTool for ExecutePythonTool {
    fn name(&self) -> &str {
        "execute_python"
    }

    fn description(&self) -> &str {
        "Execute Python code in a restricted sandbox. Captures stdout and the value of `result` (or a trailing expression). Imports are limited to a safe module allow-list."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "Python code to execute"}
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, arguments: &Map<String, Value>, _user: &UserContext) -> BuiltinToolResult {
        let code = match required_str(arguments, "code") {
            Ok(c) => c,
            Err(e) => return BuiltinToolResult::err(e),
        };
        debug!("executing {} bytes of sandboxed python", code.len());
        match self.run(code).await {
            Ok(payload) => {
                if payload["ok"].as_bool().unwrap_or(false) {
                    BuiltinToolResult::ok(json!({
                        "stdout": payload["stdout"],
                        "result": payload["result"],
                    }))
                } else {
                    let mut result = BuiltinToolResult::err(
                        payload["error"].as_str().unwrap_or("execution failed").to_string(),
                    );
                    let mut metadata = Map::new();
                    metadata.insert("stdout".into(), payload["stdout"].clone());
                    result.metadata = Some(metadata);
                    result
                }
            }
            Err(e) => BuiltinToolResult::err(e),
        }
    }
}
