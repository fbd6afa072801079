//! Tool registry and execution surface.
//!
//! Tools are named executor callbacks with a JSON-schema parameter
//! description. The registry stores and executes them; forwarding of
//! `desktop_*` invocations to a desktop peer is a dispatch-layer concern
//! handled by `ToolDispatcher`, never by the registry itself.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub type ToolExec = Box<dyn Fn(&Value) -> ToolResult + Send + Sync>;

pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON-schema string for the tool parameters.
    pub params_schema: String,
    pub exec: ToolExec,
    pub requires_sandbox: bool,
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
    pub exit_code: i32,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> ToolResult {
        ToolResult {
            output: output.into(),
            is_error: false,
            exit_code: 0,
        }
    }

    pub fn error(output: impl Into<String>) -> ToolResult {
        ToolResult {
            output: output.into(),
            is_error: true,
            exit_code: -1,
        }
    }
}

/// Insertion-ordered tool table. Registration is idempotent by name:
/// re-registering replaces the previous entry in place and warns.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDef>,
}

impl ToolRegistry {
    pub fn new() -> ToolRegistry {
        ToolRegistry { tools: Vec::new() }
    }

    pub fn register(&mut self, def: ToolDef) {
        if let Some(existing) = self.tools.iter_mut().find(|t| t.name == def.name) {
            warn!(name = %def.name, "tool already registered, replacing");
            *existing = def;
            return;
        }
        debug!(name = %def.name, "tool registered");
        self.tools.push(def);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDef> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn execute(&self, name: &str, args: &Value) -> ToolResult {
        let Some(def) = self.get(name) else {
            return ToolResult::error(format!("error: unknown tool '{name}'"));
        };
        debug!(name = %name, "executing tool");
        (def.exec)(args)
    }

    /// Anthropic-shaped tool catalog. A parameter schema that fails to
    /// parse falls back to `{}`.
    pub fn catalog(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|t| {
                    let schema: Value = serde_json::from_str(&t.params_schema)
                        .unwrap_or_else(|_| json!({}));
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": schema,
                    })
                })
                .collect(),
        )
    }
}

// ── Dispatch layer ───────────────────────────────────────────────────────────

/// Capability interface for forwarding desktop tool invocations to a
/// desktop peer. The default implementation only reports the forwarding.
pub trait DesktopForwarder: Send + Sync {
    fn forward(&self, name: &str, args: &Value) -> ToolResult;
}

pub struct NullForwarder;

impl DesktopForwarder for NullForwarder {
    fn forward(&self, name: &str, _args: &Value) -> ToolResult {
        debug!(name = %name, "desktop tool forwarded");
        ToolResult::ok("[forwarded to desktop]")
    }
}

/// Routes tool invocations: `desktop_*` names go to the forwarder, all
/// others execute through the registry.
pub struct ToolDispatcher {
    registry: ToolRegistry,
    forwarder: Box<dyn DesktopForwarder>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> ToolDispatcher {
        ToolDispatcher {
            registry,
            forwarder: Box::new(NullForwarder),
        }
    }

    pub fn with_forwarder(registry: ToolRegistry, forwarder: Box<dyn DesktopForwarder>) -> Self {
        ToolDispatcher { registry, forwarder }
    }

    pub fn dispatch(&self, name: &str, args: &Value) -> ToolResult {
        if name.starts_with("desktop_") && self.registry.get(name).is_some() {
            return self.forwarder.forward(name, args);
        }
        self.registry.execute(name, args)
    }

    pub fn catalog(&self) -> Value {
        self.registry.catalog()
    }

    pub fn has_tools(&self) -> bool {
        !self.registry.is_empty()
    }
}

// ── Default tool set ─────────────────────────────────────────────────────────

const WEB_FETCH_MAX_BODY: usize = 64 * 1024;
const BASH_TIMEOUT: Duration = Duration::from_secs(60);

/// Register the default tools: local executors plus the desktop shims the
/// model sees in its catalog.
pub fn register_defaults(registry: &mut ToolRegistry, workspace: Option<PathBuf>) {
    let workspace = workspace.unwrap_or_else(|| PathBuf::from("."));

    registry.register(ToolDef {
        name: "bash".into(),
        description: "Run a shell command and return its output.".into(),
        params_schema: r#"{"type":"object","properties":{"command":{"type":"string","description":"Shell command to run"}},"required":["command"]}"#.into(),
        exec: Box::new(bash_exec),
        requires_sandbox: true,
        requires_confirmation: true,
    });

    let ws = workspace.clone();
    registry.register(ToolDef {
        name: "file_read".into(),
        description: "Read a file from the workspace.".into(),
        params_schema: r#"{"type":"object","properties":{"path":{"type":"string","description":"Workspace-relative path"}},"required":["path"]}"#.into(),
        exec: Box::new(move |args| file_read_exec(&ws, args)),
        requires_sandbox: false,
        requires_confirmation: false,
    });

    let ws = workspace.clone();
    registry.register(ToolDef {
        name: "file_write".into(),
        description: "Write content to a file in the workspace.".into(),
        params_schema: r#"{"type":"object","properties":{"path":{"type":"string","description":"Workspace-relative path"},"content":{"type":"string","description":"File content"}},"required":["path","content"]}"#.into(),
        exec: Box::new(move |args| file_write_exec(&ws, args)),
        requires_sandbox: true,
        requires_confirmation: true,
    });

    registry.register(ToolDef {
        name: "web_fetch".into(),
        description: "Fetch a URL and return the response body.".into(),
        params_schema: r#"{"type":"object","properties":{"url":{"type":"string","description":"URL to fetch"}},"required":["url"]}"#.into(),
        exec: Box::new(web_fetch_exec),
        requires_sandbox: false,
        requires_confirmation: false,
    });

    register_desktop_shims(registry);
}

/// Desktop control shims. These exist so the model sees them in the tool
/// catalog; execution happens via the dispatcher's forwarder.
fn register_desktop_shims(registry: &mut ToolRegistry) {
    let shims: [(&str, &str, &str); 5] = [
        (
            "desktop_move_cursor",
            "Move the desktop cursor to a position on screen.",
            r#"{"type":"object","properties":{"x":{"type":"number","description":"X coordinate"},"y":{"type":"number","description":"Y coordinate"}},"required":["x","y"]}"#,
        ),
        (
            "desktop_click",
            "Click at a position on the desktop.",
            r#"{"type":"object","properties":{"x":{"type":"number","description":"X coordinate"},"y":{"type":"number","description":"Y coordinate"}},"required":["x","y"]}"#,
        ),
        (
            "desktop_type",
            "Type text into the currently focused panel.",
            r#"{"type":"object","properties":{"text":{"type":"string","description":"Text to type"}},"required":["text"]}"#,
        ),
        (
            "desktop_open_panel",
            "Open a desktop panel: chat, terminal, monitor, or files.",
            r#"{"type":"object","properties":{"name":{"type":"string","enum":["chat","terminal","monitor","files"],"description":"Panel name"}},"required":["name"]}"#,
        ),
        (
            "desktop_get_state",
            "Get the current desktop state as JSON.",
            r#"{"type":"object","properties":{}}"#,
        ),
    ];

    for (name, description, schema) in shims {
        registry.register(ToolDef {
            name: name.into(),
            description: description.into(),
            params_schema: schema.into(),
            exec: Box::new(|_| ToolResult::ok("[forwarded to desktop]")),
            requires_sandbox: false,
            requires_confirmation: false,
        });
    }
}

fn bash_exec(args: &Value) -> ToolResult {
    let Some(command) = args.get("command").and_then(Value::as_str) else {
        return ToolResult::error("error: missing 'command' argument");
    };

    let child = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("error: failed to spawn shell: {e}")),
    };

    match wait_with_timeout(child, BASH_TIMEOUT) {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.stderr.is_empty() {
                text.push_str(&String::from_utf8_lossy(&output.stderr));
            }
            let code = output.status.code().unwrap_or(-1);
            ToolResult {
                output: text,
                is_error: !output.status.success(),
                exit_code: code,
            }
        }
        Err(e) => ToolResult::error(format!("error: {e}")),
    }
}

fn wait_with_timeout(
    mut child: std::process::Child,
    timeout: Duration,
) -> std::io::Result<std::process::Output> {
    let start = std::time::Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            return child.wait_with_output();
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "command timed out",
            ));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Reject absolute paths and parent-directory escapes.
fn resolve_workspace_path(workspace: &Path, path: &str) -> Option<PathBuf> {
    let rel = Path::new(path);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return None;
    }
    Some(workspace.join(rel))
}

fn file_read_exec(workspace: &Path, args: &Value) -> ToolResult {
    let Some(path) = args.get("path").and_then(Value::as_str) else {
        return ToolResult::error("error: missing 'path' argument");
    };
    let Some(full) = resolve_workspace_path(workspace, path) else {
        return ToolResult::error(format!("error: path '{path}' escapes the workspace"));
    };
    match std::fs::read_to_string(&full) {
        Ok(content) => ToolResult::ok(content),
        Err(e) => ToolResult::error(format!("error: cannot read '{path}': {e}")),
    }
}

fn file_write_exec(workspace: &Path, args: &Value) -> ToolResult {
    let Some(path) = args.get("path").and_then(Value::as_str) else {
        return ToolResult::error("error: missing 'path' argument");
    };
    let Some(content) = args.get("content").and_then(Value::as_str) else {
        return ToolResult::error("error: missing 'content' argument");
    };
    let Some(full) = resolve_workspace_path(workspace, path) else {
        return ToolResult::error(format!("error: path '{path}' escapes the workspace"));
    };
    if let Some(parent) = full.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return ToolResult::error(format!("error: cannot create directory: {e}"));
        }
    }
    match std::fs::write(&full, content) {
        Ok(()) => ToolResult::ok(format!("wrote {} bytes to {path}", content.len())),
        Err(e) => ToolResult::error(format!("error: cannot write '{path}': {e}")),
    }
}

fn web_fetch_exec(args: &Value) -> ToolResult {
    let Some(url) = args.get("url").and_then(Value::as_str) else {
        return ToolResult::error("error: missing 'url' argument");
    };

    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(c) => c,
        Err(e) => return ToolResult::error(format!("error: {e}")),
    };

    match client.get(url).send() {
        Ok(resp) => {
            let status = resp.status();
            let mut body = resp.text().unwrap_or_default();
            if body.len() > WEB_FETCH_MAX_BODY {
                body.truncate(WEB_FETCH_MAX_BODY);
                body.push_str("\n[truncated]");
            }
            if status.is_success() {
                ToolResult::ok(body)
            } else {
                ToolResult {
                    output: format!("error: HTTP {status}: {body}"),
                    is_error: true,
                    exit_code: status.as_u16() as i32,
                }
            }
        }
        Err(e) => ToolResult::error(format!("error: fetch failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_tool(name: &str, description: &str) -> ToolDef {
        ToolDef {
            name: name.into(),
            description: description.into(),
            params_schema: r#"{"type":"object","properties":{}}"#.into(),
            exec: Box::new(|_| ToolResult::ok("ok")),
            requires_sandbox: false,
            requires_confirmation: false,
        }
    }

    #[test]
    fn unknown_tool_result_shape() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nope", &json!({}));
        assert_eq!(result.output, "error: unknown tool 'nope'");
        assert!(result.is_error);
        assert_eq!(result.exit_code, -1);
    }

    #[test]
    fn register_replaces_by_name_exactly_once() {
        let mut registry = ToolRegistry::new();
        registry.register(noop_tool("echo", "first"));
        registry.register(noop_tool("other", "other"));
        registry.register(noop_tool("echo", "second"));

        assert_eq!(registry.len(), 2);
        let catalog = registry.catalog();
        assert_eq!(catalog[0]["name"], "echo");
        assert_eq!(catalog[0]["description"], "second");
        assert_eq!(catalog[1]["name"], "other");
    }

    #[test]
    fn catalog_parses_schema_or_falls_back() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolDef {
            params_schema: "not json".into(),
            ..noop_tool("broken", "bad schema")
        });
        registry.register(noop_tool("fine", "good schema"));

        let catalog = registry.catalog();
        assert_eq!(catalog[0]["input_schema"], json!({}));
        assert_eq!(catalog[1]["input_schema"]["type"], "object");
    }

    #[test]
    fn desktop_names_route_to_forwarder() {
        struct Recorder;
        impl DesktopForwarder for Recorder {
            fn forward(&self, name: &str, _args: &Value) -> ToolResult {
                ToolResult::ok(format!("forwarded:{name}"))
            }
        }

        let mut registry = ToolRegistry::new();
        register_defaults(&mut registry, None);
        let dispatcher = ToolDispatcher::with_forwarder(registry, Box::new(Recorder));

        let result = dispatcher.dispatch("desktop_click", &json!({"x": 1, "y": 2}));
        assert_eq!(result.output, "forwarded:desktop_click");

        // Unregistered desktop names still surface as unknown tools
        let result = dispatcher.dispatch("desktop_unknown", &json!({}));
        assert!(result.is_error);
    }

    #[test]
    fn default_forwarder_reports_marker() {
        let mut registry = ToolRegistry::new();
        register_defaults(&mut registry, None);
        let dispatcher = ToolDispatcher::new(registry);
        let result = dispatcher.dispatch("desktop_get_state", &json!({}));
        assert_eq!(result.output, "[forwarded to desktop]");
        assert!(!result.is_error);
    }

    #[test]
    fn file_tools_round_trip_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        register_defaults(&mut registry, Some(dir.path().to_path_buf()));

        let write = registry.execute(
            "file_write",
            &json!({"path": "notes/hello.txt", "content": "hi there"}),
        );
        assert!(!write.is_error, "{}", write.output);

        let read = registry.execute("file_read", &json!({"path": "notes/hello.txt"}));
        assert_eq!(read.output, "hi there");
    }

    #[test]
    fn file_read_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        register_defaults(&mut registry, Some(dir.path().to_path_buf()));

        let result = registry.execute("file_read", &json!({"path": "../etc/passwd"}));
        assert!(result.is_error);
        let result = registry.execute("file_read", &json!({"path": "/etc/passwd"}));
        assert!(result.is_error);
    }

    #[test]
    fn bash_tool_runs_commands() {
        let mut registry = ToolRegistry::new();
        register_defaults(&mut registry, None);

        let result = registry.execute("bash", &json!({"command": "echo tool-ok"}));
        assert!(!result.is_error);
        assert_eq!(result.output.trim(), "tool-ok");
        assert_eq!(result.exit_code, 0);

        let result = registry.execute("bash", &json!({"command": "exit 3"}));
        assert!(result.is_error);
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn default_set_has_expected_flags() {
        let mut registry = ToolRegistry::new();
        register_defaults(&mut registry, None);
        assert!(registry.get("bash").unwrap().requires_sandbox);
        assert!(registry.get("bash").unwrap().requires_confirmation);
        assert!(!registry.get("file_read").unwrap().requires_sandbox);
        assert!(registry.get("desktop_type").is_some());
    }
}
