//! Engine configuration.
//!
//! An `EngineConfig` is built once, wrapped in an `Arc`, and handed to every
//! worker when it creates its guest runtime. Nothing here is mutated after the
//! pool starts.

use serde::{Deserialize, Serialize};

use crate::types::SourceUnit;

/// Global names the runtime installs itself; the bridge may not shadow them.
const RESERVED_NAMES: &[&str] = &["host", "console", "globalThis", "undefined"];

/// Words a script cannot use as a plain identifier.
const KEYWORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Standard globals a guest expects to find untouched.
const BUILTINS: &[&str] = &[
    "Array", "ArrayBuffer", "BigInt", "Boolean", "DataView", "Date", "Error", "EvalError",
    "Function", "Infinity", "JSON", "Map", "Math", "NaN", "Number", "Object", "Promise", "Proxy",
    "RangeError", "ReferenceError", "Reflect", "RegExp", "Set", "String", "Symbol", "SyntaxError",
    "TypeError", "URIError", "WeakMap", "WeakRef", "WeakSet", "arguments", "eval", "isFinite",
    "isNaN", "parseFloat", "parseInt",
];

/// Host facilities a guest may reach, each granted independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// `host.env(name)`
    pub environment: bool,
    /// `host.after(ms, fn, ...args)`, backed by a host thread per timer
    pub threads: bool,
    /// `host.readTextFile(path)` / `host.writeTextFile(path, text)`
    pub io: bool,
    /// `host.exec(cmd, args)`
    pub process: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        environment: false,
        threads: false,
        io: false,
        process: false,
    };

    pub fn all() -> Self {
        Self {
            environment: true,
            threads: true,
            io: true,
            process: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }

    /// Enable a capability by its short name (`env`, `threads`, `io`, `process`).
    pub fn grant(&mut self, name: &str) -> Result<(), String> {
        match name {
            "env" | "environment" => self.environment = true,
            "threads" => self.threads = true,
            "io" => self.io = true,
            "process" => self.process = true,
            other => return Err(format!("unknown capability '{other}'")),
        }
        Ok(())
    }

    /// Names of the granted capabilities, for logging.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.environment {
            names.push("env");
        }
        if self.threads {
            names.push("threads");
        }
        if self.io {
            names.push("io");
        }
        if self.process {
            names.push("process");
        }
        names
    }
}

/// Immutable settings for one guest runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global name the callback bridge is bound to.
    pub binding_name: String,
    /// Heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// Native stack limit in bytes.
    pub max_stack_size: Option<usize>,
    /// Allocation volume that triggers a GC cycle, in bytes.
    pub gc_threshold: Option<usize>,
    /// Maximum nesting of a captured argument.
    pub max_snapshot_depth: usize,
    /// Install the `console` object.
    pub console: bool,
    pub capabilities: Capabilities,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binding_name: "hostInvoke".to_string(),
            memory_limit: None,
            max_stack_size: None,
            gc_threshold: None,
            max_snapshot_depth: 32,
            console: true,
            capabilities: Capabilities::NONE,
        }
    }
}

impl EngineConfig {
    pub fn with_binding_name(mut self, name: impl Into<String>) -> Self {
        self.binding_name = name.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Check the settings a runtime cannot be created without.
    pub fn validate(&self) -> Result<(), String> {
        if !is_identifier(&self.binding_name) {
            return Err(format!(
                "binding name '{}' is not a valid identifier",
                self.binding_name
            ));
        }
        let name = self.binding_name.as_str();
        if RESERVED_NAMES.contains(&name) || KEYWORDS.contains(&name) || BUILTINS.contains(&name) {
            return Err(format!("binding name '{}' is reserved", self.binding_name));
        }
        if self.max_snapshot_depth == 0 {
            return Err("max_snapshot_depth must be at least 1".to_string());
        }
        Ok(())
    }

    /// The fixed startup script, calling this configuration's binding.
    pub fn repro_source(&self) -> SourceUnit {
        SourceUnit::repro(&self.binding_name)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
