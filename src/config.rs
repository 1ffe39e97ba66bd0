use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a call from one local handler to another is compiled.
///
/// The two modes differ for unit-scope variables. Inlined, a callee's
/// assignment is visible to the caller after the call. Called, the callee
/// initializes its own copies on its own frame and the caller's values are
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerCallMode {
    /// Splice the callee's body into the caller. Cycles are compile errors.
    #[default]
    Inline,
    /// Emit a call; the VM runs the callee on a fresh register frame.
    Call,
}

/// Storage strategy for source-level variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalsMode {
    /// Variables are bound straight to SSA values, joined by phi nodes.
    #[default]
    Ssa,
    /// Every variable lives in a stack slot (alloca/load/store).
    StackSlots,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompileOptions {
    pub handler_calls: HandlerCallMode,
    pub locals: LocalsMode,
    /// 0 disables the IR cleanup passes.
    pub optimization_level: u8,
    /// Run the IR verifier before lowering.
    pub verify: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            handler_calls: HandlerCallMode::Inline,
            locals: LocalsMode::Ssa,
            optimization_level: 1,
            verify: true,
        }
    }
}

impl CompileOptions {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerLimits {
    /// Nesting bound for handler-to-handler calls made through `HCALL`.
    pub max_call_depth: usize,
}

impl Default for RunnerLimits {
    fn default() -> Self {
        RunnerLimits { max_call_depth: 64 }
    }
}

impl RunnerLimits {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = CompileOptions::default();
        assert_eq!(opts.handler_calls, HandlerCallMode::Inline);
        assert_eq!(opts.locals, LocalsMode::Ssa);
        assert!(opts.verify);
        assert_eq!(RunnerLimits::default().max_call_depth, 64);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let opts = CompileOptions::from_json_str(r#"{"handler_calls": "call"}"#).unwrap();
        assert_eq!(opts.handler_calls, HandlerCallMode::Call);
        assert_eq!(opts.optimization_level, 1);
    }

    #[test]
    fn stack_slots_mode_parses() {
        let opts = CompileOptions::from_json_str(r#"{"locals": "stack_slots", "optimization_level": 0}"#).unwrap();
        assert_eq!(opts.locals, LocalsMode::StackSlots);
        assert_eq!(opts.optimization_level, 0);
    }

    #[test]
    fn unknown_field_is_rejected() {
        assert!(CompileOptions::from_json_str(r#"{"inline": true}"#).is_err());
        assert!(RunnerLimits::from_json_str(r#"{"max_call_depth": 3}"#).is_ok());
    }
}
