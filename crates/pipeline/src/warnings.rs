//! Non-fatal resolution warnings. Collected per turn, logged, and
//! optionally recorded by the prompt state tracker — never abort a turn.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ModuleNotFound,
    CircularDependency,
    MaxDepthExceeded,
    ScriptExecutionFailed,
    ProcessingError,
}

impl WarningKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WarningKind::ModuleNotFound => "module_not_found",
            WarningKind::CircularDependency => "circular_dependency",
            WarningKind::MaxDepthExceeded => "max_depth_exceeded",
            WarningKind::ScriptExecutionFailed => "script_execution_failed",
            WarningKind::ProcessingError => "processing_error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionWarning {
    pub module: String,
    pub kind: WarningKind,
    pub message: String,
    pub stage: Option<u8>,
}

impl ResolutionWarning {
    pub fn new(module: impl Into<String>, kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            kind,
            message: message.into(),
            stage: None,
        }
    }

    pub fn at_stage(mut self, stage: u8) -> Self {
        self.stage = Some(stage);
        self
    }
}
