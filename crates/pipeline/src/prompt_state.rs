//! Optional observability: how the system prompt evolved through the
//! stages. Purely observational — never consulted by resolution.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use weft_domain::state::VariableBag;

use crate::warnings::ResolutionWarning;

#[derive(Debug, Clone, Serialize, Default)]
pub struct SystemPromptState {
    pub original_template: String,
    pub stage1_resolved: Option<String>,
    /// Also the prompt handed to the main response call.
    pub stage2_resolved: Option<String>,
    /// Output bags by module name.
    pub stage4_variables: BTreeMap<String, VariableBag>,
    pub stage5_variables: BTreeMap<String, VariableBag>,
    /// Union of successfully resolved module names, in resolution order.
    pub resolved_modules: Vec<String>,
    pub stages_executed: Vec<u8>,
    /// Per-stage wall-clock, keyed `"stage1"`…`"stage5"`.
    pub stage_timings_ms: BTreeMap<String, u64>,
    pub warnings: Vec<ResolutionWarning>,
}

impl SystemPromptState {
    pub fn new(original_template: impl Into<String>) -> Self {
        Self {
            original_template: original_template.into(),
            ..Default::default()
        }
    }

    pub fn record_stage(&mut self, stage: u8, resolved: Option<&str>, elapsed_ms: u64) {
        match (stage, resolved) {
            (1, Some(prompt)) => self.stage1_resolved = Some(prompt.to_owned()),
            (2, Some(prompt)) => self.stage2_resolved = Some(prompt.to_owned()),
            _ => {}
        }
        if !self.stages_executed.contains(&stage) {
            self.stages_executed.push(stage);
        }
        self.stage_timings_ms
            .insert(format!("stage{stage}"), elapsed_ms);
    }

    pub fn record_post_response(&mut self, stage: u8, module: &str, outputs: &VariableBag) {
        let bags = match stage {
            4 => &mut self.stage4_variables,
            _ => &mut self.stage5_variables,
        };
        bags.insert(module.to_owned(), outputs.clone());
    }

    pub fn record_resolved(&mut self, modules: &[String]) {
        for module in modules {
            if !self.resolved_modules.contains(module) {
                self.resolved_modules.push(module.clone());
            }
        }
    }

    pub fn record_warnings(&mut self, warnings: &[ResolutionWarning]) {
        self.warnings.extend_from_slice(warnings);
    }

    /// The prompt the main response was generated against.
    pub fn main_response_prompt(&self) -> &str {
        self.stage2_resolved
            .as_deref()
            .or(self.stage1_resolved.as_deref())
            .unwrap_or(&self.original_template)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
