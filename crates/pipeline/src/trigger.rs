//! Trigger-pattern matching for advanced modules.
//!
//! Patterns are evaluated case-insensitively against the last user
//! message. An invalid regex never crashes the pipeline — it degrades to
//! substring (or pipe-separated OR-substring) matching.

use regex::RegexBuilder;
use serde_json::{json, Value};

/// The small string map a module's trigger pattern is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub last_user_message: String,
    pub last_ai_message: Option<String>,
}

impl TriggerContext {
    pub fn new(last_user_message: impl Into<String>) -> Self {
        Self {
            last_user_message: last_user_message.into(),
            last_ai_message: None,
        }
    }

    pub fn with_ai_message(mut self, message: impl Into<String>) -> Self {
        self.last_ai_message = Some(message.into());
        self
    }

    /// JSON form handed to scripts as `ctx.trigger()`.
    pub fn to_value(&self) -> Value {
        json!({
            "last_user_message": self.last_user_message,
            "last_ai_message": self.last_ai_message,
        })
    }
}

/// Decide whether a module should execute for this turn.
///
/// - `None`, empty, or `*` → always.
/// - Contains `|` → regex first, falling back to pipe-separated
///   substring-OR when the regex is invalid.
/// - Otherwise → regex, falling back to substring containment.
pub fn should_execute(pattern: Option<&str>, context: &TriggerContext) -> bool {
    let pattern = match pattern.map(str::trim) {
        None | Some("") | Some("*") => return true,
        Some(p) => p,
    };

    let message = &context.last_user_message;
    if message.is_empty() {
        return false;
    }
    let message_lower = message.to_lowercase();

    if pattern.contains('|') {
        return match case_insensitive(pattern) {
            Some(re) => re.is_match(message),
            None => pattern
                .split('|')
                .map(|option| option.trim().to_lowercase())
                .any(|option| !option.is_empty() && message_lower.contains(&option)),
        };
    }

    match case_insensitive(pattern) {
        Some(re) => re.is_match(message),
        None => {
            tracing::debug!(pattern, "invalid trigger regex, using substring match");
            message_lower.contains(&pattern.to_lowercase())
        }
    }
}

fn case_insensitive(pattern: &str) -> Option<regex::Regex> {
    RegexBuilder::new(pattern).case_insensitive(true).build().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(message: &str) -> TriggerContext {
        TriggerContext::new(message)
    }

    #[test]
    fn empty_and_star_always_execute() {
        assert!(should_execute(None, &ctx("anything")));
        assert!(should_execute(Some(""), &ctx("anything")));
        assert!(should_execute(Some("  "), &ctx("anything")));
        assert!(should_execute(Some("*"), &ctx("")));
    }

    #[test]
    fn no_message_never_matches_concrete_patterns() {
        assert!(!should_execute(Some("hello"), &ctx("")));
    }

    #[test]
    fn keyword_is_case_insensitive_substring() {
        assert!(should_execute(Some("Weather"), &ctx("what's the WEATHER like?")));
        assert!(!should_execute(Some("weather"), &ctx("tell me a joke")));
    }

    #[test]
    fn pipe_pattern_matches_any_option() {
        let pattern = Some("sad|angry|upset");
        assert!(should_execute(pattern, &ctx("I feel ANGRY today")));
        assert!(!should_execute(pattern, &ctx("I feel great")));
    }

    #[test]
    fn regex_or_pattern_is_tried_first() {
        // Word boundaries only work when interpreted as a regex.
        let pattern = Some(r"\bhi\b|\bhey\b");
        assert!(should_execute(pattern, &ctx("hi there")));
        assert!(!should_execute(pattern, &ctx("high there")));
    }

    #[test]
    fn plain_regex_matches() {
        assert!(should_execute(Some(r"^help"), &ctx("Help me out")));
        assert!(!should_execute(Some(r"^help"), &ctx("I need help")));
    }

    #[test]
    fn invalid_regex_falls_back_to_substring() {
        // Unbalanced bracket is an invalid regex; "[urgent" as a literal.
        assert!(should_execute(Some("[urgent"), &ctx("this is [URGENT now")));
        assert!(!should_execute(Some("[urgent"), &ctx("calm waters")));
    }

    #[test]
    fn invalid_regex_with_pipe_falls_back_to_or() {
        let pattern = Some("[bad|good");
        assert!(should_execute(pattern, &ctx("a good day")));
        assert!(!should_execute(pattern, &ctx("neutral")));
    }

    #[test]
    fn trigger_context_serializes_for_scripts() {
        let value = TriggerContext::new("hi").with_ai_message("hello!").to_value();
        assert_eq!(value["last_user_message"], "hi");
        assert_eq!(value["last_ai_message"], "hello!");
    }
}
