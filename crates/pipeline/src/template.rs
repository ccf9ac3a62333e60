//! Template parsing: `@name` module references, `${var}` variable
//! references, and the backslash escape.
//!
//! The `regex` crate has no look-behind, so the original's `(?<!\\)@`
//! becomes an explicit preceding-byte check on each match.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use weft_domain::state::VariableBag;

fn module_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([a-z][a-z0-9_]{0,49})").expect("module regex"))
}

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable regex"))
}

fn escaped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\@([a-z][a-z0-9_]{0,49})").expect("escape regex"))
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_'
}

/// Unescaped `@name` references in first-seen order, deduplicated.
pub fn parse_module_references(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    let bytes = template.as_bytes();
    for caps in module_re().captures_iter(template) {
        let whole = caps.get(0).expect("match");
        if whole.start() > 0 && bytes[whole.start() - 1] == b'\\' {
            continue; // escaped
        }
        let name = &caps[1];
        if !seen.iter().any(|s| s == name) {
            seen.push(name.to_owned());
        }
    }
    seen
}

/// `${name}` references, deduplicated (order unspecified is fine — the
/// substitution is total).
pub fn parse_variable_references(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in variable_re().captures_iter(template) {
        let name = &caps[1];
        if !seen.iter().any(|s| s == name) {
            seen.push(name.to_owned());
        }
    }
    seen
}

pub fn has_module_references(template: &str) -> bool {
    !parse_module_references(template).is_empty()
}

/// Render a bound value for splicing into prompt text: strings appear
/// bare, scalars via their JSON text, null and missing as empty.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `${name}` with the bound value's string form; unbound
/// references become the empty string.
pub fn substitute_variables(template: &str, variables: &VariableBag) -> String {
    variable_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            variables
                .get(&caps[1])
                .map(value_to_string)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Replace-all of the token `@name`. An occurrence is a token only when it
/// is not preceded by a backslash and not followed by a further name
/// character (so `@count` never fires inside `@counter`).
pub fn replace_module_ref(template: &str, name: &str, content: &str) -> String {
    let needle = format!("@{name}");
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut cursor = 0;

    while let Some(found) = template[cursor..].find(&needle) {
        let start = cursor + found;
        let end = start + needle.len();
        let escaped = start > 0 && bytes[start - 1] == b'\\';
        let boundary = end >= template.len() || !is_name_byte(bytes[end]);

        out.push_str(&template[cursor..start]);
        if escaped || !boundary {
            out.push_str(&needle);
        } else {
            out.push_str(content);
        }
        cursor = end;
    }
    out.push_str(&template[cursor..]);
    out
}

/// Rewrite `\@name` back to `@name` on resolver exit.
pub fn unescape_module_refs(template: &str) -> String {
    escaped_re().replace_all(template, "@$1").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_refs_in_first_seen_order() {
        let refs = parse_module_references("@b then @a then @b again");
        assert_eq!(refs, vec!["b", "a"]);
    }

    #[test]
    fn escaped_refs_are_not_extracted() {
        let refs = parse_module_references(r"Hi \@user and @real");
        assert_eq!(refs, vec!["real"]);
    }

    #[test]
    fn ref_names_follow_the_contract() {
        assert!(parse_module_references("@Upper @9bad").is_empty());
        // `@m` matches, trailing junk stays outside the name.
        assert_eq!(parse_module_references("@m-x"), vec!["m"]);
        // Name is cut at 50 chars by the pattern.
        let long = format!("@a{}", "b".repeat(60));
        let refs = parse_module_references(&long);
        assert_eq!(refs[0].len(), 50);
    }

    #[test]
    fn variable_refs_are_extracted() {
        let vars = parse_variable_references("${name} and ${Count_2} but not ${2bad}");
        assert_eq!(vars, vec!["name", "Count_2"]);
    }

    #[test]
    fn substitute_binds_and_blanks() {
        let mut bag = VariableBag::new();
        bag.insert("name".into(), json!("Ada"));
        bag.insert("n".into(), json!(3));
        assert_eq!(
            substitute_variables("Hello ${name}, n=${n}, x=${x}!", &bag),
            "Hello Ada, n=3, x=!"
        );
    }

    #[test]
    fn value_rendering() {
        assert_eq!(value_to_string(&json!("s")), "s");
        assert_eq!(value_to_string(&json!(2.5)), "2.5");
        assert_eq!(value_to_string(&json!(true)), "true");
        assert_eq!(value_to_string(&json!(null)), "");
        assert_eq!(value_to_string(&json!(["a", 1])), "[\"a\",1]");
    }

    #[test]
    fn replace_is_replace_all() {
        assert_eq!(
            replace_module_ref("@m and @m", "m", "X"),
            "X and X"
        );
    }

    #[test]
    fn replace_skips_escaped_occurrence() {
        assert_eq!(
            replace_module_ref(r"\@m and @m", "m", "X"),
            r"\@m and X"
        );
    }

    #[test]
    fn replace_respects_token_boundary() {
        assert_eq!(
            replace_module_ref("@count inside @counter", "count", "N"),
            "N inside @counter"
        );
    }

    #[test]
    fn replace_at_end_of_string() {
        assert_eq!(replace_module_ref("end @m", "m", "X"), "end X");
    }

    #[test]
    fn unescape_restores_literal_at() {
        assert_eq!(
            unescape_module_refs(r"Hi \@user, welcome"),
            "Hi @user, welcome"
        );
        // Untouched without the escape.
        assert_eq!(unescape_module_refs("plain @ref"), "plain @ref");
    }

    #[test]
    fn has_refs_ignores_escapes() {
        assert!(!has_module_references(r"only \@escaped"));
        assert!(has_module_references("a @real one"));
    }
}
