//! `{variable}` substitution for notification and reminder templates.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("regex is valid"))
}

/// Variables available to a template, by name.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: HashMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// Replace every `{name}` with its value. Unknown placeholders are left as
/// written so that literal braces in agent prompts survive.
pub fn expand(template: &str, vars: &TemplateVars) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            vars.get(&caps[1])
                .map(str::to_string)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_known_variables() {
        let vars = TemplateVars::new().with("from", "boss").with("to", "worker");
        assert_eq!(expand("{from} -> {to}", &vars), "boss -> worker");
    }

    #[test]
    fn test_expand_leaves_unknown_placeholders() {
        let vars = TemplateVars::new().with("from", "boss");
        assert_eq!(expand("{from} {missing}", &vars), "boss {missing}");
    }

    #[test]
    fn test_expand_ignores_non_identifier_braces() {
        let vars = TemplateVars::new().with("x", "1");
        assert_eq!(expand("{ \"json\": {x} }", &vars), "{ \"json\": 1 }");
    }

    #[test]
    fn test_expand_repeated_variable() {
        let vars = TemplateVars::new().with("node", "w");
        assert_eq!(expand("{node}/{node}", &vars), "w/w");
    }

    #[test]
    fn test_with_overwrites() {
        let vars = TemplateVars::new().with("count", "1").with("count", "2");
        assert_eq!(vars.get("count"), Some("2"));
    }
}
