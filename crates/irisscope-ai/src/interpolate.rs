//! `{{name}}` placeholder substitution for prompt templates.
//!
//! Substitution is a single left-to-right pass: inserted values are never
//! scanned again, so a value that itself contains `{{...}}` cannot trigger
//! further replacement. Unknown placeholders are kept verbatim.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    // Names are any brace-free run; `{{ }}`-free templates never match
    Regex::new(r"\{\{([^{}]+)\}\}").expect("placeholder regex is valid")
});

/// Variables available to a template
pub type TemplateVars = HashMap<String, String>;

pub fn interpolate(template: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Placeholder names in order of appearance (duplicates removed)
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = caps[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}
