//! Prompt assembly
//!
//! Substitutes tool variables into a prompt template and appends the
//! research section under a byte budget. Template and variable text is
//! never cut; only research text shrinks to fit.

use std::collections::HashMap;

use crate::error::Error;
use crate::research::{truncate_to_boundary, ResearchBundle};
use crate::Result;

const RESEARCH_HEADER: &str = "\n\n--- RESEARCH SOURCES ---\n";
const RESEARCH_FOOTER: &str = "\n--- END RESEARCH ---";

/// A fully specified prompt, immutable once built.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub tool: String,
    pub template: String,
    pub variables: HashMap<String, String>,
    pub research: Option<ResearchBundle>,
}

/// Builds the final completion payload from a [`PromptRequest`].
///
/// Assembly is deterministic: the same request always yields the same
/// payload byte for byte.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    max_input_bytes: usize,
}

impl ContextAssembler {
    pub fn new(max_input_bytes: usize) -> Self {
        Self { max_input_bytes }
    }

    pub fn assemble(&self, request: &PromptRequest) -> Result<String> {
        let mut payload = substitute(&request.template, &request.variables)?;

        let Some(bundle) = request.research.as_ref().filter(|b| !b.is_empty()) else {
            return Ok(payload);
        };

        let overhead = RESEARCH_HEADER.len() + RESEARCH_FOOTER.len();
        let budget = self
            .max_input_bytes
            .saturating_sub(payload.len() + overhead);
        if budget == 0 {
            return Ok(payload);
        }

        let rendered = bundle.render();
        let body = truncate_to_boundary(&rendered, budget);
        if body.is_empty() {
            return Ok(payload);
        }

        payload.push_str(RESEARCH_HEADER);
        payload.push_str(body);
        payload.push_str(RESEARCH_FOOTER);
        Ok(payload)
    }
}

/// Replace `{name}` placeholders by exact match.
///
/// A placeholder with no corresponding variable is a [`Error::Template`]
/// failure. Braces that don't form a valid placeholder name pass through
/// untouched.
pub fn substitute(template: &str, variables: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if is_placeholder_name(name) {
                    match variables.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            return Err(Error::Template(format!(
                                "no variable supplied for placeholder '{{{name}}}'"
                            )))
                        }
                    }
                } else {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    Ok(out)
}

/// Placeholder names appearing in a template, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                if is_placeholder_name(name) && !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
                rest = &after[close + 1..];
            }
            None => break,
        }
    }
    names
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
