//! Prompt Loader (L3).
//!
//! A read-only catalog of named prompt templates, addressed by
//! `(role, prompt_id)` the way the Consumed Capabilities table describes the
//! prompt catalog as an external store. Templates carry `{var}`-style named
//! substitution holes; an unsubstituted hole is a hard `PROMPT_RENDER_ERROR`
//! rather than being left in the rendered text, so a missing variable can
//! never silently reach the model.
//!
//! No control flow lives here — this module does string substitution only,
//! mirroring the teacher's own minimal `augment_system_prompt` string
//! building in `agent.rs` rather than reaching for a templating crate the
//! rest of the stack doesn't otherwise need.

use crate::error::CoreError;
use std::collections::HashMap;

/// Templates are keyed by `(role, prompt_id)`: the role that uses them
/// (`"cmo"`, a `SpecialtyTag::as_str()`, `"visualization"`) and a
/// `prompt_id` scoping them within that role (e.g. `"analyze"`,
/// `"assemble"`, `"synthesize"`, `"system"`, `"task"`).
///
/// Thread-safe, append-at-construction catalog of prompt templates.
///
/// Built once at process start (or per-test) and shared read-only across
/// every concurrently running specialist, the same way the teacher treats
/// its connection pool as process-wide, read-only state.
#[derive(Debug, Clone, Default)]
pub struct PromptCatalog {
    templates: HashMap<(String, String), String>,
}

impl PromptCatalog {
    pub fn new() -> Self {
        PromptCatalog {
            templates: HashMap::new(),
        }
    }

    /// Register (or replace) the template for `(role, prompt_id)`.
    pub fn with_template(
        mut self,
        role: impl Into<String>,
        prompt_id: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.templates
            .insert((role.into(), prompt_id.into()), template.into());
        self
    }

    /// Render the named template, substituting every `{var}` hole from
    /// `vars`. Fails with `PROMPT_RENDER_ERROR` if the template is unknown or
    /// any hole has no matching entry in `vars`.
    pub fn render(
        &self,
        role: &str,
        prompt_id: &str,
        vars: &HashMap<&str, String>,
    ) -> Result<String, CoreError> {
        let key = (role.to_string(), prompt_id.to_string());
        let template = self.templates.get(&key).ok_or_else(|| {
            CoreError::prompt_render_error(format!(
                "no template registered for role={} prompt_id={}",
                role, prompt_id
            ))
        })?;

        render_template(template, vars).map_err(|hole| {
            CoreError::prompt_render_error(format!(
                "unsubstituted hole {{{}}} in template role={} prompt_id={}",
                hole, role, prompt_id
            ))
        })
    }
}

/// Scan `template` for `{name}` holes and replace each from `vars`,
/// returning the first hole name with no match as `Err`.
fn render_template(template: &str, vars: &HashMap<&str, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let hole = &template[i + 1..i + end];
                match vars.get(hole) {
                    Some(value) => {
                        out.push_str(value);
                        i += end + 1;
                        continue;
                    }
                    None => return Err(hole.to_string()),
                }
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    Ok(out)
}
