//! Rendering of `{placeholder}` command templates into spawn specs.

use std::collections::BTreeMap;
use std::path::Path;

use wave_core::CommandTemplate;

use crate::types::SpawnSpec;

/// Shell-quote a value using POSIX single-quote escaping.
pub fn shell_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Named values substituted into templates. Unknown placeholders are left
/// as written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let key = &after[..close];
                    match self.values.get(key) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Renders `template` into a spawn spec rooted at `workdir`. `extra_env`
/// is applied after the template's own env and wins on conflicts.
pub fn render_spawn_spec(
    template: &CommandTemplate,
    workdir: &Path,
    vars: &TemplateVars,
    extra_env: &[(&str, String)],
) -> SpawnSpec {
    let mut env = BTreeMap::new();
    for (key, value) in &template.env {
        env.insert(key.clone(), vars.render(value));
    }
    for (key, value) in extra_env {
        env.insert((*key).to_string(), value.clone());
    }
    SpawnSpec {
        workdir: workdir.to_path_buf(),
        program: vars.render(&template.program),
        args: template.args.iter().map(|arg| vars.render(arg)).collect(),
        env,
    }
}
