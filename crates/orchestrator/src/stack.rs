//! Stacks and their templates
//!
//! A stack points at a template directory. Every `*.yaml` / `*.yml` file in
//! it is rendered with handlebars against the stack variables and parsed as
//! (possibly multi-document) YAML with a `units` list.
//!
//! Template data:
//!
//! ```yaml
//! name: <stack name>
//! variables: <stack variables>
//! project: <project variables>
//! ```
//!
//! The `output` helper writes a cross-unit reference:
//! `{{output "net.vpc.vpc_id"}}` renders `${output:net.vpc.vpc_id}`.

use crate::error::{Error, Result};
use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

/// Stack entry of the project manifests
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackManifest {
    #[serde(default)]
    pub kind: Option<String>,
    pub name: String,
    pub template: PathBuf,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub variables: Value,
}

#[derive(Debug, Clone)]
pub struct Stack {
    pub name: String,
    /// Backend name; the backend itself lives in the project registry
    pub backend: String,
    pub template_dir: PathBuf,
    pub variables: Value,
    /// Rendered template documents, filled by [`Stack::expand`]
    pub documents: Vec<Value>,
}

impl Stack {
    pub fn new(name: impl Into<String>, backend: impl Into<String>, template_dir: PathBuf, variables: Value) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            template_dir,
            variables,
            documents: Vec::new(),
        }
    }

    /// Stack from a manifest entry. Relative template paths are resolved
    /// against the project directory.
    pub fn from_manifest(manifest: StackManifest, working_dir: &Path, default_backend: &str) -> Result<Self> {
        if !crate::unit::is_valid_name(&manifest.name) {
            return Err(Error::config(format!(
                "invalid stack name '{}', use letters, digits, '-' and '_'",
                manifest.name
            )));
        }
        let template_dir = if manifest.template.is_absolute() {
            manifest.template
        } else {
            working_dir.join(manifest.template)
        };
        Ok(Self::new(
            manifest.name,
            manifest.backend.unwrap_or_else(|| default_backend.to_string()),
            template_dir,
            manifest.variables,
        ))
    }

    /// Render the templates and return the unit entries they declare
    pub fn expand(&mut self, project_variables: &Value) -> Result<Vec<Value>> {
        let data = json!({
            "name": self.name,
            "variables": self.variables,
            "project": project_variables,
        });

        let mut units = Vec::new();
        self.documents.clear();
        for path in template_files(&self.template_dir)? {
            let file = path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_default();
            let source = fs::read_to_string(&path).map_err(|e| Error::path(&path, e))?;
            let rendered = render(&self.name, &file, &source, &data)?;

            for doc in serde_yaml::Deserializer::from_str(&rendered) {
                let doc = Value::deserialize(doc).map_err(|e| self.template_error(&file, e.to_string()))?;
                match &doc {
                    Value::Null => continue,
                    Value::Object(map) => match map.get("units") {
                        Some(Value::Array(list)) => units.extend(list.iter().cloned()),
                        None | Some(Value::Null) => {}
                        Some(_) => return Err(self.template_error(&file, "'units' must be a list".into())),
                    },
                    _ => return Err(self.template_error(&file, "document must be a mapping".into())),
                }
                self.documents.push(doc);
            }
        }

        log::debug!("Stack '{}' expanded to {} unit(s)", self.name, units.len());
        Ok(units)
    }

    fn template_error(&self, file: &str, message: String) -> Error {
        Error::Template {
            stack: self.name.clone(),
            file: file.to_string(),
            message,
        }
    }
}

fn template_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::path(dir, e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::path(dir, e))?.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "yaml" || e == "yml");
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Render strictly first; a missing variable downgrades to a warning and a
/// lenient render.
fn render(stack: &str, file: &str, source: &str, data: &Value) -> Result<String> {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("output", Box::new(output_helper));
    hb.set_strict_mode(true);

    match hb.render_template(source, data) {
        Ok(rendered) => Ok(rendered),
        Err(strict_err) => {
            hb.set_strict_mode(false);
            let rendered = hb.render_template(source, data).map_err(|e| Error::Template {
                stack: stack.to_string(),
                file: file.to_string(),
                message: e.to_string(),
            })?;
            log::warn!("stack '{stack}': template {file}: {strict_err}");
            Ok(rendered)
        }
    }
}

fn output_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let path = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .ok_or_else(|| handlebars::RenderErrorReason::ParamNotFoundForIndex("output", 0))?;
    out.write(&format!("${{output:{path}}}"))?;
    Ok(())
}
