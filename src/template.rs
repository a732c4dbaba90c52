//! Loading and rendering of the manifest templates shipped with the
//! operator. Templates are plain text with `%{variable}` placeholders and
//! are indexed by their file basename up to the first `.`. Files named
//! `*.yaml` are parsed after substitution; everything else (user/role
//! fragments, the startup script) renders to verbatim text.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::path::Path;

lazy_static! {
    static ref VARIABLE_REGEX: Regex = Regex::new(r"%\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

#[derive(Debug)]
pub enum TemplateError {
    Io(io::Error),
    UnknownTemplate(String),
    MissingVariables {
        template: String,
        missing: BTreeSet<String>,
    },
    Yaml {
        template: String,
        error: serde_yaml::Error,
    },
}

impl Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TemplateError::Io(e) => write!(f, "Failed to read template directory: {}", e),
            TemplateError::UnknownTemplate(name) => write!(f, "No template named '{}'", name),
            TemplateError::MissingVariables { template, missing } => {
                let names: Vec<&str> = missing.iter().map(String::as_str).collect();
                write!(
                    f,
                    "Template '{}' is missing variables: {}",
                    template,
                    names.join(", ")
                )
            }
            TemplateError::Yaml { template, error } => {
                write!(f, "Template '{}' rendered invalid YAML: {}", template, error)
            }
        }
    }
}
impl std::error::Error for TemplateError {}

impl From<io::Error> for TemplateError {
    fn from(e: io::Error) -> TemplateError {
        TemplateError::Io(e)
    }
}

#[derive(Debug, Clone)]
struct Template {
    body: String,
    variables: BTreeSet<String>,
    parse_yaml: bool,
}

impl Template {
    fn new(file_name: &str, body: String) -> Template {
        let variables = VARIABLE_REGEX
            .captures_iter(&body)
            .map(|captures| captures[1].to_owned())
            .collect();
        Template {
            body,
            variables,
            parse_yaml: file_name.ends_with(".yaml"),
        }
    }
}

/// The full set of templates, loaded once at startup.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<String, Template>,
}

impl TemplateSet {
    /// Loads every regular file in `dir`. The template name is the file
    /// basename up to the first `.`, so `statefulset.yaml` registers as
    /// `statefulset` and `_internal_users.yml` as `_internal_users`.
    pub fn load(dir: &Path) -> Result<TemplateSet, TemplateError> {
        let mut templates = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = file_name.split('.').next().unwrap_or("").to_owned();
            let body = fs::read_to_string(entry.path())?;
            templates.insert(name, Template::new(&file_name, body));
        }
        log::debug!("Loaded {} templates from {}", templates.len(), dir.display());
        Ok(TemplateSet { templates })
    }

    /// Renders the named template to text. Every variable the template
    /// references must be present in `vars`; extra entries are ignored.
    pub fn render(
        &self,
        name: &str,
        vars: &HashMap<&str, String>,
    ) -> Result<String, TemplateError> {
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_owned()))?;

        let missing: BTreeSet<String> = template
            .variables
            .iter()
            .filter(|variable| !vars.contains_key(variable.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(TemplateError::MissingVariables {
                template: name.to_owned(),
                missing,
            });
        }

        let rendered = VARIABLE_REGEX.replace_all(&template.body, |captures: &regex::Captures| {
            vars[&captures[1]].clone()
        });
        Ok(rendered.into_owned())
    }

    /// Renders the named template and parses the result. Only meaningful for
    /// `*.yaml` templates; calling it on a text fragment is a programming
    /// error and fails accordingly.
    pub fn render_yaml(
        &self,
        name: &str,
        vars: &HashMap<&str, String>,
    ) -> Result<Value, TemplateError> {
        let rendered = self.render(name, vars)?;
        serde_yaml::from_str(&rendered).map_err(|error| TemplateError::Yaml {
            template: name.to_owned(),
            error,
        })
    }

    #[cfg(test)]
    pub fn variables_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.templates.get(name).map(|t| &t.variables)
    }
}

/// Encodes a value for substitution into a YAML template. JSON is a subset
/// of YAML, so a JSON-serialized scalar, object or array drops into a YAML
/// document as a single line without breaking indentation. Multi-line file
/// contents (scripts, user/role fragments) go through here as JSON strings.
pub fn yaml_value(value: &Value) -> String {
    serde_json::to_string(value).expect("serde_json::Value serialization is infallible")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn template_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        for (name, body) in files {
            let mut file = File::create(dir.path().join(name)).unwrap();
            file.write_all(body.as_bytes()).unwrap();
        }
        dir
    }

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn indexes_templates_by_basename_before_first_dot() {
        let dir = template_dir(&[
            ("service.yaml", "name: %{name}"),
            ("_startup_script.sh", "echo %{message}"),
        ]);
        let templates = TemplateSet::load(dir.path()).unwrap();
        assert!(templates.variables_of("service").is_some());
        assert!(templates.variables_of("_startup_script").is_some());
        assert!(templates.variables_of("service.yaml").is_none());
    }

    #[test]
    fn extracts_the_variable_set_once() {
        let dir = template_dir(&[("t.yaml", "a: %{alpha}\nb: %{beta}\nc: %{alpha}")]);
        let templates = TemplateSet::load(dir.path()).unwrap();
        let variables = templates.variables_of("t").unwrap();
        assert_eq!(2, variables.len());
        assert!(variables.contains("alpha") && variables.contains("beta"));
    }

    #[test]
    fn renders_literal_substitution() {
        let dir = template_dir(&[("greeting.txt", "hello %{name}, hello again %{name}")]);
        let templates = TemplateSet::load(dir.path()).unwrap();
        let out = templates
            .render("greeting", &vars(&[("name", "world")]))
            .unwrap();
        assert_eq!("hello world, hello again world", out);
    }

    #[test]
    fn missing_variables_fail_with_template_and_names() {
        let dir = template_dir(&[("t.yaml", "a: %{alpha}\nb: %{beta}")]);
        let templates = TemplateSet::load(dir.path()).unwrap();
        let err = templates.render("t", &vars(&[("alpha", "1")])).unwrap_err();
        match err {
            TemplateError::MissingVariables { template, missing } => {
                assert_eq!("t", template);
                assert_eq!(1, missing.len());
                assert!(missing.contains("beta"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn yaml_templates_parse_after_rendering() {
        let dir = template_dir(&[("cm.yaml", "metadata:\n  name: %{name}\nreplicas: %{count}")]);
        let templates = TemplateSet::load(dir.path()).unwrap();
        let value = templates
            .render_yaml("cm", &vars(&[("name", "example"), ("count", "3")]))
            .unwrap();
        assert_eq!("example", value["metadata"]["name"].as_str().unwrap());
        assert_eq!(3, value["replicas"].as_i64().unwrap());
    }

    #[test]
    fn unknown_template_is_an_error() {
        let dir = template_dir(&[]);
        let templates = TemplateSet::load(dir.path()).unwrap();
        assert!(matches!(
            templates.render("nope", &HashMap::new()),
            Err(TemplateError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn json_encoded_values_survive_yaml_embedding() {
        let dir = template_dir(&[("t.yaml", "selector: %{selector}\nscript: %{script}")]);
        let templates = TemplateSet::load(dir.path()).unwrap();
        let selector = serde_json::json!({"disk": "ssd"});
        let script = serde_json::json!("#!/bin/bash\nset -euo pipefail\necho hi\n");
        let value = templates
            .render_yaml(
                "t",
                &vars(&[
                    ("selector", &yaml_value(&selector)),
                    ("script", &yaml_value(&script)),
                ]),
            )
            .unwrap();
        assert_eq!("ssd", value["selector"]["disk"].as_str().unwrap());
        assert!(value["script"].as_str().unwrap().contains("echo hi"));
    }
}
