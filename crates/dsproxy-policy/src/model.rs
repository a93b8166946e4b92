//! Authorization model definition
//!
//! The model file uses the sectioned `key = value` format:
//!
//! ```text
//! [request_definition]
//! r = sub, dom, obj, act
//! [policy_definition]
//! p = sub, dom, obj, act
//! [role_definition]
//! g = _, _
//! [policy_effect]
//! e = some(where (p.eft == allow))
//! [matchers]
//! m = ...
//! ```
//!
//! Only the shape is validated. Matching itself is fixed: subject equality or
//! role membership, exact or `*` domain, glob object, exact action.

use std::path::Path;

use tracing::debug;

use crate::error::{PolicyError, Result};

/// Model used when no model file is present
pub const DEFAULT_MODEL: &str = r#"[request_definition]
r = sub, dom, obj, act

[policy_definition]
p = sub, dom, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = (g(r.sub, p.sub) || r.sub == p.sub) && (r.dom == p.dom || p.dom == "*") && (globMatch(r.obj, p.obj) || p.obj == "*") && r.act == p.act
"#;

const ALLOW_EFFECT: &str = "some(where (p.eft == allow))";

/// Parsed model definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    /// Request field names
    pub request: Vec<String>,
    /// Policy field names
    pub policy: Vec<String>,
    /// Whether `g` role links are declared
    pub has_roles: bool,
    /// Effect expression
    pub effect: String,
    /// Matcher expression, kept for logging
    pub matcher: String,
}

impl Model {
    /// Parse and validate model text
    pub fn parse(text: &str) -> Result<Self> {
        let mut section = String::new();
        let mut request = None;
        let mut policy = None;
        let mut role = None;
        let mut effect = None;
        let mut matcher = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                PolicyError::ModelParse(format!("expected `key = value`, got `{}`", line))
            })?;
            let (key, value) = (key.trim(), value.trim().to_string());

            let slot = match (section.as_str(), key) {
                ("request_definition", "r") => &mut request,
                ("policy_definition", "p") => &mut policy,
                ("role_definition", "g") => &mut role,
                ("policy_effect", "e") => &mut effect,
                ("matchers", "m") => &mut matcher,
                ("", _) => {
                    return Err(PolicyError::ModelParse(format!(
                        "`{}` appears before any section",
                        key
                    )))
                }
                (section, key) => {
                    return Err(PolicyError::ModelParse(format!(
                        "unsupported key `{}` in [{}]",
                        key, section
                    )))
                }
            };
            *slot = Some(value);
        }

        let request = fields(request.as_deref(), "request_definition")?;
        let policy = fields(policy.as_deref(), "policy_definition")?;
        for (name, declared) in [("request_definition", &request), ("policy_definition", &policy)] {
            if declared.len() != 4 {
                return Err(PolicyError::ModelParse(format!(
                    "[{}] must declare 4 fields (sub, dom, obj, act), found {}",
                    name,
                    declared.len()
                )));
            }
        }

        let has_roles = match role.as_deref() {
            None => false,
            Some(def) => {
                let arity = def.split(',').filter(|f| f.trim() == "_").count();
                if arity != 2 || def.split(',').count() != 2 {
                    return Err(PolicyError::ModelParse(format!(
                        "[role_definition] must be `g = _, _`, got `g = {}`",
                        def
                    )));
                }
                true
            }
        };

        let effect =
            effect.ok_or_else(|| PolicyError::ModelParse("missing [policy_effect]".into()))?;
        if normalize(&effect) != normalize(ALLOW_EFFECT) {
            return Err(PolicyError::ModelParse(format!(
                "unsupported policy effect `{}`; only `{}` is supported",
                effect, ALLOW_EFFECT
            )));
        }

        let matcher = matcher
            .filter(|m| !m.is_empty())
            .ok_or_else(|| PolicyError::ModelParse("missing [matchers]".into()))?;

        Ok(Self {
            request,
            policy,
            has_roles,
            effect,
            matcher,
        })
    }

    /// Load a model from disk, using [`DEFAULT_MODEL`] if the file does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Model file not found, using built-in model");
                Ok(Self::default())
            }
            Err(e) => Err(PolicyError::io(path, e)),
        }
    }
}

impl Default for Model {
    fn default() -> Self {
        Self {
            request: vec!["sub".into(), "dom".into(), "obj".into(), "act".into()],
            policy: vec!["sub".into(), "dom".into(), "obj".into(), "act".into()],
            has_roles: true,
            effect: ALLOW_EFFECT.to_string(),
            matcher: DEFAULT_MODEL
                .lines()
                .find_map(|l| l.strip_prefix("m = "))
                .unwrap_or_default()
                .to_string(),
        }
    }
}

fn fields(def: Option<&str>, section: &str) -> Result<Vec<String>> {
    let def = def.ok_or_else(|| PolicyError::ModelParse(format!("missing [{}]", section)))?;
    Ok(def
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect())
}

fn normalize(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}
