//! Variable resolution.
//!
//! Builds the flat parameter set handed to a workflow from four sources,
//! highest precedence first:
//!
//! 1. an environment variable bound to the key (`password` -> `WINDOWS_PASSWORD`)
//! 2. overrides given to the controller at startup (`-e key=value`)
//! 3. the resource's declared spec
//! 4. the workflow's defaults
//!
//! A key missing from a tier falls through to the next one.
//!
//! **Blank secrets fall through too.** For keys listed as secret fields, an
//! empty string in any tier is treated as absent, so a blank spec value or a
//! blank override never hides a real token further down. For every other key
//! an empty string is an explicit value and wins like any other. This
//! asymmetry is deliberate; tests pin both sides of it.
//!
//! Resolution is a pure function of its inputs. The process environment is
//! read through an [`Environment`] snapshot so the same inputs always give the
//! same output.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use playop_core::{ParamSet, ParamValue};

use crate::config::{ACTION_PARAM, DEFAULT_ACTION, WorkflowDefinition};
use crate::error::{Error, Result};
use crate::secrets::SecretRef;

/// Placeholder printed instead of secret values.
pub const MASK: &str = "********";

/// Snapshot of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// An empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment.
    #[must_use]
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    /// Add a variable.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Look up a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Resolves parameters for one workflow.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    defaults: ParamSet,
    overrides: ParamSet,
    env_bindings: BTreeMap<String, String>,
    secret_fields: BTreeSet<String>,
    required: Vec<String>,
    allowed_actions: Vec<String>,
}

impl VariableResolver {
    /// A resolver with no rules: spec values pass straight through.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A resolver following a workflow definition's rules, with startup
    /// overrides layered above the spec.
    #[must_use]
    pub fn for_workflow(workflow: &WorkflowDefinition, overrides: &ParamSet) -> Self {
        Self {
            defaults: workflow.defaults.clone(),
            overrides: overrides.clone(),
            env_bindings: workflow.env_bindings.clone(),
            secret_fields: workflow.secret_fields.iter().cloned().collect(),
            required: workflow.required.clone(),
            allowed_actions: workflow.allowed_actions.clone(),
        }
    }

    /// Set the defaults tier.
    #[must_use]
    pub fn with_defaults(mut self, defaults: ParamSet) -> Self {
        self.defaults = defaults;
        self
    }

    /// Set the startup overrides tier.
    #[must_use]
    pub fn with_overrides(mut self, overrides: ParamSet) -> Self {
        self.overrides = overrides;
        self
    }

    /// Bind a key to an environment variable.
    #[must_use]
    pub fn bind_env(mut self, key: impl Into<String>, var: impl Into<String>) -> Self {
        self.env_bindings.insert(key.into(), var.into());
        self
    }

    /// Treat blank values of `key` as absent.
    #[must_use]
    pub fn secret_field(mut self, key: impl Into<String>) -> Self {
        self.secret_fields.insert(key.into());
        self
    }

    /// Require `key` to resolve.
    #[must_use]
    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.required.push(key.into());
        self
    }

    /// Whether blank values of `key` fall through.
    #[must_use]
    pub fn is_secret(&self, key: &str) -> bool {
        self.secret_fields.contains(key)
    }

    /// Resolve the parameter set for a reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a required key is unresolved, a key
    /// is not usable as a workflow argument, or `action` is not allowed.
    pub fn resolve(&self, spec: &ParamSet, env: &Environment) -> Result<ParamSet> {
        self.resolve_inner(spec, env, None)
    }

    /// Resolve with `action` pinned, as finalization does.
    ///
    /// # Errors
    ///
    /// Same as [`VariableResolver::resolve`].
    pub fn resolve_action(&self, spec: &ParamSet, env: &Environment, action: &str) -> Result<ParamSet> {
        self.resolve_inner(spec, env, Some(action))
    }

    fn resolve_inner(&self, spec: &ParamSet, env: &Environment, action: Option<&str>) -> Result<ParamSet> {
        let bound_from_env = self
            .env_bindings
            .iter()
            .filter(|(_, var)| env.get(var).is_some())
            .map(|(key, _)| key);

        let keys: BTreeSet<&String> = self
            .defaults
            .keys()
            .chain(spec.keys())
            .chain(self.overrides.keys())
            .chain(bound_from_env)
            .collect();

        let mut resolved = ParamSet::new();
        for key in keys {
            validate_key(key)?;
            if let Some(value) = self.pick(key, spec, env) {
                resolved.insert(key.clone(), value);
            }
        }

        match action {
            Some(action) => {
                resolved.insert(ACTION_PARAM, action);
            }
            None if !resolved.contains_key(ACTION_PARAM) => {
                resolved.insert(ACTION_PARAM, DEFAULT_ACTION);
            }
            None => {}
        }

        self.check_action(&resolved)?;

        let missing = self
            .required
            .iter()
            .filter(|key| !resolved.contains_key(key))
            .collect_vec();
        if !missing.is_empty() {
            return Err(Error::configuration(format!(
                "missing required parameter(s): {}",
                missing.iter().join(", ")
            )));
        }

        Ok(resolved)
    }

    /// First usable value for `key`, walking the tiers highest first.
    fn pick(&self, key: &str, spec: &ParamSet, env: &Environment) -> Option<ParamValue> {
        let from_env = self
            .env_bindings
            .get(key)
            .and_then(|var| env.get(var))
            .map(ParamValue::from);

        let secret = self.is_secret(key);
        [
            from_env,
            self.overrides.get(key).cloned(),
            spec.get(key).cloned(),
            self.defaults.get(key).cloned(),
        ]
        .into_iter()
        .flatten()
        .find(|value| !(secret && value.is_empty_string()))
    }

    fn check_action(&self, params: &ParamSet) -> Result<()> {
        if self.allowed_actions.is_empty() {
            return Ok(());
        }
        let action = params
            .get(ACTION_PARAM)
            .map(ParamValue::render)
            .unwrap_or_default();
        if self.allowed_actions.contains(&action) {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "action '{action}' is not one of: {}",
                self.allowed_actions.join(", ")
            )))
        }
    }

    /// Copy of `params` with secret fields and secret references masked.
    #[must_use]
    pub fn masked(&self, params: &ParamSet) -> ParamSet {
        params
            .iter()
            .map(|(key, value)| {
                let hide = self.is_secret(key)
                    || value.as_str().is_some_and(|s| SecretRef::parse(s).is_some());
                let shown = if hide { ParamValue::from(MASK) } else { value.clone() };
                (key.clone(), shown)
            })
            .collect()
    }
}

/// Keys end up as `-e key=value` arguments and in environment variable
/// names, so they are limited to a safe alphabet.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "parameter name '{key}' is not a valid workflow variable"
        )))
    }
}
