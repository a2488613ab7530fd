//! Job definitions: ordered steps with dependency edges.
//!
//! A definition is a template. Triggering it validates the step graph,
//! resolves `{key}` placeholders in step config, and snapshots the result onto
//! the pipeline job so it can be rerun later without the original input.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::DefinitionError;

/// What to do with the rest of the pipeline when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort remaining steps; the pipeline fails.
    #[default]
    Stop,
    /// Record the failure and run the next step.
    Continue,
}

/// What a step does once its child failures reach the tolerance threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Fail the step now and cancel its outstanding children.
    #[default]
    StopAll,
    /// Keep waiting for the remaining children; the step completes.
    Continue,
    /// Like `Continue`, but the step's outcome is logged as a warning.
    MarkWarning,
}

/// Failure threshold for a step's children.
///
/// Without a tolerance any failed child fails the step once all children are
/// done. With one, the step completes regardless of failures unless
/// `failure_action` is [`FailureAction::StopAll`] and the threshold is hit.
/// A `max_child_failures` of 0 means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorTolerance {
    pub max_child_failures: u64,

    #[serde(default)]
    pub failure_action: FailureAction,
}

impl ErrorTolerance {
    pub fn new(max_child_failures: u64, failure_action: FailureAction) -> Self {
        Self {
            max_child_failures,
            failure_action,
        }
    }

    /// True once `failed` reaches the threshold. Never true when unlimited.
    pub fn is_reached(&self, failed: u64) -> bool {
        self.max_child_failures > 0 && failed >= self.max_child_failures
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub step_type: String,

    /// Names of steps that must finish first. Accepts a list or a
    /// comma-separated string.
    #[serde(default, deserialize_with = "deserialize_depends")]
    pub depends: Vec<String>,

    #[serde(default)]
    pub config: Map<String, Value>,

    #[serde(default)]
    pub on_error: OnError,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_tolerance: Option<ErrorTolerance>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            depends: Vec::new(),
            config: Map::new(),
            on_error: OnError::Stop,
            error_tolerance: None,
        }
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends.push(step.into());
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn tolerate_child_failures(
        mut self,
        max_child_failures: u64,
        failure_action: FailureAction,
    ) -> Self {
        self.error_tolerance = Some(ErrorTolerance::new(max_child_failures, failure_action));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub steps: Vec<StepDefinition>,

    /// Values substituted for `{key}` placeholders in step config.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            variables: BTreeMap::new(),
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn get_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Checks names and dependency edges. Does not know about step types.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        self.execution_order().map(|_| ())
    }

    /// Steps in dependency order.
    ///
    /// Kahn's algorithm, always taking the earliest-declared ready step, so
    /// independent steps keep their declaration order.
    pub fn execution_order(&self) -> Result<Vec<&StepDefinition>, DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(DefinitionError::UnnamedStep(i));
            }
            if index.insert(step.name.as_str(), i).is_some() {
                return Err(DefinitionError::DuplicateStep(step.name.clone()));
            }
        }

        let mut indegree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &step.depends {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    DefinitionError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                // Repeated edges count once.
                if seen.insert(d) {
                    indegree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.steps.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(next) = ready.pop_first() {
            order.push(&self.steps[next]);
            for &dependent in &dependents[next] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < self.steps.len() {
            let stuck = self
                .steps
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, s)| s.name.clone())
                .collect();
            return Err(DefinitionError::Cycle(stuck));
        }

        Ok(order)
    }

    /// Copy of this definition with every config string that is exactly
    /// `{key}` replaced by `variables[key]`. Unknown keys are left as written.
    pub fn resolve_placeholders(&self) -> JobDefinition {
        let mut resolved = self.clone();
        for step in &mut resolved.steps {
            for value in step.config.values_mut() {
                resolve_value(value, &self.variables, &step.name);
            }
        }
        resolved
    }
}

fn resolve_value(value: &mut Value, variables: &BTreeMap<String, String>, step: &str) {
    match value {
        Value::String(s) => {
            if let Some(key) = placeholder_key(s) {
                match variables.get(key) {
                    Some(replacement) => *s = replacement.clone(),
                    None => warn!(step, key, "unresolved config placeholder"),
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_value(item, variables, step);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                resolve_value(item, variables, step);
            }
        }
        _ => {}
    }
}

fn placeholder_key(s: &str) -> Option<&str> {
    let key = s.strip_prefix('{')?.strip_suffix('}')?;
    (!key.is_empty()).then_some(key)
}

fn deserialize_depends<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Depends {
        Csv(String),
        List(Vec<String>),
    }

    let names = match Option::<Depends>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Depends::Csv(csv)) => csv.split(',').map(str::to_string).collect(),
        Some(Depends::List(list)) => list,
    };
    Ok(names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(order: &[&StepDefinition]) -> Vec<String> {
        order.iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_roots_first_in_declaration_order() {
        let def = JobDefinition::new("news")
            .step(StepDefinition::new("summarize", "llm").depends_on("crawl"))
            .step(StepDefinition::new("crawl", "crawler"))
            .step(StepDefinition::new("places", "places_api"))
            .step(
                StepDefinition::new("merge", "merge")
                    .depends_on("summarize")
                    .depends_on("places"),
            );

        let order = def.execution_order().unwrap();
        assert_eq!(names(&order), vec!["crawl", "places", "summarize", "merge"]);
    }

    #[test]
    fn test_every_dependency_precedes_its_dependent() {
        let def = JobDefinition::new("dag")
            .step(StepDefinition::new("e", "t").depends_on("d").depends_on("b"))
            .step(StepDefinition::new("d", "t").depends_on("c"))
            .step(StepDefinition::new("c", "t").depends_on("a"))
            .step(StepDefinition::new("b", "t").depends_on("a"))
            .step(StepDefinition::new("a", "t"));

        let order = names(&def.execution_order().unwrap());
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        for step in &def.steps {
            for dep in &step.depends {
                assert!(pos(dep) < pos(&step.name), "{dep} must run before {}", step.name);
            }
        }
    }

    #[test]
    fn test_cycle_rejected() {
        let def = JobDefinition::new("loop")
            .step(StepDefinition::new("root", "t"))
            .step(StepDefinition::new("a", "t").depends_on("b"))
            .step(StepDefinition::new("b", "t").depends_on("a"));

        assert_eq!(
            def.validate(),
            Err(DefinitionError::Cycle(vec!["a".into(), "b".into()]))
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = JobDefinition::new("self").step(StepDefinition::new("a", "t").depends_on("a"));
        assert!(matches!(def.validate(), Err(DefinitionError::Cycle(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = JobDefinition::new("missing")
            .step(StepDefinition::new("a", "t").depends_on("ghost"));
        assert_eq!(
            def.validate(),
            Err(DefinitionError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            })
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(JobDefinition::new("empty").validate(), Err(DefinitionError::Empty));

        let dup = JobDefinition::new("dup")
            .step(StepDefinition::new("a", "t"))
            .step(StepDefinition::new("a", "t"));
        assert_eq!(dup.validate(), Err(DefinitionError::DuplicateStep("a".into())));

        let unnamed = JobDefinition::new("unnamed").step(StepDefinition::new(" ", "t"));
        assert_eq!(unnamed.validate(), Err(DefinitionError::UnnamedStep(0)));
    }

    #[test]
    fn test_depends_accepts_csv_and_list() {
        let def: JobDefinition = serde_json::from_value(json!({
            "name": "mixed",
            "steps": [
                {"name": "a", "type": "t"},
                {"name": "b", "type": "t", "depends": ""},
                {"name": "c", "type": "t", "depends": "a, b"},
                {"name": "d", "type": "t", "depends": ["c"], "on_error": "continue"}
            ]
        }))
        .unwrap();

        assert!(def.steps[1].depends.is_empty());
        assert_eq!(def.steps[2].depends, vec!["a", "b"]);
        assert_eq!(def.steps[3].depends, vec!["c"]);
        assert_eq!(def.steps[0].on_error, OnError::Stop);
        assert_eq!(def.steps[3].on_error, OnError::Continue);
    }

    #[test]
    fn test_placeholders_resolved_recursively() {
        let def = JobDefinition::new("places")
            .variable("places_api_key", "secret")
            .step(
                StepDefinition::new("search", "places_api")
                    .with_config("api_key", "{places_api_key}")
                    .with_config("nested", json!({"keys": ["{places_api_key}", "{unknown}"]}))
                    .with_config("literal", "{not closed"),
            );

        let resolved = def.resolve_placeholders();
        let config = &resolved.steps[0].config;
        assert_eq!(config["api_key"], json!("secret"));
        assert_eq!(config["nested"]["keys"], json!(["secret", "{unknown}"]));
        assert_eq!(config["literal"], json!("{not closed"));
        // Source definition untouched.
        assert_eq!(def.steps[0].config["api_key"], json!("{places_api_key}"));
    }

    #[test]
    fn test_error_tolerance_parses_failure_action() {
        let def: JobDefinition = serde_json::from_value(json!({
            "name": "tolerant",
            "steps": [
                {"name": "a", "type": "t", "error_tolerance": {"max_child_failures": 3}},
                {"name": "b", "type": "t", "error_tolerance": {
                    "max_child_failures": 0, "failure_action": "mark_warning"
                }},
            ]
        }))
        .unwrap();

        let a = def.steps[0].error_tolerance.unwrap();
        assert_eq!(a, ErrorTolerance::new(3, FailureAction::StopAll));
        let b = def.steps[1].error_tolerance.unwrap();
        assert_eq!(b.failure_action, FailureAction::MarkWarning);
    }

    #[test]
    fn test_error_tolerance_threshold() {
        let tolerance = ErrorTolerance::new(2, FailureAction::StopAll);
        assert!(!tolerance.is_reached(1));
        assert!(tolerance.is_reached(2));
        assert!(tolerance.is_reached(3));

        let unlimited = ErrorTolerance::new(0, FailureAction::StopAll);
        assert!(!unlimited.is_reached(1_000));
    }
}
