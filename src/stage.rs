//! Stage declarations and the contract stage bodies implement.
//!
//! The registry is an ordered list fixed at configuration time. Bodies are the
//! seam to external collaborators: they receive an entry and hand back a
//! section-scoped patch or a tagged failure.
use crate::catalog::Entry;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    pub enabled: bool,
    /// Stages that must be complete for an entry before this one may run.
    pub requires: Vec<String>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            requires: Vec::new(),
        }
    }

    pub fn requires(mut self, stage: impl Into<String>) -> Self {
        self.requires.push(stage.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("stage name must be non-empty")]
    EmptyName,
    #[error("stage {0:?} is declared more than once")]
    DuplicateStage(String),
    #[error("stage {stage:?} requires {requires:?}, which is not declared before it")]
    UnknownDependency { stage: String, requires: String },
    #[error("unknown stage {0:?}")]
    UnknownStage(String),
}

/// Ordered stage declarations.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    stages: Vec<StageDescriptor>,
}

impl StageRegistry {
    /// Validate declarations: unique names, dependencies declared earlier.
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, RegistryError> {
        let mut seen = BTreeSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(RegistryError::EmptyName);
            }
            for requires in &stage.requires {
                if !seen.contains(requires.as_str()) {
                    return Err(RegistryError::UnknownDependency {
                        stage: stage.name.clone(),
                        requires: requires.clone(),
                    });
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(RegistryError::DuplicateStage(stage.name.clone()));
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Resolve an operator selection into declaration order.
    ///
    /// An empty selection means every declared stage.
    pub fn select(&self, names: &[String]) -> Result<Vec<&StageDescriptor>, RegistryError> {
        if names.is_empty() {
            return Ok(self.stages.iter().collect());
        }
        for name in names {
            if self.get(name).is_none() {
                return Err(RegistryError::UnknownStage(name.clone()));
            }
        }
        Ok(self
            .stages
            .iter()
            .filter(|stage| names.iter().any(|name| name == &stage.name))
            .collect())
    }
}

/// Entry view handed to a stage body.
#[derive(Debug)]
pub struct StageContext<'a> {
    pub stage: &'a str,
    pub key: &'a str,
    pub entry: &'a Entry,
}

/// Section-scoped partial document returned by a stage body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    sections: BTreeMap<String, Value>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Patch touching a single section.
    pub fn section(name: impl Into<String>, value: Value) -> Self {
        Self::new().with(name, value)
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.sections.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> + '_ {
        self.sections.iter()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageFailure {
    /// Transient per-entry failure; the entry stays pending for this stage.
    #[error("{0}")]
    Recoverable(String),
    /// Misconfiguration or missing dependency; aborts the stage and the run.
    #[error("{0}")]
    Fatal(String),
}

impl StageFailure {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub trait StageBody {
    /// Resources this stage can add to the catalog before it runs.
    fn discover(&mut self) -> Result<Vec<String>, StageFailure> {
        Ok(Vec::new())
    }

    /// One-time check before any entry is processed.
    fn preflight(&mut self) -> Result<(), StageFailure> {
        Ok(())
    }

    fn process(&mut self, ctx: &StageContext<'_>) -> Result<Patch, StageFailure>;
}

impl<F> StageBody for F
where
    F: FnMut(&StageContext<'_>) -> Result<Patch, StageFailure>,
{
    fn process(&mut self, ctx: &StageContext<'_>) -> Result<Patch, StageFailure> {
        self(ctx)
    }
}

/// Pin a closure to the stage body signature so its argument types infer.
pub fn stage_fn<F>(body: F) -> F
where
    F: FnMut(&StageContext<'_>) -> Result<Patch, StageFailure>,
{
    body
}

/// Stage bodies keyed by stage name.
#[derive(Default)]
pub struct BodySet<'a> {
    bodies: BTreeMap<String, Box<dyn StageBody + 'a>>,
}

impl<'a> BodySet<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: impl Into<String>, body: impl StageBody + 'a) {
        self.bodies.insert(stage.into(), Box::new(body));
    }

    pub fn with(mut self, stage: impl Into<String>, body: impl StageBody + 'a) -> Self {
        self.insert(stage, body);
        self
    }

    pub fn get_mut(&mut self, stage: &str) -> Option<&mut (dyn StageBody + 'a)> {
        self.bodies.get_mut(stage).map(|body| body.as_mut())
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.bodies.contains_key(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StageRegistry {
        StageRegistry::new(vec![
            StageDescriptor::new("ingest"),
            StageDescriptor::new("checksum").requires("ingest"),
            StageDescriptor::new("enrich").requires("ingest"),
        ])
        .expect("valid registry")
    }

    #[test]
    fn select_follows_declaration_order() {
        let registry = registry();
        let selected = registry
            .select(&["enrich".to_string(), "ingest".to_string()])
            .expect("select");
        let names: Vec<_> = selected.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ingest", "enrich"]);
    }

    #[test]
    fn empty_selection_means_all_stages() {
        let registry = registry();
        assert_eq!(registry.select(&[]).expect("select").len(), 3);
    }

    #[test]
    fn unknown_stage_in_selection_is_rejected() {
        let err = registry()
            .select(&["upload".to_string()])
            .expect_err("unknown stage");
        assert_eq!(err, RegistryError::UnknownStage("upload".to_string()));
    }

    #[test]
    fn duplicate_and_forward_dependencies_are_rejected() {
        let dup = StageRegistry::new(vec![StageDescriptor::new("a"), StageDescriptor::new("a")]);
        assert_eq!(
            dup.expect_err("duplicate"),
            RegistryError::DuplicateStage("a".to_string())
        );
        let forward = StageRegistry::new(vec![
            StageDescriptor::new("a").requires("b"),
            StageDescriptor::new("b"),
        ]);
        assert!(matches!(
            forward,
            Err(RegistryError::UnknownDependency { .. })
        ));
        let self_dep = StageRegistry::new(vec![StageDescriptor::new("a").requires("a")]);
        assert!(matches!(
            self_dep,
            Err(RegistryError::UnknownDependency { .. })
        ));
    }
}
