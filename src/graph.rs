//! The passive data model of the build: artifacts, actions, rules and tests,
//! held in arena vectors and addressed by index newtypes. Front-ends create
//! entries through a [`Context`], which enforces path normalization and the
//! one-producer-per-filename invariant; everything is immutable once the
//! build starts.

use crate::{
    command::Command,
    error::{BuildError, Result},
    utils,
};
use std::{collections::HashMap, fmt};

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                Self(index as u32)
            }

            pub(crate) fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

entity_id!(
    /// Index of an [`Artifact`] within its [`Graph`].
    ArtifactId
);
entity_id!(
    /// Index of an [`Action`] within its [`Graph`].
    ActionId
);
entity_id!(
    /// Index of a [`Rule`] within its [`Graph`].
    RuleId
);
entity_id!(
    /// Index of a [`Test`] within its [`Graph`].
    TestId
);

/// A file involved in the build: either a source file (no producing action)
/// or a derived file (exactly one producing action).
#[derive(Debug)]
pub struct Artifact {
    /// Normalized forward-slash path relative to the virtual project root.
    pub filename: String,
    /// The action that generates this file, or `None` for sources.
    pub action: Option<ActionId>,
}

/// A step in the build process. Its input set is discovered by enumerating
/// its command; its outputs are the artifacts created against it.
#[derive(Debug)]
pub struct Action {
    pub rule: RuleId,
    /// A short verb for console messages, like "compile" or "link".
    pub verb: String,
    name: Option<String>,
    pub command: Option<Command>,
}

/// What a front-end rule expanded to: the artifacts to build when the rule is
/// requested, plus the last-modified time of the build description that
/// defined it. That timestamp is treated as an input to every action of the
/// rule, so editing the build description invalidates its outputs.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub timestamp: f64,
    pub outputs: Vec<ArtifactId>,
}

/// A rule that represents a test.
#[derive(Debug)]
pub struct Test {
    pub rule: RuleId,
    /// Must end up containing exactly `true` (pass) or `false` (fail).
    pub result_artifact: ArtifactId,
    /// Captured console output of the test, for debugging failures.
    pub output_artifact: ArtifactId,
}

/// Arena holding the expanded build graph.
#[derive(Debug, Default)]
pub struct Graph {
    artifacts: Vec<Artifact>,
    actions: Vec<Action>,
    rules: Vec<Rule>,
    tests: Vec<Test>,
    by_filename: HashMap<String, ArtifactId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifact(&self, id: ArtifactId) -> &Artifact {
        &self.artifacts[id.index()]
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.index()]
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.index()]
    }

    pub fn test(&self, id: TestId) -> &Test {
        &self.tests[id.index()]
    }

    /// Display name of an action: its own name if set, else its rule's.
    pub fn action_name(&self, id: ActionId) -> &str {
        let action = self.action(id);
        action.name.as_deref().unwrap_or(&self.rule(action.rule).name)
    }

    pub fn artifact_by_filename(&self, filename: &str) -> Option<ArtifactId> {
        self.by_filename.get(filename).copied()
    }

    pub fn add_rule(&mut self, name: impl Into<String>, timestamp: f64) -> RuleId {
        let id = RuleId::new(self.rules.len());
        self.rules.push(Rule { name: name.into(), timestamp, outputs: Vec::new() });
        id
    }

    pub fn set_rule_outputs(&mut self, rule: RuleId, outputs: Vec<ArtifactId>) {
        self.rules[rule.index()].outputs = outputs;
    }

    /// Updates a rule's build-description timestamp, e.g. when a transitive
    /// import turns out to be newer than the file itself.
    pub fn set_rule_timestamp(&mut self, rule: RuleId, timestamp: f64) {
        self.rules[rule.index()].timestamp = timestamp;
    }

    pub fn add_test(
        &mut self,
        rule: RuleId,
        result_artifact: ArtifactId,
        output_artifact: ArtifactId,
    ) -> TestId {
        let id = TestId::new(self.tests.len());
        self.tests.push(Test { rule, result_artifact, output_artifact });
        id
    }

    pub fn new_action(
        &mut self,
        rule: RuleId,
        verb: impl Into<String>,
        name: Option<String>,
    ) -> ActionId {
        let id = ActionId::new(self.actions.len());
        self.actions.push(Action { rule, verb: verb.into(), name, command: None });
        id
    }

    pub fn set_command(&mut self, action: ActionId, command: Command) {
        self.actions[action.index()].command = Some(command);
    }

    /// Registers an artifact for `filename`.
    ///
    /// Source artifacts (`action` of `None`) are deduplicated: asking twice
    /// for the same filename yields the same id, and asking for a filename
    /// some action generates yields the derived artifact. Claiming a
    /// filename as the output of a second action is a definition error.
    pub fn create_artifact(
        &mut self,
        filename: String,
        action: Option<ActionId>,
    ) -> Result<ArtifactId> {
        utils::check_path(&filename)?;
        if let Some(&existing) = self.by_filename.get(&filename) {
            return match action {
                None => Ok(existing),
                Some(_) => Err(BuildError::definition(format!(
                    "\"{filename}\" is generated by more than one action"
                ))),
            };
        }
        let id = ArtifactId::new(self.artifacts.len());
        self.artifacts.push(Artifact { filename: filename.clone(), action });
        self.by_filename.insert(filename, id);
        Ok(id)
    }

    /// A factory scope for one package of the source tree.
    pub fn context(&mut self, package: &str, rule: RuleId) -> Context<'_> {
        Context { graph: self, package: package.to_string(), rule }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "artifact#{}", self.0)
    }
}

/// Factory handed to front-end rule expansion. All artifact creation goes
/// through here so paths land in the right top-level tree and invariants are
/// checked in one place.
pub struct Context<'g> {
    graph: &'g mut Graph,
    package: String,
    rule: RuleId,
}

impl Context<'_> {
    pub fn graph(&mut self) -> &mut Graph {
        &mut *self.graph
    }

    pub fn rule(&self) -> RuleId {
        self.rule
    }

    /// A file from the source tree: `src/<package>/<name>`.
    pub fn source_artifact(&mut self, name: &str) -> Result<ArtifactId> {
        let filename = utils::join_path(&["src", &self.package, name])?;
        self.graph.create_artifact(filename, None)
    }

    /// An intermediate file generated by `action`: `tmp/<package>/<name>`.
    pub fn intermediate_artifact(&mut self, name: &str, action: ActionId) -> Result<ArtifactId> {
        let filename = utils::join_path(&["tmp", &self.package, name])?;
        self.graph.create_artifact(filename, Some(action))
    }

    /// Like [`Context::intermediate_artifact`] but stored in the in-memory
    /// tree (`mem/<package>/<name>`), persisted between runs. Good for small
    /// text artifacts such as captured exit statuses or flag files.
    pub fn memory_artifact(&mut self, name: &str, action: ActionId) -> Result<ArtifactId> {
        let filename = utils::join_path(&["mem", &self.package, name])?;
        self.graph.create_artifact(filename, Some(action))
    }

    /// An installable output under one of the allowed top-level directories.
    pub fn output_artifact(
        &mut self,
        directory: &str,
        name: &str,
        action: ActionId,
    ) -> Result<ArtifactId> {
        if !utils::OUTPUT_DIRECTORIES.contains(&directory) {
            return Err(BuildError::definition(format!(
                "\"{directory}\" is not an installable output directory (expected one of {})",
                utils::OUTPUT_DIRECTORIES.join(", ")
            )));
        }
        let filename = utils::join_path(&[directory, name])?;
        self.graph.create_artifact(filename, Some(action))
    }

    /// An intermediate artifact whose name is derived from `base` with its
    /// extension replaced by `extension` (leading dot included).
    pub fn derived_artifact(
        &mut self,
        base: ArtifactId,
        extension: &str,
        action: ActionId,
    ) -> Result<ArtifactId> {
        let filename = &self.graph.artifact(base).filename;
        let local = ["src", "tmp", "mem"]
            .iter()
            .find_map(|tree| filename.strip_prefix(&format!("{tree}/{}/", self.package)))
            .map(str::to_string)
            .unwrap_or_else(|| filename.replace('/', "_"));
        self.intermediate_artifact(&utils::replace_extension(&local, extension), action)
    }

    /// The synthesized file mirroring environment variable `var`.
    pub fn environment_artifact(&mut self, var: &str) -> Result<ArtifactId> {
        let filename = utils::join_path(&["env", var])?;
        self.graph.create_artifact(filename, None)
    }

    /// The synthesized `true`/`false` file recording whether `var` is set.
    pub fn environment_set_artifact(&mut self, var: &str) -> Result<ArtifactId> {
        let filename = utils::join_path(&["env", "set", var])?;
        self.graph.create_artifact(filename, None)
    }

    /// A reference to `artifact`'s path under the sibling configuration
    /// `config`, for cross-configuration builds.
    pub fn alternate_artifact(&mut self, config: &str, artifact: ArtifactId) -> Result<ArtifactId> {
        let inner = self.graph.artifact(artifact).filename.clone();
        let filename = utils::join_path(&["alt", config, &inner])?;
        self.graph.create_artifact(filename, None)
    }

    /// A new action belonging to this context's rule. Set its command with
    /// [`Graph::set_command`] once the output artifacts exist.
    pub fn action(&mut self, verb: &str, name: Option<&str>) -> ActionId {
        self.graph.new_action(self.rule, verb, name.map(str::to_string))
    }
}
