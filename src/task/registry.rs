//! Task registry: the immutable table of task kinds the coordinator can run.
//!
//! Concrete task types plug in here: each registration names its commands
//! (exact or `prefix*`), whether each command tolerates concurrent
//! instances, and a factory that builds a fresh body per instance.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{RegistryError, TaskError};
use crate::store::to_snake_case;
use crate::task::Task;
use crate::task::kinds::{CommandKind, InstanceId, TaskKind};
use crate::task::request::RunRequest;

/// Builds a runnable body for one admitted instance.
pub type TaskFactory =
    Arc<dyn Fn(&InstanceId, &RunRequest) -> Result<Box<dyn Task>, TaskError> + Send + Sync>;

/// One command a task kind supports.
#[derive(Clone)]
pub struct CommandSpec {
    pub pattern: CommandKind,
    pub description: String,
    pub allow_concurrent: bool,
    /// Produces the zero value of the data this command persists.
    pub result_shape: Option<fn() -> serde_json::Value>,
}

impl CommandSpec {
    /// A command that runs at most one instance at a time.
    pub fn exclusive(pattern: impl Into<CommandKind>, description: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            description: description.into(),
            allow_concurrent: false,
            result_shape: None,
        }
    }

    pub fn concurrent(pattern: impl Into<CommandKind>, description: impl Into<String>) -> Self {
        Self {
            allow_concurrent: true,
            ..Self::exclusive(pattern, description)
        }
    }

    pub fn with_result_data<T: Default + Serialize>(mut self) -> Self {
        self.result_shape = Some(default_shape::<T>);
        self
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("pattern", &self.pattern)
            .field("allow_concurrent", &self.allow_concurrent)
            .field("has_result_shape", &self.result_shape.is_some())
            .finish()
    }
}

fn default_shape<T: Default + Serialize>() -> serde_json::Value {
    serde_json::to_value(T::default()).unwrap_or(serde_json::Value::Null)
}

/// A task kind with its commands and factory.
#[derive(Clone)]
pub struct TaskRegistration {
    pub kind: TaskKind,
    pub commands: Vec<CommandSpec>,
    pub factory: TaskFactory,
}

impl TaskRegistration {
    pub fn new<F>(kind: impl Into<TaskKind>, factory: F) -> Self
    where
        F: Fn(&InstanceId, &RunRequest) -> Result<Box<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            commands: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn command(mut self, spec: CommandSpec) -> Self {
        self.commands.push(spec);
        self
    }

    /// First registered command whose pattern matches `command`.
    pub fn find_command(&self, command: &CommandKind) -> Option<&CommandSpec> {
        self.commands.iter().find(|spec| spec.pattern.matches(command))
    }
}

/// Immutable table of task registrations, built once at startup.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TaskKind, TaskRegistration>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    pub fn get(&self, kind: &TaskKind) -> Option<&TaskRegistration> {
        self.tasks.get(kind)
    }

    /// Resolve a (task, command) pair to its registration and command spec.
    pub fn lookup(
        &self,
        kind: &TaskKind,
        command: &CommandKind,
    ) -> Option<(&TaskRegistration, &CommandSpec)> {
        let registration = self.tasks.get(kind)?;
        let spec = registration.find_command(command)?;
        Some((registration, spec))
    }

    pub fn kinds(&self) -> impl Iterator<Item = &TaskKind> {
        self.tasks.keys()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn result_file_keys(
    registration: &TaskRegistration,
) -> impl Iterator<Item = ((String, String), String)> + '_ {
    let kind = to_snake_case(registration.kind.as_str());
    registration
        .commands
        .iter()
        .filter(|spec| !spec.pattern.is_wildcard())
        .map(move |spec| {
            (
                (kind.clone(), to_snake_case(spec.pattern.as_str())),
                format!("{}/{}", registration.kind, spec.pattern),
            )
        })
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    tasks: HashMap<TaskKind, TaskRegistration>,
}

impl TaskRegistryBuilder {
    pub fn register(mut self, registration: TaskRegistration) -> Result<Self, RegistryError> {
        if registration.commands.is_empty() {
            return Err(RegistryError::NoCommands {
                kind: registration.kind.to_string(),
            });
        }
        if self.tasks.contains_key(&registration.kind) {
            return Err(RegistryError::DuplicateTask {
                kind: registration.kind.to_string(),
            });
        }
        self.check_result_files(&registration)?;
        self.tasks.insert(registration.kind.clone(), registration);
        Ok(self)
    }

    /// Result files are keyed by the snake-cased kind and command, so
    /// `price-watch` and `price_watch` would overwrite each other. Wildcard
    /// commands persist under the concrete command and are not checked.
    fn check_result_files(&self, registration: &TaskRegistration) -> Result<(), RegistryError> {
        let mut seen: HashMap<(String, String), String> = self
            .tasks
            .values()
            .flat_map(result_file_keys)
            .collect();
        for (key, name) in result_file_keys(registration) {
            if let Some(first) = seen.get(&key) {
                return Err(RegistryError::ResultFileCollision {
                    first: first.clone(),
                    second: name,
                });
            }
            seen.insert(key, name);
        }
        Ok(())
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry { tasks: self.tasks }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::Deserialize;

    use super::*;
    use crate::error::Error;
    use crate::task::TaskRuntime;

    struct Noop;

    #[async_trait]
    impl Task for Noop {
        async fn run(&mut self, _rt: &TaskRuntime) -> Result<(), Error> {
            Ok(())
        }
    }

    #[derive(Default, Serialize, Deserialize)]
    struct Prices {
        last: Vec<u32>,
    }

    fn noop_registration(kind: &str) -> TaskRegistration {
        TaskRegistration::new(kind, |_, _| Ok(Box::new(Noop) as Box<dyn Task>))
            .command(CommandSpec::exclusive("watch", "watch prices"))
            .command(CommandSpec::concurrent("search:*", "search").with_result_data::<Prices>())
    }

    #[test]
    fn lookup_resolves_exact_and_wildcard() {
        let registry = TaskRegistry::builder()
            .register(noop_registration("shop"))
            .unwrap()
            .build();

        let (_, spec) = registry
            .lookup(&TaskKind::from("shop"), &CommandKind::from("watch"))
            .unwrap();
        assert!(!spec.allow_concurrent);

        let (_, spec) = registry
            .lookup(&TaskKind::from("shop"), &CommandKind::from("search:books"))
            .unwrap();
        assert!(spec.allow_concurrent);
        assert_eq!((spec.result_shape.unwrap())(), serde_json::json!({ "last": [] }));

        assert!(registry
            .lookup(&TaskKind::from("shop"), &CommandKind::from("buy"))
            .is_none());
        assert!(registry
            .lookup(&TaskKind::from("bank"), &CommandKind::from("watch"))
            .is_none());
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let result = TaskRegistry::builder()
            .register(noop_registration("shop"))
            .unwrap()
            .register(noop_registration("shop"));
        assert!(matches!(result, Err(RegistryError::DuplicateTask { .. })));
    }

    #[test]
    fn commands_sharing_a_result_file_are_rejected() {
        let registration = TaskRegistration::new("shop", |_, _| Ok(Box::new(Noop) as Box<dyn Task>))
            .command(CommandSpec::exclusive("price-watch", "dashed"))
            .command(CommandSpec::exclusive("price_watch", "underscored"));
        let result = TaskRegistry::builder().register(registration);
        assert!(matches!(
            result,
            Err(RegistryError::ResultFileCollision { ref first, ref second })
                if first == "shop/price-watch" && second == "shop/price_watch"
        ));
    }

    #[test]
    fn kinds_sharing_a_result_file_are_rejected() {
        let result = TaskRegistry::builder()
            .register(noop_registration("priceWatch"))
            .unwrap()
            .register(noop_registration("price-watch"));
        assert!(matches!(result, Err(RegistryError::ResultFileCollision { .. })));
    }

    #[test]
    fn registration_without_commands_is_rejected() {
        let registration = TaskRegistration::new("empty", |_, _| Ok(Box::new(Noop) as Box<dyn Task>));
        let result = TaskRegistry::builder().register(registration);
        assert!(matches!(result, Err(RegistryError::NoCommands { .. })));
    }
}
