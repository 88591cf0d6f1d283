//! Process-wide lookup of projects and task generators.

use std::collections::HashMap;

use crate::task::{ProjectFactory, TaskGenerator};

/// Maps project names to factories and task kinds to generators.
///
/// Built once at startup; duplicate registration is fatal there. Lookups
/// after that are read-only, so the registry can be shared freely.
#[derive(Default)]
pub struct Registry {
    projects: HashMap<String, ProjectFactory>,
    task_gens: HashMap<String, TaskGenerator>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a project and every task generator its jobs declare.
    pub fn register_project(&mut self, factory: ProjectFactory) -> anyhow::Result<()> {
        let mut proj = factory();
        proj.init_jobs();
        let name = proj.name().to_string();
        if self.projects.contains_key(&name) {
            anyhow::bail!("project {name:?} already registered");
        }

        for job in proj.jobs() {
            let job = job.lock().expect("job mutex poisoned");
            if let Some(generator) = job.task_generator() {
                self.register_task_gen(job.kind(), generator)?;
            }
        }

        tracing::info!(project = %name, "registered project");
        self.projects.insert(name, factory);
        Ok(())
    }

    fn register_task_gen(&mut self, kind: &str, generator: TaskGenerator) -> anyhow::Result<()> {
        if self.task_gens.contains_key(kind) {
            anyhow::bail!("task kind {kind:?} already registered");
        }
        self.task_gens.insert(kind.to_string(), generator);
        Ok(())
    }

    /// Fresh project instance for one run, or `None` for an unknown name.
    pub fn project(&self, name: &str) -> Option<Box<dyn crate::task::Project>> {
        self.projects.get(name).map(|factory| factory())
    }

    pub fn task_generator(&self, kind: &str) -> Option<TaskGenerator> {
        self.task_gens.get(kind).copied()
    }

    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects.keys().cloned().collect();
        names.sort();
        names
    }
}
