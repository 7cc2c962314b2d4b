//! Entity key namespace
//!
//! ```text
//! {project}/flow.state
//! {project}/{env}/flow.state                     {project}/{env}/flow.lock
//! {project}/{env}/resources/{r}/flow.state       {project}/{env}/resources/{r}/flow.lock
//! {project}/{env}/services/{s}/flow.state        {project}/{env}/services/{s}/flow.lock
//! ```

use std::fmt;

/// File / object name of an entity record
pub const STATE_FILE: &str = "flow.state";
/// File / object name of an entity lock record
pub const LOCK_FILE: &str = "flow.lock";

/// Kind of entity a key points to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Project,
    Environment,
    Resource,
    Service,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::Environment => write!(f, "environment"),
            Self::Resource => write!(f, "resource"),
            Self::Service => write!(f, "service"),
        }
    }
}

/// Children that can be listed below a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Environments,
    Resources,
    Services,
}

impl ChildKind {
    /// Intermediate directory between parent and child, if any
    pub fn directory(&self) -> Option<&'static str> {
        match self {
            Self::Environments => None,
            Self::Resources => Some("resources"),
            Self::Services => Some("services"),
        }
    }

    /// Collection name used by the remote API
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Environments => "environments",
            Self::Resources => "resources",
            Self::Services => "services",
        }
    }
}

/// Fully-qualified location of one entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Project {
        project: String,
    },
    Environment {
        project: String,
        environment: String,
    },
    Resource {
        project: String,
        environment: String,
        resource: String,
    },
    Service {
        project: String,
        environment: String,
        service: String,
    },
}

impl EntityKey {
    pub fn project(project: impl Into<String>) -> Self {
        Self::Project {
            project: project.into(),
        }
    }

    pub fn environment(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self::Environment {
            project: project.into(),
            environment: environment.into(),
        }
    }

    pub fn resource(
        project: impl Into<String>,
        environment: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::Resource {
            project: project.into(),
            environment: environment.into(),
            resource: resource.into(),
        }
    }

    pub fn service(
        project: impl Into<String>,
        environment: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self::Service {
            project: project.into(),
            environment: environment.into(),
            service: service.into(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Project { .. } => EntityKind::Project,
            Self::Environment { .. } => EntityKind::Environment,
            Self::Resource { .. } => EntityKind::Resource,
            Self::Service { .. } => EntityKind::Service,
        }
    }

    /// Name of the entity itself (last path component)
    pub fn name(&self) -> &str {
        match self {
            Self::Project { project } => project,
            Self::Environment { environment, .. } => environment,
            Self::Resource { resource, .. } => resource,
            Self::Service { service, .. } => service,
        }
    }

    /// Path segments from the namespace root to this entity
    pub fn segments(&self) -> Vec<&str> {
        match self {
            Self::Project { project } => vec![project],
            Self::Environment {
                project,
                environment,
            } => vec![project, environment],
            Self::Resource {
                project,
                environment,
                resource,
            } => vec![project, environment, "resources", resource],
            Self::Service {
                project,
                environment,
                service,
            } => vec![project, environment, "services", service],
        }
    }

    /// Relative path of the entity directory / prefix
    pub fn path(&self) -> String {
        self.segments().join("/")
    }

    /// Relative key of the state record
    pub fn state_key(&self) -> String {
        format!("{}/{}", self.path(), STATE_FILE)
    }

    /// Relative key of the lock record
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.path(), LOCK_FILE)
    }

    /// Key of a child entity, or `None` if this kind has no such children
    pub fn child(&self, kind: ChildKind, name: impl Into<String>) -> Option<Self> {
        match (self, kind) {
            (Self::Project { project }, ChildKind::Environments) => {
                Some(Self::environment(project.clone(), name))
            }
            (
                Self::Environment {
                    project,
                    environment,
                },
                ChildKind::Resources,
            ) => Some(Self::resource(project.clone(), environment.clone(), name)),
            (
                Self::Environment {
                    project,
                    environment,
                },
                ChildKind::Services,
            ) => Some(Self::service(project.clone(), environment.clone(), name)),
            _ => None,
        }
    }

    /// Relative prefix under which children of `kind` live (with trailing slash)
    pub fn children_prefix(&self, kind: ChildKind) -> String {
        match kind.directory() {
            Some(dir) => format!("{}/{}/", self.path(), dir),
            None => format!("{}/", self.path()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_and_lock_keys() {
        let project = EntityKey::project("acme");
        assert_eq!(project.state_key(), "acme/flow.state");

        let env = EntityKey::environment("acme", "dev");
        assert_eq!(env.state_key(), "acme/dev/flow.state");
        assert_eq!(env.lock_key(), "acme/dev/flow.lock");

        let resource = EntityKey::resource("acme", "dev", "bucket");
        assert_eq!(resource.state_key(), "acme/dev/resources/bucket/flow.state");
        assert_eq!(resource.lock_key(), "acme/dev/resources/bucket/flow.lock");

        let service = EntityKey::service("acme", "dev", "api");
        assert_eq!(service.state_key(), "acme/dev/services/api/flow.state");
    }

    #[test]
    fn test_child_keys() {
        let env = EntityKey::environment("acme", "dev");
        assert_eq!(
            env.child(ChildKind::Resources, "db"),
            Some(EntityKey::resource("acme", "dev", "db"))
        );
        assert_eq!(env.child(ChildKind::Environments, "x"), None);
        assert_eq!(env.children_prefix(ChildKind::Services), "acme/dev/services/");

        let project = EntityKey::project("acme");
        assert_eq!(project.children_prefix(ChildKind::Environments), "acme/");
    }

    #[test]
    fn test_kind_and_name() {
        let key = EntityKey::service("acme", "prod", "worker");
        assert_eq!(key.kind(), EntityKind::Service);
        assert_eq!(key.name(), "worker");
        assert_eq!(key.to_string(), "acme/prod/services/worker");
    }
}
