//! Resource - Declared resources, services and the environment they live in

use std::collections::BTreeSet;

use flow_state::{CloudProvider, EnvironmentType, Inputs};

/// Desired resource, as declared by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeclaration {
    /// Unique within an environment
    pub name: String,
    /// Product id (e.g. "gcp_storage_bucket")
    pub product: String,
    pub cloud_provider: CloudProvider,
    /// Declared parameters, before environment-derived values are merged in
    pub parameters: Inputs,
    /// Sibling resources that must exist before this one is created
    pub depends_on: Vec<String>,
    /// Inputs that can change without replacing the resource
    pub in_place_fields: BTreeSet<String>,
}

impl ResourceDeclaration {
    pub fn new(name: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            product: product.into(),
            cloud_provider: CloudProvider::Unknown,
            parameters: Inputs::new(),
            depends_on: Vec::new(),
            in_place_fields: BTreeSet::new(),
        }
    }

    pub fn with_cloud_provider(mut self, cloud_provider: CloudProvider) -> Self {
        self.cloud_provider = cloud_provider;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn depends_on(mut self, parent: impl Into<String>) -> Self {
        let parent = parent.into();
        if !self.depends_on.contains(&parent) {
            self.depends_on.push(parent);
        }
        self
    }

    pub fn with_in_place_field(mut self, field: impl Into<String>) -> Self {
        self.in_place_fields.insert(field.into());
        self
    }

    /// Local resources are containers; the container runtime owns their state
    pub fn is_container_backed(&self) -> bool {
        self.cloud_provider == CloudProvider::Local
    }
}

/// Desired service; services have no dependency edges
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDeclaration {
    pub name: String,
    pub product: String,
    pub cloud_provider: CloudProvider,
    pub parameters: Inputs,
    pub in_place_fields: BTreeSet<String>,
}

impl ServiceDeclaration {
    pub fn new(name: impl Into<String>, product: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            product: product.into(),
            cloud_provider: CloudProvider::Unknown,
            parameters: Inputs::new(),
            in_place_fields: BTreeSet::new(),
        }
    }

    pub fn with_cloud_provider(mut self, cloud_provider: CloudProvider) -> Self {
        self.cloud_provider = cloud_provider;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_in_place_field(mut self, field: impl Into<String>) -> Self {
        self.in_place_fields.insert(field.into());
        self
    }
}

/// Project / environment a call operates in, passed explicitly everywhere
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentContext {
    pub project: String,
    pub environment: String,
    pub environment_type: EnvironmentType,
    pub region: Option<String>,
    /// Extra environment-wide values merged into every resolved input set
    pub variables: Inputs,
}

impl EnvironmentContext {
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
            environment_type: EnvironmentType::Development,
            region: None,
            variables: Inputs::new(),
        }
    }

    pub fn with_environment_type(mut self, environment_type: EnvironmentType) -> Self {
        self.environment_type = environment_type;
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Cloud-side id generated for a resource: `{project}-{environment}-{name}`
    pub fn resource_id(&self, name: &str) -> String {
        format!("{}-{}-{}", self.project, self.environment, name)
            .to_lowercase()
            .replace('_', "-")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn declaration_builder() {
        let decl = ResourceDeclaration::new("bucket2", "gcp_storage_bucket")
            .with_cloud_provider(CloudProvider::Gcp)
            .with_parameter("location", json!("US"))
            .depends_on("bucket1")
            .depends_on("bucket1")
            .with_in_place_field("labels");

        assert_eq!(decl.depends_on, vec!["bucket1".to_string()]);
        assert_eq!(decl.parameters.get("location"), Some(&json!("US")));
        assert!(decl.in_place_fields.contains("labels"));
        assert!(!decl.is_container_backed());
    }

    #[test]
    fn local_resources_are_container_backed() {
        let decl =
            ResourceDeclaration::new("redis", "docker_redis").with_cloud_provider(CloudProvider::Local);
        assert!(decl.is_container_backed());
    }

    #[test]
    fn resource_id_is_normalized() {
        let ctx = EnvironmentContext::new("Acme", "dev");
        assert_eq!(ctx.resource_id("my_bucket"), "acme-dev-my-bucket");
    }
}
