//! Persisted entity records
//!
//! Every entity (project, environment, resource, service) is stored as its own
//! JSON record under the key namespace described in [`crate::key`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque key/value inputs handed to the provisioning collaborator
pub type Inputs = BTreeMap<String, serde_json::Value>;

/// Project record (`{project}/flow.state`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle status of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Creating,
    Ready,
    Updating,
    Deleting,
    CreateFailed,
    UpdateFailed,
    DeleteFailed,
    Unknown,
}

impl EnvironmentStatus {
    /// An operation is in flight (or was interrupted)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::CreateFailed | Self::UpdateFailed | Self::DeleteFailed
        )
    }
}

/// Kind of environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    #[default]
    Development,
    Production,
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

/// GCP-specific environment settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GcpEnvironmentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_email: Option<String>,
}

/// AWS-specific environment settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AwsEnvironmentConfig {
    pub account_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_role_arn: Option<String>,
}

/// Environment record (`{project}/{env}/flow.state`)
///
/// The name is the key segment, so it is not repeated inside the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: EnvironmentStatus,
    #[serde(default)]
    pub environment_type: EnvironmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp_config: Option<GcpEnvironmentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_config: Option<AwsEnvironmentConfig>,
}

impl EnvironmentState {
    pub fn new(environment_type: EnvironmentType, status: EnvironmentStatus) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            status,
            environment_type,
            gcp_config: None,
            aws_config: None,
        }
    }

    pub fn with_gcp_config(mut self, config: GcpEnvironmentConfig) -> Self {
        self.gcp_config = Some(config);
        self
    }

    pub fn with_aws_config(mut self, config: AwsEnvironmentConfig) -> Self {
        self.aws_config = Some(config);
        self
    }

    /// Move to a new status and bump `updated_at`
    pub fn transition(&mut self, status: EnvironmentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Cloud that backs a resource or service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudProvider {
    Gcp,
    Aws,
    Local,
    #[default]
    Unknown,
}

/// Lifecycle status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Ready,
    Creating,
    Updating,
    Replacing,
    Destroying,
    CreateFailed,
    UpdateFailed,
    DeleteFailed,
    Unknown,
}

impl ResourceStatus {
    /// An operation is in flight (or was interrupted)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Updating | Self::Replacing | Self::Destroying
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::CreateFailed | Self::UpdateFailed | Self::DeleteFailed
        )
    }
}

/// Identifiers and attributes reported back by the provisioning collaborator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Outputs {
    /// Cloud-side identifier (e.g. an ARN or a GCP resource id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Outputs {
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Resource record (`{project}/{env}/resources/{name}/flow.state`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub name: String,
    /// Product id (e.g. "gcp_storage_bucket")
    pub product: String,
    pub cloud_provider: CloudProvider,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: ResourceStatus,
    /// Inputs of the last successful apply; absent if never applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,
    /// Inputs of the in-flight or last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_inputs: Option<Inputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    /// Sibling resources this one was created after
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceState {
    pub fn new(
        name: impl Into<String>,
        product: impl Into<String>,
        cloud_provider: CloudProvider,
        status: ResourceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            product: product.into(),
            cloud_provider,
            created_at: now,
            updated_at: now,
            status,
            inputs: None,
            attempted_inputs: None,
            outputs: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Inputs) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_outputs(mut self, outputs: Outputs) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Move to a new status and bump `updated_at`
    pub fn transition(&mut self, status: ResourceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Lifecycle status of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Ready,
    Creating,
    Updating,
    Deploying,
    Destroying,
    CreateFailed,
    UpdateFailed,
    DeployFailed,
    DeleteFailed,
    Unknown,
}

impl ServiceStatus {
    /// An operation is in flight (or was interrupted)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Updating | Self::Deploying | Self::Destroying
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::CreateFailed | Self::UpdateFailed | Self::DeployFailed | Self::DeleteFailed
        )
    }
}

/// Service record (`{project}/{env}/services/{name}/flow.state`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub name: String,
    pub product: String,
    pub cloud_provider: CloudProvider,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted_inputs: Option<Inputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
}

impl ServiceState {
    pub fn new(
        name: impl Into<String>,
        product: impl Into<String>,
        cloud_provider: CloudProvider,
        status: ServiceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            product: product.into(),
            cloud_provider,
            created_at: now,
            updated_at: now,
            status,
            inputs: None,
            attempted_inputs: None,
            outputs: None,
        }
    }

    pub fn with_inputs(mut self, inputs: Inputs) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Move to a new status and bump `updated_at`
    pub fn transition(&mut self, status: ServiceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ResourceStatus::CreateFailed).unwrap();
        assert_eq!(json, "\"create_failed\"");

        let status: EnvironmentStatus = serde_json::from_str("\"delete_failed\"").unwrap();
        assert_eq!(status, EnvironmentStatus::DeleteFailed);
    }

    #[test]
    fn test_active_and_failed_statuses() {
        assert!(ResourceStatus::Destroying.is_active());
        assert!(!ResourceStatus::Ready.is_active());
        assert!(ResourceStatus::UpdateFailed.is_failed());
        assert!(ServiceStatus::Deploying.is_active());
        assert!(ServiceStatus::DeployFailed.is_failed());
        assert!(EnvironmentStatus::Deleting.is_active());
    }

    #[test]
    fn test_resource_state_omits_absent_inputs() {
        let state = ResourceState::new(
            "bucket",
            "gcp_storage_bucket",
            CloudProvider::Gcp,
            ResourceStatus::CreateFailed,
        );
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("inputs").is_none());
        assert_eq!(value["depends_on"], json!([]));
    }

    #[test]
    fn test_resource_state_defaults_on_missing_fields() {
        let raw = json!({
            "name": "db",
            "product": "aws_rds_postgres",
            "cloud_provider": "aws",
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
            "status": "ready"
        });
        let state: ResourceState = serde_json::from_value(raw).unwrap();
        assert!(state.inputs.is_none());
        assert!(state.depends_on.is_empty());
        assert_eq!(state.cloud_provider, CloudProvider::Aws);
    }

    #[test]
    fn test_transition_bumps_updated_at() {
        let mut state = ServiceState::new(
            "api",
            "gcp_cloud_run",
            CloudProvider::Gcp,
            ServiceStatus::Creating,
        );
        let before = state.updated_at;
        state.transition(ServiceStatus::Ready);
        assert_eq!(state.status, ServiceStatus::Ready);
        assert!(state.updated_at >= before);
    }
}
