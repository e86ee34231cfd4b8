use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::debug;

use super::client::DeploymentClient;
use super::manifest::{InferenceService, API_VERSION, GROUP, KIND, PLURAL, VERSION};
use crate::error::{ControlError, Result};

const FIELD_MANAGER: &str = "keel";

/// Talks to the cluster through the dynamic API, since the InferenceService
/// CRD has no generated types.
pub struct KubeDeploymentClient {
    api: Api<DynamicObject>,
    name: String,
}

fn inference_service_resource() -> ApiResource {
    ApiResource {
        group: GROUP.to_string(),
        version: VERSION.to_string(),
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        plural: PLURAL.to_string(),
    }
}

fn classify(name: &str, err: kube::Error) -> ControlError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ControlError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(ae) if ae.code == 409 => ControlError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 404 => ControlError::DeploymentNotFound(name.to_string()),
        other => ControlError::cluster(other.to_string()),
    }
}

impl KubeDeploymentClient {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced_with(client, namespace, &inference_service_resource()),
            name: name.into(),
        }
    }

    /// Connect with in-cluster or kubeconfig credentials.
    pub async fn connect(namespace: &str, name: impl Into<String>) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ControlError::cluster(format!("failed to create kubernetes client: {e}")))?;
        Ok(Self::new(client, namespace, name))
    }

    fn params(dry_run: bool) -> PostParams {
        PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }

    fn to_object(manifest: &InferenceService) -> Result<DynamicObject> {
        Ok(serde_json::from_value(manifest.to_value()?)?)
    }
}

#[async_trait]
impl DeploymentClient for KubeDeploymentClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<serde_json::Value>> {
        let live = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| classify(&self.name, e))?;
        live.map(serde_json::to_value).transpose().map_err(Into::into)
    }

    async fn create(&self, manifest: &InferenceService, dry_run: bool) -> Result<()> {
        debug!(name = %self.name, dry_run, "creating InferenceService");
        self.api
            .create(&Self::params(dry_run), &Self::to_object(manifest)?)
            .await
            .map_err(|e| classify(&self.name, e))?;
        Ok(())
    }

    async fn replace(&self, manifest: &InferenceService, dry_run: bool) -> Result<()> {
        debug!(name = %self.name, dry_run, "replacing InferenceService");
        self.api
            .replace(&self.name, &Self::params(dry_run), &Self::to_object(manifest)?)
            .await
            .map_err(|e| classify(&self.name, e))?;
        Ok(())
    }

    async fn delete(&self) -> Result<bool> {
        match self.api.delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(classify(&self.name, e)),
        }
    }
}
