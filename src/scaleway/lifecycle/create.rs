//! Server creation and power management for the Scaleway provider.

use std::future::Future;

use scaleway_rs::{ScalewayCreateInstanceBuilder, ScalewayError};
use tracing::{debug, info, warn};

use super::super::{ScalewayProvider, ScalewayProviderError};
use super::{InstanceSnapshot, NODE_TAG};

impl ScalewayProvider {
    fn is_instance_type_error(&self, api_err: &scaleway_rs::ScalewayApiError) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == self.config.default_instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    /// Creates a server called `name` from the configured image and type.
    pub(in crate::scaleway) async fn create_server(
        &self,
        name: &str,
        image_id: &str,
    ) -> Result<InstanceSnapshot, ScalewayProviderError> {
        let config = &self.config;
        let server = match ScalewayCreateInstanceBuilder::new(
            self.api.clone(),
            &config.default_zone,
            name,
            &config.default_instance_type,
        )
        .image(image_id)
        .project(&config.default_project_id)
        .routed_ip_enabled(true)
        .tags(vec![String::from(NODE_TAG)])
        .run_async()
        .await
        {
            Ok(server) => server,
            Err(ScalewayError::Api(api_err)) if self.is_instance_type_error(&api_err) => {
                return Err(ScalewayProviderError::InstanceTypeUnavailable {
                    instance_type: config.default_instance_type.clone(),
                    zone: config.default_zone.clone(),
                });
            }
            Err(other) => return Err(other.into()),
        };
        info!(instance_id = %server.id, %name, "scaleway server created");
        Ok(InstanceSnapshot::from(server))
    }

    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayProviderError> {
        if matches!(snapshot.state.as_str(), "running" | "starting") {
            return Ok(());
        }

        if snapshot
            .allowed_actions
            .iter()
            .any(|action| action.as_str() == "poweron")
        {
            debug!(instance_id = %snapshot.id.as_str(), "powering on");
            self.api
                .perform_instance_action_async(
                    &self.config.default_zone,
                    snapshot.id.as_str(),
                    "poweron",
                )
                .await?;
            return Ok(());
        }

        Err(ScalewayProviderError::PowerOnNotAllowed {
            instance_id: snapshot.id.as_str().to_owned(),
            state: snapshot.state.as_str().to_owned(),
        })
    }

    /// Removes a server that never came up: `terminate` when the server
    /// allows it, otherwise a plain delete.
    pub(in crate::scaleway) async fn discard_server(
        &self,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayProviderError> {
        let id = snapshot.id.as_str();
        if snapshot
            .allowed_actions
            .iter()
            .any(|action| action.as_str() == "terminate")
        {
            return self.terminate_server(id).await;
        }
        self.api
            .delete_instance_async(&self.config.default_zone, id)
            .await?;
        info!(instance_id = %id, "scaleway server deleted");
        Ok(())
    }

    /// Powers `snapshot` on and discards the server when that fails, so a
    /// failed creation never leaves a server behind. The power-on error is
    /// returned whether or not the discard succeeded.
    pub(in crate::scaleway) async fn start_or_discard_with<Start, Discard, FutS, FutD>(
        snapshot: &InstanceSnapshot,
        start: Start,
        discard: Discard,
    ) -> Result<(), ScalewayProviderError>
    where
        Start: FnOnce() -> FutS,
        Discard: FnOnce() -> FutD,
        FutS: Future<Output = Result<(), ScalewayProviderError>>,
        FutD: Future<Output = Result<(), ScalewayProviderError>>,
    {
        let Err(err) = start().await else {
            return Ok(());
        };
        warn!(
            instance_id = %snapshot.id.as_str(),
            error = %err,
            "power-on failed; discarding server"
        );
        if let Err(cleanup) = discard().await {
            warn!(
                instance_id = %snapshot.id.as_str(),
                error = %cleanup,
                "failed to discard server; it may need manual cleanup"
            );
        }
        Err(err)
    }
}
