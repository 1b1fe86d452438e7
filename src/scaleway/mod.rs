//! Scaleway implementation of the cloud provider contract.
//!
//! Nodes are created from the configured image and commercial type, tagged
//! so that listing only ever sees servers this crate created, and removed
//! with the `terminate` action, which also deletes their volumes. Scaleway
//! issues no per-node credential; the installation spec supplies one.

mod error;
mod lifecycle;
mod types;

use std::future::Future;
use std::net::IpAddr;

use scaleway_rs::ScalewayApi;
use tracing::info;

use crate::config::ScalewayConfig;
use crate::provider::{CloudProvider, NodeFilter, NodeHandle, NodeSnapshot, ProviderFuture};
use lifecycle::InstanceSnapshot;

pub use error::ScalewayProviderError;

/// Servers requested per listing page.
const PAGE_SIZE: u32 = 100;

/// Fetches numbered pages from 1 until one comes back short.
async fn collect_pages<T, Fetch, Fut>(mut fetch: Fetch) -> Result<Vec<T>, ScalewayProviderError>
where
    Fetch: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, ScalewayProviderError>>,
{
    let mut collected = Vec::new();
    let mut page = 1;
    loop {
        let batch = fetch(page).await?;
        let short = u32::try_from(batch.len()).is_ok_and(|len| len < PAGE_SIZE);
        collected.extend(batch);
        if short {
            return Ok(collected);
        }
        page += 1;
    }
}

/// Provider that manages nodes through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
}

impl std::fmt::Debug for ScalewayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("zone", &self.config.default_zone)
            .field("project", &self.config.default_project_id)
            .field("instance_type", &self.config.default_instance_type)
            .finish_non_exhaustive()
    }
}

impl ScalewayProvider {
    /// Constructs a new provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when the provided
    /// configuration fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayProviderError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
        })
    }

    async fn managed_servers(&self) -> Result<Vec<InstanceSnapshot>, ScalewayProviderError> {
        let servers = collect_pages(|page| async move {
            self.api
                .list_instances(&self.config.default_zone)
                .page(page)
                .per_page(PAGE_SIZE)
                .run_async()
                .await
                .map_err(ScalewayProviderError::from)
        })
        .await?;
        Ok(servers
            .into_iter()
            .map(InstanceSnapshot::from)
            .filter(InstanceSnapshot::is_managed)
            .collect())
    }

    async fn fetch_server(&self, id: &str) -> Result<InstanceSnapshot, ScalewayProviderError> {
        let mut servers = self
            .api
            .list_instances(&self.config.default_zone)
            .servers(id)
            .per_page(1)
            .run_async()
            .await?;
        servers
            .pop()
            .map(InstanceSnapshot::from)
            .ok_or_else(|| ScalewayProviderError::InstanceNotFound {
                instance_id: id.to_owned(),
                zone: self.config.default_zone.clone(),
            })
    }

    async fn terminate_server(&self, id: &str) -> Result<(), ScalewayProviderError> {
        self.api
            .perform_instance_action_async(&self.config.default_zone, id, "terminate")
            .await?;
        info!(instance_id = %id, "scaleway server terminating");
        Ok(())
    }
}

impl CloudProvider for ScalewayProvider {
    type Error = ScalewayProviderError;

    fn create_node<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, NodeHandle, Self::Error> {
        Box::pin(async move {
            let image_id = self.resolve_image_id().await?;
            let snapshot = self.create_server(name, &image_id).await?;
            Self::start_or_discard_with(
                &snapshot,
                || self.power_on_if_needed(&snapshot),
                || self.discard_server(&snapshot),
            )
            .await?;
            Ok(NodeHandle {
                id: snapshot.id.as_str().to_owned(),
                name: snapshot.name,
            })
        })
    }

    fn describe_node<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, NodeSnapshot, Self::Error> {
        Box::pin(async move { Ok(self.fetch_server(id).await?.to_node_snapshot()) })
    }

    fn list_nodes<'a>(
        &'a self,
        filter: &'a NodeFilter,
    ) -> ProviderFuture<'a, Vec<NodeSnapshot>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .managed_servers()
                .await?
                .iter()
                .map(InstanceSnapshot::to_node_snapshot)
                .filter(|snapshot| filter(snapshot))
                .collect())
        })
    }

    fn terminate_node<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.terminate_server(id).await })
    }

    fn terminate_by_address(&self, address: IpAddr) -> ProviderFuture<'_, bool, Self::Error> {
        Box::pin(async move {
            let servers = self.managed_servers().await?;
            let Some(server) = servers
                .iter()
                .find(|server| server.status().is_live() && server.has_address(address))
            else {
                info!(%address, "no live scaleway server owns this address");
                return Ok(false);
            };
            self.terminate_server(server.id.as_str()).await?;
            Ok(true)
        })
    }
}
