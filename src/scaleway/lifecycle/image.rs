//! Image resolution helpers for the Scaleway provider.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use crate::config::ScalewayConfig;

use super::super::{ScalewayProvider, ScalewayProviderError};

impl ScalewayProvider {
    #[expect(
        clippy::excessive_nesting,
        reason = "organisation scoping requires nested builder updates before execution"
    )]
    pub(in crate::scaleway) async fn resolve_image_id(&self) -> Result<String, ScalewayProviderError> {
        let config = &self.config;
        Self::resolve_image_id_with(
            config,
            || async move {
                if config.default_project_id.is_empty() {
                    Ok(Vec::new())
                } else {
                    let mut scoped =
                        ScalewayListInstanceImagesBuilder::new(self.api.clone(), &config.default_zone)
                            .public(true)
                            .project(&config.default_project_id)
                            .name(&config.default_image)
                            .arch(&config.default_architecture);
                    if let Some(org) = &config.default_organization_id {
                        scoped = scoped.organization(org);
                    }
                    scoped.run_async().await.map_err(ScalewayProviderError::from)
                }
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), &config.default_zone)
                    .public(true)
                    .name(&config.default_image)
                    .arch(&config.default_architecture)
                    .run_async()
                    .await
                    .map_err(ScalewayProviderError::from)
            },
        )
        .await
    }

    pub(in crate::scaleway) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        config: &ScalewayConfig,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayProviderError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayProviderError>>,
    {
        let project_images = project_fetch().await?;

        let public_images = if project_images.is_empty() {
            public_fetch().await?
        } else {
            Vec::new()
        };

        Self::select_image_from_sources(project_images, public_images, config)
    }

    pub(in crate::scaleway) fn select_image_id(
        mut candidates: Vec<ScalewayImage>,
        config: &ScalewayConfig,
    ) -> Result<String, ScalewayProviderError> {
        if candidates.is_empty() {
            return Err(ScalewayProviderError::ImageNotFound {
                label: config.default_image.clone(),
                arch: config.default_architecture.clone(),
                zone: config.default_zone.clone(),
            });
        }
        candidates.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
        Ok(candidates.remove(0).id)
    }

    pub(in crate::scaleway) fn select_image_from_sources(
        project_images: Vec<ScalewayImage>,
        public_images: Vec<ScalewayImage>,
        config: &ScalewayConfig,
    ) -> Result<String, ScalewayProviderError> {
        let primary = if project_images.is_empty() {
            public_images
        } else {
            project_images
        };

        let candidates = Self::filter_images(primary, config);

        Self::select_image_id(candidates, config)
    }

    pub(in crate::scaleway) fn filter_images(
        images: Vec<ScalewayImage>,
        config: &ScalewayConfig,
    ) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == config.default_architecture)
            .filter(|image| image.state == "available")
            .collect()
    }
}
