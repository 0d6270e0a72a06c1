//! Catalog-driven entry point for building and adopting fleets.
//!
//! [`CloudService`] pairs a [`FleetCatalog`] with the shared
//! [`FleetContext`]. It hands out fleets by name (applying caller
//! overrides), starts units for an image and adopts units that are already
//! running from an earlier session.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ConfigError, FleetCatalog, RuntimeConfig};
use crate::context::FleetContext;
use crate::error::FleetError;
use crate::fleet::Fleet;
use crate::gateway::{DiscoveryFilter, UnitState};
use crate::ids::ProviderId;

/// Fleet factory over a catalog and shared collaborators.
#[derive(Debug)]
pub struct CloudService {
    catalog: FleetCatalog,
    ctx: Arc<FleetContext>,
}

impl CloudService {
    /// Wraps a loaded catalog and context.
    #[must_use]
    pub const fn new(catalog: FleetCatalog, ctx: Arc<FleetContext>) -> Self {
        Self { catalog, ctx }
    }

    /// Loads the catalog named by the runtime settings.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Configuration`] when the settings are invalid
    /// or the catalog cannot be read.
    pub fn from_runtime(runtime: &RuntimeConfig, ctx: Arc<FleetContext>) -> Result<Self, FleetError> {
        runtime.validate()?;
        let margin = runtime.price_policy()?.margin;
        let catalog = FleetCatalog::load(&runtime.catalog_path(), margin)?;
        info!(fleets = catalog.len(), path = %runtime.catalog_path(), "loaded fleet catalog");
        Ok(Self::new(catalog, ctx))
    }

    /// Catalog backing this service.
    #[must_use]
    pub const fn catalog(&self) -> &FleetCatalog {
        &self.catalog
    }

    /// Shared collaborators handed to every fleet.
    #[must_use]
    pub fn context(&self) -> Arc<FleetContext> {
        Arc::clone(&self.ctx)
    }

    /// Name of the fleet launched from `image_id`, if the catalog has one.
    #[must_use]
    pub fn fleet_name_for_image(&self, image_id: &str) -> Option<&str> {
        self.catalog.name_for_image(image_id)
    }

    /// Builds an empty fleet from the named catalog entry, applying the
    /// size and count overrides.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Configuration`] for an unknown fleet name.
    pub fn fleet(
        &self,
        name: &str,
        size_override: Option<&str>,
        count_override: Option<u32>,
    ) -> Result<Fleet, FleetError> {
        let spec = self
            .catalog
            .get(name)?
            .with_overrides(size_override, count_override);
        debug!(fleet = name, size = spec.size(), count = spec.desired_count(), "building fleet");
        Ok(Fleet::new(spec, Arc::clone(&self.ctx)))
    }

    /// Bids for `count` units of the fleet launched from `image_id` and
    /// waits until they are ready and reachable.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Configuration`] when no fleet uses the image,
    /// or the bidding error.
    pub async fn start_units(&self, count: u32, image_id: &str) -> Result<(Fleet, bool), FleetError> {
        let name = self.image_fleet(image_id)?;
        let mut fleet = self.fleet(&name, None, Some(count))?;
        fleet
            .request_units(usize::try_from(count).unwrap_or(usize::MAX))
            .await?;
        let ready = fleet.wait_until_all_ready(false).await && fleet.wait_until_all_reachable().await;
        if !ready {
            warn!(fleet = fleet.name(), "fleet did not come up");
        }
        Ok((fleet, ready))
    }

    /// Adopts every unit already running from `image_id` into a fresh fleet.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Configuration`] when no fleet uses the image
    /// and [`FleetError::Provider`] when discovery fails.
    pub async fn running_by_image(&self, image_id: &str) -> Result<Fleet, FleetError> {
        let name = self.image_fleet(image_id)?;
        let mut fleet = self.fleet(&name, None, None)?;
        let filter = DiscoveryFilter {
            image_id: image_id.to_owned(),
            size: None,
        };
        let discovered = self.ctx.gateway.discover_units(&filter).await?;
        for unit in discovered {
            if let Some(provider_id) = unit.provider_id {
                fleet.add_running_unit(provider_id, unit.bid_id);
            }
        }
        info!(fleet = fleet.name(), running = fleet.running_count(), "adopted running units");
        Ok(fleet)
    }

    /// Tops `fleet` up with units of its image and size that the provider
    /// reports as ready. Returns the number of units adopted.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Provider`] when discovery fails.
    pub async fn add_running_units(&self, fleet: &mut Fleet) -> Result<usize, FleetError> {
        let filter = DiscoveryFilter {
            image_id: fleet.spec().image_id().to_owned(),
            size: Some(fleet.spec().size().to_owned()),
        };
        let discovered = self.ctx.gateway.discover_units(&filter).await?;

        let mut adopted = 0_usize;
        for unit in discovered {
            if fleet.running_count() >= fleet.desired_count() {
                break;
            }
            let Some(provider_id) = unit.provider_id else {
                continue;
            };
            if !self.is_ready(&provider_id).await {
                debug!(provider_id = %provider_id, "skipping unit that is not ready");
                continue;
            }
            if fleet.add_running_unit(provider_id, unit.bid_id) {
                adopted += 1;
            }
        }
        Ok(adopted)
    }

    async fn is_ready(&self, provider_id: &ProviderId) -> bool {
        match self
            .ctx
            .gateway
            .describe_unit_states(std::slice::from_ref(provider_id))
            .await
        {
            Ok(statuses) => statuses
                .iter()
                .any(|status| &status.provider_id == provider_id && status.state == UnitState::Ready),
            Err(err) => {
                warn!(provider_id = %provider_id, error = %err, "unit state query failed");
                false
            }
        }
    }

    fn image_fleet(&self, image_id: &str) -> Result<String, FleetError> {
        self.fleet_name_for_image(image_id)
            .map(str::to_owned)
            .ok_or_else(|| ConfigError::UnknownFleet(format!("for image {image_id}")).into())
    }
}
