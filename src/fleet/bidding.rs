//! Price ceilings, bids and direct launches.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::FleetError;
use crate::gateway::{BidRequest, BlockDevice, LaunchSpec};
use crate::ids::{BidId, ProviderId};
use crate::price::Price;

use super::Fleet;

impl Fleet {
    /// Returns the bid ceiling for the fleet's size and OS: the highest
    /// latest price across the region's partitions plus the policy margin.
    /// The result is cached for the fleet's lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Provider`] when the partitions cannot be listed
    /// or any partition's price lookup fails; nothing is cached then.
    /// Returns [`FleetError::PricingUnavailable`] when no partition reports a
    /// price.
    pub async fn price_ceiling(&mut self) -> Result<Price, FleetError> {
        let key = (self.spec.size().to_owned(), self.spec.os().to_owned());
        if let Some(cached) = self.price_ceilings.get(&key) {
            return Ok(*cached);
        }

        let ctx = Arc::clone(&self.ctx);
        let (size, os) = (key.0.as_str(), key.1.as_str());
        let partitions = ctx.gateway.list_partitions(&ctx.region).await?;
        let mut observed = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            let latest = ctx
                .gateway
                .latest_price(size, os, partition)
                .await
                .inspect_err(|err| warn!(partition = %partition, error = %err, "price lookup failed"))?;
            match latest {
                Some(price) => {
                    debug!(size, os, partition = %partition, price = %price, "observed price");
                    observed.push(price);
                }
                None => debug!(size, os, partition = %partition, "no price point"),
            }
        }

        let ceiling = self
            .spec
            .price_policy()
            .ceiling(&observed)
            .ok_or_else(|| FleetError::PricingUnavailable {
                size: size.to_owned(),
                os: os.to_owned(),
            })?;
        info!(fleet = self.name(), size, os, ceiling = %ceiling, "resolved price ceiling");
        self.price_ceilings.insert(key, ceiling);
        Ok(ceiling)
    }

    /// Submits one bid for up to `count` units, bounded by the remaining
    /// capacity, and tracks a unit per returned ticket. Returns the number of
    /// units added.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::PricingUnavailable`] when no price is known and
    /// [`FleetError::Provider`] when the bid cannot be submitted.
    pub async fn request_units(&mut self, count: usize) -> Result<usize, FleetError> {
        let Some(requested) = self.capped_request(count) else {
            return Ok(0);
        };
        let price_ceiling = self.price_ceiling().await?;
        let request = BidRequest {
            launch: self.launch_spec(requested),
            price_ceiling,
        };
        let tickets = self.ctx.gateway.submit_bid(&request).await?;
        info!(
            fleet = self.name(),
            run = %self.run_tag,
            requested,
            tickets = tickets.len(),
            ceiling = %price_ceiling,
            "submitted bid"
        );

        let mut added = 0_usize;
        for ticket in tickets {
            if self.remaining_capacity() == 0 {
                warn!(fleet = self.name(), bid_id = %ticket.bid_id, "dropping ticket beyond capacity");
                continue;
            }
            if self.insert_unit(ticket.provider_id, Some(ticket.bid_id)) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Launches up to `count` units directly, bypassing bidding. Returns the
    /// number of units added.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Provider`] when the launch fails.
    pub async fn request_units_on_demand(&mut self, count: usize) -> Result<usize, FleetError> {
        let Some(requested) = self.capped_request(count) else {
            return Ok(0);
        };
        let spec = self.launch_spec(requested);
        let launched = self.ctx.gateway.run_direct(&spec).await?;
        info!(
            fleet = self.name(),
            run = %self.run_tag,
            requested,
            launched = launched.len(),
            "launched units directly"
        );

        let mut added = 0_usize;
        for provider_id in launched {
            if self.insert_unit(Some(provider_id), None) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Adopts a unit that is already running. Returns `false` when the unit
    /// is already tracked or the fleet is full.
    pub fn add_running_unit(&mut self, provider_id: ProviderId, bid_id: Option<BidId>) -> bool {
        let added = self.insert_unit(Some(provider_id), bid_id);
        if added {
            debug!(fleet = self.name(), running = self.running_count(), "adopted running unit");
        }
        added
    }

    fn capped_request(&self, count: usize) -> Option<usize> {
        let remaining = self.remaining_capacity();
        if remaining == 0 {
            info!(
                fleet = self.name(),
                running = self.running_count(),
                desired = self.desired_count(),
                "fleet already at desired size"
            );
            return None;
        }
        let requested = count.min(remaining);
        (requested > 0).then_some(requested)
    }

    fn launch_spec(&self, count: usize) -> LaunchSpec {
        LaunchSpec {
            image_id: self.spec.image_id().to_owned(),
            size: self.spec.size().to_owned(),
            count: u32::try_from(count).unwrap_or(u32::MAX),
            root_device: BlockDevice::root(self.spec.disk_size_gb()),
            user_data: self.user_data.clone(),
            security_group: self.ctx.security_group.clone(),
            key_name: self.spec.key_name().unwrap_or_default().to_owned(),
        }
    }
}
