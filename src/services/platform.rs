//! Seams to the external collaborators: the IoT platform, its subscription
//! registry, and the weather provider.
//!
//! Tenant-scoped calls receive the cycle deadline; an implementation must not
//! let a single call run past it.

use std::time::Instant;

use crate::client::rest::ClientError;
use crate::models::c8y::{
    ApplicationSetting, DeviceRecord, DeviceUpdate, ExternalId, ExternalIdLookup, ManagedObjectId, NewDevice,
    TenantContext,
};
use crate::models::weather::{CityId, WeatherSnapshot};

/// Identity, inventory and settings operations, always on behalf of one tenant.
pub trait Platform: Send + Sync {
    /// `Absent` only when the platform positively reports the id as unknown.
    fn find_external_id(
        &self,
        tenant: &TenantContext,
        external_id: &ExternalId,
        deadline: Instant,
    ) -> Result<ExternalIdLookup, ClientError>;

    fn create_device(
        &self,
        tenant: &TenantContext,
        device: &NewDevice,
        deadline: Instant,
    ) -> Result<DeviceRecord, ClientError>;

    fn bind_external_id(
        &self,
        tenant: &TenantContext,
        external_id: &ExternalId,
        device: &ManagedObjectId,
        deadline: Instant,
    ) -> Result<(), ClientError>;

    fn update_device(&self, tenant: &TenantContext, update: &DeviceUpdate, deadline: Instant)
    -> Result<(), ClientError>;

    fn tenant_settings(&self, tenant: &TenantContext, deadline: Instant)
    -> Result<Vec<ApplicationSetting>, ClientError>;
}

/// Tenants currently subscribed to the microservice.
pub trait SubscriptionRegistry: Send + Sync {
    fn subscribed_tenants(&self) -> Result<Vec<TenantContext>, ClientError>;
}

pub trait WeatherProvider: Send + Sync {
    fn current_by_city_id(
        &self,
        api_key: &str,
        city: CityId,
        deadline: Instant,
    ) -> Result<WeatherSnapshot, ClientError>;
}
