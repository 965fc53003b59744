//! Cumulocity inventory, identity and application representations used by
//! the bridge.
//!
//! Notes
//! - Read models are plain values; writes go through dedicated request types
//!   (`NewDevice`, `DeviceUpdate`, `NewExternalId`) so a read record is never
//!   reused as a write payload.
//! - Unknown properties are ignored on read.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::weather::WeatherSnapshot;

/// Fragment name the weather snapshot is stored under.
pub const WEATHER_FRAGMENT: &str = "c8y_OpenWeather";

/// Name and type of the device created for each tenant.
pub const DEVICE_NAME: &str = "Microservice-Part4";
pub const DEVICE_TYPE: &str = "Microservice-Part4";

/// External id the device is registered under.
pub const EXTERNAL_ID_TYPE: &str = "c8y_Serial";
pub const EXTERNAL_ID_VALUE: &str = "Microservice-Part4_externalId";

// =====================
// Scalar ID newtype wrappers
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl core::fmt::Display for TenantId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform-internal managed object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManagedObjectId(pub String);

impl core::fmt::Display for ManagedObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

// =====================
// Tenant context
// =====================

/// Service user issued to the microservice for one subscribed tenant.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceUser {
    pub tenant: TenantId,
    pub name: String,
    pub password: String,
}

impl core::fmt::Debug for ServiceUser {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceUser")
            .field("tenant", &self.tenant)
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a cycle needs to act on behalf of one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub user: ServiceUser,
}

impl TenantContext {
    pub fn new(user: ServiceUser) -> Self {
        TenantContext { user }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.user.tenant
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscriptions {
    #[serde(default)]
    pub users: Vec<ServiceUser>,
}

/// One entry of `/application/currentApplication/settings`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationSetting {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

// =====================
// Identity
// =====================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ExternalId {
    #[serde(rename = "type")]
    pub id_type: String,
    #[serde(rename = "externalId")]
    pub value: String,
}

impl ExternalId {
    pub fn new(id_type: impl Into<String>, value: impl Into<String>) -> Self {
        ExternalId {
            id_type: id_type.into(),
            value: value.into(),
        }
    }

    /// The id the bridge registers its weather device under.
    pub fn weather_device() -> Self {
        ExternalId::new(EXTERNAL_ID_TYPE, EXTERNAL_ID_VALUE)
    }
}

/// Response of the external id lookup.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIdBinding {
    pub external_id: String,
    #[serde(rename = "type")]
    pub id_type: String,
    pub managed_object: DeviceRecord,
}

/// Result of looking up an external id.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalIdLookup {
    Found(DeviceRecord),
    Absent,
}

// =====================
// Inventory
// =====================

/// Device as read from the inventory.
///
/// The identity API only embeds `id` (and `self`) of the bound object, so
/// everything but the id is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceRecord {
    pub id: ManagedObjectId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub device_type: Option<String>,
    #[serde(rename = "c8y_IsDevice", default)]
    pub is_device: Option<Value>,
    #[serde(rename = "c8y_OpenWeather", default)]
    pub weather: Option<WeatherSnapshot>,
}

impl DeviceRecord {
    /// Record known only by its id.
    pub fn reference(id: ManagedObjectId) -> Self {
        DeviceRecord {
            id,
            name: None,
            device_type: None,
            is_device: None,
            weather: None,
        }
    }
}

/// Creation payload for the tenant's weather device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewDevice {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(rename = "c8y_IsDevice")]
    pub is_device: Value,
}

impl NewDevice {
    pub fn weather_device() -> Self {
        NewDevice {
            name: DEVICE_NAME.to_string(),
            device_type: DEVICE_TYPE.to_string(),
            is_device: Value::Object(Default::default()),
        }
    }
}

/// Partial update of one device: only the fields present are replaced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUpdate {
    #[serde(skip)]
    pub id: ManagedObjectId,
    #[serde(rename = "c8y_OpenWeather")]
    pub weather: WeatherSnapshot,
}
