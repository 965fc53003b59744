//! Find-or-create of the tenant's weather device.
//!
//! Resolution for one tenant is serialized by a per-tenant lock, so two
//! overlapping cycles can never both observe "absent" and create twice. Only
//! a positive "not found" from the identity API leads to creation; any other
//! lookup failure ends the attempt.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::client::rest::ClientError;
use crate::models::c8y::{DeviceRecord, ExternalId, ExternalIdLookup, ManagedObjectId, NewDevice, TenantContext, TenantId};
use crate::services::platform::Platform;

#[derive(Debug)]
pub enum ResolveError {
    /// The identity lookup failed for a reason other than "not found".
    Lookup(ClientError),
    Create(ClientError),
    /// The device exists but the external id could not be bound to it.
    Bind {
        device: ManagedObjectId,
        source: ClientError,
    },
}

impl core::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ResolveError::Lookup(e) => write!(f, "external id lookup failed: {}", e),
            ResolveError::Create(e) => write!(f, "device creation failed: {}", e),
            ResolveError::Bind { device, source } => {
                write!(f, "binding external id to device {} failed: {}", device, source)
            }
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::Lookup(e) | ResolveError::Create(e) => Some(e),
            ResolveError::Bind { source, .. } => Some(source),
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub device: DeviceRecord,
    /// The external id was bound during this call.
    pub created: bool,
}

#[derive(Debug, Default)]
struct TenantSlot {
    /// Id known to be bound to the external id.
    device: Option<ManagedObjectId>,
    /// Device created earlier whose external id binding did not go through.
    unbound: Option<ManagedObjectId>,
}

pub struct DeviceResolver {
    platform: Arc<dyn Platform>,
    external_id: ExternalId,
    slots: Mutex<HashMap<TenantId, Arc<Mutex<TenantSlot>>>>,
}

impl DeviceResolver {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::with_external_id(platform, ExternalId::weather_device())
    }

    pub fn with_external_id(platform: Arc<dyn Platform>, external_id: ExternalId) -> Self {
        DeviceResolver {
            platform,
            external_id,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, tenant: &TenantId) -> Arc<Mutex<TenantSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(tenant.clone()).or_default())
    }

    /// Return the tenant's device, creating it and its external id on first use.
    pub fn resolve(&self, tenant: &TenantContext, deadline: Instant) -> Result<Resolved, ResolveError> {
        let slot = self.slot(tenant.tenant());
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(id) = &slot.device {
            debug!("tenant={} device={} resolved from cache", tenant.tenant(), id);
            return Ok(Resolved {
                device: DeviceRecord::reference(id.clone()),
                created: false,
            });
        }

        let lookup = self
            .platform
            .find_external_id(tenant, &self.external_id, deadline)
            .map_err(ResolveError::Lookup)?;
        let resolved = match lookup {
            ExternalIdLookup::Found(device) => {
                debug!("tenant={} device={} resolved via external id", tenant.tenant(), device.id);
                Resolved { device, created: false }
            }
            ExternalIdLookup::Absent => self.create_and_bind(tenant, &mut slot, deadline)?,
        };

        slot.unbound = None;
        slot.device = Some(resolved.device.id.clone());
        Ok(resolved)
    }

    fn create_and_bind(
        &self,
        tenant: &TenantContext,
        slot: &mut TenantSlot,
        deadline: Instant,
    ) -> Result<Resolved, ResolveError> {
        let device = match slot.unbound.take() {
            Some(id) => {
                info!("tenant={} device={} retrying external id binding", tenant.tenant(), id);
                DeviceRecord::reference(id)
            }
            None => {
                let created = self
                    .platform
                    .create_device(tenant, &NewDevice::weather_device(), deadline)
                    .map_err(ResolveError::Create)?;
                info!("tenant={} device={} created", tenant.tenant(), created.id);
                created
            }
        };

        match self
            .platform
            .bind_external_id(tenant, &self.external_id, &device.id, deadline)
        {
            Ok(()) => {
                info!(
                    "tenant={} device={} bound to {}/{}",
                    tenant.tenant(),
                    device.id,
                    self.external_id.id_type,
                    self.external_id.value
                );
                Ok(Resolved { device, created: true })
            }
            Err(e) if e.status() == Some(409) => {
                // Someone else bound the id between our lookup and bind.
                match self
                    .platform
                    .find_external_id(tenant, &self.external_id, deadline)
                    .map_err(ResolveError::Lookup)?
                {
                    ExternalIdLookup::Found(existing) => {
                        warn!(
                            "tenant={} device={} left unbound; external id already bound to {}",
                            tenant.tenant(),
                            device.id,
                            existing.id
                        );
                        Ok(Resolved {
                            device: existing,
                            created: false,
                        })
                    }
                    ExternalIdLookup::Absent => {
                        slot.unbound = Some(device.id.clone());
                        Err(ResolveError::Bind {
                            device: device.id,
                            source: e,
                        })
                    }
                }
            }
            Err(e) => {
                slot.unbound = Some(device.id.clone());
                Err(ResolveError::Bind {
                    device: device.id,
                    source: e,
                })
            }
        }
    }

    /// Drop the cached device id so the next resolution asks the platform again.
    pub fn forget(&self, tenant: &TenantContext) {
        let slot = self.slot(tenant.tenant());
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = slot.device.take() {
            info!("tenant={} device={} evicted from cache", tenant.tenant(), id);
        }
    }

    /// Drop state of tenants no longer subscribed.
    pub fn retain_tenants(&self, subscribed: &[TenantId]) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|tenant, _| subscribed.contains(tenant));
        if slots.len() < before {
            debug!("Dropped resolver state of {} unsubscribed tenant(s)", before - slots.len());
        }
    }

    #[cfg(test)]
    fn tracked_tenants(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
