//! In-memory stand-ins for the platform and the weather provider.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::client::rest::ClientError;
use crate::models::c8y::*;
use crate::models::weather::{CityId, WeatherSnapshot};
use crate::services::platform::{Platform, SubscriptionRegistry, WeatherProvider};

pub fn tenant(id: &str) -> TenantContext {
    TenantContext::new(ServiceUser {
        tenant: TenantId(id.to_string()),
        name: "service_weather".into(),
        password: format!("{id}-password"),
    })
}

pub fn snapshot(city: &str, humidity: f64) -> WeatherSnapshot {
    WeatherSnapshot {
        city: city.to_string(),
        humidity,
        pressure: 1013.0,
        speed: 3.5,
        temperature_min: 280.15,
        temperature_max: 284.15,
    }
}

pub fn settings(api_key: &str, city: &str) -> Vec<ApplicationSetting> {
    vec![
        ApplicationSetting {
            key: "api_key".into(),
            value: Some(api_key.into()),
        },
        ApplicationSetting {
            key: "city".into(),
            value: Some(city.into()),
        },
    ]
}

fn http_error(status: u16) -> ClientError {
    ClientError::Http {
        status,
        message: format!("injected {status}"),
    }
}

#[derive(Debug)]
pub struct StoredDevice {
    pub tenant: TenantId,
    pub record: DeviceRecord,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub devices: HashMap<ManagedObjectId, StoredDevice>,
    pub bindings: HashMap<(TenantId, ExternalId), ManagedObjectId>,
    pub settings: HashMap<TenantId, Vec<ApplicationSetting>>,
    pub tenants: Vec<TenantContext>,
    pub next_id: u64,
    pub lookups: usize,
    pub updates: usize,
    /// Number of upcoming lookups answered with a 503.
    pub lookup_failures: usize,
    /// Statuses returned by upcoming binds, in order.
    pub bind_failures: Vec<u16>,
    /// Bound by a concurrent writer just before our next bind.
    pub race_binding: Option<ManagedObjectId>,
    pub create_failure: Option<u16>,
    pub update_failure: Option<u16>,
    pub settings_failure: Option<u16>,
    pub registry_failure: bool,
    /// Time every tenant-scoped call takes; calls give up at the deadline.
    pub latency: Duration,
}

#[derive(Debug, Default)]
pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state lock")
    }

    pub fn add_tenant(&self, ctx: &TenantContext, api_key: &str, city: &str) {
        let mut state = self.state();
        state.tenants.push(ctx.clone());
        state.settings.insert(ctx.tenant().clone(), settings(api_key, city));
    }

    /// Simulated network time, bounded by `deadline` like a real request.
    fn respond_within(&self, deadline: Instant) -> Result<(), ClientError> {
        let latency = self.state().latency;
        if latency.is_zero() {
            return Ok(());
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if latency > left {
            thread::sleep(left);
            return Err(ClientError::Timeout);
        }
        thread::sleep(latency);
        Ok(())
    }

    pub fn weather_of(&self, device: &ManagedObjectId) -> Option<WeatherSnapshot> {
        self.state().devices.get(device).and_then(|d| d.record.weather.clone())
    }
}

impl Platform for FakePlatform {
    fn find_external_id(
        &self,
        tenant: &TenantContext,
        external_id: &ExternalId,
        deadline: Instant,
    ) -> Result<ExternalIdLookup, ClientError> {
        self.respond_within(deadline)?;
        let mut state = self.state();
        state.lookups += 1;
        if state.lookup_failures > 0 {
            state.lookup_failures -= 1;
            return Err(http_error(503));
        }
        let key = (tenant.tenant().clone(), external_id.clone());
        Ok(match state.bindings.get(&key) {
            Some(id) => ExternalIdLookup::Found(DeviceRecord::reference(id.clone())),
            None => ExternalIdLookup::Absent,
        })
    }

    fn create_device(
        &self,
        tenant: &TenantContext,
        device: &NewDevice,
        deadline: Instant,
    ) -> Result<DeviceRecord, ClientError> {
        self.respond_within(deadline)?;
        let mut state = self.state();
        if let Some(status) = state.create_failure {
            return Err(http_error(status));
        }
        state.next_id += 1;
        let record = DeviceRecord {
            id: ManagedObjectId(format!("{}", 1000 + state.next_id)),
            name: Some(device.name.clone()),
            device_type: Some(device.device_type.clone()),
            is_device: Some(device.is_device.clone()),
            weather: None,
        };
        state.devices.insert(
            record.id.clone(),
            StoredDevice {
                tenant: tenant.tenant().clone(),
                record: record.clone(),
            },
        );
        Ok(record)
    }

    fn bind_external_id(
        &self,
        tenant: &TenantContext,
        external_id: &ExternalId,
        device: &ManagedObjectId,
        deadline: Instant,
    ) -> Result<(), ClientError> {
        self.respond_within(deadline)?;
        let mut state = self.state();
        let key = (tenant.tenant().clone(), external_id.clone());
        if let Some(winner) = state.race_binding.take() {
            state.bindings.insert(key.clone(), winner);
        }
        if !state.bind_failures.is_empty() {
            let status = state.bind_failures.remove(0);
            return Err(http_error(status));
        }
        if state.bindings.contains_key(&key) {
            return Err(http_error(409));
        }
        state.bindings.insert(key, device.clone());
        Ok(())
    }

    fn update_device(
        &self,
        tenant: &TenantContext,
        update: &DeviceUpdate,
        deadline: Instant,
    ) -> Result<(), ClientError> {
        self.respond_within(deadline)?;
        let mut state = self.state();
        if let Some(status) = state.update_failure {
            return Err(http_error(status));
        }
        let stored = state
            .devices
            .get_mut(&update.id)
            .filter(|d| &d.tenant == tenant.tenant())
            .ok_or_else(|| http_error(404))?;
        stored.record.weather = Some(update.weather.clone());
        state.updates += 1;
        Ok(())
    }

    fn tenant_settings(
        &self,
        tenant: &TenantContext,
        deadline: Instant,
    ) -> Result<Vec<ApplicationSetting>, ClientError> {
        self.respond_within(deadline)?;
        let state = self.state();
        if let Some(status) = state.settings_failure {
            return Err(http_error(status));
        }
        Ok(state.settings.get(tenant.tenant()).cloned().unwrap_or_default())
    }
}

impl SubscriptionRegistry for FakePlatform {
    fn subscribed_tenants(&self) -> Result<Vec<TenantContext>, ClientError> {
        let state = self.state();
        if state.registry_failure {
            return Err(ClientError::Timeout);
        }
        Ok(state.tenants.clone())
    }
}

/// Serves fixed snapshots per API key; unknown keys get a 401.
#[derive(Debug, Default)]
pub struct FakeWeather {
    by_key: Mutex<HashMap<String, WeatherSnapshot>>,
    calls: Mutex<Vec<(String, CityId)>>,
}

impl FakeWeather {
    pub fn serve(&self, api_key: &str, snapshot: WeatherSnapshot) {
        self.by_key
            .lock()
            .expect("fake weather lock")
            .insert(api_key.to_string(), snapshot);
    }

    pub fn calls(&self) -> Vec<(String, CityId)> {
        self.calls.lock().expect("fake weather lock").clone()
    }
}

impl WeatherProvider for FakeWeather {
    fn current_by_city_id(
        &self,
        api_key: &str,
        city: CityId,
        deadline: Instant,
    ) -> Result<WeatherSnapshot, ClientError> {
        if Instant::now() >= deadline {
            return Err(ClientError::Timeout);
        }
        self.calls
            .lock()
            .expect("fake weather lock")
            .push((api_key.to_string(), city));
        self.by_key
            .lock()
            .expect("fake weather lock")
            .get(api_key)
            .cloned()
            .ok_or_else(|| http_error(401))
    }
}
