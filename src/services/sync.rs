//! One synchronization cycle for one tenant: resolve the device, read the
//! tenant's weather settings, fetch the current weather, and overwrite the
//! device's weather fragment.

use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;
use std::time::Instant;

use crate::client::rest::ClientError;
use crate::models::c8y::{ApplicationSetting, DeviceUpdate, ManagedObjectId, TenantContext, TenantId};
use crate::models::weather::{CityId, WeatherSnapshot};
use crate::services::platform::{Platform, WeatherProvider};
use crate::services::resolver::{DeviceResolver, ResolveError};

pub const SETTING_API_KEY: &str = "api_key";
/// Key under which the platform exposes an encrypted `api_key` option.
pub const SETTING_API_KEY_CREDENTIAL: &str = "credentials.api_key";
pub const SETTING_CITY: &str = "city";

/// Tenant settings the bridge cannot run without.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    MissingSetting(&'static str),
    MalformedCity(String),
}

impl core::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigurationError::MissingSetting(key) => write!(f, "tenant setting `{}` is not set", key),
            ConfigurationError::MalformedCity(raw) => {
                write!(f, "tenant setting `city` is not a numeric city id: {:?}", raw)
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

#[derive(Debug)]
pub enum SyncError {
    Configuration(ConfigurationError),
    /// Reading the tenant settings failed.
    Settings(ClientError),
    PlatformLookup(ResolveError),
    Provider(ClientError),
    PlatformWrite(ClientError),
    /// The cycle ran out of time before `stage`.
    DeadlineExceeded { stage: &'static str },
}

impl SyncError {
    /// Short label used in logs and failure counters.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Configuration(_) => "configuration",
            SyncError::Settings(_) => "settings",
            SyncError::PlatformLookup(_) => "platform_lookup",
            SyncError::Provider(_) => "provider",
            SyncError::PlatformWrite(_) => "platform_write",
            SyncError::DeadlineExceeded { .. } => "deadline",
        }
    }
}

impl core::fmt::Display for SyncError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SyncError::Configuration(e) => write!(f, "configuration error: {}", e),
            SyncError::Settings(e) => write!(f, "reading tenant settings failed: {}", e),
            SyncError::PlatformLookup(e) => write!(f, "device resolution failed: {}", e),
            SyncError::Provider(e) => write!(f, "weather provider error: {}", e),
            SyncError::PlatformWrite(e) => write!(f, "device update failed: {}", e),
            SyncError::DeadlineExceeded { stage } => write!(f, "cycle deadline exceeded before {}", stage),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Configuration(e) => Some(e),
            SyncError::Settings(e) | SyncError::Provider(e) | SyncError::PlatformWrite(e) => Some(e),
            SyncError::PlatformLookup(e) => Some(e),
            SyncError::DeadlineExceeded { .. } => None,
        }
    }
}

impl From<ConfigurationError> for SyncError {
    fn from(value: ConfigurationError) -> Self {
        SyncError::Configuration(value)
    }
}

impl From<ResolveError> for SyncError {
    fn from(value: ResolveError) -> Self {
        SyncError::PlatformLookup(value)
    }
}

/// API key and city the tenant configured for the weather provider.
#[derive(Clone, PartialEq, Eq)]
pub struct WeatherSettings {
    pub api_key: String,
    pub city: CityId,
}

impl core::fmt::Debug for WeatherSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WeatherSettings")
            .field("api_key", &"<redacted>")
            .field("city", &self.city)
            .finish()
    }
}

impl WeatherSettings {
    pub fn from_settings(settings: &[ApplicationSetting]) -> Result<Self, ConfigurationError> {
        let value = |key: &str| {
            settings
                .iter()
                .find(|s| s.key == key)
                .and_then(|s| s.value.as_deref())
                .filter(|v| !v.trim().is_empty())
        };

        let api_key = value(SETTING_API_KEY)
            .or_else(|| value(SETTING_API_KEY_CREDENTIAL))
            .ok_or(ConfigurationError::MissingSetting(SETTING_API_KEY))?;
        let raw_city = value(SETTING_CITY).ok_or(ConfigurationError::MissingSetting(SETTING_CITY))?;
        let city = raw_city
            .trim()
            .parse::<u32>()
            .map(CityId)
            .map_err(|_| ConfigurationError::MalformedCity(raw_city.to_string()))?;

        Ok(WeatherSettings {
            api_key: api_key.to_string(),
            city,
        })
    }
}

/// What a successful cycle wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub tenant: TenantId,
    pub device: ManagedObjectId,
    pub device_created: bool,
    pub weather: WeatherSnapshot,
    pub completed_at: DateTime<Utc>,
}

pub struct SyncJob {
    resolver: DeviceResolver,
    platform: Arc<dyn Platform>,
    weather: Arc<dyn WeatherProvider>,
}

fn check_deadline(deadline: Instant, stage: &'static str) -> Result<(), SyncError> {
    if Instant::now() >= deadline {
        Err(SyncError::DeadlineExceeded { stage })
    } else {
        Ok(())
    }
}

impl SyncJob {
    pub fn new(platform: Arc<dyn Platform>, weather: Arc<dyn WeatherProvider>) -> Self {
        SyncJob {
            resolver: DeviceResolver::new(Arc::clone(&platform)),
            platform,
            weather,
        }
    }

    /// Forget per-tenant state of tenants that are no longer subscribed.
    pub fn retain_tenants(&self, subscribed: &[TenantId]) {
        self.resolver.retain_tenants(subscribed);
    }

    /// Run one cycle within `deadline`. Nothing is written unless a fresh snapshot was fetched.
    pub fn run(&self, tenant: &TenantContext, deadline: Instant) -> Result<SyncReport, SyncError> {
        check_deadline(deadline, "resolve")?;
        let resolved = self.resolver.resolve(tenant, deadline)?;

        check_deadline(deadline, "settings")?;
        let settings = self.platform
            .tenant_settings(tenant, deadline)
            .map_err(SyncError::Settings)?;
        let settings = WeatherSettings::from_settings(&settings)?;

        check_deadline(deadline, "fetch")?;
        debug!("tenant={} fetching weather for city {}", tenant.tenant(), settings.city);
        let weather = self
            .weather
            .current_by_city_id(&settings.api_key, settings.city, deadline)
            .map_err(SyncError::Provider)?;

        check_deadline(deadline, "write")?;
        let update = DeviceUpdate {
            id: resolved.device.id,
            weather,
        };
        if let Err(e) = self.platform.update_device(tenant, &update, deadline) {
            if e.status() == Some(404) {
                self.resolver.forget(tenant);
            }
            return Err(SyncError::PlatformWrite(e));
        }

        Ok(SyncReport {
            tenant: tenant.tenant().clone(),
            device: update.id,
            device_created: resolved.created,
            weather: update.weather,
            completed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::{FakePlatform, FakeWeather, settings, snapshot, tenant};
    use std::time::Duration;

    struct Harness {
        platform: Arc<FakePlatform>,
        weather: Arc<FakeWeather>,
        job: SyncJob,
    }

    fn harness() -> Harness {
        let platform = Arc::new(FakePlatform::default());
        let weather = Arc::new(FakeWeather::default());
        let job = SyncJob::new(
            Arc::clone(&platform) as Arc<dyn Platform>,
            Arc::clone(&weather) as Arc<dyn WeatherProvider>,
        );
        Harness { platform, weather, job }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn writes_fetched_snapshot_to_device() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));

        let report = h.job.run(&t, soon()).expect("cycle");
        assert!(report.device_created);
        assert_eq!(h.platform.weather_of(&report.device), Some(snapshot("Berlin", 50.0)));
        assert_eq!(h.weather.calls(), vec![("key-a".to_string(), CityId(2950159))]);
    }

    #[test]
    fn second_cycle_overwrites_previous_snapshot() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");

        h.weather.serve("key-a", snapshot("Berlin", 50.0));
        let first = h.job.run(&t, soon()).expect("first");
        let mut b = snapshot("Berlin", 80.0);
        b.pressure = 990.0;
        b.temperature_max = 290.0;
        h.weather.serve("key-a", b.clone());
        let second = h.job.run(&t, soon()).expect("second");

        assert_eq!(first.device, second.device);
        assert!(!second.device_created);
        assert_eq!(h.platform.weather_of(&second.device), Some(b));
        assert_eq!(h.platform.state().devices.len(), 1);
    }

    #[test]
    fn failed_fetch_leaves_device_untouched() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));
        let report = h.job.run(&t, soon()).expect("first");

        // rotate the key to one the provider rejects
        h.platform.state().settings.insert(t.tenant().clone(), settings("revoked", "2950159"));
        let err = h.job.run(&t, soon()).expect_err("fetch fails");
        assert!(matches!(err, SyncError::Provider(_)));
        assert_eq!(h.platform.weather_of(&report.device), Some(snapshot("Berlin", 50.0)));
        assert_eq!(h.platform.state().updates, 1);
    }

    #[test]
    fn malformed_city_fails_before_provider_call() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "not-a-number");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));

        let err = h.job.run(&t, soon()).expect_err("bad city");
        assert!(matches!(
            err,
            SyncError::Configuration(ConfigurationError::MalformedCity(ref raw)) if raw == "not-a-number"
        ));
        assert_eq!(err.kind(), "configuration");
        assert!(h.weather.calls().is_empty());
        assert_eq!(h.platform.state().updates, 0);
    }

    #[test]
    fn write_failure_is_reported_and_not_found_evicts_cache() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));
        let report = h.job.run(&t, soon()).expect("first");

        // device deleted on the platform side
        h.platform.state().devices.remove(&report.device);
        let err = h.job.run(&t, soon()).expect_err("write fails");
        assert!(matches!(err, SyncError::PlatformWrite(ref e) if e.status() == Some(404)));

        // next cycle asks the identity API again instead of trusting the cache
        let lookups = h.platform.state().lookups;
        let _ = h.job.run(&t, soon());
        assert_eq!(h.platform.state().lookups, lookups + 1);
    }

    #[test]
    fn slow_platform_cannot_stretch_cycle_past_budget() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));
        h.platform.state().latency = Duration::from_millis(100);

        let started = Instant::now();
        let budget = Duration::from_millis(120);
        let err = h.job.run(&t, started + budget).expect_err("budget too small");
        let took = started.elapsed();

        // the second call (device creation) is cut off at the deadline
        assert!(matches!(err, SyncError::PlatformLookup(ResolveError::Create(ClientError::Timeout))));
        assert!(took < budget + Duration::from_millis(60), "cycle took {:?}", took);
        assert!(h.platform.state().devices.is_empty());
    }

    #[test]
    fn write_failure_keeps_snapshot_and_cached_device() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));
        let report = h.job.run(&t, soon()).expect("first");

        h.weather.serve("key-a", snapshot("Berlin", 90.0));
        h.platform.state().update_failure = Some(503);
        let err = h.job.run(&t, soon()).expect_err("write fails");
        assert!(matches!(err, SyncError::PlatformWrite(ref e) if e.status() == Some(503)));
        assert_eq!(err.kind(), "platform_write");
        assert_eq!(h.platform.weather_of(&report.device), Some(snapshot("Berlin", 50.0)));

        h.platform.state().update_failure = None;
        let lookups = h.platform.state().lookups;
        h.job.run(&t, soon()).expect("recovered");
        assert_eq!(h.platform.state().lookups, lookups);
        assert_eq!(h.platform.weather_of(&report.device), Some(snapshot("Berlin", 90.0)));
    }

    #[test]
    fn settings_read_failure_skips_fetch() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));
        h.platform.state().settings_failure = Some(500);

        let err = h.job.run(&t, soon()).expect_err("settings unreadable");
        assert!(matches!(err, SyncError::Settings(ref e) if e.status() == Some(500)));
        assert_eq!(err.kind(), "settings");
        assert!(h.weather.calls().is_empty());
        assert_eq!(h.platform.state().updates, 0);
    }

    #[test]
    fn device_creation_failure_ends_cycle() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");
        h.weather.serve("key-a", snapshot("Berlin", 50.0));
        h.platform.state().create_failure = Some(422);

        let err = h.job.run(&t, soon()).expect_err("creation rejected");
        assert!(matches!(err, SyncError::PlatformLookup(ResolveError::Create(_))));
        assert_eq!(err.kind(), "platform_lookup");
        assert!(h.platform.state().bindings.is_empty());
        assert!(h.weather.calls().is_empty());
    }

    #[test]
    fn expired_deadline_stops_before_any_call() {
        let h = harness();
        let t = tenant("t100");
        h.platform.add_tenant(&t, "key-a", "2950159");

        let err = h.job.run(&t, Instant::now()).expect_err("deadline");
        assert!(matches!(err, SyncError::DeadlineExceeded { stage: "resolve" }));
        assert_eq!(h.platform.state().lookups, 0);
    }

    #[test]
    fn settings_fall_back_to_encrypted_api_key() {
        let json = std::fs::read_to_string("tests/data/c8y-settings.json").expect("fixture present");
        let raw: Vec<ApplicationSetting> = serde_json::from_str(&json).expect("parse settings");
        let parsed = WeatherSettings::from_settings(&raw).expect("settings");
        assert_eq!(parsed.api_key, "0123456789abcdef");
        assert_eq!(parsed.city, CityId(2950159));
        assert!(!format!("{:?}", parsed).contains("0123456789abcdef"));
    }

    #[test]
    fn missing_settings_are_named() {
        let err = WeatherSettings::from_settings(&[]).expect_err("nothing set");
        assert_eq!(err, ConfigurationError::MissingSetting("api_key"));

        let only_key = vec![ApplicationSetting {
            key: "api_key".into(),
            value: Some("k".into()),
        }];
        let err = WeatherSettings::from_settings(&only_key).expect_err("no city");
        assert_eq!(err, ConfigurationError::MissingSetting("city"));
    }
}
