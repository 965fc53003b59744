//! Weather snapshot and the subset of the OpenWeatherMap "current weather"
//! response it is built from.

use serde::{Deserialize, Serialize};

/// Numeric OpenWeatherMap city identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CityId(pub u32);

impl core::fmt::Display for CityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current weather for one city, as written onto the device.
///
/// Serialized with the camelCase keys of the `c8y_OpenWeather` fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSnapshot {
    pub city: String,
    pub humidity: f64,
    pub pressure: f64,
    /// Wind speed.
    pub speed: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
}

// =====================
// OpenWeatherMap response
// =====================

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentWeather {
    pub name: String,
    pub main: MainData,
    pub wind: WindData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainData {
    pub humidity: f64,
    pub pressure: f64,
    pub temp_min: f64,
    pub temp_max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindData {
    pub speed: f64,
}

impl From<CurrentWeather> for WeatherSnapshot {
    fn from(value: CurrentWeather) -> Self {
        WeatherSnapshot {
            city: value.name,
            humidity: value.main.humidity,
            pressure: value.main.pressure,
            speed: value.wind.speed,
            temperature_min: value.main.temp_min,
            temperature_max: value.main.temp_max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_fixture() -> CurrentWeather {
        let json = std::fs::read_to_string("tests/data/openweather-current.json").expect("fixture present");
        serde_json::from_str(&json).expect("parse current weather")
    }

    #[test]
    fn maps_provider_fields_without_conversion() {
        let snapshot = WeatherSnapshot::from(load_fixture());
        assert_eq!(
            snapshot,
            WeatherSnapshot {
                city: "Berlin".into(),
                humidity: 71.0,
                pressure: 1012.0,
                speed: 4.63,
                temperature_min: 281.48,
                temperature_max: 284.26,
            }
        );
    }

    #[test]
    fn snapshot_uses_fragment_key_names() {
        let snapshot = WeatherSnapshot::from(load_fixture());
        let value = serde_json::to_value(&snapshot).expect("serialize");
        let obj = value.as_object().expect("object");
        let mut keys = obj.keys().map(String::as_str).collect::<Vec<_>>();
        keys.sort_unstable();
        assert_eq!(
            keys,
            ["city", "humidity", "pressure", "speed", "temperatureMax", "temperatureMin"]
        );
    }
}
