//! Blocking client for the OpenWeatherMap "current weather" endpoint.

use std::time::{Duration, Instant};

use crate::client::rest::{self, ClientError, Reply};
use crate::models::weather::{CityId, CurrentWeather, WeatherSnapshot};
use crate::services::platform::WeatherProvider;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org/data/2.5";

pub struct OpenWeatherClient {
    agent: ureq::Agent,
    timeout: Duration,
    base_url: String,
}

impl OpenWeatherClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        OpenWeatherClient {
            agent: rest::agent(timeout),
            timeout,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn get_current(&self, api_key: &str, city: CityId, deadline: Instant) -> Result<CurrentWeather, ClientError> {
        let url = format!("{}/weather", self.base_url);
        let timeout = rest::budget(self.timeout, deadline)?;
        let reply = Reply::read(
            self.agent
                .get(&url)
                .config()
                .timeout_global(Some(timeout))
                .build()
                .header("Accept", "application/json")
                .query("id", city.to_string())
                .query("appid", api_key)
                .call(),
        )?
        .success()?;
        reply.json()
    }
}

impl WeatherProvider for OpenWeatherClient {
    fn current_by_city_id(
        &self,
        api_key: &str,
        city: CityId,
        deadline: Instant,
    ) -> Result<WeatherSnapshot, ClientError> {
        self.get_current(api_key, city, deadline).map(WeatherSnapshot::from)
    }
}
