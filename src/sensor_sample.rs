use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Baseline relative humidity the derived value is adjusted from
const BASE_HUMIDITY: f64 = 45.0;
/// Derived humidity is clamped to this range before rounding
const HUMIDITY_MIN: f64 = 10.0;
const HUMIDITY_MAX: f64 = 90.0;

/// Snapshot of the latest decoded sensor readings.
///
/// Immutable once constructed; the device session replaces the current
/// snapshot wholesale on each successfully parsed line, so readers never
/// observe a half-updated set of values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSample {
    /// Air temperature in degrees Celsius
    pub temperature: f64,
    /// Raw soil moisture reading from the analog probe
    pub soil_moisture: f64,
    /// Relative humidity in percent, derived from the two measured values
    pub humidity: f64,
    /// When the sample was parsed; None until the first reading arrives
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for SensorSample {
    fn default() -> Self {
        SensorSample {
            temperature: 0.0,
            soil_moisture: 0.0,
            humidity: derived_humidity(0.0, 0.0),
            last_update: None,
        }
    }
}

/// Error parsing one line of sensor CSV from the device
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("expected at least 2 comma-separated values, got {0}")]
    MissingFields(usize),
    #[error("invalid {field} value {value:?}")]
    InvalidNumber { field: &'static str, value: String },
}

impl SensorSample {
    /// Decode a `"temperature,soil_moisture"` line from the device.
    ///
    /// Fields beyond the first two are ignored. Humidity is recomputed
    /// from the measured values and `last_update` is stamped with the
    /// current time.
    pub fn from_line(line: &str) -> Result<SensorSample, ParseError> {
        let values: Vec<&str> = line.trim().split(',').collect();
        if values.len() < 2 {
            return Err(ParseError::MissingFields(values.len()));
        }
        let temperature: f64 = values[0]
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidNumber {
                field: "temperature",
                value: values[0].to_string(),
            })?;
        let soil_moisture: f64 = values[1]
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidNumber {
                field: "soil_moisture",
                value: values[1].to_string(),
            })?;
        Ok(SensorSample {
            temperature,
            soil_moisture,
            humidity: derived_humidity(soil_moisture, temperature),
            last_update: Some(Utc::now()),
        })
    }
}

/// Derive relative humidity from soil moisture and temperature.
///
/// Clamped to [10, 90] and rounded to one decimal place. The formula is
/// fixed and the humidity value is never stored independently of its
/// inputs.
pub fn derived_humidity(soil_moisture: f64, temperature: f64) -> f64 {
    let soil_factor = (soil_moisture - 400.0) / 20.0;
    let temp_factor = (temperature - 25.0) / 2.0;
    let humidity = BASE_HUMIDITY - soil_factor + temp_factor;
    (humidity.clamp(HUMIDITY_MIN, HUMIDITY_MAX) * 10.0).round() / 10.0
}
