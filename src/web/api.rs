use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::actuators::ActuatorCommand;
use crate::config::Config;
use crate::device_session::DeviceSession;
use crate::serial_link;

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<DeviceSession>,
    pub config_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// The mock/live decision is re-read from disk on every request so a
/// config change takes effect without restarting the process.
fn load_config(state: &AppState) -> Result<Config, ApiError> {
    Config::load_or_create(state.config_path.as_ref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to load configuration: {}", e),
        )
    })
}

/// Connect the device session if it is not already up.
///
/// Runs on the blocking pool because connect sleeps out the settle delay
/// after opening the port.
async fn ensure_connected(state: &AppState, config: &Config) -> Result<(), ApiError> {
    if state.session.is_connected() {
        return Ok(());
    }
    let session = Arc::clone(&state.session);
    let port = config.serial.port.clone();
    let port_for_error = port.clone();
    let joined = tokio::task::spawn_blocking(move || session.connect(&port)).await;
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Device connection failed: {}", e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to connect to device on {}: {}", port_for_error, e),
            ))
        }
        Err(e) => {
            error!("Connect task failed to run: {}", e);
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to connect to device",
            ))
        }
    }
}

fn to_json(value: impl Serialize) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| {
        error!("Failed to serialize response: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "Serialization failed")
    })
}

/// All sensor readings as one JSON object: the configured mock values,
/// or the session's current sample.
async fn readings(state: &AppState, config: &Config) -> Result<Value, ApiError> {
    if config.mock.enabled {
        return to_json(&config.mock.values);
    }
    ensure_connected(state, config).await?;
    to_json(state.session.read_current_sample())
}

pub async fn get_sensors(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    info!("GET /api/sensors");
    let config = load_config(&state)?;
    readings(&state, &config).await.map(Json)
}

pub async fn get_sensor(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!(sensor = %name, "GET /api/sensor");
    let config = load_config(&state)?;
    let all = readings(&state, &config).await?;
    match all.get(&name) {
        Some(value) => {
            let mut body = serde_json::Map::new();
            body.insert(name, value.clone());
            Ok(Json(Value::Object(body)))
        }
        None => Err(api_error(StatusCode::NOT_FOUND, "Sensor not found")),
    }
}

pub async fn do_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> Result<Json<Value>, ApiError> {
    info!(action = %action, "GET /api/action");
    let config = load_config(&state)?;
    if config.mock.enabled {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Cannot control actuators in mock mode",
        ));
    }
    let Some(command) = ActuatorCommand::from_action(&action) else {
        warn!(action = %action, "Unknown actuator action");
        return Err(api_error(StatusCode::BAD_REQUEST, "Unknown action"));
    };
    ensure_connected(&state, &config).await?;
    if !state.session.send_command(command) {
        error!("Command {:?} was not accepted by the device session", command);
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to send {:?} to the device", command),
        ));
    }
    to_json(state.session.read_current_sample()).map(Json)
}

#[derive(Debug, Deserialize)]
pub struct MockQuery {
    pub mock: Option<String>,
}

pub async fn set_mock_mode(
    State(state): State<AppState>,
    Query(params): Query<MockQuery>,
) -> Result<Json<Value>, ApiError> {
    info!(?params, "POST /api/config");
    let Some(raw) = params.mock else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Please provide ?mock=true or ?mock=false",
        ));
    };
    let Some(enabled) = parse_mock_flag(&raw) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid value for mock"));
    };

    let mut config = load_config(&state)?;
    config.mock.enabled = enabled;
    config.save(state.config_path.as_ref()).map_err(|e| {
        error!("Failed to save configuration: {}", e);
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save configuration: {}", e),
        )
    })?;
    info!(enabled, "Mock mode updated");
    Ok(Json(json!({
        "message": "Configuration updated",
        "use_mock_data": enabled,
    })))
}

/// Accepts the same spellings the original API did
fn parse_mock_flag(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

pub async fn list_ports() -> Json<Vec<serial_link::PortInfo>> {
    info!("GET /api/ports");
    Json(serial_link::available_ports())
}

pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/sensors", get(get_sensors))
        .route("/sensor/:name", get(get_sensor))
        .route("/action/:action", get(do_action))
        .route("/config", post(set_mock_mode))
        .route("/ports", get(list_ports))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mock_flag_true_spellings() {
        assert_eq!(parse_mock_flag("true"), Some(true));
        assert_eq!(parse_mock_flag("TRUE"), Some(true));
        assert_eq!(parse_mock_flag("1"), Some(true));
        assert_eq!(parse_mock_flag("yes"), Some(true));
    }

    #[test]
    fn test_parse_mock_flag_false_spellings() {
        assert_eq!(parse_mock_flag("false"), Some(false));
        assert_eq!(parse_mock_flag("False"), Some(false));
        assert_eq!(parse_mock_flag("0"), Some(false));
        assert_eq!(parse_mock_flag("no"), Some(false));
    }

    #[test]
    fn test_parse_mock_flag_rejects_garbage() {
        assert_eq!(parse_mock_flag("maybe"), None);
        assert_eq!(parse_mock_flag(""), None);
        assert_eq!(parse_mock_flag("2"), None);
    }

    #[test]
    fn test_mock_values_expose_sensor_names() {
        // get_sensor looks fields up by name in the serialized readings;
        // the mock object must carry the same keys the live sample does.
        let config = Config::default();
        let value = serde_json::to_value(&config.mock.values).unwrap();
        assert!(value.get("temperature").is_some());
        assert!(value.get("soil_moisture").is_some());
        assert!(value.get("humidity").is_some());
        assert!(value.get("co2").is_none());
    }
}
