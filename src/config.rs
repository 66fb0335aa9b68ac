use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub mock: MockConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial device the greenhouse controller is attached to
    pub port: String,
    /// Line speed of the serial link
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
        }
    }
}

/// Mock-mode routing, re-read from disk at the start of every request.
///
/// When enabled, sensor reads answer with `values` and actuator commands
/// are rejected without touching the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub values: MockValues,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockValues {
    pub temperature: f64,
    pub soil_moisture: f64,
    pub humidity: f64,
}

impl Default for MockValues {
    fn default() -> Self {
        Self {
            temperature: 25.0,
            soil_moisture: 400.0,
            humidity: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP port the web server listens on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Directory where log files will be stored
    pub directory: String,
    /// Log file name prefix (date will be appended)
    pub file_prefix: String,
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: "./logs".to_string(),
            file_prefix: "greenhouse_bridge".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Load the configuration, writing a default file first if none
    /// exists yet.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.as_ref().exists() {
            let config = Config::default();
            config.save(&path)?;
            return Ok(config);
        }
        Self::from_file(path)
    }

    /// Persist the configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 9600);
    }

    #[test]
    fn test_mock_config_default() {
        let config = MockConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.values.temperature, 25.0);
        assert_eq!(config.values.soil_moisture, 400.0);
        assert_eq!(config.values.humidity, 50.0);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5000);
    }

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.directory, "./logs");
        assert_eq!(config.file_prefix, "greenhouse_bridge");
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert!(!config.mock.enabled);
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("/dev/ttyACM0"));
        assert!(json.contains("9600"));
        assert!(json.contains("greenhouse_bridge"));
    }

    #[test]
    fn test_config_deserialization() {
        let json = r#"{
            "serial": {
                "port": "/dev/ttyUSB1",
                "baud_rate": 115200
            },
            "mock": {
                "enabled": true,
                "values": {
                    "temperature": 21.5,
                    "soil_moisture": 380.0,
                    "humidity": 55.0
                }
            },
            "server": {
                "port": 8080
            },
            "logging": {
                "directory": "/var/log/greenhouse",
                "file_prefix": "bridge",
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baud_rate, 115200);
        assert!(config.mock.enabled);
        assert_eq!(config.mock.values.temperature, 21.5);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_config_missing_sections_use_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert!(!config.mock.enabled);
        assert_eq!(config.server.port, 5000);
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.mock.enabled = true;
        config.serial.port = "/dev/ttyUSB0".to_string();

        let json = serde_json::to_string_pretty(&config).unwrap();
        let restored: Config = serde_json::from_str(&json).unwrap();
        assert!(restored.mock.enabled);
        assert_eq!(restored.serial.port, "/dev/ttyUSB0");
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let path = std::env::temp_dir().join(format!(
            "greenhouse_bridge_test_config_{}.json",
            std::process::id()
        ));
        let _ = fs::remove_file(&path);

        let config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(!config.mock.enabled);

        // A second load reads the file back rather than rewriting it
        let reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.serial.port, config.serial.port);

        let _ = fs::remove_file(&path);
    }
}
