use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::Level;

pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-mini-realtime-preview-2024-12-17";
pub const DEFAULT_SIDECAR_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_SIDECAR_MODEL: &str = "llama-3.3-70b-versatile";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Settings for the secondary assessment model. Absent when no key is configured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: String,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub sidecar: Option<SidecarConfig>,
    pub review_endpoint: Option<String>,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let openai_api_key = non_empty_var("OPENAI_API_KEY")
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_model =
            non_empty_var("REALTIME_MODEL").unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string());
        let realtime_voice = non_empty_var("REALTIME_VOICE").unwrap_or_else(|| "alloy".to_string());

        let sidecar = non_empty_var("SIDECAR_API_KEY").map(|api_key| SidecarConfig {
            api_key,
            base_url: non_empty_var("SIDECAR_BASE_URL")
                .unwrap_or_else(|| DEFAULT_SIDECAR_BASE_URL.to_string()),
            model: non_empty_var("SIDECAR_MODEL").unwrap_or_else(|| DEFAULT_SIDECAR_MODEL.to_string()),
        });

        let review_endpoint = non_empty_var("REVIEW_ENDPOINT");
        if let Some(endpoint) = &review_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ConfigError::InvalidValue(
                    "REVIEW_ENDPOINT".to_string(),
                    format!("'{}' is not an http(s) URL", endpoint),
                ));
            }
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_model,
            realtime_voice,
            sidecar,
            review_endpoint,
            log_level,
            prompts_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("BIND_ADDRESS");
            env::remove_var("OPENAI_API_KEY");
            env::remove_var("REALTIME_MODEL");
            env::remove_var("REALTIME_VOICE");
            env::remove_var("SIDECAR_API_KEY");
            env::remove_var("SIDECAR_BASE_URL");
            env::remove_var("SIDECAR_MODEL");
            env::remove_var("REVIEW_ENDPOINT");
            env::remove_var("RUST_LOG");
            env::remove_var("PROMPTS_PATH");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3000");
        assert_eq!(config.openai_api_key, "test-openai-key");
        assert_eq!(config.realtime_model, DEFAULT_REALTIME_MODEL);
        assert_eq!(config.realtime_voice, "alloy");
        assert_eq!(config.sidecar, None);
        assert_eq!(config.review_endpoint, None);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.prompts_path, PathBuf::from("./prompts"));
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
            env::set_var("OPENAI_API_KEY", "custom-openai-key");
            env::set_var("REALTIME_MODEL", "gpt-4o-realtime-preview");
            env::set_var("REALTIME_VOICE", "verse");
            env::set_var("SIDECAR_API_KEY", "groq-key");
            env::set_var("SIDECAR_MODEL", "llama-3.1-8b-instant");
            env::set_var("REVIEW_ENDPOINT", "https://review.internal/finalize");
            env::set_var("RUST_LOG", "debug");
            env::set_var("PROMPTS_PATH", "/custom/prompts");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:8080");
        assert_eq!(config.realtime_model, "gpt-4o-realtime-preview");
        assert_eq!(config.realtime_voice, "verse");
        assert_eq!(
            config.sidecar,
            Some(SidecarConfig {
                api_key: "groq-key".to_string(),
                base_url: DEFAULT_SIDECAR_BASE_URL.to_string(),
                model: "llama-3.1-8b-instant".to_string(),
            })
        );
        assert_eq!(
            config.review_endpoint.as_deref(),
            Some("https://review.internal/finalize")
        );
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.prompts_path, PathBuf::from("/custom/prompts"));
    }

    #[test]
    #[serial]
    fn test_config_missing_openai_key() {
        clear_env_vars();

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("OPENAI_API_KEY")),
            _ => panic!("Expected MissingVar for OPENAI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_blank_sidecar_key_disables_sidecar() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
            env::set_var("SIDECAR_API_KEY", "  ");
        }

        let config = Config::from_env().expect("Config should load successfully");
        assert_eq!(config.sidecar, None);
    }

    #[test]
    #[serial]
    fn test_config_invalid_bind_address() {
        clear_env_vars();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
            env::set_var("OPENAI_API_KEY", "test-openai-key");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_review_endpoint() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
            env::set_var("REVIEW_ENDPOINT", "review.internal");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "REVIEW_ENDPOINT"),
            _ => panic!("Expected InvalidValue for REVIEW_ENDPOINT"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("OPENAI_API_KEY", "test-openai-key");
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
