use std::path::PathBuf;
use std::time::Duration;

use crate::acquisition::AcquisitionConfig;
use crate::protocol::STANDARD_SYSTEM;
use crate::redirect::DEFAULT_AD_TARGET_PARAM;

pub const DEFAULT_KEY_SERVICE_URL: &str = "https://api-kn3m.onrender.com";
pub const DEFAULT_AD_LINK_URL: &str = "https://link-to-your-shortener.com/";
pub const DEFAULT_VERIFY_URL: &str = "https://your-site.netlify.app/verify";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
pub const MIN_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

pub const ENV_KEY_SERVICE_URL: &str = "OBLIVION_KEY_SERVICE_URL";
pub const ENV_AD_LINK_URL: &str = "OBLIVION_AD_LINK_URL";
pub const ENV_AD_TARGET_PARAM: &str = "OBLIVION_AD_TARGET_PARAM";
pub const ENV_VERIFY_URL: &str = "OBLIVION_VERIFY_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "OBLIVION_POLL_INTERVAL_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "OBLIVION_REQUEST_TIMEOUT_MS";
pub const ENV_GATE_SIGNAL: &str = "OBLIVION_GATE_SIGNAL";
pub const ENV_SESSION_FILE: &str = "OBLIVION_SESSION_FILE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must not be empty")]
    EmptyUrl { key: &'static str },
    #[error("{key} must use http:// or https:// and include a host")]
    InvalidUrl { key: &'static str },
    #[error("invalid {key}: {value}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("invalid OBLIVION_GATE_SIGNAL: {0}")]
    InvalidGateSignal(String),
    #[error("OBLIVION_AD_TARGET_PARAM must not be empty")]
    EmptyAdTargetParam,
}

/// How the KeyService says "ad not completed yet".
///
/// Backends in the wild disagree: some answer 403, others a 200 body with
/// `success: false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateSignal {
    #[default]
    Forbidden,
    ForbiddenOrUnsuccessful,
}

impl GateSignal {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::ForbiddenOrUnsuccessful => "forbidden_or_unsuccessful",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "forbidden" | "403" | "http_403" => Some(Self::Forbidden),
            "forbidden_or_unsuccessful" | "forbidden-or-unsuccessful" | "403_or_body" => {
                Some(Self::ForbiddenOrUnsuccessful)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalConfig {
    pub key_service_url: String,
    pub ad_link_url: String,
    pub ad_target_param: String,
    pub verify_url: String,
    pub poll_interval: Duration,
    pub request_timeout: Option<Duration>,
    pub gate_signal: GateSignal,
    pub session_file: Option<PathBuf>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            key_service_url: DEFAULT_KEY_SERVICE_URL.to_string(),
            ad_link_url: DEFAULT_AD_LINK_URL.to_string(),
            ad_target_param: DEFAULT_AD_TARGET_PARAM.to_string(),
            verify_url: DEFAULT_VERIFY_URL.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            request_timeout: Some(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            gate_signal: GateSignal::Forbidden,
            session_file: None,
        }
    }
}

impl PortalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let key_service_url = normalize_base_url(
            ENV_KEY_SERVICE_URL,
            env_non_empty(ENV_KEY_SERVICE_URL)
                .as_deref()
                .unwrap_or(DEFAULT_KEY_SERVICE_URL),
        )?;
        let ad_link_url = validate_link_url(
            ENV_AD_LINK_URL,
            env_non_empty(ENV_AD_LINK_URL)
                .as_deref()
                .unwrap_or(DEFAULT_AD_LINK_URL),
        )?;
        let verify_url = validate_link_url(
            ENV_VERIFY_URL,
            env_non_empty(ENV_VERIFY_URL)
                .as_deref()
                .unwrap_or(DEFAULT_VERIFY_URL),
        )?;
        let ad_target_param =
            env_non_empty(ENV_AD_TARGET_PARAM).unwrap_or_else(|| DEFAULT_AD_TARGET_PARAM.to_string());

        let poll_interval_ms = parse_millis(ENV_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS)?;
        let request_timeout_ms = parse_millis(ENV_REQUEST_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS)?;
        let gate_signal = match env_non_empty(ENV_GATE_SIGNAL) {
            Some(raw) => GateSignal::parse(&raw).ok_or(ConfigError::InvalidGateSignal(raw))?,
            None => GateSignal::default(),
        };

        Ok(Self {
            key_service_url,
            ad_link_url,
            ad_target_param,
            verify_url,
            poll_interval: clamp_poll_interval(poll_interval_ms),
            request_timeout: (request_timeout_ms > 0)
                .then(|| Duration::from_millis(request_timeout_ms)),
            gate_signal,
            session_file: env_non_empty(ENV_SESSION_FILE).map(PathBuf::from),
        })
    }

    pub fn with_key_service_url(mut self, raw: &str) -> Result<Self, ConfigError> {
        self.key_service_url = normalize_base_url(ENV_KEY_SERVICE_URL, raw)?;
        Ok(self)
    }

    pub fn acquisition(&self) -> Result<AcquisitionConfig, ConfigError> {
        let ad_target_param = self.ad_target_param.trim();
        if ad_target_param.is_empty() {
            return Err(ConfigError::EmptyAdTargetParam);
        }
        Ok(AcquisitionConfig {
            ad_link_url: validate_link_url(ENV_AD_LINK_URL, &self.ad_link_url)?,
            ad_target_param: ad_target_param.to_string(),
            verify_url: validate_link_url(ENV_VERIFY_URL, &self.verify_url)?,
            system: STANDARD_SYSTEM.to_string(),
            gate_signal: self.gate_signal,
            request_timeout: self.request_timeout,
        })
    }
}

#[must_use]
pub fn clamp_poll_interval(millis: u64) -> Duration {
    Duration::from_millis(millis.max(MIN_POLL_INTERVAL_MS))
}

/// Trims whitespace and trailing slashes; requires an http(s) scheme and host.
pub fn normalize_base_url(key: &'static str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    ensure_http_url(key, trimmed)?;
    Ok(trimmed.to_string())
}

/// Like [`normalize_base_url`] but keeps the path untouched.
pub fn validate_link_url(key: &'static str, raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    ensure_http_url(key, trimmed)?;
    Ok(trimmed.to_string())
}

fn ensure_http_url(key: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::EmptyUrl { key });
    }
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(ConfigError::InvalidUrl { key });
    }
    let Some((_, remainder)) = value.split_once("://") else {
        return Err(ConfigError::InvalidUrl { key });
    };
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidUrl { key });
    }
    Ok(())
}

fn parse_millis(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_non_empty(key) {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        None => Ok(default),
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const ALL_KEYS: [&str; 8] = [
        ENV_KEY_SERVICE_URL,
        ENV_AD_LINK_URL,
        ENV_AD_TARGET_PARAM,
        ENV_VERIFY_URL,
        ENV_POLL_INTERVAL_MS,
        ENV_REQUEST_TIMEOUT_MS,
        ENV_GATE_SIGNAL,
        ENV_SESSION_FILE,
    ];

    fn with_env<T>(overrides: &[(&str, &str)], test: impl FnOnce() -> T) -> T {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous = ALL_KEYS
            .iter()
            .map(|key| (*key, std::env::var(key).ok()))
            .collect::<Vec<_>>();

        for key in ALL_KEYS {
            unsafe { std::env::remove_var(key) };
        }
        for (key, value) in overrides {
            unsafe { std::env::set_var(key, value) };
        }

        let result = test();

        for (key, value) in previous {
            if let Some(value) = value {
                unsafe { std::env::set_var(key, value) };
            } else {
                unsafe { std::env::remove_var(key) };
            }
        }

        result
    }

    #[test]
    fn from_env_uses_defaults_when_unset() {
        with_env(&[], || {
            let config = PortalConfig::from_env().expect("defaults");
            assert_eq!(config, PortalConfig::default());
        });
    }

    #[test]
    fn from_env_reads_overrides() {
        with_env(
            &[
                (ENV_KEY_SERVICE_URL, " https://keys.example.com/ "),
                (ENV_AD_LINK_URL, "https://ads.example.com/go"),
                (ENV_VERIFY_URL, "https://portal.example.com/verify"),
                (ENV_POLL_INTERVAL_MS, "2000"),
                (ENV_REQUEST_TIMEOUT_MS, "0"),
                (ENV_GATE_SIGNAL, "forbidden_or_unsuccessful"),
                (ENV_SESSION_FILE, "/tmp/oblivion-session.json"),
            ],
            || {
                let config = PortalConfig::from_env().expect("config");
                assert_eq!(config.key_service_url, "https://keys.example.com");
                assert_eq!(config.ad_link_url, "https://ads.example.com/go");
                assert_eq!(config.verify_url, "https://portal.example.com/verify");
                assert_eq!(config.poll_interval, Duration::from_millis(2_000));
                assert_eq!(config.request_timeout, None);
                assert_eq!(config.gate_signal, GateSignal::ForbiddenOrUnsuccessful);
                assert_eq!(
                    config.session_file,
                    Some(PathBuf::from("/tmp/oblivion-session.json"))
                );
            },
        );
    }

    #[test]
    fn poll_interval_is_clamped_to_minimum() {
        with_env(&[(ENV_POLL_INTERVAL_MS, "1")], || {
            let config = PortalConfig::from_env().expect("config");
            assert_eq!(
                config.poll_interval,
                Duration::from_millis(MIN_POLL_INTERVAL_MS)
            );
        });
    }

    #[test]
    fn invalid_values_name_the_variable() {
        with_env(&[(ENV_POLL_INTERVAL_MS, "soon")], || {
            let error = PortalConfig::from_env().expect_err("invalid interval");
            assert_eq!(error.to_string(), "invalid OBLIVION_POLL_INTERVAL_MS: soon");
        });
        with_env(&[(ENV_GATE_SIGNAL, "maybe")], || {
            let error = PortalConfig::from_env().expect_err("invalid gate signal");
            assert_eq!(error, ConfigError::InvalidGateSignal("maybe".to_string()));
        });
        with_env(&[(ENV_KEY_SERVICE_URL, "keys.example.com")], || {
            let error = PortalConfig::from_env().expect_err("invalid url");
            assert_eq!(
                error,
                ConfigError::InvalidUrl {
                    key: ENV_KEY_SERVICE_URL
                }
            );
        });
    }

    #[test]
    fn link_urls_keep_their_path_and_trailing_slash() {
        let link = validate_link_url(ENV_AD_LINK_URL, " https://ads.example.com/ ").expect("valid");
        assert_eq!(link, "https://ads.example.com/");
        let error = validate_link_url(ENV_AD_LINK_URL, "https:///path").expect_err("no host");
        assert_eq!(error, ConfigError::InvalidUrl { key: ENV_AD_LINK_URL });
    }

    #[test]
    fn acquisition_config_carries_gate_signal_and_timeout() {
        let config = PortalConfig {
            gate_signal: GateSignal::ForbiddenOrUnsuccessful,
            request_timeout: Some(Duration::from_secs(3)),
            ..PortalConfig::default()
        };
        let acquisition = config.acquisition().expect("acquisition");
        assert_eq!(acquisition.gate_signal, GateSignal::ForbiddenOrUnsuccessful);
        assert_eq!(acquisition.request_timeout, Some(Duration::from_secs(3)));
        assert_eq!(acquisition.system, STANDARD_SYSTEM);
        assert_eq!(acquisition.ad_target_param, DEFAULT_AD_TARGET_PARAM);
    }

    #[test]
    fn gate_signal_parse_accepts_aliases() {
        assert_eq!(GateSignal::parse("403"), Some(GateSignal::Forbidden));
        assert_eq!(
            GateSignal::parse(" Forbidden-Or-Unsuccessful "),
            Some(GateSignal::ForbiddenOrUnsuccessful)
        );
        assert_eq!(GateSignal::parse("never"), None);
    }
}
