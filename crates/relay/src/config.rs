// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::RelayError;
use crate::transport::TransferRequest;
use reqwest::{Method, Url};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IDENTIFIER: &str = "relay";
pub const DEFAULT_MAX_RECORDS: usize = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SUCCESS_STATUS: u16 = 200;
const MAX_IDENTIFIER_LEN: usize = 64;
const JSON_CONTENT_TYPE: &str = "application/json";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Network settings used when firing off uploads.
///
/// Compared structurally: changing the host, a header or the success codes
/// makes every outstanding transfer stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfiguration {
    host: Url,
    http_headers: BTreeMap<String, String>,
    successful_status_codes: BTreeSet<u16>,
}

impl RelayConfiguration {
    /// Builds a configuration with the JSON content negotiation headers.
    pub fn new(host: Url) -> Self {
        Self::with_headers(host, Vec::<(String, String)>::new())
    }

    /// `Content-Type` and `Accept` default to `application/json` when the
    /// additional headers do not set them.
    pub fn with_headers<I, K, V>(host: Url, additional_http_headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut http_headers: BTreeMap<String, String> = additional_http_headers
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        for name in ["Content-Type", "Accept"] {
            if !http_headers.keys().any(|k| k.eq_ignore_ascii_case(name)) {
                http_headers.insert(name.to_string(), JSON_CONTENT_TYPE.to_string());
            }
        }

        Self {
            host,
            http_headers,
            successful_status_codes: BTreeSet::from([DEFAULT_SUCCESS_STATUS]),
        }
    }

    /// Parses `host` and builds a configuration with default headers.
    pub fn parse(host: &str) -> Result<Self, RelayError> {
        let host = Url::parse(host)
            .map_err(|e| RelayError::InvalidConfig(format!("invalid host '{host}': {e}")))?;
        Ok(Self::new(host))
    }

    #[must_use]
    pub fn with_successful_status_codes<I: IntoIterator<Item = u16>>(mut self, codes: I) -> Self {
        self.successful_status_codes = codes.into_iter().collect();
        self
    }

    #[must_use]
    pub fn host(&self) -> &Url {
        &self.host
    }

    #[must_use]
    pub fn http_headers(&self) -> &BTreeMap<String, String> {
        &self.http_headers
    }

    #[must_use]
    pub fn successful_status_codes(&self) -> &BTreeSet<u16> {
        &self.successful_status_codes
    }

    #[must_use]
    pub fn is_success(&self, status: u16) -> bool {
        self.successful_status_codes.contains(&status)
    }

    /// The upload request this configuration produces for any record.
    #[must_use]
    pub fn request_for(&self) -> TransferRequest {
        TransferRequest {
            method: Method::POST,
            url: self.host.clone(),
            headers: self.http_headers.clone(),
        }
    }

    /// Rejects a configuration under which no response could count as delivered.
    pub fn validate(&self) -> Result<(), RelayError> {
        let codes = &self.successful_status_codes;
        if codes.is_empty() {
            return Err(RelayError::InvalidConfig(
                "at least one successful status code is required".to_string(),
            ));
        }
        if let Some(code) = codes.iter().find(|c| !(100..=599).contains(*c)) {
            return Err(RelayError::InvalidConfig(format!(
                "{code} is not an HTTP status code"
            )));
        }
        Ok(())
    }

    /// Reports whether an outstanding request still reflects this configuration.
    ///
    /// Headers the request carries beyond the configured ones are tolerated.
    #[must_use]
    pub fn matches(&self, request: &TransferRequest) -> bool {
        if request.url != self.host {
            return false;
        }
        self.http_headers.iter().all(|(name, value)| {
            request
                .headers
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(name) && v == value)
        })
    }
}

/// Everything needed to construct a relay.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Names the store and the transport session; one live relay per identifier.
    pub identifier: String,
    /// Directory holding the on-disk store; `None` keeps records in memory only.
    pub storage_dir: Option<PathBuf>,
    /// Records kept before the oldest ones are evicted.
    pub max_records: usize,
    /// Retryable failures tolerated per record; `None` retries forever.
    pub max_retries: Option<u32>,
    pub configuration: RelayConfiguration,
    pub request_timeout: Duration,
    pub flush_interval: Duration,
    pub log_level: String,
}

impl RelaySettings {
    pub fn new(identifier: impl Into<String>, configuration: RelayConfiguration) -> Self {
        Self {
            identifier: identifier.into(),
            storage_dir: None,
            max_records: DEFAULT_MAX_RECORDS,
            max_retries: Some(DEFAULT_MAX_RETRIES),
            configuration,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            log_level: "info".to_string(),
        }
    }

    /// Create settings from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_env_iter(std::env::vars())
    }

    /// Create settings from an explicit list of variables.
    ///
    /// `RELAY_HOST` is required. Headers are `Name:Value` pairs and success
    /// codes plain numbers, both comma separated. `RELAY_UPLOAD_RETRIES`
    /// accepts `unlimited` to retry forever.
    pub fn from_env_iter<I, K, V>(vars: I) -> Result<Self, RelayError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: BTreeMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with("RELAY_"))
            .collect();
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let host = get("RELAY_HOST")
            .ok_or_else(|| RelayError::InvalidConfig("RELAY_HOST must be set".to_string()))?;
        let host = Url::parse(&host)
            .map_err(|e| RelayError::InvalidConfig(format!("invalid RELAY_HOST '{host}': {e}")))?;

        let headers = match get("RELAY_HTTP_HEADERS") {
            Some(raw) => parse_headers(&raw)?,
            None => Vec::new(),
        };
        let mut configuration = RelayConfiguration::with_headers(host, headers);
        if let Some(raw) = get("RELAY_SUCCESS_CODES") {
            configuration = configuration.with_successful_status_codes(parse_status_codes(&raw)?);
        }

        let mut settings = Self::new(
            get("RELAY_IDENTIFIER").unwrap_or_else(|| DEFAULT_IDENTIFIER.to_string()),
            configuration,
        );
        settings.storage_dir = get("RELAY_STORAGE_DIR").map(PathBuf::from);
        if let Some(raw) = get("RELAY_MAX_RECORDS") {
            settings.max_records = parse_number("RELAY_MAX_RECORDS", &raw)?;
        }
        if let Some(raw) = get("RELAY_UPLOAD_RETRIES") {
            settings.max_retries = if raw.eq_ignore_ascii_case("unlimited") {
                None
            } else {
                Some(parse_number("RELAY_UPLOAD_RETRIES", &raw)?)
            };
        }
        if let Some(raw) = get("RELAY_REQUEST_TIMEOUT_SECS") {
            settings.request_timeout =
                Duration::from_secs(parse_number("RELAY_REQUEST_TIMEOUT_SECS", &raw)?);
        }
        if let Some(raw) = get("RELAY_FLUSH_INTERVAL_SECS") {
            settings.flush_interval =
                Duration::from_secs(parse_number("RELAY_FLUSH_INTERVAL_SECS", &raw)?);
        }
        if let Some(level) = get("RELAY_LOG_LEVEL") {
            settings.log_level = level.to_lowercase();
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), RelayError> {
        validate_identifier(&self.identifier)?;

        if self.max_records == 0 {
            return Err(RelayError::InvalidConfig(
                "max_records must be greater than 0".to_string(),
            ));
        }

        self.configuration.validate()?;

        if self.request_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "request timeout must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(RelayError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }
}

/// Checks that an identifier is safe to use as a store and session name.
pub fn validate_identifier(identifier: &str) -> Result<(), RelayError> {
    let invalid = |reason| Err(RelayError::InvalidIdentifier(identifier.to_string(), reason));
    if identifier.is_empty() {
        return invalid("must not be empty");
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return invalid("must be at most 64 characters");
    }
    if identifier.starts_with('.') {
        return invalid("must not start with '.'");
    }
    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("only ASCII alphanumerics, '-', '_' and '.' are allowed");
    }
    Ok(())
}

fn parse_headers(raw: &str) -> Result<Vec<(String, String)>, RelayError> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once(':').ok_or_else(|| {
                RelayError::InvalidConfig(format!("header '{pair}' must be Name:Value"))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(RelayError::InvalidConfig(format!(
                    "header '{pair}' has an empty name"
                )));
            }
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_status_codes(raw: &str) -> Result<Vec<u16>, RelayError> {
    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| parse_number("RELAY_SUCCESS_CODES", code))
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, RelayError> {
    raw.trim()
        .parse()
        .map_err(|_| RelayError::InvalidConfig(format!("{key} has invalid value '{raw}'")))
}
