// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service configuration.
//
// Built once at startup from the environment and passed explicitly to every
// component that needs it. Missing or invalid required values fail startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TillprintError};
use crate::types::{DEFAULT_PRINTER_PORT, PrinterProtocol, PrinterTarget};

/// Minimum length of the token signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Narrowest paper the receipt layout supports, in characters.
pub const MIN_COLUMNS: usize = 24;

const MAX_COLUMNS: usize = 96;

/// Character encoding used when turning receipt text into printer bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    /// Code page 437 with Latin accents mapped; unknown characters become `?`.
    #[default]
    Cp437,
    /// 7-bit ASCII only. Anything else is a render error.
    Ascii,
}

impl FromStr for TextEncoding {
    type Err = TillprintError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cp437" => Ok(Self::Cp437),
            "ascii" => Ok(Self::Ascii),
            other => Err(TillprintError::Config(format!("unknown text encoding {other:?}"))),
        }
    }
}

/// HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    /// Origins allowed by CORS. Empty means same-origin only.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8600)),
            allowed_origins: Vec::new(),
        }
    }
}

/// Credentials accepted on the enqueue/inspect API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret for signed bearer tokens.
    #[serde(skip_serializing)]
    pub secret: String,
    /// Static API keys, accepted as bearer credentials as-is.
    #[serde(skip_serializing)]
    pub api_keys: Vec<String>,
}

/// Receipt printer defaults and the render profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterSettings {
    /// Used when an enqueue request names no target.
    pub default_target: Option<PrinterTarget>,
    /// Characters per line (42 for 80 mm paper in font A).
    pub columns: usize,
    pub encoding: TextEncoding,
}

impl Default for PrinterSettings {
    fn default() -> Self {
        Self {
            default_target: None,
            columns: 42,
            encoding: TextEncoding::Cp437,
        }
    }
}

/// Shared store location and housekeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub path: PathBuf,
    /// How long `Succeeded`/`Dead` jobs are kept before purging.
    pub retention: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tillprint.db"),
            retention: Duration::from_secs(72 * 3600),
        }
    }
}

/// Tunables for dispatch, retry, pooling and idempotency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub workers: usize,
    pub lease: Duration,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
    pub transmit_timeout: Duration,
    pub pool_max_per_target: usize,
    pub pool_acquire_timeout: Duration,
    pub pool_fail_fast: bool,
    /// Must be longer than `lease`.
    pub idempotency_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: Duration::from_secs(1),
            transmit_timeout: Duration::from_secs(10),
            pool_max_per_target: 2,
            pool_acquire_timeout: Duration::from_secs(5),
            pool_fail_fast: false,
            idempotency_window: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl DispatchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(TillprintError::Config("at least one dispatcher worker is required".into()));
        }
        if self.lease.is_zero() {
            return Err(TillprintError::Config("lease duration must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(TillprintError::Config("max attempts must be at least 1".into()));
        }
        if self.base_delay > self.max_delay {
            return Err(TillprintError::Config(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if self.transmit_timeout.is_zero() {
            return Err(TillprintError::Config("transmit timeout must be positive".into()));
        }
        // A send must finish or time out while its claim still holds the
        // lease, otherwise the sweeper hands the job to a second worker.
        let longest_attempt = self.pool_acquire_timeout + self.transmit_timeout;
        if self.lease <= longest_attempt {
            return Err(TillprintError::Config(format!(
                "lease {:?} must exceed pool acquire timeout plus transmit timeout ({:?})",
                self.lease, longest_attempt
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(TillprintError::Config("poll interval must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(TillprintError::Config("sweep interval must be positive".into()));
        }
        if self.pool_max_per_target == 0 {
            return Err(TillprintError::Config("pool cap per target must be at least 1".into()));
        }
        if self.idempotency_window <= self.lease {
            return Err(TillprintError::Config(format!(
                "idempotency window {:?} must exceed the lease {:?}",
                self.idempotency_window, self.lease
            )));
        }
        Ok(())
    }
}

/// The whole service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub printer: PrinterSettings,
    pub store: StoreSettings,
    pub dispatch: DispatchSettings,
}

impl ServiceConfig {
    /// Read `TILLPRINT_*` variables from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let secret = env
            .string("TILLPRINT_AUTH_SECRET")
            .ok_or_else(|| TillprintError::Config("TILLPRINT_AUTH_SECRET must be set".into()))?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(TillprintError::Config(format!(
                "TILLPRINT_AUTH_SECRET must be at least {MIN_SECRET_LEN} bytes"
            )));
        }

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            listen_addr: env.parse("TILLPRINT_LISTEN_ADDR", server_defaults.listen_addr)?,
            allowed_origins: env.list("TILLPRINT_ALLOWED_ORIGINS"),
        };

        let auth = AuthSettings {
            secret,
            api_keys: env.list("TILLPRINT_API_KEYS"),
        };

        let printer_defaults = PrinterSettings::default();
        let default_target = match env.string("TILLPRINT_DEFAULT_PRINTER_HOST") {
            Some(host) => {
                let target = PrinterTarget::new(
                    host,
                    env.parse("TILLPRINT_DEFAULT_PRINTER_PORT", DEFAULT_PRINTER_PORT)?,
                    env.parse("TILLPRINT_DEFAULT_PRINTER_PROTOCOL", PrinterProtocol::EscPos)?,
                );
                target
                    .validate()
                    .map_err(|e| TillprintError::Config(format!("default printer: {e}")))?;
                Some(target)
            }
            None => None,
        };
        let printer = PrinterSettings {
            default_target,
            columns: env.parse("TILLPRINT_PRINTER_COLUMNS", printer_defaults.columns)?,
            encoding: env.parse("TILLPRINT_PRINTER_ENCODING", printer_defaults.encoding)?,
        };
        if !(MIN_COLUMNS..=MAX_COLUMNS).contains(&printer.columns) {
            return Err(TillprintError::Config(format!(
                "TILLPRINT_PRINTER_COLUMNS must be between {MIN_COLUMNS} and {MAX_COLUMNS}"
            )));
        }

        let store_defaults = StoreSettings::default();
        let store = StoreSettings {
            path: env
                .string("TILLPRINT_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or(store_defaults.path),
            retention: env.hours("TILLPRINT_RETENTION_HOURS", store_defaults.retention)?,
        };

        let d = DispatchSettings::default();
        let dispatch = DispatchSettings {
            workers: env.parse("TILLPRINT_WORKERS", d.workers)?,
            lease: env.secs("TILLPRINT_LEASE_SECS", d.lease)?,
            poll_interval: env.millis("TILLPRINT_POLL_MS", d.poll_interval)?,
            max_attempts: env.parse("TILLPRINT_MAX_ATTEMPTS", d.max_attempts)?,
            base_delay: env.millis("TILLPRINT_BASE_DELAY_MS", d.base_delay)?,
            max_delay: env.millis("TILLPRINT_MAX_DELAY_MS", d.max_delay)?,
            jitter: env.millis("TILLPRINT_JITTER_MS", d.jitter)?,
            transmit_timeout: env.millis("TILLPRINT_TRANSMIT_TIMEOUT_MS", d.transmit_timeout)?,
            pool_max_per_target: env.parse("TILLPRINT_POOL_MAX_PER_TARGET", d.pool_max_per_target)?,
            pool_acquire_timeout: env
                .millis("TILLPRINT_POOL_ACQUIRE_TIMEOUT_MS", d.pool_acquire_timeout)?,
            pool_fail_fast: env.parse("TILLPRINT_POOL_FAIL_FAST", d.pool_fail_fast)?,
            idempotency_window: env
                .secs("TILLPRINT_IDEMPOTENCY_WINDOW_SECS", d.idempotency_window)?,
            sweep_interval: env.secs("TILLPRINT_SWEEP_SECS", d.sweep_interval)?,
        };
        dispatch.validate()?;

        Ok(Self {
            server,
            auth,
            printer,
            store,
            dispatch,
        })
    }
}

/// Typed access to a variable source.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value, trimmed.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| TillprintError::Config(format!("{key}={raw:?}: {e}"))),
            None => Ok(default),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.string(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        let ms = self.parse(key, default.as_millis() as u64)?;
        Ok(Duration::from_millis(ms))
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        let secs = self.parse(key, default.as_secs())?;
        Ok(Duration::from_secs(secs))
    }

    fn hours(&self, key: &str, default: Duration) -> Result<Duration> {
        let hours = self.parse(key, default.as_secs() / 3600)?;
        Ok(Duration::from_secs(hours.saturating_mul(3600)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn build(vars: &[(&str, &str)]) -> Result<ServiceConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_with_only_the_secret() {
        let config = build(&[("TILLPRINT_AUTH_SECRET", SECRET)]).expect("config");
        assert_eq!(config.server.listen_addr.port(), 8600);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert!(config.printer.default_target.is_none());
        assert!(config.auth.api_keys.is_empty());
    }

    #[test]
    fn missing_secret_fails_startup() {
        assert!(matches!(build(&[]), Err(TillprintError::Config(_))));
    }

    #[test]
    fn short_secret_fails_startup() {
        let err = build(&[("TILLPRINT_AUTH_SECRET", "short")]).unwrap_err();
        assert!(err.to_string().contains("at least"));
    }

    #[test]
    fn default_printer_is_assembled() {
        let config = build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_DEFAULT_PRINTER_HOST", "192.168.1.40"),
            ("TILLPRINT_DEFAULT_PRINTER_PROTOCOL", "star"),
        ])
        .expect("config");
        let target = config.printer.default_target.expect("target");
        assert_eq!(target.host, "192.168.1.40");
        assert_eq!(target.port, DEFAULT_PRINTER_PORT);
        assert_eq!(target.protocol, PrinterProtocol::StarPrnt);
    }

    #[test]
    fn unparsable_number_is_reported_with_its_key() {
        let err = build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_WORKERS", "many"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("TILLPRINT_WORKERS"));
    }

    #[test]
    fn idempotency_window_must_outlive_the_lease() {
        let err = build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_LEASE_SECS", "60"),
            ("TILLPRINT_IDEMPOTENCY_WINDOW_SECS", "60"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("idempotency window"));
    }

    #[test]
    fn lease_must_outlive_a_whole_attempt() {
        let err = build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_LEASE_SECS", "1"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("transmit timeout"));

        // 5 s acquire + 10 s transmit leaves exactly 15 s: still too short.
        assert!(build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_LEASE_SECS", "15"),
        ])
        .is_err());
        assert!(build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_LEASE_SECS", "16"),
        ])
        .is_ok());
    }

    #[test]
    fn zero_intervals_fail_startup() {
        let err = build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_SWEEP_SECS", "0"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("sweep interval"));

        let err = build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_POLL_MS", "0"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("poll interval"));
    }

    #[test]
    fn lists_are_split_and_trimmed() {
        let config = build(&[
            ("TILLPRINT_AUTH_SECRET", SECRET),
            ("TILLPRINT_API_KEYS", " key-one , ,key-two"),
            ("TILLPRINT_ALLOWED_ORIGINS", "https://shop.example"),
        ])
        .expect("config");
        assert_eq!(config.auth.api_keys, vec!["key-one", "key-two"]);
        assert_eq!(config.server.allowed_origins, vec!["https://shop.example"]);
    }
}
