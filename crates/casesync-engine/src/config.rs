//! Settings read once from the environment at process start.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use casesync_db::PgSslMode;

use crate::error::ConfigError;
use crate::observability::LogFormat;

const DEFAULT_DATABASE_NAME: &str = "blaise";
const DEFAULT_DATABASE_PORT: u16 = 5432;
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_HTTP_PORT: u16 = 8080;

/// What a run does once one questionnaire has failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Record the failure and continue with the next questionnaire.
    #[default]
    Isolate,
    /// Stop the run after the first failure.
    Abort,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "isolate" => Ok(Self::Isolate),
            "abort" => Ok(Self::Abort),
            other => Err(format!("expected 'isolate' or 'abort', got '{other}'")),
        }
    }
}

/// Column names the merge statement relies on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeColumns {
    /// Conflict key of the target table.
    pub key: String,
    /// Rows with this column equal to `1` are never copied.
    pub edited_flag: String,
    /// Columns overwritten when a key already exists in the target.
    pub mutable: Vec<String>,
}

impl Default for MergeColumns {
    fn default() -> Self {
        Self {
            key: "Serial_Number".to_string(),
            edited_flag: "QEdit_edited".to_string(),
            mutable: vec!["QEdit_LastUpdated".to_string(), "DataStream".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlaiseConfig {
    pub api_url: String,
    pub server_park: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    Sqlite {
        path: PathBuf,
        pool_size: usize,
    },
    Postgres {
        host: String,
        port: u16,
        username: String,
        password: String,
        name: String,
        ssl_mode: PgSslMode,
        pool_size: usize,
    },
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite { path, pool_size } => f
                .debug_struct("Sqlite")
                .field("path", path)
                .field("pool_size", pool_size)
                .finish(),
            Self::Postgres {
                host,
                port,
                username,
                name,
                ssl_mode,
                pool_size,
                ..
            } => f
                .debug_struct("Postgres")
                .field("host", host)
                .field("port", port)
                .field("username", username)
                .field("password", &"<redacted>")
                .field("name", name)
                .field("ssl_mode", ssl_mode)
                .field("pool_size", pool_size)
                .finish(),
        }
    }
}

/// Everything a sync run needs, built once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub blaise: BlaiseConfig,
    pub database: DatabaseConfig,
    pub failure_policy: FailurePolicy,
    pub run_timeout: Option<Duration>,
    pub columns: MergeColumns,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env::new(lookup);

        let api_url = env.required("BLAISE_API_URL");
        let server_park = env.required("BLAISE_SERVER_PARK");
        let sqlite_path = env.get("SQLITE_PATH");
        let postgres = if sqlite_path.is_none() {
            Some((
                env.required("INSTANCE_NAME"),
                env.required("DATABASE_USERNAME"),
                env.required("DATABASE_PASSWORD"),
            ))
        } else {
            None
        };
        env.finish_required()?;

        let pool_size = env.parsed("DATABASE_POOL_SIZE", DEFAULT_POOL_SIZE)?;
        if pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "DATABASE_POOL_SIZE".to_string(),
                value: "0".to_string(),
                reason: "pool size must be at least 1".to_string(),
            });
        }

        let database = match sqlite_path {
            Some(path) => DatabaseConfig::Sqlite {
                path: PathBuf::from(path),
                pool_size,
            },
            None => {
                let (host, username, password) = postgres.unwrap_or_default();
                DatabaseConfig::Postgres {
                    host: host.unwrap_or_default(),
                    port: env.parsed("DATABASE_PORT", DEFAULT_DATABASE_PORT)?,
                    username: username.unwrap_or_default(),
                    password: password.unwrap_or_default(),
                    name: env
                        .get("DATABASE_NAME")
                        .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string()),
                    ssl_mode: env.parsed("DATABASE_SSL_MODE", PgSslMode::default())?,
                    pool_size,
                }
            }
        };

        let run_timeout = match env.get("SYNC_RUN_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value("SYNC_RUN_TIMEOUT_SECS", &raw)?)),
            None => None,
        };

        Ok(Self {
            blaise: BlaiseConfig {
                api_url: api_url.unwrap_or_default(),
                server_park: server_park.unwrap_or_default(),
            },
            database,
            failure_policy: env.parsed("SYNC_FAILURE_POLICY", FailurePolicy::default())?,
            run_timeout,
            columns: MergeColumns::default(),
        })
    }
}

/// Settings of the HTTP worker itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub port: u16,
    pub log_format: LogFormat,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env::new(lookup);
        Ok(Self {
            port: env.parsed("PORT", DEFAULT_HTTP_PORT)?,
            log_format: env.parsed("LOG_FORMAT", LogFormat::default())?,
        })
    }
}

struct Env<F> {
    lookup: F,
    missing: std::cell::RefCell<Vec<String>>,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn new(lookup: F) -> Self {
        Self {
            lookup,
            missing: std::cell::RefCell::new(Vec::new()),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    /// Reads `key`, remembering it for [`finish_required`](Self::finish_required) when unset.
    fn required(&self, key: &str) -> Option<String> {
        let value = self.get(key);
        if value.is_none() {
            self.missing.borrow_mut().push(key.to_ascii_lowercase());
        }
        value
    }

    fn finish_required(&self) -> Result<(), ConfigError> {
        let missing = self.missing.take();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing { fields: missing })
        }
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
        reason: err.to_string(),
    })
}
