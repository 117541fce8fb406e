//! Configuration module
//!
//! Configuration is read once from the environment (with `.env` support) into
//! [`Config`], which the API binary hands to every layer it builds.

use std::env;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::constants::{
    ARCHIVE_JOB_MAX_TIMEOUT_SECS, ARCHIVE_JOB_TIMEOUT_SECS, ARCHIVE_LOCK_TTL_SECS,
    ARCHIVE_MAX_ATTEMPTS, ARCHIVE_RANGE_CHUNK_BYTES, DEFAULT_ARCHIVE_PREFIX,
    DEFAULT_ZIP_DOWNLOAD_TTL_MINUTES, MAX_CHUNK_SIZE_BYTES, RECOMMENDED_CHUNK_SIZE_BYTES,
    UPLOAD_SESSION_TTL_HOURS,
};
use crate::storage_types::StorageBackend;

// Common constants
const SERVER_PORT: u16 = 4000;
const MAX_CONNECTIONS: u32 = 20;
const CONNECTION_TIMEOUT_SECS: u64 = 30;
const MIN_SIGNING_SECRET_LEN: usize = 32;

/// Where upload sessions, documents, jobs and tasks are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    Postgres,
    /// Single-process mode; nothing survives a restart.
    Memory,
}

impl FromStr for MetadataBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(MetadataBackend::Postgres),
            "memory" => Ok(MetadataBackend::Memory),
            _ => Err(anyhow::anyhow!("Invalid metadata backend: {}", s)),
        }
    }
}

impl Display for MetadataBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            MetadataBackend::Postgres => write!(f, "postgres"),
            MetadataBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Settings shared by the HTTP server and the worker pool.
#[derive(Clone, Debug)]
pub struct BaseConfig {
    pub server_port: u16,
    pub cors_origins: Vec<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub environment: String,
    pub log_format: String,
}

#[derive(Clone, Debug)]
pub struct QueueworkConfig {
    pub base: BaseConfig,
    pub metadata_backend: MetadataBackend,
    pub database_url: Option<String>,
    // Storage configuration
    pub default_disk: StorageBackend,
    pub archive_disk: Option<StorageBackend>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub aws_region: Option<String>,
    pub local_storage_path: Option<String>,
    pub local_storage_base_url: Option<String>,
    pub signing_secret: Option<String>,
    // Chunked uploads
    pub upload_session_ttl_hours: i64,
    pub upload_recommended_chunk_bytes: u64,
    pub upload_max_chunk_bytes: u64,
    pub session_sweep_interval_secs: u64,
    // Archives
    pub archive_prefix: String,
    pub zip_download_ttl_minutes: u64,
    pub archive_range_chunk_bytes: u64,
    pub archive_job_timeout_seconds: u64,
    pub archive_lock_ttl_seconds: u64,
    // Task queue configuration
    pub task_queue_max_workers: usize,
    pub task_queue_poll_interval_ms: u64,
    pub task_queue_max_attempts: i32,
    /// Interval in seconds between stale task and stale job sweeps. 0 = disabled.
    pub stale_job_reap_interval_secs: u64,
    /// Grace period in seconds added to the job timeout before a running task is reaped.
    pub stale_task_grace_period_secs: i64,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Box<QueueworkConfig>);

impl Config {
    fn inner(&self) -> &QueueworkConfig {
        &self.0
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.inner().base.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let config = QueueworkConfig::from_env()?;
        Ok(Config(Box::new(config)))
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.inner().validate()
    }

    pub fn server_port(&self) -> u16 {
        self.inner().base.server_port
    }

    pub fn cors_origins(&self) -> &[String] {
        &self.inner().base.cors_origins
    }

    pub fn db_max_connections(&self) -> u32 {
        self.inner().base.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.inner().base.db_timeout_seconds
    }

    pub fn environment(&self) -> &str {
        &self.inner().base.environment
    }

    pub fn log_format(&self) -> &str {
        &self.inner().base.log_format
    }

    pub fn metadata_backend(&self) -> MetadataBackend {
        self.inner().metadata_backend
    }

    pub fn database_url(&self) -> Option<&str> {
        self.inner().database_url.as_deref()
    }

    pub fn default_disk(&self) -> StorageBackend {
        self.inner().default_disk
    }

    /// Disk archives are written to; falls back to the default disk.
    pub fn archive_disk(&self) -> StorageBackend {
        self.inner()
            .archive_disk
            .unwrap_or(self.inner().default_disk)
    }

    pub fn s3_bucket(&self) -> Option<&str> {
        self.inner().s3_bucket.as_deref()
    }

    pub fn s3_region(&self) -> Option<&str> {
        self.inner().s3_region.as_deref()
    }

    pub fn s3_endpoint(&self) -> Option<&str> {
        self.inner().s3_endpoint.as_deref()
    }

    pub fn aws_region(&self) -> Option<&str> {
        self.inner().aws_region.as_deref()
    }

    pub fn local_storage_path(&self) -> Option<&str> {
        self.inner().local_storage_path.as_deref()
    }

    pub fn local_storage_base_url(&self) -> Option<&str> {
        self.inner().local_storage_base_url.as_deref()
    }

    pub fn signing_secret(&self) -> Option<&str> {
        self.inner().signing_secret.as_deref()
    }

    pub fn upload_session_ttl_hours(&self) -> i64 {
        self.inner().upload_session_ttl_hours
    }

    pub fn upload_recommended_chunk_bytes(&self) -> u64 {
        self.inner().upload_recommended_chunk_bytes
    }

    pub fn upload_max_chunk_bytes(&self) -> u64 {
        self.inner().upload_max_chunk_bytes
    }

    pub fn session_sweep_interval_secs(&self) -> u64 {
        self.inner().session_sweep_interval_secs
    }

    pub fn archive_prefix(&self) -> &str {
        &self.inner().archive_prefix
    }

    pub fn zip_download_ttl_minutes(&self) -> u64 {
        self.inner().zip_download_ttl_minutes
    }

    pub fn archive_range_chunk_bytes(&self) -> u64 {
        self.inner().archive_range_chunk_bytes
    }

    pub fn archive_job_timeout_seconds(&self) -> u64 {
        self.inner().archive_job_timeout_seconds
    }

    pub fn archive_lock_ttl_seconds(&self) -> u64 {
        self.inner().archive_lock_ttl_seconds
    }

    pub fn task_queue_max_workers(&self) -> usize {
        self.inner().task_queue_max_workers
    }

    pub fn task_queue_poll_interval_ms(&self) -> u64 {
        self.inner().task_queue_poll_interval_ms
    }

    pub fn task_queue_max_attempts(&self) -> i32 {
        self.inner().task_queue_max_attempts
    }

    pub fn stale_job_reap_interval_secs(&self) -> u64 {
        self.inner().stale_job_reap_interval_secs
    }

    pub fn stale_task_grace_period_secs(&self) -> i64 {
        self.inner().stale_task_grace_period_secs
    }
}

fn parse_disk(var: &str) -> Result<Option<StorageBackend>, anyhow::Error> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", var, e)),
        _ => Ok(None),
    }
}

impl QueueworkConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        const SESSION_SWEEP_INTERVAL_SECS: u64 = 600;
        const TASK_QUEUE_MAX_WORKERS: usize = 4;
        const TASK_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
        const STALE_JOB_REAP_INTERVAL_SECS: u64 = 60;
        const STALE_TASK_GRACE_PERIOD_SECS: i64 = 300;

        let environment = env::var("ENVIRONMENT")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string());

        let cors_origins: Vec<String> = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let base = BaseConfig {
            server_port: env::var("PORT")
                .unwrap_or_else(|_| SERVER_PORT.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?,
            cors_origins,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| MAX_CONNECTIONS.to_string())
                .parse()
                .unwrap_or(MAX_CONNECTIONS),
            db_timeout_seconds: env::var("DB_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| CONNECTION_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(CONNECTION_TIMEOUT_SECS),
            environment,
            log_format: env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "text".to_string())
                .to_lowercase(),
        };

        let metadata_backend = env::var("METADATA_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .parse()?;

        let config = QueueworkConfig {
            base,
            metadata_backend,
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            default_disk: parse_disk("FILESYSTEM_DISK")?.unwrap_or(StorageBackend::S3),
            archive_disk: parse_disk("ARCHIVE_DISK")?,
            s3_bucket: env::var("S3_BUCKET").ok(),
            s3_region: env::var("S3_REGION").ok(),
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            aws_region: env::var("AWS_REGION").ok(),
            local_storage_path: env::var("LOCAL_STORAGE_PATH").ok(),
            local_storage_base_url: env::var("LOCAL_STORAGE_BASE_URL").ok(),
            signing_secret: env::var("SIGNING_SECRET").ok().filter(|s| !s.is_empty()),
            upload_session_ttl_hours: env::var("UPLOAD_SESSION_TTL_HOURS")
                .unwrap_or_else(|_| UPLOAD_SESSION_TTL_HOURS.to_string())
                .parse()
                .unwrap_or(UPLOAD_SESSION_TTL_HOURS),
            upload_recommended_chunk_bytes: env::var("UPLOAD_RECOMMENDED_CHUNK_BYTES")
                .unwrap_or_else(|_| RECOMMENDED_CHUNK_SIZE_BYTES.to_string())
                .parse()
                .unwrap_or(RECOMMENDED_CHUNK_SIZE_BYTES),
            upload_max_chunk_bytes: env::var("UPLOAD_MAX_CHUNK_BYTES")
                .unwrap_or_else(|_| MAX_CHUNK_SIZE_BYTES.to_string())
                .parse()
                .unwrap_or(MAX_CHUNK_SIZE_BYTES),
            session_sweep_interval_secs: env::var("SESSION_SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| SESSION_SWEEP_INTERVAL_SECS.to_string())
                .parse()
                .unwrap_or(SESSION_SWEEP_INTERVAL_SECS),
            archive_prefix: env::var("ZIP_ARCHIVE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_ARCHIVE_PREFIX.to_string())
                .trim_matches('/')
                .to_string(),
            zip_download_ttl_minutes: env::var("ZIP_DOWNLOAD_TTL")
                .unwrap_or_else(|_| DEFAULT_ZIP_DOWNLOAD_TTL_MINUTES.to_string())
                .parse()
                .unwrap_or(DEFAULT_ZIP_DOWNLOAD_TTL_MINUTES),
            archive_range_chunk_bytes: env::var("ARCHIVE_RANGE_CHUNK_BYTES")
                .unwrap_or_else(|_| ARCHIVE_RANGE_CHUNK_BYTES.to_string())
                .parse()
                .unwrap_or(ARCHIVE_RANGE_CHUNK_BYTES),
            archive_job_timeout_seconds: env::var("ARCHIVE_JOB_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| ARCHIVE_JOB_TIMEOUT_SECS.to_string())
                .parse()
                .unwrap_or(ARCHIVE_JOB_TIMEOUT_SECS),
            archive_lock_ttl_seconds: env::var("ARCHIVE_LOCK_TTL_SECONDS")
                .unwrap_or_else(|_| ARCHIVE_LOCK_TTL_SECS.to_string())
                .parse()
                .unwrap_or(ARCHIVE_LOCK_TTL_SECS),
            task_queue_max_workers: env::var("TASK_QUEUE_MAX_WORKERS")
                .unwrap_or_else(|_| TASK_QUEUE_MAX_WORKERS.to_string())
                .parse()
                .unwrap_or(TASK_QUEUE_MAX_WORKERS),
            task_queue_poll_interval_ms: env::var("TASK_QUEUE_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| TASK_QUEUE_POLL_INTERVAL_MS.to_string())
                .parse()
                .unwrap_or(TASK_QUEUE_POLL_INTERVAL_MS),
            task_queue_max_attempts: env::var("TASK_QUEUE_MAX_ATTEMPTS")
                .unwrap_or_else(|_| ARCHIVE_MAX_ATTEMPTS.to_string())
                .parse()
                .unwrap_or(ARCHIVE_MAX_ATTEMPTS),
            stale_job_reap_interval_secs: env::var("STALE_JOB_REAP_INTERVAL_SECS")
                .unwrap_or_else(|_| STALE_JOB_REAP_INTERVAL_SECS.to_string())
                .parse()
                .unwrap_or(STALE_JOB_REAP_INTERVAL_SECS),
            stale_task_grace_period_secs: env::var("STALE_TASK_GRACE_PERIOD_SECS")
                .unwrap_or_else(|_| STALE_TASK_GRACE_PERIOD_SECS.to_string())
                .parse()
                .unwrap_or(STALE_TASK_GRACE_PERIOD_SECS),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let is_production = matches!(
            self.base.environment.to_lowercase().as_str(),
            "production" | "prod"
        );

        if is_production && self.base.cors_origins.iter().any(|o| o == "*") {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS cannot be '*' in production. Please specify explicit origins."
            ));
        }

        if self.metadata_backend == MetadataBackend::Postgres {
            match self.database_url.as_deref() {
                Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {}
                Some(_) => {
                    return Err(anyhow::anyhow!(
                        "DATABASE_URL must be a valid PostgreSQL connection string"
                    ))
                }
                None => {
                    return Err(anyhow::anyhow!(
                        "DATABASE_URL must be set when METADATA_BACKEND=postgres"
                    ))
                }
            }
        }

        if !self.default_disk.is_remote() {
            return Err(anyhow::anyhow!(
                "FILESYSTEM_DISK must name a remote object disk (s3); chunked uploads require it"
            ));
        }

        let uses_local = self.archive_disk == Some(StorageBackend::Local);
        if (uses_local || self.local_storage_path.is_some())
            && self
                .signing_secret
                .as_ref()
                .map(|s| s.len() < MIN_SIGNING_SECRET_LEN)
                .unwrap_or(true)
        {
            return Err(anyhow::anyhow!(
                "SIGNING_SECRET must be at least {} characters when the local disk is configured",
                MIN_SIGNING_SECRET_LEN
            ));
        }

        if self.archive_job_timeout_seconds == 0
            || self.archive_job_timeout_seconds > ARCHIVE_JOB_MAX_TIMEOUT_SECS
        {
            return Err(anyhow::anyhow!(
                "ARCHIVE_JOB_TIMEOUT_SECONDS must be between 1 and {}",
                ARCHIVE_JOB_MAX_TIMEOUT_SECS
            ));
        }

        if self.archive_lock_ttl_seconds < self.archive_job_timeout_seconds {
            return Err(anyhow::anyhow!(
                "ARCHIVE_LOCK_TTL_SECONDS must not be shorter than ARCHIVE_JOB_TIMEOUT_SECONDS"
            ));
        }

        if self.upload_recommended_chunk_bytes == 0
            || self.upload_recommended_chunk_bytes > self.upload_max_chunk_bytes
        {
            return Err(anyhow::anyhow!(
                "UPLOAD_RECOMMENDED_CHUNK_BYTES must be between 1 and UPLOAD_MAX_CHUNK_BYTES"
            ));
        }

        if self.archive_range_chunk_bytes == 0 {
            return Err(anyhow::anyhow!("ARCHIVE_RANGE_CHUNK_BYTES must be positive"));
        }

        if self.task_queue_max_attempts < 1 {
            return Err(anyhow::anyhow!("TASK_QUEUE_MAX_ATTEMPTS must be at least 1"));
        }

        Ok(())
    }
}

impl Default for QueueworkConfig {
    /// In-memory metadata with the documented defaults; used by tests and local runs.
    fn default() -> Self {
        QueueworkConfig {
            base: BaseConfig {
                server_port: SERVER_PORT,
                cors_origins: vec!["*".to_string()],
                db_max_connections: MAX_CONNECTIONS,
                db_timeout_seconds: CONNECTION_TIMEOUT_SECS,
                environment: "development".to_string(),
                log_format: "text".to_string(),
            },
            metadata_backend: MetadataBackend::Memory,
            database_url: None,
            default_disk: StorageBackend::S3,
            archive_disk: None,
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            aws_region: None,
            local_storage_path: None,
            local_storage_base_url: None,
            signing_secret: None,
            upload_session_ttl_hours: UPLOAD_SESSION_TTL_HOURS,
            upload_recommended_chunk_bytes: RECOMMENDED_CHUNK_SIZE_BYTES,
            upload_max_chunk_bytes: MAX_CHUNK_SIZE_BYTES,
            session_sweep_interval_secs: 600,
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            zip_download_ttl_minutes: DEFAULT_ZIP_DOWNLOAD_TTL_MINUTES,
            archive_range_chunk_bytes: ARCHIVE_RANGE_CHUNK_BYTES,
            archive_job_timeout_seconds: ARCHIVE_JOB_TIMEOUT_SECS,
            archive_lock_ttl_seconds: ARCHIVE_LOCK_TTL_SECS,
            task_queue_max_workers: 4,
            task_queue_poll_interval_ms: 1000,
            task_queue_max_attempts: ARCHIVE_MAX_ATTEMPTS,
            stale_job_reap_interval_secs: 60,
            stale_task_grace_period_secs: 300,
        }
    }
}
