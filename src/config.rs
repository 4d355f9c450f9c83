use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr};
use url::Url;

/// Default cap on a single upload request body (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 << 20;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub signing_secret: String,
    pub public_url: Url,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Object storage gateway with presigned links and live bucket events")]
pub struct Args {
    /// Host to bind to (overrides BUCKET_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BUCKET_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides BUCKET_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides BUCKET_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket served by this instance (overrides BUCKET_GATEWAY_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Externally reachable base URL used in download links
    /// (overrides BUCKET_GATEWAY_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Maximum upload request size in bytes (overrides BUCKET_GATEWAY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over variables looked up through `var`, then defaults.
    pub fn from_sources(args: Args, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = args
            .host
            .or_else(|| var("BUCKET_GATEWAY_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "BUCKET_GATEWAY_PORT")?.unwrap_or(8080),
        };
        let storage_dir = args
            .storage_dir
            .or_else(|| var("BUCKET_GATEWAY_STORAGE_DIR"))
            .unwrap_or_else(|| "./data/objects".into());
        let database_url = args
            .database_url
            .or_else(|| var("BUCKET_GATEWAY_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/gateway.db".into());
        let max_upload_bytes = match args.max_upload_bytes {
            Some(limit) => limit,
            None => parse_var(&var, "BUCKET_GATEWAY_MAX_UPLOAD_BYTES")?
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
        };

        let Some(bucket) = args
            .bucket
            .or_else(|| var("BUCKET_GATEWAY_BUCKET"))
            .filter(|b| !b.is_empty())
        else {
            bail!("BUCKET_GATEWAY_BUCKET must be set");
        };
        let Some(signing_secret) = var("BUCKET_GATEWAY_SIGNING_SECRET").filter(|s| !s.is_empty())
        else {
            bail!("BUCKET_GATEWAY_SIGNING_SECRET must be set");
        };

        let public_url = match args.public_url.or_else(|| var("BUCKET_GATEWAY_PUBLIC_URL")) {
            Some(raw) => {
                Url::parse(&raw).with_context(|| format!("parsing public URL `{}`", raw))?
            }
            None => {
                let reachable = match host.as_str() {
                    "0.0.0.0" | "::" => "localhost",
                    other => other,
                };
                Url::parse(&format!("http://{}:{}", reachable, port))
                    .context("building default public URL")?
            }
        };

        Ok(Self {
            host,
            port,
            storage_dir,
            database_url,
            bucket,
            signing_secret,
            public_url,
            max_upload_bytes,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", name, value))
        })
        .transpose()
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("bucket", &self.bucket)
            .field("signing_secret", &"<redacted>")
            .field("public_url", &self.public_url.as_str())
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}
