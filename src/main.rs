//! gcs -- command-line access to Cloud Storage.
//!
//! Credentials come from the configuration file (or Application Default
//! Credentials when there is none).  `STORAGE_EMULATOR_HOST` points every
//! command at a local emulator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use futures_util::StreamExt;
use http::Method;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use gcsclient::config::{load_config, ClientConfig, LoggingConfig};
use gcsclient::signing::{ServiceAccountSigner, SignedUrlConfig, SignedUrlVersion};
use gcsclient::{DownloadOptions, ListBucketsQuery, ListObjectsQuery, Preconditions, Storage, UploadOptions};

/// Command-line arguments for gcs.
#[derive(Parser, Debug)]
#[command(name = "gcs", version, about = "Cloud Storage command-line client")]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project for bucket listing (overrides the configuration).
    #[arg(short, long, global = true)]
    project: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List buckets in the project.
    Buckets {
        #[arg(long)]
        prefix: Option<String>,
    },
    /// List objects under gs://bucket/prefix.
    Ls {
        url: String,
        /// List every object instead of one directory level.
        #[arg(short, long)]
        recursive: bool,
        /// Include noncurrent generations.
        #[arg(short = 'a', long)]
        all_versions: bool,
    },
    /// Print an object's metadata as JSON.
    Stat { url: String },
    /// Write an object's contents to stdout.
    Cat { url: String },
    /// Upload a local file.
    Upload {
        file: PathBuf,
        url: String,
        #[arg(long)]
        content_type: Option<String>,
        /// Only replace this generation (0: only create).
        #[arg(long)]
        if_generation_match: Option<i64>,
    },
    /// Download an object to a local file.
    Download { url: String, file: PathBuf },
    /// Delete an object.
    Rm {
        url: String,
        #[arg(long)]
        generation: Option<i64>,
    },
    /// Print a signed URL for an object.
    SignUrl {
        url: String,
        /// Service account key file used for signing.
        #[arg(short, long)]
        key_file: String,
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Lifetime in seconds.
        #[arg(short, long, default_value_t = 3600)]
        expires: i64,
        #[arg(long, value_enum, default_value_t = Version::V4)]
        signing_version: Version,
        /// Content type the holder must send (uploads).
        #[arg(long)]
        content_type: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Version {
    V2,
    V4,
}

/// Split `gs://bucket/path` into bucket and (possibly empty) path.
fn parse_gs_url(url: &str) -> anyhow::Result<(String, String)> {
    let rest = url
        .strip_prefix("gs://")
        .with_context(|| format!("expected a gs:// URL, got {url}"))?;
    let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        bail!("missing bucket name in {url}");
    }
    Ok((bucket.to_string(), path.to_string()))
}

fn parse_object_url(url: &str) -> anyhow::Result<(String, String)> {
    let (bucket, object) = parse_gs_url(url)?;
    if object.is_empty() {
        bail!("missing object name in {url}");
    }
    Ok((bucket, object))
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(cli: &Cli) -> anyhow::Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let mut config = ClientConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(project) = &cli.project {
        config.project_id = Some(project.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load(&cli)?;
    init_logging(&config.logging);
    gcsclient::metrics::describe_metrics();
    debug!("Using endpoint {}", config.api.endpoint);

    let storage = Storage::from_config(config)?;
    run(storage, cli.command).await
}

async fn run(storage: Storage, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Buckets { prefix } => {
            let query = ListBucketsQuery {
                prefix,
                ..ListBucketsQuery::default()
            };
            for bucket in storage.list_buckets(&query).await?.items {
                println!("gs://{}/", bucket.name);
            }
        }
        Command::Ls {
            url,
            recursive,
            all_versions,
        } => {
            let (bucket, prefix) = parse_gs_url(&url)?;
            let query = ListObjectsQuery {
                prefix: (!prefix.is_empty()).then_some(prefix),
                delimiter: (!recursive).then(|| "/".to_string()),
                versions: all_versions,
                ..ListObjectsQuery::default()
            };
            let page = storage.bucket(&bucket).get_files(&query).await?;
            for dir in page.prefixes {
                println!("gs://{bucket}/{dir}");
            }
            for object in page.items {
                match (all_versions, object.generation) {
                    (true, Some(generation)) => {
                        println!("gs://{bucket}/{}#{generation}", object.name)
                    }
                    _ => println!("gs://{bucket}/{}", object.name),
                }
            }
        }
        Command::Stat { url } => {
            let (bucket, name) = parse_object_url(&url)?;
            let object = storage.bucket(bucket).object(name).get_metadata().await?;
            println!("{}", serde_json::to_string_pretty(&object)?);
        }
        Command::Cat { url } => {
            let (bucket, name) = parse_object_url(&url)?;
            let mut reader = storage
                .bucket(bucket)
                .object(name)
                .read_stream(&DownloadOptions::default())
                .await?;
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = reader.next().await {
                stdout.write_all(&chunk?).await?;
            }
            stdout.flush().await?;
        }
        Command::Upload {
            file,
            url,
            content_type,
            if_generation_match,
        } => {
            let (bucket, name) = parse_object_url(&url)?;
            let mut options = UploadOptions::default();
            options.metadata.content_type = content_type;
            if let Some(generation) = if_generation_match {
                options.preconditions = Preconditions::if_generation_match(generation);
            }
            let object = storage
                .bucket(bucket)
                .object(name)
                .upload_from_file(&file, &options)
                .await
                .with_context(|| format!("uploading {}", file.display()))?;
            info!(
                "Uploaded {} to {} (generation {:?})",
                file.display(),
                url,
                object.generation
            );
        }
        Command::Download { url, file } => {
            let (bucket, name) = parse_object_url(&url)?;
            let bytes = storage
                .bucket(bucket)
                .object(name)
                .download_to_file(&file)
                .await?;
            info!("Downloaded {} bytes to {}", bytes, file.display());
        }
        Command::Rm { url, generation } => {
            let (bucket, name) = parse_object_url(&url)?;
            let mut object = storage.bucket(bucket).object(name);
            if let Some(generation) = generation {
                object = object.with_generation(generation);
            }
            object.delete(&Preconditions::default()).await?;
            info!("Removed {}", url);
        }
        Command::SignUrl {
            url,
            key_file,
            method,
            expires,
            signing_version,
            content_type,
        } => {
            let (bucket, name) = parse_object_url(&url)?;
            let signer = ServiceAccountSigner::from_file(&key_file)?;
            let storage = storage.with_signer(Arc::new(signer));
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method {method}"))?;
            let mut config =
                SignedUrlConfig::new(method, Utc::now() + chrono::Duration::seconds(expires));
            config.version = match signing_version {
                Version::V2 => SignedUrlVersion::V2,
                Version::V4 => SignedUrlVersion::V4,
            };
            config.content_type = content_type;
            let signed = storage
                .bucket(bucket)
                .object(name)
                .get_signed_url(&config)
                .await?;
            println!("{signed}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gs_url() {
        assert_eq!(
            parse_gs_url("gs://b/dir/file.txt").unwrap(),
            ("b".to_string(), "dir/file.txt".to_string())
        );
        assert_eq!(parse_gs_url("gs://b").unwrap(), ("b".to_string(), String::new()));
        assert!(parse_gs_url("s3://b/o").is_err());
        assert!(parse_gs_url("gs:///o").is_err());
        assert!(parse_object_url("gs://b/").is_err());
    }

    #[test]
    fn test_cli_parses_sign_url() {
        let cli = Cli::try_parse_from([
            "gcs", "sign-url", "gs://b/o", "--key-file", "key.json", "-m", "put", "-e", "600",
            "--signing-version", "v2",
        ])
        .unwrap();
        match cli.command {
            Command::SignUrl {
                method,
                expires,
                signing_version,
                ..
            } => {
                assert_eq!(method, "put");
                assert_eq!(expires, 600);
                assert!(matches!(signing_version, Version::V2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
