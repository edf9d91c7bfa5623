//! Extract download, gzip decompression and atomic publication into the
//! local storage root.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tlc_core::ExtractDescriptor;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tlc-storage";

const INFLATE_BUF_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decompressing {}: {source}", path.display())]
    Decompress {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    fn io<'a>(context: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| DownloadError::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A decompressed extract published under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedExtract {
    pub path: PathBuf,
    pub filename: String,
    pub byte_size: u64,
    pub content_sha256: String,
    pub fetched_at: DateTime<Utc>,
}

/// Local scratch directory holding decompressed extracts.
#[derive(Debug, Clone)]
pub struct ExtractStore {
    root: PathBuf,
}

impl ExtractStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn published_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Hidden sibling of the published path; never read by later steps.
    fn temp_path(&self, filename: &str, suffix: &str) -> PathBuf {
        self.root
            .join(format!(".{filename}.{}.{suffix}.tmp", Uuid::new_v4()))
    }

    async fn ensure_root(&self) -> Result<(), DownloadError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(DownloadError::io("creating storage root", &self.root))
    }

    async fn publish(&self, temp_path: &Path, filename: &str) -> Result<PathBuf, DownloadError> {
        let final_path = self.published_path(filename);
        match fs::rename(temp_path, &final_path).await {
            Ok(()) => Ok(final_path),
            Err(err) => {
                let _ = fs::remove_file(temp_path).await;
                Err(DownloadError::Io {
                    context: "publishing extract",
                    path: final_path,
                    source: err,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// Whole-request timeout. `None` leaves run-level timeouts to the caller.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

/// Downloads monthly extracts and publishes them decompressed.
#[derive(Debug, Clone)]
pub struct ExtractFetcher {
    client: reqwest::Client,
    base_url: String,
    store: ExtractStore,
}

impl ExtractFetcher {
    pub fn new(
        config: HttpClientConfig,
        base_url: impl Into<String>,
        store: ExtractStore,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            store,
        })
    }

    pub fn url_for(&self, descriptor: &ExtractDescriptor) -> String {
        descriptor.url(&self.base_url)
    }

    /// Stream the compressed extract to disk, inflate it and atomically
    /// publish the CSV. Nothing is left at the published path when this
    /// returns an error.
    pub async fn fetch(&self, descriptor: &ExtractDescriptor) -> Result<FetchedExtract, DownloadError> {
        let url = self.url_for(descriptor);
        let span = info_span!(
            "extract_fetch",
            category = %descriptor.category,
            period = %descriptor.period,
            url = %url,
        );
        self.fetch_inner(url, descriptor.filename())
            .instrument(span)
            .await
    }

    async fn fetch_inner(&self, url: String, filename: String) -> Result<FetchedExtract, DownloadError> {
        self.store.ensure_root().await?;
        let gz_tmp = self.store.temp_path(&filename, "gz");
        let csv_tmp = self.store.temp_path(&filename, "csv");

        info!(dest = %self.store.published_path(&filename).display(), "downloading extract");
        let inflated = match self.download_to(&url, &gz_tmp).await {
            Ok(compressed) => {
                debug!(compressed_bytes = compressed, "download complete, inflating");
                inflate_blocking(gz_tmp.clone(), csv_tmp.clone()).await
            }
            Err(err) => Err(err),
        };
        let _ = fs::remove_file(&gz_tmp).await;

        let (byte_size, content_sha256) = match inflated {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&csv_tmp).await;
                return Err(err);
            }
        };

        let path = self.store.publish(&csv_tmp, &filename).await?;
        info!(bytes = byte_size, sha256 = %content_sha256, "extract published");
        Ok(FetchedExtract {
            path,
            filename,
            byte_size,
            content_sha256,
            fetched_at: Utc::now(),
        })
    }

    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let request_err = |source: reqwest::Error| DownloadError::Request {
            url: url.to_string(),
            source,
        };
        let mut resp = self.client.get(url).send().await.map_err(request_err)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(dest)
            .await
            .map_err(DownloadError::io("opening temp download", dest))?;
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(request_err)? {
            file.write_all(&chunk)
                .await
                .map_err(DownloadError::io("writing temp download", dest))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(DownloadError::io("flushing temp download", dest))?;
        Ok(written)
    }
}

async fn inflate_blocking(gz_path: PathBuf, out_path: PathBuf) -> Result<(u64, String), DownloadError> {
    let join_path = out_path.clone();
    tokio::task::spawn_blocking(move || inflate(&gz_path, &out_path))
        .await
        .map_err(|err| DownloadError::Io {
            context: "joining inflate task for",
            path: join_path,
            source: std::io::Error::other(err),
        })?
}

/// Inflate a (possibly multi-member) gzip file, returning the decompressed
/// size and its sha256.
fn inflate(gz_path: &Path, out_path: &Path) -> Result<(u64, String), DownloadError> {
    let input = std::fs::File::open(gz_path).map_err(DownloadError::io("opening temp download", gz_path))?;
    let output = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(out_path)
        .map_err(DownloadError::io("opening temp extract", out_path))?;

    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut writer = BufWriter::new(output);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; INFLATE_BUF_BYTES];
    let mut total = 0u64;

    loop {
        let n = match decoder.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(DownloadError::Decompress {
                    path: gz_path.to_path_buf(),
                    source,
                })
            }
        };
        hasher.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .map_err(DownloadError::io("writing temp extract", out_path))?;
        total += n as u64;
    }

    writer
        .flush()
        .map_err(DownloadError::io("flushing temp extract", out_path))?;
    Ok((total, hex::encode(hasher.finalize())))
}
