//! Obtain a raw image file in the work directory from a local path or URL.
//!
//! Format checks run on the locator alone, before any filesystem or network
//! access. Every file produced here is registered with the tracker.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{classify_name, Compression, ImageSource};
use crate::error::{Error, Result};
use crate::resource::{run_scoped_suffix, ResourceTracker};

pub struct ImageAcquirer<'a> {
    tracker: &'a ResourceTracker,
    work_dir: &'a Path,
    allowed_schemes: &'a [String],
}

impl<'a> ImageAcquirer<'a> {
    pub fn new(
        tracker: &'a ResourceTracker,
        work_dir: &'a Path,
        allowed_schemes: &'a [String],
    ) -> Self {
        Self {
            tracker,
            work_dir,
            allowed_schemes,
        }
    }

    /// Produce the pipeline's working raw image and return its path.
    pub fn acquire(&self, source: &ImageSource) -> Result<PathBuf> {
        match source {
            ImageSource::Local { path } => self.acquire_local(path),
            ImageSource::Remote { url } => self.acquire_remote(url),
            ImageSource::CloudManaged { image_id, region } => Err(Error::Unsupported(format!(
                "cloud-managed image '{image_id}' in '{region}' cannot be exported; \
                 download it as a raw image and use a local or remote source"
            ))),
        }
    }

    /// Check a source without touching the filesystem or network.
    pub fn validate(&self, source: &ImageSource) -> Result<()> {
        match source {
            ImageSource::Local { path } => check_local_name(path).map(|_| ()),
            ImageSource::Remote { url } => self.check_url(url).map(|_| ()),
            ImageSource::CloudManaged { .. } => self.acquire(source).map(|_| ()),
        }
    }

    fn acquire_local(&self, path: &Path) -> Result<PathBuf> {
        let locator = path.display().to_string();
        let compression = check_local_name(path)?;

        if !path.is_file() {
            return Err(Error::Usage(format!("image '{locator}' does not exist")));
        }
        self.materialize(path, compression)
    }

    fn acquire_remote(&self, url: &str) -> Result<PathBuf> {
        let (compression, name) = self.check_url(url)?;

        self.ensure_work_dir()?;
        let download = self
            .work_dir
            .join(format!("download-{}-{}", run_scoped_suffix(), name));
        self.tracker.track_file(&download);
        download_file(url, &download)?;

        self.materialize(&download, compression)
    }

    /// Validate scheme and suffix of a URL; returns the compression and file name.
    pub fn check_url(&self, url: &str) -> Result<(Compression, String)> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| Error::Usage(format!("'{url}' is not a URL")))?;
        let scheme = scheme.to_ascii_lowercase();
        if !self.allowed_schemes.iter().any(|s| *s == scheme) {
            return Err(Error::Usage(format!(
                "URL scheme '{scheme}' is not allowed; expected one of: {}",
                self.allowed_schemes.join(", ")
            )));
        }

        let path = rest.split(['?', '#']).next().unwrap_or_default();
        let name = path
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty() && path.contains('/'))
            .ok_or_else(|| Error::Format {
                locator: url.to_string(),
                reason: "URL does not name an image file".into(),
            })?;
        let compression = classify_name(name).map_err(|reason| Error::Format {
            locator: url.to_string(),
            reason,
        })?;
        Ok((compression, name.to_string()))
    }

    /// Decompress (or link) `input` into a tracked working raw file.
    fn materialize(&self, input: &Path, compression: Compression) -> Result<PathBuf> {
        self.ensure_work_dir()?;
        let output = self
            .work_dir
            .join(format!("image-{}.raw", run_scoped_suffix()));
        self.tracker.track_file(&output);

        match compression {
            Compression::None => {
                debug!(from = %input.display(), to = %output.display(), "linking raw image");
                hardlink_or_copy(input, &output)?;
            }
            compressed => {
                info!(from = %input.display(), ?compressed, "decompressing image");
                decompress(input, &output, compressed)?;
            }
        }
        Ok(output)
    }

    fn ensure_work_dir(&self) -> Result<()> {
        fs::create_dir_all(self.work_dir).map_err(|e| Error::io(self.work_dir, e))
    }
}

fn check_local_name(path: &Path) -> Result<Compression> {
    let locator = path.display().to_string();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Usage(format!("image path '{locator}' has no file name")))?;
    classify_name(name).map_err(|reason| Error::Format { locator, reason })
}

fn download_file(url: &str, dest: &Path) -> Result<()> {
    info!(url, "downloading image");
    let network = |reason: String| Error::Network {
        url: url.to_string(),
        reason,
    };

    let response = ureq::get(url).call().map_err(|e| network(e.to_string()))?;
    let mut reader = response.into_body().into_reader();
    let mut file = File::create(dest).map_err(|e| Error::io(dest, e))?;

    let total = io::copy(&mut reader, &mut file).map_err(|e| network(e.to_string()))?;
    info!(bytes = total, dest = %dest.display(), "download complete");
    Ok(())
}

fn decompress(input: &Path, output: &Path, compression: Compression) -> Result<()> {
    let file = File::open(input).map_err(|e| Error::io(input, e))?;
    let buffered = BufReader::new(file);
    let mut reader: Box<dyn Read> = match compression {
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(buffered)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::with_buffer(buffered).map_err(|e| Error::io(input, e))?,
        ),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(buffered)),
        Compression::None => Box::new(buffered),
    };
    let mut out = File::create(output).map_err(|e| Error::io(output, e))?;
    let bytes = io::copy(&mut reader, &mut out).map_err(|e| Error::Format {
        locator: input.display().to_string(),
        reason: format!("decompression failed: {e}"),
    })?;
    debug!(bytes, "decompressed image");
    Ok(())
}

fn hardlink_or_copy(src: &Path, dest: &Path) -> Result<()> {
    if fs::hard_link(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest).map_err(|e| Error::io(dest, e))?;
    Ok(())
}
