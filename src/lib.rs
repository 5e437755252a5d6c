//! Reproducibility verification for operating-system disk images.
//!
//! Given a raw disk image, this crate works out which source revision built
//! it, rebuilds that revision, and diffs content manifests of the original
//! and rebuilt images. An empty diff means the image reproduced bit-for-bit.
//!
//! - **Resources** - every device, mount, pool and temp file is tracked and
//!   released in reverse order, on success, error or termination signal
//! - **Images** - acquisition (local, remote, decompression) and mounting
//!   (memory device, UFS or ZFS)
//! - **Identity** - platform, arch, branch and commit, supplied or scraped
//!   from the kernel
//! - **Manifests and comparison** - deterministic SHA-256 manifests and a
//!   unified diff verdict
//! - **Build** - clone, pin, and run the world, kernel and image stages
//!
//! # Architecture
//!
//! ```text
//! image-repro (bin)
//!     │
//!     └── pipeline::run
//!             ├── image::ImageAcquirer ──▶ image::ImageMounter
//!             ├── identity::extract
//!             ├── manifest::hash_tree
//!             ├── build::BuildOrchestrator
//!             └── compare::compare ──▶ result files
//!
//!     resource::ResourceTracker underlies every step
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use image_repro::{config::Config, image::ImageSource, pipeline, resource::ResourceTracker};
//!
//! let tracker = ResourceTracker::new();
//! let _teardown = tracker.guard();
//! let outcome = pipeline::run(
//!     Config::load(None)?,
//!     tracker.clone(),
//!     pipeline::RunOptions {
//!         source: ImageSource::Local { path: "FreeBSD-14.1-RELEASE-amd64.raw.xz".into() },
//!         identity: Default::default(),
//!         keep_build: false,
//!     },
//! )?;
//! println!("reproducible: {}", outcome.report.is_reproducible());
//! ```

pub mod build;
pub mod compare;
pub mod config;
pub mod error;
pub mod identity;
pub mod image;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod resource;

pub use error::{Error, Result};
