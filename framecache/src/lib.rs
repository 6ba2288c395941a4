//! framecache - Disk-backed image and frame cache for node graph evaluation
//!
//! This library caches the pixel buffers a node graph produces so that
//! re-evaluating an unchanged node at the same time and view is a lookup
//! instead of a render.
//!
//! # High-Level API
//!
//! For most use cases, the [`cache::CacheService`] owns the caches an
//! application needs:
//!
//! ```no_run
//! use framecache::cache::{CacheService, HolderId, ImageKey, Lookup};
//! use framecache::config::ConfigFile;
//!
//! let config = ConfigFile::load()?;
//! let _logging = framecache::logging::init_logging(&config.logging)?;
//! let service = CacheService::start(&config.cache)?;
//!
//! let key = ImageKey::new(HolderId(1), 0x5eed, false, 0.0, 0, 1.0, false);
//! match service.node_cache().get_or_wait(&key)? {
//!     Lookup::Hit(handle) => println!("cached: {} bytes", handle.size()),
//!     Lookup::Miss(claim) => {
//!         // render, then allocate() + commit() through the claim
//!         service.node_cache().abort_claim(claim);
//!     }
//!     Lookup::InProgress => unreachable!("get_or_wait never reports InProgress"),
//! }
//!
//! service.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cache;
pub mod config;
pub mod logging;
pub mod system;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
