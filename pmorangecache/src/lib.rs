//! # pmorangecache - Cache disque par plages d'octets
//!
//! Cette crate assemble les couches de flux de [`pmostreams`] en un cache
//! disque complet : un répertoire plat de fichiers `{hash}` +
//! `{hash}.metadata`, une taille totale bornée par un quota avec éviction des
//! entrées les plus anciennes, et un point d'entrée par URL qui distribue des
//! curseurs indépendants sur une même ressource sans rouvrir la connexion
//! réseau.
//!
//! ## Vue d'ensemble
//!
//! ```text
//! FileCache (une entrée par URL)
//!     ├── CacheHandler   - répertoire, taille approximative, trim
//!     ├── SharedStream   - multiplexeur de vues par clé (pmostreams)
//!     └── Prefetcher     - drainage complet en tâche de fond + listeners
//! ```
//!
//! ### Exemple
//!
//! ```rust,no_run
//! use pmorangecache::FileCache;
//! use pmostreams::RandomAccessStream;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = FileCache::new("./cache")?;
//!
//!     // Deux curseurs indépendants sur la même ressource.
//!     let a = cache.get_stream("https://example.com/video.webm").await?;
//!     let b = cache.get_stream("https://example.com/video.webm").await?;
//!
//!     a.open(0).await?;
//!     b.open(1024).await?;
//!
//!     let mut buffer = vec![0u8; 8192];
//!     while let Some(n) = a.read(&mut buffer).await? {
//!         // ... décoder buffer[..n]
//!     }
//!
//!     a.close().await?;
//!     b.close().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod handler;
pub mod prefetch;

pub use cache::FileCache;
pub use handler::{CacheHandler, DISK_QUOTA, TRIM_TRIES};
pub use prefetch::{CacheListener, Prefetcher};
