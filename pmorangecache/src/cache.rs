//! Façade du cache de fichiers.
//!
//! [`FileCache`] assemble la pile complète pour chaque URL demandée :
//!
//! ```text
//! HttpRangeStream (×N) → StreamReplicator → LazyStream
//!     → CacheBackedStream → SharedStream → StreamView (×N lecteurs)
//! ```
//!
//! Une seule pile vit par URL à un instant donné : les lecteurs concurrents
//! reçoivent des vues sur le même multiplexeur et partagent connexions et
//! fichier de cache. La pile est reconstruite quand la précédente a été fermée
//! par son dernier lecteur.

use crate::handler::CacheHandler;
use crate::prefetch::{CacheListener, Prefetcher};
use anyhow::Result;
use pmostreams::{
    CacheBackedStream, HttpRangeStream, InputStreamFactory, LazyStream, LazyStreamFactory,
    RandomAccessStream, SharedStream, StreamReplicator, StreamView,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Point d'entrée du cache : fabrique des vues de lecture et des
/// préchargements pour des URLs distantes.
pub struct FileCache {
    client: reqwest::Client,
    handler: Arc<CacheHandler>,
    /// Multiplexeurs ouverts, par clé de cache.
    open_streams: RwLock<HashMap<String, Arc<SharedStream>>>,
    /// Préchargements en cours, retirés par leur callback de fin.
    prefetchers: Mutex<Vec<Arc<Prefetcher>>>,
}

impl FileCache {
    /// Crée le cache dans `directory` (créé si besoin). Le quota disque par
    /// défaut de [`crate::handler::DISK_QUOTA`] s'applique.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let handler = CacheHandler::new(directory)?;
        Self::with_handler(handler)
    }

    pub fn with_handler(handler: Arc<CacheHandler>) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Arc::new(Self {
            client,
            handler,
            open_streams: RwLock::new(HashMap::new()),
            prefetchers: Mutex::new(Vec::new()),
        }))
    }

    pub fn handler(&self) -> &Arc<CacheHandler> {
        &self.handler
    }

    /// Vrai si la ressource est intégralement en cache.
    pub async fn exists(&self, url: &str) -> bool {
        self.handler.exists(url).await
    }

    /// Chemin du fichier de cache complet, s'il existe.
    pub async fn get(&self, url: &str) -> Option<PathBuf> {
        if self.handler.exists(url).await {
            self.handler.get(url)
        } else {
            None
        }
    }

    /// Volume actuellement suivi sur disque.
    pub fn cache_size(&self) -> u64 {
        self.handler.current_size()
    }

    /// Ouvre une vue de lecture sur `url`. Paresseux de bout en bout : aucune
    /// requête réseau ne part avant la première lecture qui manque le cache.
    pub async fn get_stream(&self, url: &str) -> Result<StreamView> {
        let key = CacheHandler::hash_key(url);

        {
            let streams = self.open_streams.read().await;
            if let Some(shared) = streams.get(&key) {
                if !shared.is_closed().await {
                    return Ok(shared.create_view().await?);
                }
            }
        }

        let mut streams = self.open_streams.write().await;
        // Revérification sous le verrou exclusif : un autre lecteur a pu
        // reconstruire la pile entre-temps.
        if let Some(shared) = streams.get(&key) {
            if !shared.is_closed().await {
                return Ok(shared.create_view().await?);
            }
        }

        let shared = self.build_stack(url, &key);
        let view = shared.create_view().await?;
        streams.insert(key, shared);
        Ok(view)
    }

    /// Assemble la pile de flux d'une URL.
    fn build_stack(&self, url: &str, key: &str) -> Arc<SharedStream> {
        let client = self.client.clone();
        let factory_url = url.to_string();
        let http_factory: InputStreamFactory = Arc::new(move |position| {
            let client = client.clone();
            let url = factory_url.clone();
            Box::pin(async move {
                let _ = position;
                Ok(Box::new(HttpRangeStream::new(client, url)) as Box<dyn RandomAccessStream>)
            })
        });

        let lazy_factory: LazyStreamFactory = Arc::new(move || {
            let http_factory = Arc::clone(&http_factory);
            Box::pin(async move {
                Ok(Box::new(StreamReplicator::new(http_factory)) as Box<dyn RandomAccessStream>)
            })
        });

        let handler = Arc::clone(&self.handler);
        let cached = CacheBackedStream::new(
            self.handler.cache_dir(),
            key,
            Box::new(LazyStream::new(lazy_factory)),
            Some(Box::new(move |size_delta| {
                handler.stream_was_closed(size_delta);
            })),
        );

        SharedStream::new(Box::new(cached))
    }

    /// Lance le téléchargement complet de `url` en tâche de fond. Le
    /// [`Prefetcher`] retourné permet l'annulation ; `listener` reçoit les
    /// notifications de progression et de fin.
    pub async fn download_file(
        self: &Arc<Self>,
        url: &str,
        listener: Option<Box<dyn CacheListener>>,
    ) -> Result<Arc<Prefetcher>> {
        let view = self.get_stream(url).await?;
        let prefetcher = Prefetcher::new(view);
        if let Some(listener) = listener {
            prefetcher.add_listener(listener).await;
        }

        self.prefetchers.lock().await.push(Arc::clone(&prefetcher));

        let weak: Weak<FileCache> = Arc::downgrade(self);
        let finished = Arc::clone(&prefetcher);
        prefetcher.execute(Some(Box::new(move || {
            if let Some(cache) = weak.upgrade() {
                tokio::spawn(async move {
                    cache
                        .prefetchers
                        .lock()
                        .await
                        .retain(|p| !Arc::ptr_eq(p, &finished));
                });
            }
        })));

        Ok(prefetcher)
    }

    /// Annule les préchargements en cours puis vide le répertoire de cache.
    pub async fn clear_cache(&self) -> Result<()> {
        let prefetchers = std::mem::take(&mut *self.prefetchers.lock().await);
        for prefetcher in &prefetchers {
            prefetcher.cancel();
        }

        self.handler.clear().await
    }

    /// Répertoire racine du cache.
    pub fn directory(&self) -> &Path {
        self.handler.cache_dir()
    }
}
