//! Répertoire de cache : comptabilité de taille et éviction sous quota.
//!
//! Le répertoire est plat : un fichier de données `{hash(clé)}` et son
//! compagnon `{hash(clé)}.metadata` par entrée. La taille totale est tenue de
//! façon incrémentale (chaque flux rapporte son delta à la fermeture), jamais
//! recalculée à chaque opération ; un recalcul complet part en tâche de fond à
//! la création et après chaque trim.

use anyhow::Result;
use pmostreams::cache_stream::METADATA_EXTENSION;
use pmostreams::CacheMetadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

/// Quota disque du cache.
pub const DISK_QUOTA: u64 = 100 * 1024 * 1024;

/// Nombre maximum de suppressions tentées par passe de trim : borne la latence
/// du pire cas.
pub const TRIM_TRIES: usize = 20;

/// Gestionnaire du répertoire de cache.
///
/// Conçu pour être partagé derrière un `Arc` : la taille et le drapeau de trim
/// sont atomiques, le reste est immuable.
pub struct CacheHandler {
    directory: PathBuf,
    quota: u64,
    /// Estimation de la taille courante du répertoire. Sert à décider si une
    /// passe de trim doit partir, pas de comptabilité exacte.
    size: AtomicI64,
    trim_running: AtomicBool,
}

impl CacheHandler {
    /// Crée le gestionnaire avec le quota par défaut ([`DISK_QUOTA`]).
    pub fn new(directory: impl Into<PathBuf>) -> Result<Arc<Self>> {
        Self::with_quota(directory, DISK_QUOTA)
    }

    /// Crée le gestionnaire avec un quota explicite.
    pub fn with_quota(directory: impl Into<PathBuf>, quota: u64) -> Result<Arc<Self>> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;

        let handler = Arc::new(Self {
            directory,
            quota,
            size: AtomicI64::new(0),
            trim_running: AtomicBool::new(false),
        });

        // Recalcul initial en tâche de fond.
        let background = Arc::clone(&handler);
        tokio::spawn(async move {
            background.recalculate_size().await;
        });

        Ok(handler)
    }

    /// Hash déterministe d'une clé logique (URL) vers un nom de fichier :
    /// les 16 premiers octets du SHA-256, en hexadécimal.
    pub fn hash_key(key: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    pub fn cache_dir(&self) -> &Path {
        &self.directory
    }

    /// Chemin du fichier de données pour une clé.
    pub fn data_path(&self, key: &str) -> PathBuf {
        self.directory.join(Self::hash_key(key))
    }

    /// Chemin du fichier compagnon de métadonnées pour une clé.
    pub fn metadata_path(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{METADATA_EXTENSION}", Self::hash_key(key)))
    }

    /// `true` si l'entrée est présente **et complète** : le fichier de données
    /// existe et ses métadonnées couvrent la plage `[0, length - 1]` entière.
    pub async fn exists(&self, key: &str) -> bool {
        if !self.data_path(key).exists() {
            return false;
        }
        match CacheMetadata::load(&self.metadata_path(key)).await {
            Ok(Some(metadata)) => metadata.is_complete(),
            _ => false,
        }
    }

    /// Chemin du fichier de données s'il est présent sur disque.
    pub fn get(&self, key: &str) -> Option<PathBuf> {
        let path = self.data_path(key);
        path.exists().then_some(path)
    }

    /// Taille approximative courante du répertoire, en octets.
    pub fn current_size(&self) -> u64 {
        self.size.load(Ordering::SeqCst).max(0) as u64
    }

    /// Supprime tous les fichiers du répertoire puis remet la taille à jour.
    pub async fn clear(&self) -> Result<()> {
        tracing::debug!(directory = %self.directory.display(), "clearing cache");

        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().is_file() {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    tracing::warn!(
                        path = %entry.path().display(),
                        "could not delete cache file while clearing: {e}"
                    );
                }
            }
        }

        self.recalculate_size().await;
        Ok(())
    }

    /// Notification de fermeture d'un flux : ajuste la taille estimée du
    /// delta rapporté et déclenche une passe de trim si le quota est dépassé.
    /// Une seule passe à la fois ; les demandes simultanées se fondent en un
    /// no-op.
    pub fn stream_was_closed(self: &Arc<Self>, size_delta: i64) {
        let adjusted = self.size.fetch_add(size_delta, Ordering::SeqCst) + size_delta;

        if adjusted > self.quota as i64
            && self
                .trim_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let handler = Arc::clone(self);
            tokio::spawn(async move {
                handler.trim().await;
                handler.trim_running.store(false, Ordering::SeqCst);
            });
        }
    }

    /// Recalcule la taille exacte du répertoire.
    async fn recalculate_size(&self) {
        let mut total: i64 = 0;

        match tokio::fs::read_dir(&self.directory).await {
            Ok(mut entries) => {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    if let Ok(metadata) = entry.metadata().await {
                        if metadata.is_file() {
                            total += metadata.len() as i64;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    directory = %self.directory.display(),
                    "could not list cache directory: {e}"
                );
                return;
            }
        }

        self.size.store(total, Ordering::SeqCst);
    }

    /// Passe d'éviction : supprime les entrées les plus anciennes (mtime
    /// croissant) jusqu'à repasser sous le quota ou épuiser [`TRIM_TRIES`]
    /// tentatives. Les fichiers compagnons suivent leur fichier de données.
    async fn trim(&self) {
        let mut files = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("could not list cache directory for trim: {e}");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            // Les compagnons de métadonnées sont supprimés avec leur fichier
            // de données, pas comptés comme candidats.
            if path
                .extension()
                .is_some_and(|ext| ext == METADATA_EXTENSION)
            {
                continue;
            }
            if let Ok(metadata) = entry.metadata().await {
                if metadata.is_file() {
                    let modified = metadata.modified().ok();
                    files.push((path, modified, metadata.len()));
                }
            }
        }

        // Rien à faire sur un répertoire vide ou à fichier unique.
        if files.len() <= 1 {
            return;
        }

        // Du plus ancien au plus récent.
        files.sort_by_key(|(_, modified, _)| *modified);

        let mut working_size = self.size.load(Ordering::SeqCst);
        let mut deleted = 0usize;

        for (path, _, len) in files.iter().take(TRIM_TRIES) {
            if working_size <= self.quota as i64 {
                break;
            }

            tracing::debug!(path = %path.display(), "deleting cache entry for trim");
            working_size -= *len as i64;
            deleted += 1;

            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), "failed to delete cache file for trim: {e}");
            }

            let mut sidecar = path.clone().into_os_string();
            sidecar.push(format!(".{METADATA_EXTENSION}"));
            if let Err(e) = tokio::fs::remove_file(PathBuf::from(sidecar)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to delete metadata file for trim: {e}");
                }
            }
        }

        if deleted > 0 {
            tracing::info!(deleted, "cache trim finished");
        }

        self.recalculate_size().await;
    }
}
