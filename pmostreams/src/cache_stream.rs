//! Flux adossé à un fichier cache local, alimenté par un flux intérieur.
//!
//! Derrière le contrat [`RandomAccessStream`], ce flux fusionne trois choses :
//! un fichier local d'octets déjà téléchargés, un [`RangeSet`] qui sait quelles
//! plages de ce fichier sont valides, et un flux intérieur qui fournit les
//! octets manquants. Tout octet reçu du flux intérieur est écrit dans le
//! fichier local avant d'être compté comme présent en cache : une relecture,
//! même après redémarrage du processus, ne retélécharge jamais une plage déjà
//! obtenue.
//!
//! L'état {fichier local, RangeSet, position} vit sous un unique Mutex : le
//! fichier et l'ensemble de plages ne sont jamais mutés séparément.

use crate::range_set::{ByteRange, RangeSet};
use crate::stream::{RandomAccessStream, Result, StreamError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Extension du fichier compagnon de métadonnées.
pub const METADATA_EXTENSION: &str = "metadata";

/// Callback notifié à la fermeture avec la variation (en octets) du volume
/// mis en cache pendant la vie du flux. Sert au répertoire de cache pour tenir
/// sa taille approximative sans rescanner le disque.
pub type CloseCallback = Box<dyn Fn(i64) + Send + Sync>;

/// Contenu du fichier compagnon `{hash}.metadata`.
///
/// Format interne (JSON). La seule exigence de compatibilité est la tolérance :
/// un fichier illisible ou absent ne doit jamais empêcher la création du flux,
/// seulement remettre l'état du cache à vide.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Plages d'octets valides dans le fichier local.
    pub ranges: RangeSet,
    /// Longueur totale de la ressource, si elle a été observée.
    pub length: Option<u64>,
}

impl CacheMetadata {
    /// Lit le fichier compagnon. `Ok(None)` s'il n'existe pas,
    /// `Err(CorruptMetadata)` s'il est illisible.
    pub async fn load(path: &Path) -> Result<Option<CacheMetadata>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StreamError::CorruptMetadata(e.to_string()))
    }

    /// Écrit le fichier compagnon.
    pub async fn store(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_vec(self)
            .map_err(|e| StreamError::CorruptMetadata(e.to_string()))?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }

    /// `true` quand les métadonnées couvrent la ressource entière, c'est-à-dire
    /// la plage `[0, length - 1]` complète.
    pub fn is_complete(&self) -> bool {
        match self.length {
            Some(0) => true,
            Some(length) => self.ranges.contains(&ByteRange::new(0, length - 1)),
            None => false,
        }
    }
}

struct CacheState {
    file: Option<File>,
    cached: RangeSet,
    saved_length: Option<u64>,
    position: u64,
    /// Volume en cache à l'ouverture, pour le delta rapporté à la fermeture.
    initial_cached_bytes: u64,
    closed: bool,
}

/// Flux à accès aléatoire adossé à un fichier cache local.
pub struct CacheBackedStream {
    backing_path: PathBuf,
    metadata_path: PathBuf,
    inner: Box<dyn RandomAccessStream>,
    on_close: Option<CloseCallback>,
    /// File d'attente à un seul slot pour la persistance des métadonnées :
    /// les écritures du même fichier compagnon ne se chevauchent jamais.
    metadata_queue: Arc<Mutex<()>>,
    state: Mutex<CacheState>,
}

impl CacheBackedStream {
    /// Crée le flux pour l'entrée `filename` (déjà hachée) du répertoire
    /// `directory`. Aucune E/S ici : tout se passe dans `open`.
    pub fn new(
        directory: &Path,
        filename: &str,
        inner: Box<dyn RandomAccessStream>,
        on_close: Option<CloseCallback>,
    ) -> Self {
        let backing_path = directory.join(filename);
        let metadata_path = directory.join(format!("{filename}.{METADATA_EXTENSION}"));
        Self {
            backing_path,
            metadata_path,
            inner,
            on_close,
            metadata_queue: Arc::new(Mutex::new(())),
            state: Mutex::new(CacheState {
                file: None,
                cached: RangeSet::new(),
                saved_length: None,
                position: 0,
                initial_cached_bytes: 0,
                closed: false,
            }),
        }
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing_path
    }

    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }
}

#[async_trait]
impl RandomAccessStream for CacheBackedStream {
    async fn open(&self, start_position: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.backing_path)
            .await?;
        state.file = Some(file);

        match CacheMetadata::load(&self.metadata_path).await {
            Ok(Some(metadata)) => {
                tracing::debug!(
                    path = %self.metadata_path.display(),
                    cached_bytes = metadata.ranges.total_len(),
                    length = ?metadata.length,
                    "loaded cache metadata"
                );
                state.cached = metadata.ranges;
                state.saved_length = metadata.length;
            }
            Ok(None) => {
                tracing::debug!(
                    path = %self.metadata_path.display(),
                    "no cache metadata, starting empty"
                );
            }
            // Métadonnées illisibles : perte de cache, pas une erreur fatale.
            Err(e) => {
                tracing::warn!(
                    path = %self.metadata_path.display(),
                    "unreadable cache metadata, resetting cache state: {e}"
                );
            }
        }

        state.initial_cached_bytes = state.cached.total_len();
        state.position = start_position;
        drop(state);

        // Pour un flux intérieur différé, ceci n'enregistre que la position :
        // aucun trafic réseau avant la première lecture non satisfaite.
        self.inner.open(start_position).await
    }

    async fn position(&self) -> Result<u64> {
        Ok(self.state.lock().await.position)
    }

    async fn length(&self) -> Result<u64> {
        {
            let state = self.state.lock().await;
            if state.closed {
                return Err(StreamError::Closed);
            }
            if let Some(length) = state.saved_length {
                return Ok(length);
            }
        }

        // Une seule interrogation du flux intérieur : la ressource est
        // supposée ne pas grandir, le résultat vaut pour toute la vie de
        // l'instance (et sera persisté avec les métadonnées).
        let length = self.inner.length().await?;
        let mut state = self.state.lock().await;
        state.saved_length = Some(length);
        Ok(length)
    }

    /// Lecture à la position courante.
    ///
    /// **Attention** : un chevauchement partiel (préfixe en cache, suffixe
    /// absent) n'est servi que pour sa partie en cache — l'appel retourne
    /// moins d'octets que demandé et l'appelant doit boucler. Mélanger une
    /// lecture disque et une lecture réseau dans un même appel est exclu.
    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        if output.is_empty() {
            return Ok(Some(0));
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }

        let position = state.position;
        let wanted = ByteRange::new(position, position + output.len() as u64 - 1);

        // Partie en cache seulement si elle démarre à la position courante ;
        // un bloc en cache plus loin dans la requête sera servi quand la
        // position l'atteindra.
        let cached_part = state
            .cached
            .intersect(&wanted)
            .filter(|part| part.lower() == position);

        let read = if let Some(part) = cached_part {
            tracing::trace!(%part, "cache hit");
            let file = state.file.as_mut().ok_or(StreamError::Closed)?;
            file.seek(SeekFrom::Start(part.lower())).await?;
            let count = part.len() as usize;
            file.read_exact(&mut output[..count]).await?;
            Some(count)
        } else if state.saved_length.is_some_and(|length| position >= length) {
            // Fin de ressource connue : rien à demander au flux intérieur.
            return Ok(None);
        } else {
            self.inner.seek(position).await?;
            match self.inner.read(output).await? {
                Some(count) if count > 0 => {
                    let file = state.file.as_mut().ok_or(StreamError::Closed)?;
                    file.seek(SeekFrom::Start(position)).await?;
                    file.write_all(&output[..count]).await?;
                    state
                        .cached
                        .union(ByteRange::new(position, position + count as u64 - 1));
                    Some(count)
                }
                other => other,
            }
        };

        if let Some(count) = read {
            state.position += count as u64;
        }
        Ok(read)
    }

    async fn seek(&self, pos: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        state.position = pos;
        Ok(())
    }

    /// Persiste les métadonnées puis relâche fichier et flux intérieur.
    ///
    /// L'écriture des métadonnées part sur une tâche de fond sérialisée par la
    /// file à un slot : fermer de nombreuses vues ne bloque pas les appelants.
    /// Les écritures du fichier de données, elles, sont déjà toutes terminées
    /// (elles se font sous le Mutex d'état que nous tenons ici).
    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let metadata = CacheMetadata {
            ranges: state.cached.clone(),
            length: state.saved_length,
        };
        let size_delta = state.cached.total_len() as i64 - state.initial_cached_bytes as i64;
        let file = state.file.take();
        drop(state);

        // À partir d'ici tout est au mieux : quoi qu'il arrive au fichier ou
        // au flux intérieur, le callback de fermeture doit partir, sinon la
        // comptabilité de taille du répertoire dérive.
        if let Some(mut file) = file {
            if let Err(e) = file.flush().await {
                tracing::warn!(
                    path = %self.backing_path.display(),
                    "failed to flush cache file on close: {e}"
                );
            }
        }

        let metadata_path = self.metadata_path.clone();
        let queue = Arc::clone(&self.metadata_queue);
        tokio::spawn(async move {
            let _slot = queue.lock().await;
            tracing::debug!(path = %metadata_path.display(), "writing cache metadata");
            if let Err(e) = metadata.store(&metadata_path).await {
                tracing::error!(
                    path = %metadata_path.display(),
                    "failed to write cache metadata: {e}"
                );
            }
        });

        if let Err(e) = self.inner.close().await {
            tracing::warn!("failed to close inner stream: {e}");
        }

        if let Some(on_close) = &self.on_close {
            on_close(size_delta);
        }
        Ok(())
    }
}
