//! Contrat commun des flux à accès aléatoire et taxonomie d'erreurs associée.

use async_trait::async_trait;
use thiserror::Error;

/// Type Result personnalisé pour pmostreams
pub type Result<T> = std::result::Result<T, StreamError>;

/// Erreurs possibles lors de la manipulation d'un flux
#[derive(Debug, Error)]
pub enum StreamError {
    /// Opération sur un flux ou une vue déjà fermée
    #[error("stream is closed")]
    Closed,

    /// Statut HTTP non succès lors de l'ouverture d'une connexion
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    /// La réponse HTTP ne porte aucun corps exploitable
    #[error("HTTP response has no body")]
    EmptyBody,

    /// La longueur totale de la ressource n'est pas connue (par exemple une
    /// réponse en transfert chunked, sans en-tête `Content-Length`)
    #[error("resource length unknown")]
    UnknownLength,

    /// Téléchargement interrompu volontairement (distinct d'un échec)
    #[error("download cancelled")]
    Cancelled,

    /// Fichier de métadonnées illisible. Toujours rattrapé localement par le
    /// flux cache (remise à zéro de l'état), jamais propagé à l'appelant.
    #[error("corrupt cache metadata: {0}")]
    CorruptMetadata(String),

    /// Erreur d'entrée/sortie disque
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Erreur de transport HTTP
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl StreamError {
    /// `true` pour un statut HTTP 404, que les collaborateurs affichent
    /// différemment d'un échec générique.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamError::HttpStatus(404))
    }

    /// `true` pour une interruption volontaire.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// Capacité de flux à accès aléatoire.
///
/// Toutes les couches du système (flux HTTP, pool de connexions, flux
/// différé, flux adossé au cache, vues partagées) implémentent ce contrat et
/// se composent par encapsulation.
///
/// # Contrat
///
/// - [`open`](RandomAccessStream::open) doit être appelé avant toute lecture ;
/// - [`read`](RandomAccessStream::read) retourne `Ok(Some(n))` avec `n` octets
///   lus, ou `Ok(None)` en fin de flux. **`n` peut être inférieur à la taille
///   du buffer** : les appelants doivent boucler jusqu'à satisfaction ;
/// - [`seek`](RandomAccessStream::seek) ne change que la position logique. Une
///   implémentation physiquement non repositionnable (le flux HTTP) accepte
///   l'appel sans effet et compte sur son propriétaire pour rouvrir une
///   connexion à la bonne position ;
/// - après [`close`](RandomAccessStream::close), toute lecture échoue avec
///   [`StreamError::Closed`].
#[async_trait]
pub trait RandomAccessStream: Send + Sync {
    /// Ouvre le flux à la position de départ donnée.
    async fn open(&self, start_position: u64) -> Result<()>;

    /// Position logique courante.
    async fn position(&self) -> Result<u64>;

    /// Longueur totale de la ressource, telle que connue par cette couche.
    async fn length(&self) -> Result<u64>;

    /// Lit au plus `output.len()` octets à la position courante.
    ///
    /// Retourne `Ok(None)` en fin de flux. Peut retourner moins d'octets que
    /// demandé, notamment quand seule une partie de la requête est en cache :
    /// bouclez jusqu'à `Ok(None)` pour un drainage complet.
    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>>;

    /// Déplace la position logique.
    async fn seek(&self, pos: u64) -> Result<()>;

    /// Libère les ressources sous-jacentes. Idempotent.
    async fn close(&self) -> Result<()>;
}
