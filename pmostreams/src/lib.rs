//! # pmostreams - Flux à accès aléatoire composables avec cache disque
//!
//! Cette crate fournit les couches de flux nécessaires pour lire une ressource
//! distante (HTTP avec support des requêtes `Range`) à des positions arbitraires,
//! tout en persistant les plages d'octets déjà téléchargées sur disque.
//!
//! ## Architecture
//!
//! Chaque couche implémente le même contrat [`RandomAccessStream`] et se compose
//! par encapsulation :
//!
//! ```text
//! SharedStream (N vues, fermeture comptée par référence)
//!     └── CacheBackedStream (fichier local + RangeSet + métadonnées)
//!             └── LazyStream (construction différée)
//!                     └── StreamReplicator (pool borné de connexions)
//!                             └── HttpRangeStream (une connexion Range)
//! ```
//!
//! - [`range_set`] : suivi des plages d'octets présentes dans le cache
//! - [`stream`] : le contrat commun `position`/`length`/`read`/`seek`/`open`/`close`
//! - [`http_stream`] : une connexion HTTP Range exposée comme flux
//! - [`replicator`] : pool borné de connexions distantes, routées par position
//! - [`lazy`] : report de la création du flux au premier accès
//! - [`cache_stream`] : fusion cache disque + flux distant derrière un seul flux
//! - [`view`] : N curseurs indépendants partageant un flux sous-jacent
//!
//! Cette composition est intentionnelle : le cache, le pool et l'initialisation
//! différée restent testables indépendamment les uns des autres.

pub mod cache_stream;
pub mod http_stream;
pub mod lazy;
pub mod range_set;
pub mod replicator;
pub mod stream;
pub mod view;

pub use cache_stream::{CacheBackedStream, CacheMetadata, CloseCallback};
pub use http_stream::HttpRangeStream;
pub use lazy::{LazyStream, LazyStreamFactory};
pub use range_set::{ByteRange, RangeSet};
pub use replicator::{InputStreamFactory, StreamReplicator, MAX_INPUT_STREAMS};
pub use stream::{RandomAccessStream, Result, StreamError};
pub use view::{SharedStream, StreamView};
