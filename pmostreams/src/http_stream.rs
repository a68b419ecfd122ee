//! Une connexion HTTP Range exposée comme flux à accès aléatoire.
//!
//! Chaque instance représente **une** connexion vivante : la requête est émise
//! avec `Range: bytes=<start>-` quand la position de départ est non nulle, et le
//! corps de la réponse est consommé morceau par morceau. Le flux n'est pas
//! repositionnable : `seek` est sans effet, c'est au [`StreamReplicator`]
//! propriétaire de rouvrir une connexion à la position voulue.
//!
//! [`StreamReplicator`]: crate::replicator::StreamReplicator

use crate::stream::{RandomAccessStream, Result, StreamError};
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use reqwest::header;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};

/// User-Agent fixe envoyé avec chaque requête.
pub const USER_AGENT: &str = concat!("pmostreams/", env!("CARGO_PKG_VERSION"));

#[derive(Default)]
struct HttpState {
    start_position: u64,
    /// Longueur annoncée par le serveur. `None` pour une réponse sans
    /// `Content-Length` (transfert chunked) : le corps se lit quand même,
    /// seule `length()` est indisponible.
    content_length: Option<u64>,
    position: u64,
    /// Réponse en cours. Son drop annule le transfert en vol.
    response: Option<reqwest::Response>,
    /// Reliquat du dernier chunk reçu, pas encore copié vers l'appelant.
    leftover: Bytes,
}

/// Flux de lecture sur une connexion HTTP Range.
pub struct HttpRangeStream {
    client: reqwest::Client,
    url: String,
    closed: AtomicBool,
    /// Réveille une lecture garée dans l'attente d'un chunk. Vit hors du
    /// Mutex d'état : `close` doit pouvoir interrompre une lecture qui tient
    /// ce verrou.
    cancel: Notify,
    state: Mutex<HttpState>,
}

impl HttpRangeStream {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            closed: AtomicBool::new(false),
            cancel: Notify::new(),
            state: Mutex::new(HttpState::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RandomAccessStream for HttpRangeStream {
    async fn open(&self, start_position: u64) -> Result<()> {
        self.ensure_open()?;

        let mut request = self
            .client
            .get(&self.url)
            .header(header::USER_AGENT, USER_AGENT);
        if start_position > 0 {
            request = request.header(header::RANGE, format!("bytes={start_position}-"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::HttpStatus(status.as_u16()));
        }

        // Un close a pu arriver pendant l'attente réseau.
        self.ensure_open()?;

        if status == reqwest::StatusCode::NO_CONTENT {
            return Err(StreamError::EmptyBody);
        }

        // Un serveur en transfert chunked n'annonce pas de longueur : le
        // corps reste lisible, seule `length()` sera indisponible.
        let content_length = response.content_length();
        tracing::debug!(
            url = %self.url,
            start_position,
            content_length = ?content_length,
            "opened range connection"
        );

        let mut state = self.state.lock().await;
        state.start_position = start_position;
        state.position = start_position;
        state.content_length = content_length;
        state.response = Some(response);
        state.leftover = Bytes::new();
        Ok(())
    }

    async fn position(&self) -> Result<u64> {
        Ok(self.state.lock().await.position)
    }

    /// Offset de fin absolu impliqué par cette connexion : position de départ
    /// plus longueur annoncée. Ce n'est la taille totale de la ressource que si
    /// le serveur a honoré l'en-tête `Range`. Sans `Content-Length`, échoue
    /// avec [`StreamError::UnknownLength`].
    async fn length(&self) -> Result<u64> {
        let state = self.state.lock().await;
        match state.content_length {
            Some(content_length) => Ok(state.start_position + content_length),
            None => Err(StreamError::UnknownLength),
        }
    }

    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        self.ensure_open()?;
        if output.is_empty() {
            return Ok(Some(0));
        }

        let mut state = self.state.lock().await;
        while state.leftover.is_empty() {
            // L'annulation est armée avant la relecture du drapeau : un close
            // qui tombe entre les deux est vu soit par le drapeau, soit par
            // la notification.
            let cancelled = self.cancel.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();
            self.ensure_open()?;

            let response = state.response.as_mut().ok_or(StreamError::Closed)?;
            let chunk = tokio::select! {
                _ = cancelled => return Err(StreamError::Closed),
                chunk = response.chunk() => chunk,
            };
            match chunk {
                Ok(Some(chunk)) => state.leftover = chunk,
                Ok(None) => return Ok(None),
                // Un close concurrent annule l'appel réseau en vol : on le
                // signale comme fermeture, pas comme erreur de transport.
                Err(_) if self.closed.load(Ordering::SeqCst) => {
                    return Err(StreamError::Closed)
                }
                Err(e) => return Err(e.into()),
            }
        }

        let count = state.leftover.len().min(output.len());
        output[..count].copy_from_slice(&state.leftover[..count]);
        state.leftover.advance(count);
        state.position += count as u64;
        Ok(Some(count))
    }

    async fn seek(&self, _pos: u64) -> Result<()> {
        // Non repositionnable : le replicator rouvre une connexion à la place.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Une lecture garée dans `chunk()` tient le verrou d'état : elle doit
        // être réveillée avant qu'on puisse le prendre.
        self.cancel.notify_waiters();

        let mut state = self.state.lock().await;
        // Drop de la réponse : reqwest annule le transfert restant.
        state.response.take();
        state.leftover = Bytes::new();
        tracing::debug!(url = %self.url, "closed range connection");
        Ok(())
    }
}
