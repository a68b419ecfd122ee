//! Report de la construction d'un flux jusqu'au premier accès.
//!
//! Construire un [`StreamReplicator`] émet une vraie requête réseau : un
//! multiplexeur doit pouvoir exister (et être retrouvé par clé) avant que le
//! moindre trafic n'ait lieu. Ce wrapper ne fabrique le flux enveloppé qu'au
//! premier accesseur.
//!
//! [`StreamReplicator`]: crate::replicator::StreamReplicator

use crate::stream::{RandomAccessStream, Result, StreamError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Fabrique sans argument du flux enveloppé.
pub type LazyStreamFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn RandomAccessStream>>> + Send + Sync>;

struct LazyState {
    stream: Option<Box<dyn RandomAccessStream>>,
    start_position: u64,
    closed: bool,
}

/// Flux dont la construction et l'ouverture sont différées au premier accès.
pub struct LazyStream {
    factory: LazyStreamFactory,
    state: Mutex<LazyState>,
}

impl LazyStream {
    pub fn new(factory: LazyStreamFactory) -> Self {
        Self {
            factory,
            state: Mutex::new(LazyState {
                stream: None,
                start_position: 0,
                closed: false,
            }),
        }
    }

    /// Construit et ouvre le flux enveloppé si ce n'est pas déjà fait.
    async fn initialized<'a>(
        &self,
        state: &'a mut LazyState,
    ) -> Result<&'a dyn RandomAccessStream> {
        if state.closed {
            return Err(StreamError::Closed);
        }
        if state.stream.is_none() {
            tracing::debug!(
                start_position = state.start_position,
                "first access, building deferred stream"
            );
            let stream = (self.factory)().await?;
            stream.open(state.start_position).await?;
            state.stream = Some(stream);
        }
        match state.stream.as_deref() {
            Some(stream) => Ok(stream),
            None => Err(StreamError::Closed),
        }
    }
}

#[async_trait]
impl RandomAccessStream for LazyStream {
    /// N'enregistre que la position de départ : aucune initialisation ici.
    async fn open(&self, start_position: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        state.start_position = start_position;
        Ok(())
    }

    async fn position(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.initialized(&mut state).await?.position().await
    }

    async fn length(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.initialized(&mut state).await?.length().await
    }

    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock().await;
        self.initialized(&mut state).await?.read(output).await
    }

    async fn seek(&self, pos: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        self.initialized(&mut state).await?.seek(pos).await
    }

    /// Ne déclenche jamais l'initialisation : fermer un flux jamais utilisé
    /// est un no-op.
    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.closed = true;
        match state.stream.take() {
            Some(stream) => stream.close().await,
            None => Ok(()),
        }
    }
}
