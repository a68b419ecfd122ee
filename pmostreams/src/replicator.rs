//! Pool borné de connexions distantes pour une même ressource.
//!
//! Un lecteur séquentiel (lecture vidéo vers l'avant) retombe en permanence sur
//! la même connexion sous-jacente ; un lecteur qui navigue (scrubbing) obtient
//! au plus une connexion concurrente supplémentaire au lieu de rouvrir une
//! connexion à chaque saut.

use crate::stream::{RandomAccessStream, Result, StreamError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Nombre maximum de connexions distantes vivantes par replicator.
pub const MAX_INPUT_STREAMS: usize = 2;

/// Fabrique de flux d'entrée : `position de départ -> flux non ouvert`.
///
/// Le replicator ouvre lui-même le flux retourné à la position demandée, ce qui
/// émet une nouvelle requête HTTP Range.
pub type InputStreamFactory = Arc<
    dyn Fn(u64) -> BoxFuture<'static, Result<Box<dyn RandomAccessStream>>> + Send + Sync,
>;

struct ReplicatorState {
    /// Connexions vivantes, de la plus ancienne à la plus récente.
    streams: VecDeque<Box<dyn RandomAccessStream>>,
    position: u64,
    closed: bool,
}

/// Réplique un flux distant derrière un pool borné de connexions, routées
/// implicitement par leur position de lecture courante.
pub struct StreamReplicator {
    factory: InputStreamFactory,
    state: Mutex<ReplicatorState>,
}

impl StreamReplicator {
    pub fn new(factory: InputStreamFactory) -> Self {
        Self {
            factory,
            state: Mutex::new(ReplicatorState {
                streams: VecDeque::with_capacity(MAX_INPUT_STREAMS),
                position: 0,
                closed: false,
            }),
        }
    }

    /// Crée (et ouvre) une nouvelle connexion à `position`, en évinçant la plus
    /// ancienne si le pool est plein. Retourne l'index du flux dans le pool.
    async fn create_input_stream(&self, state: &mut ReplicatorState, position: u64) -> Result<usize> {
        let stream = (self.factory)(position).await?;
        stream.open(position).await?;

        if state.streams.len() == MAX_INPUT_STREAMS {
            if let Some(oldest) = state.streams.pop_front() {
                if let Err(e) = oldest.close().await {
                    tracing::warn!("failed to close evicted input stream: {e}");
                }
            }
        }

        state.streams.push_back(stream);
        Ok(state.streams.len() - 1)
    }

    /// Index du flux du pool dont la position correspond, s'il existe.
    async fn find_input_stream(
        state: &ReplicatorState,
        position: u64,
    ) -> Result<Option<usize>> {
        for (index, stream) in state.streams.iter().enumerate() {
            if stream.position().await? == position {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RandomAccessStream for StreamReplicator {
    async fn open(&self, start_position: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }

        state.position = start_position;
        // Première connexion créée d'emblée : le caractère différé de
        // l'ensemble vient du LazyStream qui enveloppe ce replicator.
        self.create_input_stream(&mut state, start_position).await?;
        Ok(())
    }

    async fn position(&self) -> Result<u64> {
        Ok(self.state.lock().await.position)
    }

    async fn length(&self) -> Result<u64> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        // Toutes les connexions portent sur la même ressource : n'importe
        // laquelle convient.
        match state.streams.front() {
            Some(stream) => stream.length().await,
            None => Err(StreamError::Closed),
        }
    }

    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }

        let position = state.position;
        let index = match Self::find_input_stream(&state, position).await? {
            Some(index) => index,
            None => {
                tracing::debug!(position, "no pooled connection at position, opening a new one");
                self.create_input_stream(&mut state, position).await?
            }
        };

        let read = state.streams[index].read(output).await?;
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

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        while let Some(stream) = state.streams.pop_front() {
            stream.close().await?;
        }
        Ok(())
    }
}
