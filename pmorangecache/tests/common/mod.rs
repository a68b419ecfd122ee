//! Doubles de test : flux en mémoire instrumenté et flux cassé.
#![allow(dead_code)]

use async_trait::async_trait;
use pmostreams::{RandomAccessStream, Result, StreamError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Compteurs d'appels partagés entre le test et son flux.
#[derive(Default)]
pub struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct MemoryState {
    position: u64,
    closed: bool,
}

/// Flux aléatoire en mémoire, compte ses ouvertures et fermetures.
pub struct MemoryStream {
    data: Vec<u8>,
    counters: Arc<Counters>,
    state: Mutex<MemoryState>,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let stream = Self {
            data,
            counters: Arc::clone(&counters),
            state: Mutex::new(MemoryState {
                position: 0,
                closed: false,
            }),
        };
        (stream, counters)
    }
}

#[async_trait]
impl RandomAccessStream for MemoryStream {
    async fn open(&self, start_position: u64) -> Result<()> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        state.position = start_position;
        Ok(())
    }

    async fn position(&self) -> Result<u64> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        Ok(state.position)
    }

    async fn length(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        let position = state.position as usize;
        if position >= self.data.len() {
            return Ok(None);
        }
        let count = output.len().min(self.data.len() - position);
        output[..count].copy_from_slice(&self.data[position..position + count]);
        state.position += count as u64;
        Ok(Some(count))
    }

    async fn seek(&self, position: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        state.position = position;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.state.lock().await.closed = true;
        Ok(())
    }
}

/// Flux dont l'ouverture échoue toujours avec le statut HTTP donné.
pub struct BrokenStream {
    status: u16,
}

impl BrokenStream {
    pub fn new(status: u16) -> Self {
        Self { status }
    }
}

#[async_trait]
impl RandomAccessStream for BrokenStream {
    async fn open(&self, _start_position: u64) -> Result<()> {
        Err(StreamError::HttpStatus(self.status))
    }

    async fn position(&self) -> Result<u64> {
        Ok(0)
    }

    async fn length(&self) -> Result<u64> {
        Err(StreamError::HttpStatus(self.status))
    }

    async fn read(&self, _output: &mut [u8]) -> Result<Option<usize>> {
        Err(StreamError::HttpStatus(self.status))
    }

    async fn seek(&self, _position: u64) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Données de test reproductibles.
pub fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
