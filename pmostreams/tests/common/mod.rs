//! Flux en mémoire instrumenté, utilisé comme flux intérieur dans les tests.

use async_trait::async_trait;
use pmostreams::{RandomAccessStream, Result, StreamError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Compteurs partagés entre un flux (ou plusieurs) et le test.
#[derive(Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub reads: AtomicUsize,
    pub closes: AtomicUsize,
}

impl Counters {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct MemoryState {
    position: u64,
    closed: bool,
}

/// Délégué dont la fermeture échoue systématiquement, pour vérifier que les
/// appelants ferment au mieux au lieu de s'arrêter à la première erreur.
pub struct FailingCloseStream {
    inner: MemoryStream,
}

impl FailingCloseStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: MemoryStream::new(data),
        }
    }
}

#[async_trait]
impl RandomAccessStream for FailingCloseStream {
    async fn open(&self, start_position: u64) -> Result<()> {
        self.inner.open(start_position).await
    }

    async fn position(&self) -> Result<u64> {
        self.inner.position().await
    }

    async fn length(&self) -> Result<u64> {
        self.inner.length().await
    }

    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        self.inner.read(output).await
    }

    async fn seek(&self, pos: u64) -> Result<()> {
        self.inner.seek(pos).await
    }

    async fn close(&self) -> Result<()> {
        Err(StreamError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection lost",
        )))
    }
}

/// Flux à accès aléatoire servi depuis un buffer, avec compteurs d'appels.
pub struct MemoryStream {
    data: Vec<u8>,
    /// Nombre maximum d'octets servis par lecture (simule des lectures
    /// partielles côté réseau).
    chunk_limit: usize,
    counters: Arc<Counters>,
    state: Mutex<MemoryState>,
}

impl MemoryStream {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_counters(data, Arc::new(Counters::default()))
    }

    pub fn with_counters(data: Vec<u8>, counters: Arc<Counters>) -> Self {
        Self {
            data,
            chunk_limit: usize::MAX,
            counters,
            state: Mutex::new(MemoryState {
                position: 0,
                closed: false,
            }),
        }
    }

    pub fn with_chunk_limit(mut self, chunk_limit: usize) -> Self {
        self.chunk_limit = chunk_limit;
        self
    }
}

#[async_trait]
impl RandomAccessStream for MemoryStream {
    async fn open(&self, start_position: u64) -> Result<()> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.position = start_position;
        Ok(())
    }

    async fn position(&self) -> Result<u64> {
        Ok(self.state.lock().await.position)
    }

    async fn length(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }

        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let position = state.position as usize;
        if position >= self.data.len() {
            return Ok(None);
        }

        let count = output
            .len()
            .min(self.data.len() - position)
            .min(self.chunk_limit);
        output[..count].copy_from_slice(&self.data[position..position + count]);
        state.position += count as u64;
        Ok(Some(count))
    }

    async fn seek(&self, pos: u64) -> Result<()> {
        self.state.lock().await.position = pos;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.closed = true;
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Données de test reproductibles.
pub fn sample_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Draine un flux jusqu'à EOF avec un buffer de taille donnée.
pub async fn drain(stream: &dyn RandomAccessStream, buffer_size: usize) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; buffer_size];
    let mut collected = Vec::new();
    while let Some(count) = stream.read(&mut buffer).await? {
        collected.extend_from_slice(&buffer[..count]);
    }
    Ok(collected)
}
