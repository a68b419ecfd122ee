//! Multiplexeur de vues : N curseurs indépendants sur un flux partagé.
//!
//! Un [`SharedStream`] enveloppe exactement un flux sous-jacent par clé
//! logique. Chaque [`StreamView`] ne possède que sa propre position ; la paire
//! seek + read est exécutée en section critique sur le flux partagé, si bien
//! que deux vues qui lisent en parallèle n'entrelacent jamais leurs seeks.
//!
//! La liste des vues vivantes fait office de compteur de références : le flux
//! sous-jacent est ouvert au plus une fois (garde d'idempotence) et fermé
//! exactement une fois, quand la dernière vue se ferme. Pas de finaliseur ni
//! de ramasse-miettes : la libération de la connexion réseau est immédiate.

use crate::stream::{RandomAccessStream, Result, StreamError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

struct SharedState {
    /// Identifiants des vues vivantes. Liste autoritaire pour la fermeture.
    children: HashSet<u64>,
    next_child_id: u64,
    opened: bool,
    closed: bool,
}

/// Propriétaire du flux partagé et de ses vues.
pub struct SharedStream {
    stream: Box<dyn RandomAccessStream>,
    state: Mutex<SharedState>,
}

impl SharedStream {
    pub fn new(stream: Box<dyn RandomAccessStream>) -> Arc<Self> {
        Arc::new(Self {
            stream,
            state: Mutex::new(SharedState {
                children: HashSet::new(),
                next_child_id: 0,
                opened: false,
                closed: false,
            }),
        })
    }

    /// Crée un nouveau curseur indépendant sur le flux partagé.
    pub async fn create_view(self: &Arc<Self>) -> Result<StreamView> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }

        let id = state.next_child_id;
        state.next_child_id += 1;
        state.children.insert(id);

        Ok(StreamView {
            parent: Arc::clone(self),
            id,
            position: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// `true` une fois la dernière vue fermée. Un multiplexeur fermé ne peut
    /// plus créer de vues ; son propriétaire doit en reconstruire un.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Ouverture idempotente du flux partagé : seul le premier appel compte,
    /// même si chaque vue déclenche ce chemin à son premier usage.
    async fn open_shared(&self, start_position: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        if !state.opened {
            self.stream.open(start_position).await?;
            state.opened = true;
        }
        Ok(())
    }

    async fn length(&self) -> Result<u64> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        self.stream.length().await
    }

    /// Paire seek + read atomique : le verrou d'état est tenu pendant les deux
    /// opérations sur le flux partagé.
    async fn read_at(&self, position: u64, output: &mut [u8]) -> Result<Option<usize>> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::Closed);
        }
        self.stream.seek(position).await?;
        self.stream.read(output).await
    }

    /// Retire une vue de la liste ; la dernière fermeture entraîne celle du
    /// flux sous-jacent, exactement une fois.
    async fn close_child(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.children.remove(&id) {
            return Ok(());
        }

        if state.children.is_empty() && !state.closed {
            state.closed = true;
            tracing::debug!("last view closed, closing shared stream");
            self.stream.close().await?;
        }
        Ok(())
    }
}

/// Curseur léger sur un flux partagé : une position propre, rien d'autre.
pub struct StreamView {
    parent: Arc<SharedStream>,
    id: u64,
    position: AtomicU64,
    closed: AtomicBool,
}

impl StreamView {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RandomAccessStream for StreamView {
    async fn open(&self, start_position: u64) -> Result<()> {
        self.ensure_open()?;
        self.parent.open_shared(start_position).await?;
        self.position.store(start_position, Ordering::SeqCst);
        Ok(())
    }

    async fn position(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.position.load(Ordering::SeqCst))
    }

    async fn length(&self) -> Result<u64> {
        self.ensure_open()?;
        self.parent.length().await
    }

    async fn read(&self, output: &mut [u8]) -> Result<Option<usize>> {
        self.ensure_open()?;
        let position = self.position.load(Ordering::SeqCst);
        let read = self.parent.read_at(position, output).await?;
        if let Some(count) = read {
            self.position.fetch_add(count as u64, Ordering::SeqCst);
        }
        Ok(read)
    }

    /// Ne déplace que le curseur de cette vue.
    async fn seek(&self, pos: u64) -> Result<()> {
        self.ensure_open()?;
        self.position.store(pos, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.parent.close_child(self.id).await
    }
}
