//! Préchargement : drainage complet d'un flux en tâche de fond.
//!
//! Un [`Prefetcher`] lit une vue jusqu'à la fin de la ressource, ce qui remplit
//! le cache disque au passage, et tient ses listeners informés : progression
//! périodique puis exactement une notification terminale (succès, échec ou
//! annulation) suivie de `on_end`.
//!
//! Les callbacks ne sont jamais invoqués depuis la tâche de lecture : ils sont
//! mis en file sur un canal consommé par une unique tâche de distribution, ce
//! qui garantit une livraison séquentielle sur un seul contexte ("control
//! thread") sans dépendre d'un main thread graphique.

use pmostreams::{RandomAccessStream, StreamError, StreamView};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Taille du buffer de lecture.
const BUFFER_SIZE: usize = 8192;

/// Volume minimum entre deux notifications de progression.
const NOTIFY_SIZE: u64 = (BUFFER_SIZE * 8) as u64;

/// Callbacks d'un téléchargement. Toutes les méthodes ont un corps vide par
/// défaut : n'implémenter que ce qui intéresse.
///
/// Garanties de livraison : les callbacks arrivent séquentiellement sur la
/// tâche de distribution du préchargeur ; exactement un parmi
/// {`on_success`, `on_fail`, `on_cancel`} est émis, puis `on_end`, toujours en
/// dernier et exactement une fois.
pub trait CacheListener: Send + Sync {
    /// Progression périodique. `total` vaut le volume déjà téléchargé quand la
    /// longueur de la ressource est inconnue.
    fn on_progress(&self, downloaded: u64, total: u64) {
        let _ = (downloaded, total);
    }

    /// La ressource entière est en cache.
    fn on_success(&self) {}

    /// Échec. `not_found` distingue un HTTP 404 pour l'affichage.
    fn on_fail(&self, not_found: bool) {
        let _ = not_found;
    }

    /// Téléchargement annulé volontairement (pas un échec).
    fn on_cancel(&self) {}

    /// Toujours le dernier callback, quel que soit le dénouement.
    fn on_end(&self) {}
}

enum ListenerEvent {
    Progress(u64, u64),
    Success,
    Fail(bool),
    Cancel,
    End,
}

/// Tâche de préchargement d'une ressource complète.
pub struct Prefetcher {
    view: StreamView,
    cancelled: AtomicBool,
    running: AtomicBool,
    /// Garde d'unicité de la notification terminale.
    terminal_sent: AtomicBool,
    listeners: Arc<Mutex<Vec<Box<dyn CacheListener>>>>,
    events: mpsc::UnboundedSender<ListenerEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ListenerEvent>>>,
}

impl Prefetcher {
    pub fn new(view: StreamView) -> Arc<Self> {
        let (events, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            view,
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            listeners: Arc::new(Mutex::new(Vec::new())),
            events,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Enregistre un listener. À faire avant [`Prefetcher::execute`].
    pub async fn add_listener(&self, listener: Box<dyn CacheListener>) {
        self.listeners.lock().await.push(listener);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Demande d'annulation coopérative, testée entre deux lectures (jamais au
    /// milieu d'une). Annuler une tâche pas encore partie produit quand même
    /// la notification terminale : les listeners ne restent jamais en attente.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::debug!("prefetch cancel requested");
        if !self.running.load(Ordering::SeqCst) {
            self.send_terminal(ListenerEvent::Cancel);
        }
    }

    /// Émet l'événement terminal puis `End`, une seule fois quel que soit le
    /// nombre d'appelants en course.
    fn send_terminal(&self, event: ListenerEvent) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
        let _ = self.events.send(ListenerEvent::End);
    }

    /// Soumet la tâche : une tâche de distribution des callbacks et une tâche
    /// de lecture. `on_finished` est rappelé à la toute fin, quelle que soit
    /// l'issue (le propriétaire s'en sert pour son propre registre).
    pub fn execute(self: &Arc<Self>, on_finished: Option<Box<dyn FnOnce() + Send>>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.dispatch_events().await;
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.running.store(true, Ordering::SeqCst);
            tracing::debug!("prefetch started");

            match this.run().await {
                Ok(()) => {
                    tracing::debug!("prefetch done");
                    this.send_terminal(ListenerEvent::Success);
                }
                Err(e) if e.is_cancelled() => {
                    tracing::debug!("prefetch cancelled");
                    this.send_terminal(ListenerEvent::Cancel);
                }
                Err(e) => {
                    tracing::warn!("prefetch failed: {e}");
                    this.send_terminal(ListenerEvent::Fail(e.is_not_found()));
                }
            }

            if let Err(e) = this.view.close().await {
                tracing::warn!("failed to close prefetch view: {e}");
            }

            if let Some(on_finished) = on_finished {
                on_finished();
            }
        });
    }

    /// Boucle de distribution : consomme le canal et invoque les listeners,
    /// séquentiellement, jusqu'à l'événement `End`.
    async fn dispatch_events(&self) {
        let receiver = self.receiver.lock().await.take();
        let Some(mut receiver) = receiver else {
            return;
        };

        while let Some(event) = receiver.recv().await {
            let listeners = self.listeners.lock().await;
            match event {
                ListenerEvent::Progress(downloaded, total) => {
                    for listener in listeners.iter() {
                        listener.on_progress(downloaded, total);
                    }
                }
                ListenerEvent::Success => {
                    for listener in listeners.iter() {
                        listener.on_success();
                    }
                }
                ListenerEvent::Fail(not_found) => {
                    for listener in listeners.iter() {
                        listener.on_fail(not_found);
                    }
                }
                ListenerEvent::Cancel => {
                    for listener in listeners.iter() {
                        listener.on_cancel();
                    }
                }
                ListenerEvent::End => {
                    for listener in listeners.iter() {
                        listener.on_end();
                    }
                    return;
                }
            }
        }
    }

    fn check_cancel(&self) -> pmostreams::Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(StreamError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drainage complet de la vue.
    async fn run(&self) -> pmostreams::Result<()> {
        // Annulé avant d'avoir commencé : aucun trafic réseau.
        self.check_cancel()?;

        self.view.open(0).await?;

        // Longueur totale si le flux la connaît ; sinon la progression est
        // rapportée contre le volume déjà téléchargé.
        let total = match self.view.length().await {
            Ok(length) => length,
            Err(e) => {
                tracing::debug!("resource length unknown: {e}");
                0
            }
        };

        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut downloaded: u64 = 0;
        let mut notified: u64 = 0;

        loop {
            self.check_cancel()?;

            match self.view.read(&mut buffer).await? {
                None => break,
                Some(count) => {
                    downloaded += count as u64;
                    if downloaded >= notified + NOTIFY_SIZE {
                        notified = downloaded;
                        let report_total = if total == 0 { downloaded } else { total };
                        let _ = self
                            .events
                            .send(ListenerEvent::Progress(downloaded, report_total));
                    }
                }
            }
        }

        Ok(())
    }
}
