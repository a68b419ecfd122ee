//! Tests du préchargeur : ordre des notifications, annulation, échec.

mod common;

use common::{sample_data, BrokenStream, MemoryStream};
use pmorangecache::{CacheListener, Prefetcher};
use pmostreams::SharedStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Listener qui journalise chaque callback dans l'ordre de réception.
#[derive(Clone, Default)]
struct RecordingListener {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingListener {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    async fn wait_for_end(&self) {
        for _ in 0..100 {
            if self.events().last().map(String::as_str) == Some("end") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no on_end within the deadline: {:?}", self.events());
    }

    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl CacheListener for RecordingListener {
    fn on_progress(&self, downloaded: u64, total: u64) {
        assert!(downloaded <= total);
        self.push("progress");
    }

    fn on_success(&self) {
        self.push("success");
    }

    fn on_fail(&self, not_found: bool) {
        self.push(format!("fail:{not_found}"));
    }

    fn on_cancel(&self) {
        self.push("cancel");
    }

    fn on_end(&self) {
        self.push("end");
    }
}

#[tokio::test]
async fn prefetch_reports_progress_then_success_then_end() {
    // Assez gros pour passer plusieurs seuils de notification.
    let (stream, counters) = MemoryStream::new(sample_data(200_000));
    let shared = SharedStream::new(Box::new(stream));
    let view = shared.create_view().await.unwrap();

    let listener = RecordingListener::default();
    let prefetcher = Prefetcher::new(view);
    prefetcher.add_listener(Box::new(listener.clone())).await;
    prefetcher.execute(None);

    listener.wait_for_end().await;
    let events = listener.events();

    assert!(
        events.iter().filter(|e| *e == "progress").count() >= 2,
        "expected several progress callbacks: {events:?}"
    );
    assert_eq!(events.iter().filter(|e| *e == "success").count(), 1);
    assert_eq!(events.iter().filter(|e| *e == "end").count(), 1);
    assert_eq!(events.last().map(String::as_str), Some("end"));
    let success_at = events.iter().position(|e| e == "success").unwrap();
    assert_eq!(success_at, events.len() - 2, "success right before end");

    // Le préchargeur ferme sa vue, dernière sur le flux partagé.
    assert_eq!(counters.closes(), 1);
}

#[tokio::test]
async fn cancel_before_start_still_notifies_exactly_once() {
    let (stream, counters) = MemoryStream::new(sample_data(1024));
    let shared = SharedStream::new(Box::new(stream));
    let view = shared.create_view().await.unwrap();

    let listener = RecordingListener::default();
    let prefetcher = Prefetcher::new(view);
    prefetcher.add_listener(Box::new(listener.clone())).await;

    // Annulation avant soumission : l'issue est déjà scellée.
    prefetcher.cancel();
    assert!(prefetcher.is_cancelled());
    // Une seconde annulation ne doit rien ajouter.
    prefetcher.cancel();

    prefetcher.execute(None);
    listener.wait_for_end().await;

    assert_eq!(listener.events(), vec!["cancel", "end"]);
    // Aucune ouverture : annulé avant le moindre trafic.
    assert_eq!(counters.opens(), 0);
    assert_eq!(counters.closes(), 1);
}

#[tokio::test]
async fn failed_open_reports_not_found() {
    let shared = SharedStream::new(Box::new(BrokenStream::new(404)));
    let view = shared.create_view().await.unwrap();

    let listener = RecordingListener::default();
    let prefetcher = Prefetcher::new(view);
    prefetcher.add_listener(Box::new(listener.clone())).await;
    prefetcher.execute(None);

    listener.wait_for_end().await;
    assert_eq!(listener.events(), vec!["fail:true", "end"]);
}

#[tokio::test]
async fn on_finished_runs_whatever_the_outcome() {
    let (stream, _counters) = MemoryStream::new(sample_data(256));
    let shared = SharedStream::new(Box::new(stream));
    let view = shared.create_view().await.unwrap();

    let listener = RecordingListener::default();
    let prefetcher = Prefetcher::new(view);
    prefetcher.add_listener(Box::new(listener.clone())).await;

    let finished = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&finished);
    prefetcher.execute(Some(Box::new(move || {
        flag.store(true, Ordering::SeqCst);
    })));

    listener.wait_for_end().await;
    for _ in 0..100 {
        if finished.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(finished.load(Ordering::SeqCst));
}
