//! Tests du flux HTTP Range contre un petit serveur TCP local.

use pmostreams::{HttpRangeStream, RandomAccessStream, StreamError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Sert une unique réponse HTTP brute puis ferme la connexion.
async fn serve_once(response: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;
        socket.write_all(response).await.unwrap();
        let _ = socket.shutdown().await;
    });
    format!("http://{addr}/data")
}

/// Sert les en-têtes puis laisse la connexion ouverte sans jamais envoyer
/// le moindre octet du corps.
async fn serve_stalled_body(headers: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 1024];
        let _ = socket.read(&mut request).await;
        socket.write_all(headers).await.unwrap();
        // Garde la connexion vivante, corps jamais envoyé.
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    format!("http://{addr}/data")
}

async fn drain(stream: &HttpRangeStream) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut buffer = [0u8; 32];
    while let Some(count) = stream.read(&mut buffer).await.unwrap() {
        collected.extend_from_slice(&buffer[..count]);
    }
    collected
}

#[tokio::test]
async fn chunked_body_without_content_length_still_streams() {
    let url = serve_once(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await;
    let stream = HttpRangeStream::new(reqwest::Client::new(), url);

    stream.open(0).await.unwrap();
    // Pas de Content-Length : la longueur est inconnue, pas une erreur
    // d'ouverture.
    assert!(matches!(
        stream.length().await,
        Err(StreamError::UnknownLength)
    ));

    assert_eq!(drain(&stream).await, b"hello");
    stream.close().await.unwrap();
}

#[tokio::test]
async fn announced_length_is_the_absolute_end_offset() {
    let url = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
    let stream = HttpRangeStream::new(reqwest::Client::new(), url);

    stream.open(0).await.unwrap();
    assert_eq!(stream.length().await.unwrap(), 5);
    assert_eq!(drain(&stream).await, b"hello");
}

#[tokio::test]
async fn error_status_fails_open() {
    let url = serve_once(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
    let stream = HttpRangeStream::new(reqwest::Client::new(), url);

    let error = stream.open(0).await.unwrap_err();
    assert!(error.is_not_found());
}

#[tokio::test]
async fn close_interrupts_a_parked_read() {
    let url = serve_stalled_body(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n").await;
    let stream = Arc::new(HttpRangeStream::new(reqwest::Client::new(), url));
    stream.open(0).await.unwrap();

    // Une lecture part et se gare dans l'attente du corps.
    let reader = Arc::clone(&stream);
    let read_task = tokio::spawn(async move {
        let mut buffer = [0u8; 16];
        reader.read(&mut buffer).await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // close ne doit pas attendre que le serveur daigne envoyer des octets.
    tokio::time::timeout(Duration::from_secs(2), stream.close())
        .await
        .expect("close must not wait behind the stalled read")
        .unwrap();

    let read = tokio::time::timeout(Duration::from_secs(2), read_task)
        .await
        .expect("interrupted read must return")
        .unwrap();
    assert!(matches!(read, Err(StreamError::Closed)));
}
