mod common;

use blobcache::BlobStore;
use bytes::Bytes;
use common::{Harness, slow_backend};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_name_reads_are_serialized() {
    let h = Harness::with_backend(slow_backend(100)).await;
    let body = Bytes::from(vec![7u8; 256 * 1024]);
    h.backend.seed("images/big.png", body.clone()).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = h.client.clone();
        // Independent references, each in its own unit of work.
        let mut r = h.object_in_new_scope("images/big.png");
        tasks.push(tokio::spawn(async move {
            client.get_bytes(&mut r).await.unwrap()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), body);
    }

    assert_eq!(h.backend.max_concurrent_downloads(), 1);
    assert_eq!(h.backend.stats().get, 1);
    assert!(h.client.gate().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_names_download_in_parallel() {
    let h = Harness::with_backend(slow_backend(200)).await;
    h.backend.seed("a.txt", "a").await;
    h.backend.seed("b.txt", "b").await;

    let (client_a, client_b) = (h.client.clone(), h.client.clone());
    let mut a = h.object("a.txt");
    let mut b = h.object_in_new_scope("b.txt");
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { client_a.get_bytes(&mut a).await.unwrap() }),
        tokio::spawn(async move { client_b.get_bytes(&mut b).await.unwrap() }),
    );

    assert_eq!(ra.unwrap(), Bytes::from("a"));
    assert_eq!(rb.unwrap(), Bytes::from("b"));
    assert_eq!(h.backend.max_concurrent_downloads(), 2);
}

#[tokio::test]
async fn test_failed_read_releases_gate() {
    let h = Harness::new().await;
    let mut r = h.object("missing.txt");
    assert!(h.client.get_content(&mut r).await.is_err());
    assert!(h.client.gate().is_empty());

    // The name can be used again right away.
    h.client.put_text(&mut r, "now here").await.unwrap();
    assert_eq!(
        h.client.get_bytes(&mut r).await.unwrap(),
        Bytes::from("now here")
    );
}

#[tokio::test]
async fn test_held_content_survives_refresh() {
    let h = Harness::new().await;
    let v1 = h.backend.seed("doc.txt", "version-one-long").await;
    let mut first = h.object("doc.txt");
    let held = h.client.get_content(&mut first).await.unwrap();

    // Another unit of work sees the new version and refreshes the cache.
    h.backend.seed("doc.txt", "v2").await;
    let mut second = h.object_in_new_scope("doc.txt");
    assert_eq!(
        h.client.get_bytes(&mut second).await.unwrap(),
        Bytes::from("v2")
    );

    assert_eq!(held.etag, v1);
    assert_eq!(
        held.into_bytes().await.unwrap(),
        Bytes::from("version-one-long")
    );
}
