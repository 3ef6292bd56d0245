mod common;

use std::sync::{Arc, Mutex};

use blobcache::error::BoxError;
use blobcache::{
    AuditRecord, AuditSink, BlobError, BlobStore, ContainerOptions, MemoryBackend, ObjectRef,
    RemoteContainer, TextEncoding,
};
use bytes::Bytes;
use common::Harness;

#[derive(Default)]
struct CollectingSink(Mutex<Vec<AuditRecord>>);

impl AuditSink for CollectingSink {
    fn record(&self, record: &AuditRecord) -> Result<(), BoxError> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_logo_lifecycle() {
    let h = Harness::new().await;
    let mut logo = h.object("images/logo.png");
    assert!(!h.client.exists(&mut logo).await.unwrap());

    let png = Bytes::from_static(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    h.client.put_bytes(&mut logo, png.clone()).await.unwrap();
    assert!(h.client.exists(&mut logo).await.unwrap());
    assert_eq!(logo.length().await.unwrap(), png.len() as u64);

    // Populate the local cache so eviction can be observed.
    assert_eq!(h.client.get_bytes(&mut logo).await.unwrap(), png);
    let paths = h.client.disk_cache().paths_for("site", "images/logo.png");
    assert!(paths.content.exists());
    assert!(paths.sidecar.exists());

    logo.lock().await.unwrap();
    let metadata = h.backend.peek_metadata("images/logo.png").await.unwrap();
    assert_eq!(metadata.get("Lock").map(String::as_str), Some("True"));
    let err = h
        .client
        .put_bytes(&mut logo, Bytes::from_static(b"other"))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::LockConflict { .. }));

    logo.unlock().await.unwrap();
    h.client.delete(&mut logo).await.unwrap();
    assert!(!h.client.exists(&mut logo).await.unwrap());
    assert!(!paths.content.exists());
    assert!(!paths.sidecar.exists());
    assert!(!paths.temp.exists());
}

#[tokio::test]
async fn test_round_trip_within_one_scope() {
    let h = Harness::new().await;
    let mut r = h.object("docs/readme.md");
    h.client.put_text(&mut r, "# hello\n").await.unwrap();
    assert_eq!(
        h.client.get_text(&mut r, TextEncoding::Utf8).await.unwrap(),
        "# hello\n"
    );
}

#[tokio::test]
async fn test_append_on_missing_equals_put() {
    let h = Harness::new().await;
    let mut appended = h.object("a.txt");
    let mut put = h.object("b.txt");
    h.client
        .append_text(&mut appended, "same", TextEncoding::Utf8)
        .await
        .unwrap();
    h.client.put_text(&mut put, "same").await.unwrap();

    assert_eq!(h.backend.peek("a.txt").await, h.backend.peek("b.txt").await);
    assert_eq!(appended.etag().await.unwrap(), put.etag().await.unwrap());
}

#[tokio::test]
async fn test_append_a_then_b() {
    let h = Harness::new().await;
    let mut r = h.object("log.txt");
    h.client
        .append_text(&mut r, "A", TextEncoding::Utf8)
        .await
        .unwrap();
    h.client
        .append_text(&mut r, "B", TextEncoding::Utf8)
        .await
        .unwrap();
    assert_eq!(h.backend.peek("log.txt").await.unwrap(), Bytes::from("AB"));
}

#[tokio::test]
async fn test_mutations_are_audited() {
    let h = Harness::new().await;
    let sink = Arc::new(CollectingSink::default());
    let container = RemoteContainer::with_backend(
        "site",
        h.backend.clone(),
        ContainerOptions {
            reference_only: true,
            ..ContainerOptions::default()
        },
    )
    .await
    .unwrap()
    .with_audit(sink.clone());

    let mut r = ObjectRef::new(container.clone(), "notes.txt", h.scope.clone()).unwrap();
    let mut copy = ObjectRef::new(container, "notes-copy.txt", h.scope.clone()).unwrap();
    h.client.put_text(&mut r, "x").await.unwrap();
    h.client.copy(&mut r, &mut copy, true).await.unwrap();
    h.client.delete(&mut r).await.unwrap();

    let records = sink.0.lock().unwrap();
    let operations: Vec<_> = records.iter().map(|r| r.operation.as_str()).collect();
    assert_eq!(operations, ["PutText", "Copy", "Delete"]);
    assert!(records.iter().all(|r| r.backend == "memory"));
    assert_eq!(records[0].path, "notes.txt");
    assert_eq!(records[1].path, "notes-copy.txt");
}

#[tokio::test]
async fn test_case_insensitive_container_shares_objects() {
    let h = Harness::new().await;
    let container = RemoteContainer::with_backend(
        "site",
        Arc::new(MemoryBackend::new()),
        ContainerOptions {
            case_sensitive: false,
            ..ContainerOptions::default()
        },
    )
    .await
    .unwrap();

    let mut upper = ObjectRef::new(container.clone(), "Docs/README.TXT", h.scope.clone()).unwrap();
    h.client.put_text(&mut upper, "shared").await.unwrap();
    let mut lower = ObjectRef::new(container, "docs/readme.txt", h.scope.clone()).unwrap();
    assert_eq!(
        h.client.get_text(&mut lower, TextEncoding::Utf8).await.unwrap(),
        "shared"
    );
}

#[tokio::test]
async fn test_reference_from_uri() {
    let h = Harness::new().await;
    h.backend.seed("images/logo.png", "png").await;
    let mut r = ObjectRef::from_uri(
        h.container.clone(),
        "https://s3.amazonaws.com/site/images/logo.png",
        h.scope.clone(),
    )
    .unwrap();
    assert!(h.client.exists(&mut r).await.unwrap());

    let foreign = ObjectRef::from_uri(
        h.container.clone(),
        "https://example.com/site/images/logo.png",
        h.scope.clone(),
    );
    assert!(matches!(foreign, Err(BlobError::Argument(_))));
}

#[tokio::test]
async fn test_delete_succeeds_when_eviction_fails() {
    let h = Harness::new().await;
    let mut r = h.object("docs/stuck.txt");
    h.client.put_text(&mut r, "cached").await.unwrap();
    assert_eq!(h.client.get_bytes(&mut r).await.unwrap(), Bytes::from("cached"));

    // A directory where the sidecar should be cannot be removed as a file.
    let paths = h.client.disk_cache().paths_for("site", "docs/stuck.txt");
    std::fs::remove_file(&paths.sidecar).unwrap();
    std::fs::create_dir(&paths.sidecar).unwrap();

    h.client.delete(&mut r).await.unwrap();
    assert!(h.backend.peek("docs/stuck.txt").await.is_none());
    assert!(!paths.content.exists());
    assert!(paths.sidecar.is_dir());
    assert!(h.client.gate().is_empty());
}
