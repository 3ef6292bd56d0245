mod common;

use blobcache::{BlobError, BlobStore, ChunkedUploader, MemoryBackend, PartId};
use bytes::Bytes;
use common::Harness;
use tokio::io::AsyncReadExt;

const PART: usize = 8;

async fn harness() -> Harness {
    Harness::build(MemoryBackend::new(), |c| c.max_part_size = PART).await
}

#[tokio::test]
async fn test_exactly_one_part_size_is_one_part() {
    let h = harness().await;
    let r = h.object("exact.bin");
    let uploader = h.client.uploader();
    let session = uploader.init_session();

    let mut body: &[u8] = &[1u8; PART];
    let parts = uploader
        .upload_from_stream(&r, session, 1, &mut body)
        .await
        .unwrap();
    assert_eq!(parts.len(), 1);
    assert_eq!(h.backend.staged_parts("exact.bin").await, 1);
}

#[tokio::test]
async fn test_one_byte_over_is_two_parts() {
    let h = harness().await;
    let mut r = h.object("over.bin");
    let uploader = h.client.uploader();
    let session = uploader.init_session();

    let data: Vec<u8> = (0..=PART as u8).collect();
    let mut body: &[u8] = &data;
    let parts = uploader
        .upload_from_stream(&r, session, 1, &mut body)
        .await
        .unwrap();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].number(), 1);
    assert_eq!(parts[1].number(), 2);

    // Committing only the tail shows it holds exactly the last byte.
    uploader
        .complete_session(&r, session, &parts[1..])
        .await
        .unwrap();
    assert_eq!(
        h.client.get_bytes(&mut r).await.unwrap(),
        Bytes::from(vec![PART as u8])
    );
}

#[tokio::test]
async fn test_short_reads_are_filled() {
    let h = harness().await;
    let mut r = h.object("chained.bin");
    let uploader = h.client.uploader();
    let session = uploader.init_session();

    // `chain` hands out the first half in a read of its own.
    let mut body = (&b"abc"[..]).chain(&b"defgh"[..]);
    let parts = uploader
        .upload_from_stream(&r, session, 1, &mut body)
        .await
        .unwrap();
    assert_eq!(parts.len(), 1);

    uploader.complete_session(&r, session, &parts).await.unwrap();
    assert_eq!(
        h.client.get_bytes(&mut r).await.unwrap(),
        Bytes::from("abcdefgh")
    );
}

#[tokio::test]
async fn test_empty_stream_is_one_empty_part() {
    let h = harness().await;
    let mut r = h.object("empty.bin");
    let uploader = h.client.uploader();
    let session = uploader.init_session();

    let mut body: &[u8] = &[];
    let parts = uploader
        .upload_from_stream(&r, session, 1, &mut body)
        .await
        .unwrap();
    assert_eq!(parts.len(), 1);
    uploader.complete_session(&r, session, &parts).await.unwrap();
    assert_eq!(r.length().await.unwrap(), 0);
}

#[tokio::test]
async fn test_commit_uses_caller_order() {
    let h = harness().await;
    let mut r = h.object("ordered.txt");
    let uploader = h.client.uploader();
    let session = uploader.init_session();

    let mut first: &[u8] = b"AAAA";
    let mut second: &[u8] = b"BBBB";
    let mut parts = uploader
        .upload_from_stream(&r, session, 1, &mut first)
        .await
        .unwrap();
    parts.extend(
        uploader
            .upload_from_stream(&r, session, 2, &mut second)
            .await
            .unwrap(),
    );

    parts.reverse();
    let etag = uploader.complete_session(&r, session, &parts).await.unwrap();
    assert_eq!(r.etag().await.unwrap(), etag);
    assert_eq!(
        h.client.get_bytes(&mut r).await.unwrap(),
        Bytes::from("BBBBAAAA")
    );
    let props = r.properties().unwrap();
    assert_eq!(props.content_type.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn test_part_ids_share_one_length() {
    let h = harness().await;
    let r = h.object("many.bin");
    let uploader = h.client.uploader();
    let session = uploader.init_session();

    let data = vec![0u8; PART * 11 + 3];
    let mut body: &[u8] = &data;
    let parts = uploader
        .upload_from_stream(&r, session, 1, &mut body)
        .await
        .unwrap();
    assert_eq!(parts.len(), 12);
    let width = parts[0].encoded().len();
    assert!(parts.iter().all(|p| p.encoded().len() == width));
    assert!(
        parts
            .iter()
            .zip(1u32..)
            .all(|(p, n)| p.number() == n && PartId::decode(&p.encoded()).as_ref() == Some(p))
    );
}

#[tokio::test]
async fn test_foreign_parts_are_rejected() {
    let h = harness().await;
    let r = h.object("mixed.bin");
    let uploader = h.client.uploader();
    let session = uploader.init_session();
    let other = uploader.init_session();
    assert_ne!(session, other);

    let mut body: &[u8] = b"abc";
    let parts = uploader
        .upload_from_stream(&r, other, 1, &mut body)
        .await
        .unwrap();
    let err = uploader
        .complete_session(&r, session, &parts)
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::Argument(_)));
    assert_eq!(h.backend.stats().commit_parts, 0);
}

#[tokio::test]
async fn test_abort_only_invalidates() {
    let h = harness().await;
    h.backend.seed("aborted.bin", "keep").await;
    let mut r = h.object("aborted.bin");
    assert!(r.fetch_attributes().await.unwrap());
    let uploader = h.client.uploader();
    let session = uploader.init_session();

    let mut body: &[u8] = b"never committed";
    uploader
        .upload_from_stream(&r, session, 1, &mut body)
        .await
        .unwrap();
    uploader.abort_session(&r, session).await.unwrap();

    assert!(r.fetch_attributes().await.unwrap());
    assert_eq!(h.backend.stats().head, 2);
    assert_eq!(h.backend.stats().commit_parts, 0);
    assert_eq!(h.backend.peek("aborted.bin").await.unwrap(), Bytes::from("keep"));
}

#[test]
fn test_standalone_uploader_uses_its_part_size() {
    let uploader = ChunkedUploader::with_part_size(PART).unwrap();
    assert_eq!(uploader.max_part_size(), PART);
}
