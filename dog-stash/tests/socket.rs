mod common;

use futures::StreamExt;

use common::{account, binary, harness, name, ScriptedChannel};
use dog_stash::{FileLookup, SocketFrame, StashError};

/// Several files over one connection, each its own upload
#[tokio::test]
async fn test_multiple_files_over_one_channel() {
    let h = harness(100, 1000);
    let alice = account("alice");
    let channel = ScriptedChannel::new(vec![
        name("greeting.txt"),
        binary(b"hello"),
        binary(b" world"),
        SocketFrame::End,
        name("bye.txt"),
        binary(b"bye"),
        SocketFrame::End,
    ]);

    let results: Vec<_> = h.stash.upload_via_socket(&alice, channel).collect().await;
    assert_eq!(results.len(), 2);
    let first = results[0].as_ref().unwrap();
    let second = results[1].as_ref().unwrap();
    assert_eq!((first.name.as_str(), first.size), ("greeting.txt", 11));
    assert_eq!((second.name.as_str(), second.size), ("bye.txt", 3));
    assert_eq!(second.available_bytes, 1000 - 14);

    let (data, _) = h
        .stash
        .get_file(&FileLookup::Public, &first.file_id)
        .await
        .unwrap();
    assert_eq!(&data[..], b"hello world");
}

/// Disconnect mid-file: earlier files stay, the cut one leaves nothing
#[tokio::test]
async fn test_disconnect_mid_file_is_compensated() {
    let h = harness(100, 1000);
    let alice = account("alice");
    let channel = ScriptedChannel::new(vec![
        name("done.bin"),
        binary(b"abc"),
        SocketFrame::End,
        name("cut.bin"),
        binary(b"partial"),
    ]);

    let results: Vec<_> = h.stash.upload_via_socket(&alice, channel).collect().await;
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(StashError::Aborted { .. })));

    let files = h.stash.list_files(&alice).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "done.bin");
    assert_eq!(h.stash.account_summary(&alice).await.unwrap().bytes_used, 3);
    h.assert_orphan_free(&alice).await;
}

/// An oversized file is refused and the channel carries on with the next one
#[tokio::test]
async fn test_rejected_file_does_not_end_the_connection() {
    let h = harness(4, 1000);
    let alice = account("alice");
    let channel = ScriptedChannel::new(vec![
        name("big.bin"),
        binary(b"abcdef"),
        binary(b"ghi"),
        SocketFrame::End,
        name("small.bin"),
        binary(b"ab"),
        SocketFrame::End,
    ]);

    let results: Vec<_> = h.stash.upload_via_socket(&alice, channel).collect().await;
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], Err(StashError::PayloadTooLarge { size: 6, max: 4 })));
    assert_eq!(results[1].as_ref().unwrap().size, 2);
    assert_eq!(h.store.inner.len(), 1);
}

#[tokio::test]
async fn test_bytes_before_filename_are_refused() {
    let h = harness(100, 1000);
    let channel = ScriptedChannel::new(vec![binary(b"orphan"), SocketFrame::End]);

    let results: Vec<_> = h
        .stash
        .upload_via_socket(&account("alice"), channel)
        .collect()
        .await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(StashError::Invalid { .. })));
    assert!(h.store.inner.is_empty());
}

/// A filename before the end marker fails the open file and starts the next
#[tokio::test]
async fn test_early_filename_starts_next_file() {
    let h = harness(100, 1000);
    let alice = account("alice");
    let channel = ScriptedChannel::new(vec![
        name("a.txt"),
        binary(b"first"),
        name("b.txt"),
        binary(b"second"),
        SocketFrame::End,
    ]);

    let results: Vec<_> = h.stash.upload_via_socket(&alice, channel).collect().await;
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], Err(StashError::Invalid { .. })));
    let second = results[1].as_ref().unwrap();
    assert_eq!((second.name.as_str(), second.size), ("b.txt", 6));

    let files = h.stash.list_files(&alice).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "b.txt");
    h.assert_orphan_free(&alice).await;
}

/// Same when the open file was already refused and its tail is being skipped
#[tokio::test]
async fn test_filename_while_skipping_refused_file_is_kept() {
    let h = harness(4, 1000);
    let alice = account("alice");
    let channel = ScriptedChannel::new(vec![
        name("big.bin"),
        binary(b"abcdef"),
        binary(b"ghi"),
        name("small.bin"),
        binary(b"ab"),
        SocketFrame::End,
    ]);

    let results: Vec<_> = h.stash.upload_via_socket(&alice, channel).collect().await;
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], Err(StashError::PayloadTooLarge { .. })));
    assert_eq!(results[1].as_ref().unwrap().name, "small.bin");
}
