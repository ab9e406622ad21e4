//! Integration tests for recheck of partial downloads.

use ferry_files::MIN_BLOCK_SIZE;
use ferry_integration_tests::fixtures::{QueueFixture, peer, sample_data};
use ferry_queue::{Completion, QueueEvent, QueueStatus, RecheckOutcome};
use std::time::Duration;

const BLOCK: usize = MIN_BLOCK_SIZE as usize;

#[tokio::test]
async fn test_recheck_refused_while_running() {
    let fixture = QueueFixture::new();
    let data = sample_data(2 * BLOCK, 20);
    let target = fixture.queue(&data, peer(1), true).await;

    let download = fixture.manager.start_download(&peer(1)).await.unwrap().unwrap();
    assert_eq!(
        fixture.manager.recheck(&target).await.unwrap(),
        RecheckOutcome::DownloadsRunning
    );
    fixture.manager.on_source_disconnected(download).await;
}

/// Blocks damaged on disk after a download are found and fetched again.
#[tokio::test]
async fn test_recheck_after_disk_damage() {
    let fixture = QueueFixture::new();
    let data = sample_data(4 * BLOCK, 21);
    let target = fixture.queue(&data, peer(1), true).await;

    let mut download = fixture.manager.start_download(&peer(1)).await.unwrap().unwrap();
    fixture
        .manager
        .on_bytes_received(&mut download, &data[..3 * BLOCK])
        .await
        .unwrap();
    fixture.manager.on_source_disconnected(download).await;

    let temp = fixture
        .manager
        .item(&target)
        .await
        .unwrap()
        .temp_target()
        .to_path_buf();
    let mut on_disk = std::fs::read(&temp).unwrap();
    on_disk[2 * BLOCK + 5] ^= 0xFF;
    std::fs::write(&temp, &on_disk).unwrap();

    assert_eq!(
        fixture.manager.recheck(&target).await.unwrap(),
        RecheckOutcome::Done
    );
    let item = fixture.manager.item(&target).await.unwrap();
    assert_eq!(item.status(), QueueStatus::Waiting);
    assert_eq!(
        item.completed_blocks().keys().copied().collect::<Vec<_>>(),
        vec![0, 1]
    );

    assert_eq!(
        fixture.transfer(peer(1), &data, 16_384).await.unwrap(),
        Completion::Finished
    );
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

/// Background recheck reports its stages as events.
#[tokio::test]
async fn test_spawned_recheck_emits_outcome() {
    let fixture = QueueFixture::new();
    let data = sample_data(BLOCK, 22);
    let target = fixture.queue(&data, peer(1), true).await;
    let mut events = fixture.manager.subscribe();

    assert_eq!(
        fixture.manager.spawn_recheck(target.clone()),
        RecheckOutcome::Started
    );

    let mut outcomes = Vec::new();
    while outcomes.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let QueueEvent::Recheck { outcome, .. } = event {
            outcomes.push(outcome);
        }
    }
    assert_eq!(outcomes, vec![RecheckOutcome::Started, RecheckOutcome::NoFile]);
}
