use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use peerwire::{
    Controller, EngineConfig, MemoryStorage, Orchestrator, PeerCandidate, PiecePolicy, TcpTransport, Torrent,
    TorrentInfo,
};
use tokio::sync::mpsc;

const PIECE_LENGTH: u32 = 32768;

fn files() -> Vec<(PathBuf, Vec<u8>)> {
    let first: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    let second: Vec<u8> = (0..45_123u32).map(|i| (i * 13 % 256) as u8).collect();
    vec![
        (PathBuf::from("swarm/first.bin"), first),
        (PathBuf::from("swarm/second.bin"), second),
    ]
}

fn content() -> Vec<u8> {
    files().into_iter().flat_map(|(_, data)| data).collect()
}

fn info() -> TorrentInfo {
    TorrentInfo::from_content("swarm", PIECE_LENGTH, &files())
}

fn controller(config: EngineConfig) -> Controller<TcpTransport> {
    let transport = TcpTransport::new(Duration::from_secs(5)).with_bind_ip([127, 0, 0, 1].into());
    Controller::with_transport(config, transport).unwrap()
}

async fn seeder(config: EngineConfig) -> (Controller<TcpTransport>, Arc<Orchestrator>) {
    let controller = controller(config);
    let torrent = Arc::new(Torrent::from_info(&info()).unwrap());
    let orchestrator = controller
        .register_torrent(torrent, Arc::new(MemoryStorage::with_content(content())))
        .unwrap();
    assert_eq!(orchestrator.recheck().await, orchestrator.torrent().piece_count());
    (controller, orchestrator)
}

fn leecher(config: EngineConfig) -> (Controller<TcpTransport>, Arc<Orchestrator>, Arc<MemoryStorage>) {
    let controller = controller(config);
    let torrent = Arc::new(Torrent::from_info(&info()).unwrap());
    let storage = Arc::new(MemoryStorage::new(torrent.total_size()));
    let orchestrator = controller.register_torrent(torrent, storage.clone()).unwrap();
    (controller, orchestrator, storage)
}

async fn wait_complete(orchestrator: &Orchestrator) {
    tokio::time::timeout(Duration::from_secs(20), async {
        while !orchestrator.torrent().is_complete() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("download did not complete");
}

#[tokio::test]
async fn test_leecher_downloads_from_seeder() {
    let (seed_controller, _seed) = seeder(EngineConfig::default()).await;
    let seed_addr = seed_controller.start(0).await.unwrap();

    let (leech_controller, leech, storage) = leecher(EngineConfig::default());
    leech_controller.connect(leech.info_hash(), seed_addr).await.unwrap();

    wait_complete(&leech).await;
    assert_eq!(storage.contents(), content());

    let stats = leech_controller.announce_stats(leech.info_hash()).unwrap();
    assert_eq!(stats.left, 0);
    assert!(stats.downloaded >= content().len() as u64);
    assert!(leech_controller.torrent_error(leech.info_hash()).is_none());

    leech_controller.stop().await;
    seed_controller.stop().await;
}

#[tokio::test]
async fn test_pipelined_rarest_first_via_candidates() {
    let config = EngineConfig {
        pipeline_depth: 4,
        piece_policy: PiecePolicy::RarestFirst,
        end_game: true,
        ..EngineConfig::default()
    };
    let (seed_a, _) = seeder(config.clone()).await;
    let (seed_b, _) = seeder(config.clone()).await;
    let addr_a = seed_a.start(0).await.unwrap();
    let addr_b = seed_b.start(0).await.unwrap();

    let (leech_controller, leech, storage) = leecher(config);
    let (tx, rx) = mpsc::channel(4);
    leech_controller.add_peers(leech.info_hash(), rx).unwrap();
    tx.send(PeerCandidate::new(addr_a)).await.unwrap();
    tx.send(PeerCandidate::new(addr_b)).await.unwrap();
    // A duplicate candidate must not produce a second connection
    tx.send(PeerCandidate::new(addr_a)).await.unwrap();

    wait_complete(&leech).await;
    assert_eq!(storage.contents(), content());
    assert!(leech.swarm().len() <= 2);

    leech_controller.stop().await;
    seed_a.stop().await;
    seed_b.stop().await;
}

#[tokio::test]
async fn test_seeder_accepts_inbound_leecher_with_upload_limit() {
    let seed_config = EngineConfig {
        upload_limit: 256 * 1024,
        ..EngineConfig::default()
    };
    let (seed_controller, seed) = seeder(seed_config).await;
    let seed_addr = seed_controller.start(0).await.unwrap();

    let (leech_controller, leech, storage) = leecher(EngineConfig::default());
    leech_controller.start(0).await.unwrap();
    leech_controller.connect(leech.info_hash(), seed_addr).await.unwrap();

    wait_complete(&leech).await;
    assert_eq!(storage.contents(), content());
    assert!(seed.announce_stats().uploaded >= content().len() as u64);

    // Once both sides are complete the connection is redundant and closes
    tokio::time::timeout(Duration::from_secs(5), async {
        while seed.swarm().connected_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("redundant connection stayed open");

    leech_controller.stop().await;
    seed_controller.stop().await;
}
