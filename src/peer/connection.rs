//! Peer connection module
//!
//! One [`PeerConnection`] is the execution unit for one remote peer. It
//! performs the handshake, owns the [`PeerSession`], and runs a single event
//! loop that multiplexes received frames, commands from the rest of the
//! torrent, pending uploads and a housekeeping tick.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::session::PeerSession;
use crate::peer::swarm::{PeerCommand, PeerSource};
use crate::protocol::{BitTorrentWire, Handshake, Message};
use crate::transfer::{Flow, Orchestrator};

/// Frames buffered between the socket reader and the event loop
const FRAME_QUEUE: usize = 16;

/// Housekeeping period for keep-alives and idle detection
const TICK: Duration = Duration::from_secs(1);

/// A handshaked connection to a peer
pub struct PeerConnection<S> {
    stream: S,
    session: PeerSession,
    orchestrator: Arc<Orchestrator>,
    wire: BitTorrentWire,
    commands: UnboundedReceiver<PeerCommand>,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Handshake on a stream we dialled
    pub async fn establish_outbound(
        mut stream: S,
        addr: SocketAddr,
        orchestrator: Arc<Orchestrator>,
        source: PeerSource,
    ) -> Result<Self> {
        let mut session = orchestrator.new_session(addr);
        session.connecting();

        let wire = BitTorrentWire::default();
        let ours = Handshake::new(*orchestrator.info_hash(), orchestrator.peer_id());
        let exchange = async {
            wire.write_handshake(&mut stream, &ours).await?;
            wire.read_handshake(&mut stream).await
        };
        let remote = timeout(orchestrator.config().handshake_timeout(), exchange)
            .await
            .map_err(|_| {
                debug!("Handshake with {} timed out", addr);
                TorrentError::network_error_with_address("Handshake timed out", addr.to_string())
            })??;

        Self::check_remote(&remote, addr, &orchestrator)?;
        Self::finish(stream, session, remote, orchestrator, source)
    }

    /// Answer a handshake already read from an accepted stream
    pub async fn establish_inbound(
        mut stream: S,
        addr: SocketAddr,
        remote: Handshake,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<Self> {
        let mut session = orchestrator.new_session(addr);
        session.connecting();
        Self::check_remote(&remote, addr, &orchestrator)?;

        let ours = Handshake::new(*orchestrator.info_hash(), orchestrator.peer_id());
        timeout(
            orchestrator.config().handshake_timeout(),
            BitTorrentWire::default().write_handshake(&mut stream, &ours),
        )
        .await
        .map_err(|_| TorrentError::network_error_with_address("Handshake timed out", addr.to_string()))??;

        Self::finish(stream, session, remote, orchestrator, PeerSource::Incoming)
    }

    fn check_remote(remote: &Handshake, addr: SocketAddr, orchestrator: &Orchestrator) -> Result<()> {
        if !remote.validate(orchestrator.info_hash()) {
            warn!("Peer {} sent handshake for another torrent", addr);
            return Err(TorrentError::protocol_error_with_source(
                "Info hash mismatch",
                hex::encode(remote.info_hash),
            )
            .into());
        }
        if remote.peer_id == orchestrator.peer_id() {
            debug!("Rejecting connection to ourselves via {}", addr);
            return Err(TorrentError::peer_error_with_peer("Connected to self", addr.to_string()).into());
        }
        Ok(())
    }

    fn finish(
        stream: S,
        mut session: PeerSession,
        remote: Handshake,
        orchestrator: Arc<Orchestrator>,
        source: PeerSource,
    ) -> Result<Self> {
        let addr = session.addr();
        let (tx, commands) = mpsc::unbounded_channel();
        orchestrator.swarm().attach(addr, remote.peer_id, source, tx)?;
        session.handshake_completed(remote.peer_id, remote.reserved);

        let config = orchestrator.config();
        let shaper = orchestrator
            .shaper()
            .child(config.peer_download_limit, config.peer_upload_limit);
        let wire = BitTorrentWire::new(config.max_frame_length).with_shaper(shaper);

        info!("Connected to peer {} ({:?})", addr, source);
        Ok(Self {
            stream,
            session,
            orchestrator,
            wire,
            commands,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.session.addr()
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Drive the connection until either side closes it.
    ///
    /// Never fails: errors are logged and the unit cleans up after itself.
    pub async fn run(self) {
        let PeerConnection {
            stream,
            mut session,
            orchestrator,
            wire,
            mut commands,
        } = self;
        let addr = session.addr();

        let (reader, mut writer) = tokio::io::split(stream);
        let (frame_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
        let reader_task = tokio::spawn(read_frames(reader, wire.clone(), frame_tx));

        let result = event_loop(&mut session, &orchestrator, &wire, &mut writer, &mut frames, &mut commands).await;
        match result {
            Ok(()) => info!("Closing connection to {}", addr),
            Err(e) => match crate::error::as_torrent_error(&e) {
                Some(err) if err.is_protocol_violation() => warn!("Peer {} violated the protocol: {}", addr, err),
                Some(err) if err.is_torrent_wide() => error!("Connection to {} aborted: {}", addr, err),
                _ => debug!("Connection to {} ended: {}", addr, e),
            },
        }

        reader_task.abort();
        if let Err(e) = writer.shutdown().await {
            trace!("Shutdown of {} failed: {}", addr, e);
        }
        orchestrator.on_disconnect(&mut session);
    }
}

/// Forward decoded frames to the event loop until the stream fails
async fn read_frames<R>(mut reader: R, wire: BitTorrentWire, frames: mpsc::Sender<Result<Message>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let result = wire.read_message(&mut reader).await;
        let failed = result.is_err();
        if frames.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn event_loop<W>(
    session: &mut PeerSession,
    orchestrator: &Orchestrator,
    wire: &BitTorrentWire,
    writer: &mut W,
    frames: &mut mpsc::Receiver<Result<Message>>,
    commands: &mut UnboundedReceiver<PeerCommand>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut outbox = Vec::new();
    orchestrator.on_handshaked(session, &mut outbox);
    flush(session, wire, writer, &mut outbox).await?;

    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let flow = tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(PeerCommand::Have(index)) => orchestrator.on_local_have(session, index, &mut outbox)?,
                Some(PeerCommand::Disconnect) | None => Flow::Disconnect,
            },
            _ = std::future::ready(()), if session.pending_upload().is_some() => {
                orchestrator.serve_upload(session, &mut outbox).await?
            }
            frame = frames.recv() => match frame {
                Some(Ok(message)) => {
                    let event = session.receive(message)?;
                    orchestrator.handle_event(session, event, &mut outbox).await?
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(TorrentError::peer_error_with_peer("Reader stopped", session.addr().to_string()).into())
                }
            },
            _ = ticker.tick() => orchestrator.check_idle(session, &mut outbox),
        };

        flush(session, wire, writer, &mut outbox).await?;
        if flow == Flow::Disconnect {
            return Ok(());
        }
    }
}

async fn flush<W>(session: &mut PeerSession, wire: &BitTorrentWire, writer: &mut W, outbox: &mut Vec<Message>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for message in outbox.drain(..) {
        wire.write_message(writer, &message).await?;
        session.record_sent();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::MemoryStorage;
    use crate::torrent::{Torrent, TorrentInfo};
    use std::path::PathBuf;
    use tokio::io::duplex;

    fn content() -> Vec<u8> {
        (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn orchestrator(seed: bool, peer_id: u8) -> (Arc<Orchestrator>, Arc<MemoryStorage>) {
        let info = TorrentInfo::from_content("conn", 32768, &[(PathBuf::from("conn"), content())]);
        let torrent = Arc::new(Torrent::from_info(&info).unwrap());
        let storage = Arc::new(if seed {
            MemoryStorage::with_content(content())
        } else {
            MemoryStorage::new(100_000)
        });
        if seed {
            for i in 0..torrent.piece_count() as u32 {
                torrent.mark_complete(i);
            }
        }
        let o = Orchestrator::new(torrent, storage.clone(), EngineConfig::default(), [peer_id; 20]);
        (Arc::new(o), storage)
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_transfer_over_duplex() {
        let (seeder, _) = orchestrator(true, 1);
        let (leecher, storage) = orchestrator(false, 2);
        let (client, mut server) = duplex(256 * 1024);

        let outbound = {
            let leecher = leecher.clone();
            tokio::spawn(async move {
                PeerConnection::establish_outbound(client, addr(1), leecher, PeerSource::Manual).await
            })
        };
        let remote = BitTorrentWire::default().read_handshake(&mut server).await.unwrap();
        let inbound = PeerConnection::establish_inbound(server, addr(2), remote, seeder.clone())
            .await
            .unwrap();
        let outbound = outbound.await.unwrap().unwrap();
        assert_eq!(outbound.session().peer_id(), Some([1u8; 20]));
        assert!(leecher.swarm().is_connected(&addr(1)));

        let seed_task = tokio::spawn(inbound.run());
        let leech_task = tokio::spawn(outbound.run());
        tokio::time::timeout(Duration::from_secs(10), async {
            leech_task.await.unwrap();
            seed_task.await.unwrap();
        })
        .await
        .unwrap();

        assert!(leecher.torrent().is_complete());
        assert_eq!(storage.contents(), content());
        assert!(!leecher.swarm().is_connected(&addr(1)));
        assert!(!seeder.swarm().is_connected(&addr(2)));
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_rejected() {
        let (leecher, _) = orchestrator(false, 2);
        let (client, mut server) = duplex(1024);

        let peer = tokio::spawn(async move {
            let wire = BitTorrentWire::default();
            let _ = wire.read_handshake(&mut server).await;
            wire.write_handshake(&mut server, &Handshake::new([9u8; 20], [3u8; 20])).await
        });
        let err = PeerConnection::establish_outbound(client, addr(1), leecher.clone(), PeerSource::Manual)
            .await
            .err()
            .unwrap();
        assert!(crate::error::as_torrent_error(&err).unwrap().is_protocol_violation());
        assert!(!leecher.swarm().is_connected(&addr(1)));
        peer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (o, _) = orchestrator(false, 5);
        let (client, _server) = duplex(1024);
        let remote = Handshake::new(*o.info_hash(), o.peer_id());
        assert!(PeerConnection::establish_inbound(client, addr(1), remote, o.clone()).await.is_err());
        assert_eq!(o.swarm().connected_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_command_ends_unit() {
        let (seeder, _) = orchestrator(true, 1);
        let (client, mut server) = duplex(64 * 1024);
        let remote = Handshake::new(*seeder.info_hash(), [7u8; 20]);
        let conn = PeerConnection::establish_inbound(client, addr(3), remote, seeder.clone())
            .await
            .unwrap();
        let task = tokio::spawn(conn.run());

        // Our handshake then our bitfield arrive first
        let wire = BitTorrentWire::default();
        wire.read_handshake(&mut server).await.unwrap();
        assert!(matches!(wire.read_message(&mut server).await.unwrap(), Message::Bitfield { .. }));

        seeder.swarm().disconnect_all();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!seeder.swarm().is_connected(&addr(3)));
    }

    #[tokio::test]
    async fn test_violation_disconnects() {
        let (seeder, _) = orchestrator(true, 1);
        let (client, mut server) = duplex(64 * 1024);
        let remote = Handshake::new(*seeder.info_hash(), [7u8; 20]);
        let conn = PeerConnection::establish_inbound(client, addr(4), remote, seeder.clone())
            .await
            .unwrap();
        let task = tokio::spawn(conn.run());

        let wire = BitTorrentWire::default();
        wire.read_handshake(&mut server).await.unwrap();
        wire.read_message(&mut server).await.unwrap();
        wire.write_message(&mut server, &Message::Have { piece_index: 99 }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!seeder.swarm().is_connected(&addr(4)));
    }
}
