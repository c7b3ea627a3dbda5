//! TCP transport: every rank is a process listening on `host:base_port + rank`.
//!
//! Each rank dials every other rank once at startup and keeps that connection
//! for its outgoing traffic. Incoming connections are served by one reader task
//! each, which decodes frames into the rank's mailbox. A frame is a `u32`
//! little-endian length followed by a bincode-encoded [`Packet`]. The first four
//! bytes on every connection carry the dialing rank's index.

use super::{Group, Mailbox, Outbound, Packet, Topology};
use crate::error::{RingError, RingResult};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Upper bound on a single frame; the largest sweep envelope is far below it
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Addressing and socket options for one rank of a TCP group
#[derive(Debug, Clone)]
pub struct TcpGroupConfig {
    pub host: String,
    pub base_port: u16,
    pub rank: usize,
    pub size: usize,
    pub buffer_size: usize,
    pub connect_retries: usize,
    pub retry_delay: Duration,
}

impl TcpGroupConfig {
    pub fn new(host: impl Into<String>, base_port: u16, rank: usize, size: usize) -> Self {
        Self {
            host: host.into(),
            base_port,
            rank,
            size,
            buffer_size: crate::defaults::SOCKET_BUFFER_SIZE,
            connect_retries: crate::defaults::CONNECT_RETRIES,
            retry_delay: crate::defaults::CONNECT_RETRY_DELAY,
        }
    }

    /// Listening address of `rank`
    pub fn address_of(&self, rank: usize) -> Result<String> {
        let port = usize::from(self.base_port)
            .checked_add(rank)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| {
                anyhow!(
                    "Port {} + rank {} does not fit in a TCP port",
                    self.base_port,
                    rank
                )
            })?;
        Ok(format!("{}:{}", self.host, port))
    }
}

/// Outgoing connections, indexed by destination rank
pub struct TcpOutbound {
    rank: usize,
    streams: Vec<Option<TcpStream>>,
}

#[async_trait]
impl Outbound for TcpOutbound {
    async fn post(&mut self, dest: usize, packet: Packet) -> RingResult<()> {
        let stream = self
            .streams
            .get_mut(dest)
            .and_then(Option::as_mut)
            .ok_or(RingError::Disconnected { rank: self.rank })?;
        write_frame(stream, &packet).await
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// One rank of a TCP group
pub type TcpComm = Group<TcpOutbound>;

/// Join the group described by `config`
///
/// Binds this rank's listener, dials every peer (retrying while they start
/// up) and returns once all outgoing links are established. Incoming links
/// are accepted in the background.
pub async fn connect(config: &TcpGroupConfig) -> Result<TcpComm> {
    let topology = Topology::new(config.rank, config.size)?;
    let rank = topology.rank();

    let listen_addr = config.address_of(rank)?;
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Rank {} failed to listen on {}", rank, listen_addr))?;
    debug!("Rank {} listening on {}", rank, listen_addr);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(accept_loop(
        listener,
        config.size - 1,
        tx,
        rank,
        config.buffer_size,
    ));

    let mut streams = Vec::with_capacity(config.size);
    for peer in 0..config.size {
        if peer == rank {
            streams.push(None);
            continue;
        }
        let addr = config.address_of(peer)?;
        let stream = connect_with_retry(&addr, config.connect_retries, config.retry_delay).await?;
        let mut stream = configure_stream(stream, config.buffer_size)?;
        stream
            .write_all(&(rank as u32).to_le_bytes())
            .await
            .with_context(|| format!("Rank {} failed to greet rank {}", rank, peer))?;
        debug!("Rank {} connected to rank {} at {}", rank, peer, addr);
        streams.push(Some(stream));
    }

    Ok(Group::new(
        topology,
        Mailbox::new(rank, rx),
        TcpOutbound { rank, streams },
    ))
}

async fn connect_with_retry(addr: &str, retries: usize, delay: Duration) -> Result<TcpStream> {
    let mut attempt = 0;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                if attempt >= retries {
                    return Err(anyhow!(
                        "Failed to connect to {} after {} attempts: {}",
                        addr,
                        retries,
                        e
                    ));
                }
                debug!(
                    "Connect to {} failed (attempt {}/{}): {}",
                    addr, attempt, retries, e
                );
                sleep(delay).await;
            }
        }
    }
}

/// Configure socket options for low latency
fn configure_stream(stream: TcpStream, buffer_size: usize) -> Result<TcpStream> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    socket.set_recv_buffer_size(buffer_size)?;
    socket.set_send_buffer_size(buffer_size)?;
    Ok(TcpStream::from_std(std_stream)?)
}

async fn accept_loop(
    listener: TcpListener,
    expected: usize,
    tx: mpsc::UnboundedSender<Packet>,
    rank: usize,
    buffer_size: usize,
) {
    for _ in 0..expected {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Rank {} failed to accept a peer connection: {}", rank, e);
                return;
            }
        };
        let stream = match configure_stream(stream, buffer_size) {
            Ok(stream) => stream,
            Err(e) => {
                error!("Rank {} failed to configure connection from {}: {}", rank, addr, e);
                return;
            }
        };
        tokio::spawn(read_loop(stream, tx.clone(), rank));
    }
    debug!("Rank {} accepted all {} peer connections", rank, expected);
}

async fn read_loop(mut stream: TcpStream, tx: mpsc::UnboundedSender<Packet>, rank: usize) {
    let mut hello = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut hello).await {
        warn!("Rank {} dropped a connection before its greeting: {}", rank, e);
        return;
    }
    let peer = u32::from_le_bytes(hello) as usize;
    debug!("Rank {} serving incoming link from rank {}", rank, peer);

    loop {
        match read_frame(&mut stream).await {
            Ok(packet) => {
                if packet.source != peer {
                    warn!(
                        "Rank {} got a packet claiming rank {} on the link from rank {}",
                        rank, packet.source, peer
                    );
                }
                if tx.send(packet).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Link from rank {} to rank {} closed: {}", peer, rank, e);
                break;
            }
        }
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> RingResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let bytes = bincode::serialize(packet)?;
    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&bytes);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> RingResult<Packet>
where
    R: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_LEN {
        return Err(RingError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", frame_len),
        )));
    }

    let mut frame = vec![0u8; frame_len];
    reader.read_exact(&mut frame).await?;
    Ok(bincode::deserialize(&frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Body, GroupComm};

    #[test]
    fn test_address_of_offsets_port_by_rank() {
        let config = TcpGroupConfig::new("127.0.0.1", 30000, 0, 4);
        assert_eq!(config.address_of(0).unwrap(), "127.0.0.1:30000");
        assert_eq!(config.address_of(3).unwrap(), "127.0.0.1:30003");

        let config = TcpGroupConfig::new("127.0.0.1", 65535, 0, 2);
        assert!(config.address_of(1).is_err());
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let packet = Packet::data(1, 123123, &[232323, 0, 7, 424242]);
        write_frame(&mut a, &packet).await.unwrap();
        let decoded = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded.source, 1);
        assert_eq!(decoded.body, Body::Data(vec![232323, 0, 7, 424242]));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(RingError::Io(_))));
    }

    #[tokio::test]
    async fn test_two_rank_group_on_loopback() {
        let port = 42310;
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                tokio::spawn(async move {
                    let config = TcpGroupConfig::new("127.0.0.1", port, rank, 2);
                    let mut comm = connect(&config).await.unwrap();
                    let mut buf = [0i32; 3];
                    if rank == 0 {
                        comm.send(1, 9, &[1, 2, 3]).await.unwrap();
                        comm.receive(1, 9, &mut buf).await.unwrap();
                    } else {
                        assert_eq!(comm.probe_size(0, 9).await.unwrap(), 3);
                        comm.receive(0, 9, &mut buf).await.unwrap();
                        comm.send(0, 9, &buf).await.unwrap();
                    }
                    comm.barrier().await.unwrap();
                    buf
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), [1, 2, 3]);
        }
    }
}
