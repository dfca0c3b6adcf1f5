use crate::transport::defs::MAX_PACKET_SIZE;
use crate::transport::frame::Frame;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};

// A non-blocking datagram endpoint exclusively owned by one session. Source
// filtering against the latched peer happens here; the engines decide when to
// latch (the sender pre-latches its configured remote, the receiver latches
// on the first SYN it accepts).
pub struct Endpoint {
    socket: UdpSocket,
    peer: Option<SocketAddrV4>,
}

impl Endpoint {
    pub fn bind(local: SocketAddrV4) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .context(format!("Failed to bind udp socket to {}.", local))?;
        socket
            .set_nonblocking(true)
            .context("Failed to set the udp socket non-blocking.")?;
        Ok(Self { socket, peer: None })
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(addr) => {
                anyhow::bail!("Udp socket is bound to an Ipv6 address ({}).", addr)
            }
        }
    }

    // The peer lock is monotone within a session.
    pub fn latch_peer(&mut self, addr: SocketAddrV4) {
        if self.peer.is_none() {
            self.peer = Some(addr);
            log::info!("Latched remote endpoint {}.", addr);
        }
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn send(&self, frame: &Frame) -> Result<usize> {
        let Some(peer) = self.peer else {
            anyhow::bail!("Cannot send a frame before the remote endpoint is known.");
        };
        let bytes = frame.create_frame();
        let sent = self
            .socket
            .send_to(&bytes, peer)
            .context(format!("Failed to send a {} frame to {}.", frame.kind, peer))?;
        log::trace!(
            "Sent a {} frame. seq={} ack={} len={} remote={}",
            frame.kind,
            frame.seq_num,
            frame.ack_num,
            sent,
            peer
        );
        Ok(sent)
    }

    // Returns None when no datagram is pending, and silently drops datagrams
    // from sources other than the latched peer as well as malformed frames.
    pub fn try_recv(&mut self) -> Result<Option<(Frame, SocketAddrV4)>> {
        let mut buf = [0u8; MAX_PACKET_SIZE * 2];
        match self.socket.recv_from(&mut buf) {
            Ok((length, SocketAddr::V4(from))) => {
                if let Some(peer) = self.peer {
                    if from != peer {
                        log::trace!("Discarding a datagram from unknown endpoint {}.", from);
                        return Ok(None);
                    }
                }
                let mut frame = Frame::new();
                match frame.read(&buf[..length]) {
                    Ok(()) => Ok(Some((frame, from))),
                    Err(e) => {
                        log::debug!("Discarding a malformed datagram from {}. Err: {:?}", from, e);
                        Ok(None)
                    }
                }
            }
            Ok((_, SocketAddr::V6(from))) => {
                log::trace!("Discarding a datagram from an Ipv6 endpoint {}.", from);
                Ok(None)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("Failed to receive from the udp socket."),
        }
    }
}
