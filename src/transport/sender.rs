use crate::transport::{
    defs::{
        CongestionState, ConnectionState, FrameKind, TransferError, DUP_ACK_THRESHOLD,
        MAX_DATA_SIZE, RETRANSMISSION_TIMEOUT, WINDOW_SIZE,
    },
    endpoint::Endpoint,
    frame::Frame,
    timer::ControlTimer,
};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::thread;
use std::time::{Duration, Instant};

const DATA_TICK: Duration = Duration::from_millis(1);
const CONTROL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Clone, Copy)]
pub struct SenderStats {
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub retransmissions: u64,
}

#[derive(Debug)]
struct SendBufferEntry {
    frame: Frame,
    last_sent: Instant,
}

// The sending side of a session: owns the socket and all per-session state,
// and drives the connection through the handshake, the file-name handoff,
// the windowed data transfer and the FIN exchange.
pub struct Sender {
    endpoint: Endpoint,
    remote: SocketAddrV4,
    state: ConnectionState,
    isn: u32,
    base: u32,
    next_seq: u32,
    send_buffer: BTreeMap<u32, SendBufferEntry>,
    cong_state: CongestionState,
    cwnd: f64,
    ssthresh: u32,
    dup_acks: u32,
    last_ack: u32,
    stats: SenderStats,
}

impl Sender {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4) -> Result<Self> {
        let mut endpoint = Endpoint::bind(local)?;
        endpoint.latch_peer(remote);
        Ok(Self {
            endpoint,
            remote,
            state: ConnectionState::Closed,
            isn: 0,
            base: 0,
            next_seq: 0,
            send_buffer: BTreeMap::new(),
            cong_state: CongestionState::SlowStart,
            cwnd: 1.0,
            ssthresh: WINDOW_SIZE,
            dup_acks: 0,
            last_ack: 0,
            stats: SenderStats::default(),
        })
    }

    pub fn stats(&self) -> SenderStats {
        self.stats
    }

    // Three-way establishment: SYN, SYN-ACK, then the third-leg ACK. The
    // receiver stays in SYN-RECEIVED until that ACK arrives.
    pub fn connect(&mut self) -> Result<()> {
        let syn = Frame::new_syn(self.isn);
        self.transmit(&syn)?;
        self.state = ConnectionState::SynSent;
        let mut timer = ControlTimer::fire();
        log::debug!(
            "Status changed from CLOSED to SYN-SENT. ISN={} remote={}",
            self.isn,
            self.remote
        );
        loop {
            if timer.is_exhausted() {
                self.state = ConnectionState::Closed;
                anyhow::bail!(TransferError::HandshakeTimeout {
                    retries: timer.retries(),
                    remote: self.remote,
                });
            }
            if timer.is_expired() {
                self.transmit(&syn)?;
                timer.next();
                log::debug!("SYN frame timed out. Retransmitted. retries={}", timer.retries());
            }
            if let Some((frame, _)) = self.endpoint.try_recv()? {
                if frame.kind == FrameKind::SynAck
                    && frame.verify_checksum()
                    && frame.ack_num == self.isn.wrapping_add(1)
                {
                    let ack = Frame::new_ack(
                        self.isn.wrapping_add(1),
                        frame.seq_num.wrapping_add(1),
                        Vec::new(),
                    );
                    self.transmit(&ack)?;
                    self.base = self.isn.wrapping_add(1);
                    self.next_seq = self.base;
                    self.last_ack = self.base;
                    self.state = ConnectionState::Established;
                    log::info!("Connection established. remote={}", self.remote);
                    return Ok(());
                }
            }
            thread::sleep(CONTROL_TICK);
        }
    }

    // Reads the whole input into memory, announces its basename, then runs
    // the sliding-window transfer until every data frame is acknowledged.
    pub fn send_file(&mut self, path: &str) -> Result<SenderStats> {
        anyhow::ensure!(
            self.state == ConnectionState::Established,
            "Cannot send a file while the connection is {}.",
            self.state
        );
        let data =
            std::fs::read(path).context(format!("Failed to read the input file {}.", path))?;
        self.send_file_name(path)?;
        let total_frames = (data.len() + MAX_DATA_SIZE - 1) / MAX_DATA_SIZE;
        let first_seq = self.isn.wrapping_add(1);
        let end_seq = first_seq.wrapping_add(total_frames as u32);
        log::info!(
            "Starting transfer. size={} bytes frames={} remote={}",
            data.len(),
            total_frames,
            self.remote
        );
        while self.base < end_seq {
            self.fill_window(&data, first_seq, end_seq)?;
            if let Some((frame, _)) = self.endpoint.try_recv()? {
                if frame.kind == FrameKind::Ack && frame.verify_checksum() {
                    self.handle_ack(&frame)?;
                }
            }
            self.check_timeouts()?;
            thread::sleep(DATA_TICK);
        }
        log::info!(
            "All data frames acknowledged. frames={} retransmissions={}",
            total_frames,
            self.stats.retransmissions
        );
        Ok(self.stats)
    }

    // Graceful teardown. Exhausting the FIN retries is logged, not fatal:
    // every data frame is already acknowledged at this point.
    pub fn close(&mut self) -> Result<()> {
        let fin = Frame::new_fin(self.next_seq);
        self.transmit(&fin)?;
        self.state = ConnectionState::FinWait;
        let mut timer = ControlTimer::fire();
        log::debug!(
            "Status changed from {} to FIN-WAIT. seq={}",
            ConnectionState::Established,
            self.next_seq
        );
        loop {
            if timer.is_exhausted() {
                log::warn!(
                    "Gave up waiting for FIN-ACK after {} retries. Closing anyway.",
                    timer.retries()
                );
                break;
            }
            if timer.is_expired() {
                self.transmit(&fin)?;
                timer.next();
                log::debug!("FIN frame timed out. Retransmitted. retries={}", timer.retries());
            }
            if let Some((frame, _)) = self.endpoint.try_recv()? {
                if frame.kind == FrameKind::FinAck && frame.verify_checksum() {
                    log::info!("Connection closed. remote={}", self.remote);
                    break;
                }
            }
            thread::sleep(CONTROL_TICK);
        }
        self.state = ConnectionState::Closed;
        Ok(())
    }

    fn send_file_name(&mut self, path: &str) -> Result<()> {
        let name = basename_of(path);
        let frame = Frame::new_file_name(self.isn, name.as_bytes());
        self.transmit(&frame)?;
        let mut timer = ControlTimer::fire();
        log::debug!("Sent FILE-NAME frame. name={}", name);
        loop {
            if timer.is_exhausted() {
                anyhow::bail!(TransferError::HandoffTimeout {
                    retries: timer.retries(),
                    remote: self.remote,
                });
            }
            if timer.is_expired() {
                self.transmit(&frame)?;
                timer.next();
                log::debug!(
                    "FILE-NAME frame timed out. Retransmitted. retries={}",
                    timer.retries()
                );
            }
            if let Some((reply, _)) = self.endpoint.try_recv()? {
                if reply.kind == FrameKind::FileNameAck && reply.verify_checksum() {
                    log::debug!("FILE-NAME frame acknowledged.");
                    return Ok(());
                }
            }
            thread::sleep(CONTROL_TICK);
        }
    }

    // Admits new data frames while the window has room. The effective window
    // is min(floor(cwnd), WINDOW_SIZE).
    fn fill_window(&mut self, data: &[u8], first_seq: u32, end_seq: u32) -> Result<()> {
        let effective_window = (self.cwnd as u32).min(WINDOW_SIZE);
        while self.next_seq < self.base + effective_window && self.next_seq < end_seq {
            let index = (self.next_seq - first_seq) as usize;
            let offset = index * MAX_DATA_SIZE;
            let end = (offset + MAX_DATA_SIZE).min(data.len());
            let frame = Frame::new_data(self.next_seq, data[offset..end].to_vec());
            self.transmit(&frame)?;
            log::trace!(
                "Sent DATA frame. seq={} len={} base={} cwnd={:.2}",
                self.next_seq,
                end - offset,
                self.base,
                self.cwnd
            );
            self.send_buffer.insert(
                self.next_seq,
                SendBufferEntry {
                    frame,
                    last_sent: Instant::now(),
                },
            );
            self.next_seq += 1;
        }
        Ok(())
    }

    fn handle_ack(&mut self, ack: &Frame) -> Result<()> {
        let ack_num = ack.ack_num;
        if ack_num > self.base {
            self.base = ack_num;
            self.dup_acks = 0;
            match self.cong_state {
                CongestionState::SlowStart => {
                    self.cwnd += 1.0;
                    if self.cwnd >= self.ssthresh as f64 {
                        self.cong_state = CongestionState::CongestionAvoidance;
                        log::debug!(
                            "Congestion state changed from SLOW-START to CONGESTION-AVOIDANCE. cwnd={:.2} ssthresh={}",
                            self.cwnd,
                            self.ssthresh
                        );
                    }
                }
                CongestionState::CongestionAvoidance => {
                    self.cwnd += 1.0 / self.cwnd;
                }
                CongestionState::FastRecovery => {
                    self.cwnd = self.ssthresh as f64;
                    self.cong_state = CongestionState::CongestionAvoidance;
                    log::debug!(
                        "Congestion state changed from FAST-RECOVERY to CONGESTION-AVOIDANCE. cwnd={:.2}",
                        self.cwnd
                    );
                }
            }
            self.send_buffer.retain(|&seq, _| seq >= ack_num);
            self.last_ack = ack_num;
        } else if ack_num == self.last_ack {
            self.dup_acks += 1;
            if self.dup_acks == DUP_ACK_THRESHOLD {
                let frame = match self.send_buffer.get_mut(&ack_num) {
                    Some(entry) => {
                        entry.last_sent = Instant::now();
                        Some(entry.frame.clone())
                    }
                    None => None,
                };
                if let Some(frame) = frame {
                    self.transmit(&frame)?;
                    self.stats.retransmissions += 1;
                    self.ssthresh = ((self.cwnd / 2.0) as u32).max(2);
                    self.cwnd = (self.ssthresh + DUP_ACK_THRESHOLD) as f64;
                    self.cong_state = CongestionState::FastRecovery;
                    log::debug!(
                        "Fast retransmit. seq={} ssthresh={} cwnd={:.2}",
                        ack_num,
                        self.ssthresh,
                        self.cwnd
                    );
                }
            } else if self.dup_acks > DUP_ACK_THRESHOLD
                && self.cong_state == CongestionState::FastRecovery
            {
                self.cwnd += 1.0;
            }
        }
        // Frames covered by a SACK block arrived out of order and need no
        // retransmission.
        for sack in &ack.sack_blocks {
            if sack.right_edge <= sack.left_edge {
                continue;
            }
            let covered: Vec<u32> = self
                .send_buffer
                .range(sack.left_edge..sack.right_edge)
                .map(|(&seq, _)| seq)
                .collect();
            for seq in covered {
                self.send_buffer.remove(&seq);
                log::trace!("SACK covered frame removed from the send buffer. seq={}", seq);
            }
        }
        Ok(())
    }

    // Retransmits every frame whose last send is older than the timeout; the
    // congestion window adjustment is applied at most once per tick.
    fn check_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut retransmitted = false;
        let seqs: Vec<u32> = self.send_buffer.keys().copied().collect();
        for seq in seqs {
            let frame = match self.send_buffer.get_mut(&seq) {
                Some(entry) if now.duration_since(entry.last_sent) > RETRANSMISSION_TIMEOUT => {
                    entry.last_sent = now;
                    entry.frame.clone()
                }
                _ => continue,
            };
            self.transmit(&frame)?;
            self.stats.retransmissions += 1;
            retransmitted = true;
            log::debug!("DATA frame timed out. Retransmitted. seq={}", seq);
        }
        if retransmitted {
            self.ssthresh = ((self.cwnd / 2.0) as u32).max(2);
            self.cwnd = 1.0;
            self.cong_state = CongestionState::SlowStart;
            self.dup_acks = 0;
            log::debug!(
                "Retransmission timeout. Congestion window reset. ssthresh={} cwnd={:.2}",
                self.ssthresh,
                self.cwnd
            );
        }
        Ok(())
    }

    fn transmit(&mut self, frame: &Frame) -> Result<()> {
        let sent = self.endpoint.send(frame)?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += sent as u64;
        Ok(())
    }
}

// The trailing path component, split on the last `/` or `\`.
pub fn basename_of(path: &str) -> &str {
    match path.rfind(|c| c == '/' || c == '\\') {
        Some(position) => &path[position + 1..],
        None => path,
    }
}

#[cfg(test)]
mod sender_tests {
    use super::*;
    use rstest::rstest;
    use std::net::Ipv4Addr;

    // A sender whose frames loop back to its own unread socket queue, so
    // the congestion logic can be driven without a live peer.
    fn established_sender() -> Sender {
        let local = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        let mut sender = Sender::new(local, remote).expect("Failed to create sender");
        let mut endpoint = Endpoint::bind(local).expect("Failed to bind");
        let own_addr = endpoint.local_addr().expect("Failed to read local addr");
        endpoint.latch_peer(own_addr);
        sender.endpoint = endpoint;
        sender.state = ConnectionState::Established;
        sender.base = 1;
        sender.next_seq = 1;
        sender.last_ack = 1;
        sender
    }

    fn seed_window(sender: &mut Sender, frames: usize) {
        for i in 0..frames {
            let seq = sender.next_seq;
            sender.send_buffer.insert(
                seq,
                SendBufferEntry {
                    frame: Frame::new_data(seq, vec![i as u8; 4]),
                    last_sent: Instant::now(),
                },
            );
            sender.next_seq += 1;
        }
    }

    #[test]
    fn test_new_ack_advances_base_and_grows_window() {
        let mut sender = established_sender();
        seed_window(&mut sender, 4);
        sender.handle_ack(&Frame::new_ack(0, 3, Vec::new())).unwrap();
        assert_eq!(sender.base, 3);
        assert_eq!(sender.last_ack, 3);
        assert_eq!(sender.cwnd, 2.0);
        assert!(sender.send_buffer.keys().all(|&seq| seq >= 3));
        assert_eq!(sender.cong_state, CongestionState::SlowStart);
    }

    #[test]
    fn test_slow_start_transitions_to_congestion_avoidance() {
        let mut sender = established_sender();
        sender.ssthresh = 3;
        seed_window(&mut sender, 4);
        for ack in [2, 3, 4] {
            sender.handle_ack(&Frame::new_ack(0, ack, Vec::new())).unwrap();
        }
        assert_eq!(sender.cong_state, CongestionState::CongestionAvoidance);
        // Two slow-start increments, then one additive increase of 1/cwnd.
        assert!((sender.cwnd - (3.0 + 1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_triple_duplicate_ack_triggers_fast_retransmit() {
        let mut sender = established_sender();
        seed_window(&mut sender, 5);
        sender.cwnd = 5.0;
        for _ in 0..2 {
            sender.handle_ack(&Frame::new_ack(0, 1, Vec::new())).unwrap();
            assert_eq!(sender.stats.retransmissions, 0);
        }
        sender.handle_ack(&Frame::new_ack(0, 1, Vec::new())).unwrap();
        assert_eq!(sender.stats.retransmissions, 1);
        assert_eq!(sender.cong_state, CongestionState::FastRecovery);
        assert_eq!(sender.ssthresh, 2);
        assert_eq!(sender.cwnd, 5.0);
        // Further duplicates inflate the window but do not retransmit again.
        sender.handle_ack(&Frame::new_ack(0, 1, Vec::new())).unwrap();
        assert_eq!(sender.stats.retransmissions, 1);
        assert_eq!(sender.cwnd, 6.0);
    }

    #[test]
    fn test_new_ack_in_fast_recovery_deflates_window() {
        let mut sender = established_sender();
        seed_window(&mut sender, 5);
        sender.cong_state = CongestionState::FastRecovery;
        sender.ssthresh = 4;
        sender.cwnd = 9.0;
        sender.handle_ack(&Frame::new_ack(0, 4, Vec::new())).unwrap();
        assert_eq!(sender.cong_state, CongestionState::CongestionAvoidance);
        assert_eq!(sender.cwnd, 4.0);
    }

    #[test]
    fn test_sack_blocks_clear_the_send_buffer() {
        let mut sender = established_sender();
        seed_window(&mut sender, 6);
        let ack = Frame::new_ack(
            0,
            1,
            vec![crate::transport::frame::SackBlock {
                left_edge: 3,
                right_edge: 6,
            }],
        );
        sender.handle_ack(&ack).unwrap();
        let remaining: Vec<u32> = sender.send_buffer.keys().copied().collect();
        assert_eq!(remaining, vec![1, 2, 6]);
    }

    #[test]
    fn test_timeout_resets_to_slow_start() {
        let mut sender = established_sender();
        seed_window(&mut sender, 3);
        sender.cwnd = 8.0;
        sender.cong_state = CongestionState::CongestionAvoidance;
        let stale = Instant::now() - Duration::from_millis(1500);
        for entry in sender.send_buffer.values_mut() {
            entry.last_sent = stale;
        }
        sender.check_timeouts().unwrap();
        assert_eq!(sender.stats.retransmissions, 3);
        assert_eq!(sender.cwnd, 1.0);
        assert_eq!(sender.ssthresh, 4);
        assert_eq!(sender.cong_state, CongestionState::SlowStart);
        // The adjustment is applied once even though three frames expired,
        // and freshly stamped frames do not expire again.
        sender.check_timeouts().unwrap();
        assert_eq!(sender.stats.retransmissions, 3);
    }

    #[rstest]
    #[case("data/report.txt", "report.txt")]
    #[case("report.txt", "report.txt")]
    #[case("/var/tmp/archive.tar.gz", "archive.tar.gz")]
    #[case("c:\\temp\\image.png", "image.png")]
    #[case("trailing/", "")]
    fn test_basename_of(#[case] path: &str, #[case] expected: &str) {
        assert_eq!(basename_of(path), expected);
    }
}
