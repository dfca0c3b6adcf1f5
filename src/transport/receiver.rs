use crate::transport::{
    defs::{ConnectionState, FrameKind, MAX_SACK_BLOCKS},
    endpoint::Endpoint,
    frame::{Frame, SackBlock},
};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::net::SocketAddrV4;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const RECV_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverStats {
    pub bytes_received: u64,
    pub frames_received: u64,
}

// The receiving side of a session: owns the socket and the output sink,
// reassembles data frames in sequence order and answers every one with a
// cumulative ACK decorated with SACK blocks.
pub struct Receiver {
    endpoint: Endpoint,
    state: ConnectionState,
    expected_seq: u32,
    recv_buffer: BTreeMap<u32, Vec<u8>>,
    received_seqs: BTreeSet<u32>,
    output: Option<File>,
    output_path: Option<PathBuf>,
    output_dir: PathBuf,
    // Set by the FIN exchange; distinguishes the terminal Closed from the
    // pre-session Closed.
    finished: bool,
    stats: ReceiverStats,
}

impl Receiver {
    pub fn new(bind: SocketAddrV4, output_dir: impl Into<PathBuf>) -> Result<Self> {
        let endpoint = Endpoint::bind(bind)?;
        Ok(Self {
            endpoint,
            state: ConnectionState::Closed,
            expected_seq: 0,
            recv_buffer: BTreeMap::new(),
            received_seqs: BTreeSet::new(),
            output: None,
            output_path: None,
            output_dir: output_dir.into(),
            finished: false,
            stats: ReceiverStats::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        self.endpoint.local_addr()
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    // Drives the whole session: waits for a SYN, serves the handoff and the
    // data transfer, and returns once the FIN exchange closed the session.
    pub fn run(&mut self) -> Result<ReceiverStats> {
        log::info!("Listening on {}.", self.endpoint.local_addr()?);
        loop {
            if let Some((frame, from)) = self.endpoint.try_recv()? {
                self.stats.frames_received += 1;
                if frame.verify_checksum() {
                    self.handle_frame(&frame, from)?;
                } else {
                    log::debug!(
                        "Discarding a {} frame with a bad checksum. seq={}",
                        frame.kind,
                        frame.seq_num
                    );
                }
                if self.finished {
                    break;
                }
            }
            thread::sleep(RECV_TICK);
        }
        Ok(self.stats)
    }

    fn handle_frame(&mut self, frame: &Frame, from: SocketAddrV4) -> Result<()> {
        match frame.kind {
            FrameKind::Syn => self.handle_syn(frame, from),
            FrameKind::Ack => self.handle_handshake_ack(frame),
            FrameKind::FileName => self.handle_file_name(frame),
            FrameKind::Data => self.handle_data(frame),
            FrameKind::Fin => self.handle_fin(frame),
            other => {
                log::trace!("Discarding a {} frame in state {}.", other, self.state);
                Ok(())
            }
        }
    }

    fn handle_syn(&mut self, syn: &Frame, from: SocketAddrV4) -> Result<()> {
        match self.state {
            ConnectionState::Closed => {
                self.endpoint.latch_peer(from);
                self.expected_seq = syn.seq_num.wrapping_add(1);
                let syn_ack = Frame::new_syn_ack(self.expected_seq);
                self.endpoint.send(&syn_ack)?;
                self.state = ConnectionState::SynReceived;
                log::info!(
                    "Received SYN. Status changed from CLOSED to SYN-RECEIVED. remote={} ISN={}",
                    from,
                    syn.seq_num
                );
            }
            ConnectionState::SynReceived => {
                // A retransmitted SYN means our SYN-ACK was lost.
                let syn_ack = Frame::new_syn_ack(syn.seq_num.wrapping_add(1));
                self.endpoint.send(&syn_ack)?;
                log::debug!("Received a duplicate SYN. Replied SYN-ACK again. remote={}", from);
            }
            _ => {
                log::trace!("Discarding a SYN frame in state {}.", self.state);
            }
        }
        Ok(())
    }

    fn handle_handshake_ack(&mut self, ack: &Frame) -> Result<()> {
        // Our SYN-ACK carries seq 0, so the third leg acknowledges 1.
        if self.state == ConnectionState::SynReceived && ack.ack_num == 1 {
            self.state = ConnectionState::Established;
            log::info!("Status changed from SYN-RECEIVED to ESTABLISHED.");
        } else {
            log::trace!("Discarding an ACK frame in state {}.", self.state);
        }
        Ok(())
    }

    fn handle_file_name(&mut self, frame: &Frame) -> Result<()> {
        match self.state {
            ConnectionState::SynReceived | ConnectionState::Established => {
                // A FILE-NAME frame proves the peer saw our SYN-ACK even if
                // the handshake ACK was lost.
                if self.state == ConnectionState::SynReceived {
                    self.state = ConnectionState::Established;
                    log::info!("Status changed from SYN-RECEIVED to ESTABLISHED.");
                }
                if self.output.is_none() {
                    let name = derive_output_name(&frame.payload);
                    let path = self.output_dir.join(&name);
                    let file = File::create(&path).context(format!(
                        "Failed to create the output file {}.",
                        path.display()
                    ))?;
                    log::info!("Output file created. path={}", path.display());
                    self.output = Some(file);
                    self.output_path = Some(path);
                }
                let ack = Frame::new_file_name_ack(frame.seq_num.wrapping_add(1));
                self.endpoint.send(&ack)?;
            }
            _ => {
                log::trace!("Discarding a FILE-NAME frame in state {}.", self.state);
            }
        }
        Ok(())
    }

    fn handle_data(&mut self, frame: &Frame) -> Result<()> {
        if self.state != ConnectionState::Established || self.output.is_none() {
            log::trace!(
                "Discarding a DATA frame before the session is ready. seq={} state={}",
                frame.seq_num,
                self.state
            );
            return Ok(());
        }
        let seq = frame.seq_num;
        if self.received_seqs.contains(&seq) {
            log::trace!("Received a duplicate DATA frame. seq={}", seq);
        } else {
            self.received_seqs.insert(seq);
            self.recv_buffer.insert(seq, frame.payload.clone());
            self.stats.bytes_received += frame.data_length as u64;
        }
        while let Some(payload) = self.recv_buffer.remove(&self.expected_seq) {
            if let Some(output) = self.output.as_mut() {
                output
                    .write_all(&payload)
                    .context("Failed to write to the output file.")?;
            }
            self.expected_seq = self.expected_seq.wrapping_add(1);
        }
        // The previous ACK may have been lost, so even duplicates are acked.
        self.send_ack()?;
        Ok(())
    }

    fn handle_fin(&mut self, fin: &Frame) -> Result<()> {
        if self.state != ConnectionState::Established {
            log::trace!("Discarding a FIN frame in state {}.", self.state);
            return Ok(());
        }
        let fin_ack = Frame::new_fin_ack(fin.seq_num.wrapping_add(1));
        self.endpoint.send(&fin_ack)?;
        if let Some(output) = self.output.take() {
            drop(output);
        }
        self.state = ConnectionState::Closed;
        self.finished = true;
        log::info!("Received FIN. Connection closed.");
        Ok(())
    }

    fn send_ack(&mut self) -> Result<()> {
        let sack_blocks = collect_sack_blocks(&self.received_seqs, self.expected_seq);
        let ack = Frame::new_ack(0, self.expected_seq, sack_blocks);
        self.endpoint.send(&ack)?;
        Ok(())
    }
}

// Enumerates up to MAX_SACK_BLOCKS maximal runs of received sequences
// strictly above the cumulative point, in ascending order of left edge.
pub fn collect_sack_blocks(received: &BTreeSet<u32>, expected_seq: u32) -> Vec<SackBlock> {
    let mut blocks: Vec<SackBlock> = Vec::new();
    for &seq in received.range((Bound::Excluded(expected_seq), Bound::Unbounded)) {
        match blocks.last_mut() {
            Some(last) if last.right_edge == seq => last.right_edge = seq + 1,
            _ => {
                if blocks.len() == MAX_SACK_BLOCKS {
                    break;
                }
                blocks.push(SackBlock {
                    left_edge: seq,
                    right_edge: seq + 1,
                });
            }
        }
    }
    blocks
}

// Inserts `_output` before the final extension of the transferred basename,
// appends it when there is no extension, and falls back to `output` for an
// empty payload.
pub fn derive_output_name(payload: &[u8]) -> String {
    if payload.is_empty() {
        return String::from("output");
    }
    let name = String::from_utf8_lossy(payload);
    let base = match name.rfind(|c| c == '/' || c == '\\') {
        Some(position) => &name[position + 1..],
        None => &name[..],
    };
    match base.rfind('.') {
        Some(position) => format!("{}_output{}", &base[..position], &base[position..]),
        None => format!("{}_output", base),
    }
}
