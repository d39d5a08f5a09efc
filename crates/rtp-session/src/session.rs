//! A single call leg's RTP session: learns the remote endpoint from the
//! first inbound datagram (symmetric RTP, no `c=`/port trust needed once the
//! stream is flowing), and paces outbound packets on an absolute-deadline
//! schedule so jitter in packet production never drifts the wall clock.
//!
//! Grounded on `rtp-core`'s `RtpScheduler` for the pacing idea, reworked as a
//! single tokio task computing `next_tick += ptime` rather than a 1ms poll
//! loop, per the fixed-cadence requirement this bridge needs.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use voicebridge_codec_core::CodecBinding;

use crate::error::Result;
use crate::header::{RtpHeader, RtpPacket};

const INBOUND_CHANNEL_CAPACITY: usize = 256;

struct SenderState {
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    first_packet: bool,
}

/// A live call leg's RTP socket, paced sender and symmetric-RTP learner.
pub struct RtpSession {
    local_port: u16,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    queue: Arc<Mutex<VecDeque<Bytes>>>,
    paused: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    ended_rx: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
    sender_task: Option<JoinHandle<()>>,
    receiver_task: Option<JoinHandle<()>>,
}

impl RtpSession {
    /// Spawn the sender and receiver tasks for one call leg. Returns the
    /// session handle plus the channel on which decoded inbound payloads
    /// arrive (destined for the STT/adapter side).
    pub fn spawn(
        std_socket: std::net::UdpSocket,
        local_port: u16,
        binding: CodecBinding,
    ) -> Result<(RtpSession, mpsc::Receiver<Bytes>)> {
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);

        let remote: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
        let queue: Arc<Mutex<VecDeque<Bytes>>> = Arc::new(Mutex::new(VecDeque::new()));
        let paused = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let (ended_tx, ended_rx) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let sender_task = tokio::spawn(run_sender(
            socket.clone(),
            remote.clone(),
            queue.clone(),
            paused.clone(),
            terminated.clone(),
            ended_tx,
            shutdown.clone(),
            binding,
        ));
        let receiver_task = tokio::spawn(run_receiver(
            socket,
            remote.clone(),
            paused.clone(),
            shutdown.clone(),
            inbound_tx,
        ));

        Ok((
            RtpSession {
                local_port,
                remote,
                queue,
                paused,
                terminated,
                ended_rx,
                shutdown,
                sender_task: Some(sender_task),
                receiver_task: Some(receiver_task),
            },
            inbound_rx,
        ))
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Queue an audio payload (already framed to the negotiated codec's
    /// packet size) for the next send tick.
    pub async fn enqueue(&self, payload: Bytes) {
        self.queue.lock().await.push_back(payload);
    }

    /// Drop everything queued but not yet sent - used on barge-in.
    pub async fn drain(&self) {
        self.queue.lock().await.clear();
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub async fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote.lock().await
    }

    /// Mark this leg terminated: once the outbound queue next drains empty,
    /// the sender stops emitting and signals `wait_ended`. Mirrors the
    /// adapter-sets-`terminated`-on-its-Call contract in the call engine.
    pub fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Resolves once the sender has observed `terminated` with an empty
    /// queue and stopped emitting. The call engine awaits this before
    /// tearing the rest of the call down.
    pub async fn wait_ended(&self) {
        wait_for_ended(&mut self.ended_rx.clone()).await;
    }

    /// An independent, cloneable handle a watcher can hold onto *before*
    /// knowing whether it will end up doing the teardown itself - unlike
    /// [`RtpSession::wait_ended`], this doesn't borrow the session, so the
    /// dispatcher can watch for engine-driven termination (adapter failure,
    /// the `terminate_call` tool) without racing the session's own consumer
    /// for a single-shot wakeup. Backed by `watch` rather than `Notify`
    /// specifically so late subscribers still observe a termination that
    /// already happened.
    pub fn termination_watch(&self) -> watch::Receiver<bool> {
        self.ended_rx.clone()
    }

    /// Stop both tasks and wait for them to finish. The caller releases the
    /// port back to the allocator only after this returns, so the socket is
    /// fully closed first.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.sender_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.receiver_task.take() {
            let _ = task.await;
        }
        debug!(port = self.local_port, "rtp session shut down");
    }
}

/// Waits for `rx` to report the sender's terminal state, tolerating both a
/// value flip (the ordinary path) and the sender side of the channel being
/// dropped without one (session torn down by `shutdown()` before it ever
/// reached the terminated-and-drained state) - either way, "ended" holds.
async fn wait_for_ended(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
}

/// Paced outbound loop. Timestamps always advance once per tick, per the
/// "always advance" resolution of the paused-timestamp open question (see
/// DESIGN.md); sequence numbers and the marker bit only move when a packet
/// is actually emitted, so pauses never create a gap for a receiver to flag.
async fn run_sender(
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    queue: Arc<Mutex<VecDeque<Bytes>>>,
    paused: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    ended: watch::Sender<bool>,
    shutdown: Arc<Notify>,
    binding: CodecBinding,
) {
    let ptime = Duration::from_millis(binding.ptime_ms as u64);
    let mut state = SenderState {
        sequence_number: rand::thread_rng().gen(),
        timestamp: rand::thread_rng().gen(),
        ssrc: rand::thread_rng().gen(),
        first_packet: true,
    };

    let mut next_tick = Instant::now();
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep_until(next_tick.into()) => {}
        }
        next_tick += ptime;

        let current_ts = state.timestamp;
        state.timestamp = state.timestamp.wrapping_add(binding.ts_increment());

        if paused.load(Ordering::SeqCst) {
            continue;
        }

        let dequeued = queue.lock().await.pop_front();
        let payload = match dequeued {
            Some(payload) => payload,
            None if terminated.load(Ordering::SeqCst) => {
                let _ = ended.send(true);
                break;
            }
            None => binding.silence_packet(),
        };

        let header = RtpHeader {
            marker: state.first_packet,
            payload_type: binding.kind.static_payload_type().unwrap_or(0),
            sequence_number: state.sequence_number,
            timestamp: current_ts,
            ssrc: state.ssrc,
        };
        state.first_packet = false;
        state.sequence_number = state.sequence_number.wrapping_add(1);

        let packet = RtpPacket { header, payload };
        let wire = packet.to_bytes();

        let dest = *remote.lock().await;
        if let Some(addr) = dest {
            if let Err(err) = socket.send_to(&wire, addr).await {
                warn!(%err, "rtp send failed");
            }
        } else {
            trace!("no remote endpoint learned yet, dropping outbound packet");
        }
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    paused: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    inbound_tx: mpsc::Sender<Bytes>,
) {
    let mut buf = [0u8; 2048];
    loop {
        let recv = tokio::select! {
            _ = shutdown.notified() => break,
            result = socket.recv_from(&mut buf) => result,
        };

        let (len, addr) = match recv {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "rtp recv failed");
                continue;
            }
        };

        if paused.load(Ordering::SeqCst) {
            continue;
        }

        let learned = {
            let mut guard = remote.lock().await;
            match *guard {
                None => {
                    debug!(%addr, "learned remote rtp endpoint");
                    *guard = Some(addr);
                    addr
                }
                Some(learned) => learned,
            }
        };

        if addr != learned {
            trace!(%addr, remote = %learned, "dropping datagram from unlearned source");
            continue;
        }

        match RtpPacket::from_bytes(&buf[..len]) {
            Ok(packet) => {
                if inbound_tx.send(packet.payload).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(%err, "dropping malformed rtp packet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voicebridge_codec_core::CodecKind;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn learns_remote_endpoint_and_echoes_silence_when_idle() {
        let peer_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer_std.local_addr().unwrap();
        peer_std.set_nonblocking(true).unwrap();
        let peer = UdpSocket::from_std(peer_std).unwrap();

        let session_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let local_port = session_std.local_addr().unwrap().port();
        let binding = CodecBinding::new(CodecKind::Mulaw, 20);
        let (session, _inbound) = RtpSession::spawn(session_std, local_port, binding).unwrap();

        peer.send_to(&[0u8; 12], session.local_port()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        // give the receiver task a scheduling slot under the paused clock
        tokio::task::yield_now().await;

        assert!(session.remote_addr().await.is_some());
        let _ = peer_addr;

        session.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn pause_suppresses_send_and_receive() {
        let peer_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        peer_std.set_nonblocking(true).unwrap();
        let peer = UdpSocket::from_std(peer_std).unwrap();

        let session_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let local_port = session_std.local_addr().unwrap().port();
        let binding = CodecBinding::new(CodecKind::Mulaw, 20);
        let (session, mut inbound) = RtpSession::spawn(session_std, local_port, binding).unwrap();
        session.pause();

        peer.send_to(&[0u8; 12], session.local_port()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        tokio::task::yield_now().await;

        assert!(session.remote_addr().await.is_none());
        assert!(inbound.try_recv().is_err());

        let mut recv_buf = [0u8; 16];
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), peer.recv_from(&mut recv_buf))
                .await
                .is_err();
        assert!(timed_out, "no RTP packet should be emitted while paused");

        session.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn terminated_with_empty_queue_ends_sender_without_release_race() {
        let peer_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer_std.local_addr().unwrap();
        peer_std.set_nonblocking(true).unwrap();
        let peer = UdpSocket::from_std(peer_std).unwrap();

        let session_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let local_port = session_std.local_addr().unwrap().port();
        let binding = CodecBinding::new(CodecKind::Mulaw, 20);
        let (session, _inbound) = RtpSession::spawn(session_std, local_port, binding).unwrap();

        peer.send_to(&[0u8; 12], session.local_port()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        let _ = peer_addr;

        session.mark_terminated();
        tokio::time::timeout(Duration::from_millis(200), session.wait_ended())
            .await
            .expect("sender should self-end once terminated and drained");

        session.shutdown().await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn ignores_datagrams_from_addresses_other_than_the_learned_remote() {
        let real_peer_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        real_peer_std.set_nonblocking(true).unwrap();
        let real_peer = UdpSocket::from_std(real_peer_std).unwrap();

        let impostor_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        impostor_std.set_nonblocking(true).unwrap();
        let impostor = UdpSocket::from_std(impostor_std).unwrap();

        let session_std = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let local_port = session_std.local_addr().unwrap().port();
        let binding = CodecBinding::new(CodecKind::Mulaw, 20);
        let (session, mut inbound) = RtpSession::spawn(session_std, local_port, binding).unwrap();

        let wire = |seq: u16, tag: u8| {
            let header = RtpHeader { marker: false, payload_type: 0, sequence_number: seq, timestamp: 0, ssrc: 1 };
            RtpPacket { header, payload: Bytes::from_static(match tag {
                0 => &[0xAA],
                _ => &[0xBB],
            }) }
            .to_bytes()
        };

        real_peer.send_to(&wire(1, 0), session.local_port()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        let learned = session.remote_addr().await.expect("remote endpoint learned");
        assert_eq!(learned, real_peer.local_addr().unwrap());
        assert_eq!(inbound.try_recv().unwrap(), Bytes::from_static(&[0xAA]));

        impostor.send_to(&wire(2, 1), session.local_port()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(session.remote_addr().await, Some(learned));
        assert!(inbound.try_recv().is_err(), "datagram from an unlearned source must be dropped");

        session.shutdown().await;
    }
}
