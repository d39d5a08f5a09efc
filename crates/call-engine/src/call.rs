//! The per-call object (C7, spec 4.6): glues the negotiated codec (C2), the
//! RTP transport (C3/C4) and the AI adapter (C5/C6) into one lifecycle, the
//! way `call.py`'s `Call` held a socket, a codec and a provider session
//! together - reworked so ownership is explicit (spec 9's Design Notes: "a
//! Call exclusively owns its socket, port reservation, outbound queue, and
//! adapter").

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use voicebridge_ai_adapter::tool::ToolEffect;
use voicebridge_ai_adapter::{AdapterEvent, AiAdapter};
use voicebridge_codec_core::{CodecBinding, CodecKind};
use voicebridge_rtp::{PortAllocator, RtpSession};
use voicebridge_sdp::{negotiate_answer, set_direction};

use crate::error::{EngineError, Result};
use crate::mgmt::ManagementChannel;

/// Maximum number of caller-audio forwards allowed in flight toward the
/// adapter at once (spec 9's open-question resolution: bound the in-flight
/// forward count and drop the oldest on overflow, rather than let an
/// unbounded burst of `tokio::spawn`ed sends grow memory without limit).
const MAX_IN_FLIGHT_FORWARDS: usize = 8;

/// Everything the call needs to build the right adapter flavor and answer
/// the way the dispatcher (C8) decided, independent of which flavor it is.
pub struct CallOptions {
    pub bot_id: String,
    pub local_ip: IpAddr,
    pub transfer_by: Option<String>,
}

/// A live call: one RTP leg, one AI adapter, bound together for its whole
/// lifetime.
pub struct Call {
    key: String,
    bot_id: String,
    codec: CodecKind,
    answer_body: Mutex<String>,
    paused: AtomicBool,
    local_port: u16,
    port_allocator: Arc<Mutex<PortAllocator>>,
    rtp: Arc<RtpSession>,
    adapter: Arc<Mutex<Box<dyn AiAdapter>>>,
    mgmt: Arc<ManagementChannel>,
    transfer_by: Option<String>,
    glue_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
}

impl Call {
    /// Builds the call end to end: allocate a port, construct the adapter
    /// (which exposes its codec priority), negotiate the SDP answer, bind
    /// the RTP session to the chosen codec, and start the adapter's
    /// provider connection. Order matches spec 4.6: port allocation ->
    /// adapter construction -> SDP negotiation -> RTP bind -> adapter start
    /// -> event glue tasks. The answer is not returned until the codec and
    /// RTP port are both settled.
    pub async fn construct(
        key: String,
        offer_sdp: &str,
        mut adapter: Box<dyn AiAdapter>,
        port_allocator: Arc<Mutex<PortAllocator>>,
        options: CallOptions,
        mgmt: Arc<ManagementChannel>,
    ) -> Result<(Self, String)> {
        let (local_port, std_socket) = port_allocator.lock().await.allocate()?;

        let priority = adapter.codec_priority();
        let negotiated = match negotiate_answer(offer_sdp, options.local_ip, local_port, &priority) {
            Ok(n) => n,
            Err(err) => {
                port_allocator.lock().await.release(local_port);
                return Err(EngineError::from(err));
            }
        };

        let ptime_ms = 20;
        let sample_rate = sprop_maxcapturerate(offer_sdp).unwrap_or_else(|| negotiated.codec.clock_rate());
        let binding = CodecBinding::with_sample_rate(negotiated.codec, ptime_ms, sample_rate);

        let (rtp, inbound_rx) = RtpSession::spawn(std_socket, local_port, binding)?;
        let rtp = Arc::new(rtp);

        let (events_tx, events_rx) = mpsc::channel(256);
        adapter.start(events_tx).await?;

        let adapter = Arc::new(Mutex::new(adapter));
        let answer_body = negotiated.body.clone();

        let mut call = Call {
            key: key.clone(),
            bot_id: options.bot_id,
            codec: negotiated.codec,
            answer_body: Mutex::new(answer_body.clone()),
            paused: AtomicBool::new(false),
            local_port,
            port_allocator: port_allocator.clone(),
            rtp,
            adapter: adapter.clone(),
            mgmt,
            transfer_by: options.transfer_by,
            glue_task: None,
            forward_task: None,
        };

        call.spawn_glue_tasks(binding, events_rx, inbound_rx, adapter);

        Ok((call, answer_body))
    }

    fn spawn_glue_tasks(
        &mut self,
        binding: CodecBinding,
        events_rx: mpsc::Receiver<AdapterEvent>,
        inbound_rx: mpsc::Receiver<Bytes>,
        adapter: Arc<Mutex<Box<dyn AiAdapter>>>,
    ) {
        let span = info_span!("call", call_key = %self.key, bot_id = %self.bot_id);

        let rtp_for_events = self.rtp.clone();
        let mgmt_for_events = self.mgmt.clone();
        let transfer_by = self.transfer_by.clone();
        self.glue_task = Some(tokio::spawn(
            run_event_glue(binding, events_rx, rtp_for_events, mgmt_for_events, self.key.clone(), transfer_by)
                .instrument(span.clone()),
        ));

        let rtp_for_forward = self.rtp.clone();
        self.forward_task =
            Some(tokio::spawn(run_forward_loop(inbound_rx, adapter, rtp_for_forward).instrument(span)));
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// In-dialog re-INVITE (spec 4.6): pause/resume per the new offer's
    /// direction and re-answer with the unchanged codec and current
    /// direction. The codec is never renegotiated mid-call.
    pub async fn renegotiate(&self, offer_sdp: &str) -> String {
        if voicebridge_sdp::remote_direction_is_paused(offer_sdp) {
            self.pause();
        } else {
            self.resume();
        }
        self.current_answer().await
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.rtp.pause();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.rtp.resume();
    }

    pub async fn current_answer(&self) -> String {
        let mut body = self.answer_body.lock().await;
        *body = set_direction(&body, self.paused.load(Ordering::SeqCst));
        body.clone()
    }

    /// Winds the call down: closes the adapter, lets the RTP sender drain
    /// and stop, then releases its tasks and socket. Used for both an
    /// externally observed BYE and an engine-initiated termination (adapter
    /// failure, `terminate_call` tool) - the caller decides what that means
    /// for the signaling peer.
    pub async fn close(mut self) {
        let _ = self.adapter.lock().await.close().await;
        self.rtp.mark_terminated();
        self.rtp.wait_ended().await;

        if let Some(task) = self.glue_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.forward_task.take() {
            task.abort();
            let _ = task.await;
        }

        match Arc::try_unwrap(self.rtp) {
            Ok(rtp) => rtp.shutdown().await,
            Err(_) => warn!(call_key = %self.key, "rtp session still referenced at close, socket left for drop"),
        }

        self.port_allocator.lock().await.release(self.local_port);

        info!(call_key = %self.key, "call closed");
    }

    /// An independent handle the dispatcher can hold before the call is even
    /// inserted into its call table, so it can notice engine-driven
    /// termination (adapter failure, the `terminate_call` tool) and drive
    /// `close()` itself - see [`voicebridge_rtp::RtpSession::termination_watch`].
    pub fn termination_watch(&self) -> tokio::sync::watch::Receiver<bool> {
        self.rtp.termination_watch()
    }
}

fn sprop_maxcapturerate(offer_sdp: &str) -> Option<u32> {
    offer_sdp.lines().find_map(|line| {
        let rest = line.strip_prefix("a=fmtp:")?;
        let idx = rest.find("sprop-maxcapturerate=")?;
        rest[idx + "sprop-maxcapturerate=".len()..]
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|digits| digits.parse().ok())
    })
}

/// Forwards synthesized-audio events from the adapter into the RTP outbound
/// queue, applying the codec's framing (spec 4.5's "Inbound audio
/// handling"). One task per call; it owns the `FrameState` so framing
/// remainders persist across successive provider audio deltas.
async fn run_event_glue(
    binding: CodecBinding,
    mut events: mpsc::Receiver<AdapterEvent>,
    rtp: Arc<RtpSession>,
    mgmt: Arc<ManagementChannel>,
    key: String,
    transfer_by: Option<String>,
) {
    let mut frame_state = binding.new_frame_state();

    while let Some(event) = events.recv().await {
        match event {
            AdapterEvent::AudioOut(audio) => {
                for packet in binding.parse(&mut frame_state, Some(&audio)) {
                    rtp.enqueue(packet).await;
                }
            }
            AdapterEvent::AudioFlush => {
                for packet in binding.parse(&mut frame_state, None) {
                    rtp.enqueue(packet).await;
                }
                frame_state = binding.new_frame_state();
            }
            AdapterEvent::BargeIn => {
                rtp.drain().await;
            }
            AdapterEvent::Transcript { text, is_final } => {
                info!(%text, is_final, "transcript");
            }
            AdapterEvent::Warning(message) => {
                warn!(%message, "adapter warning");
            }
            AdapterEvent::ToolEffect(effect) => {
                handle_tool_effect(effect, &mgmt, &key, transfer_by.as_deref(), &rtp).await;
            }
            AdapterEvent::Closed => {
                rtp.mark_terminated();
                break;
            }
        }
    }
}

async fn handle_tool_effect(
    effect: ToolEffect,
    mgmt: &Arc<ManagementChannel>,
    key: &str,
    transfer_by: Option<&str>,
    rtp: &Arc<RtpSession>,
) {
    match effect {
        ToolEffect::None => {}
        ToolEffect::TerminateCall => {
            rtp.mark_terminated();
        }
        ToolEffect::TransferCall { target, referred_by } => {
            let mut headers = HashMap::new();
            headers.insert("Refer-To".to_string(), target.clone());
            if let Some(by) = referred_by.or_else(|| transfer_by.map(str::to_string)) {
                headers.insert("Referred-By".to_string(), by);
            }
            if let Err(err) = mgmt.update(key, "REFER", None, &headers).await {
                warn!(%err, target, "failed to send REFER for call transfer");
            }
        }
    }
}

/// Forwards caller audio from the RTP session to the adapter, bounding the
/// number of concurrent in-flight `send_audio` calls: when the bound is
/// exceeded the oldest still-running forward is aborted rather than letting
/// the backlog grow without limit (spec 9's open question).
async fn run_forward_loop(
    mut inbound: mpsc::Receiver<Bytes>,
    adapter: Arc<Mutex<Box<dyn AiAdapter>>>,
    _rtp: Arc<RtpSession>,
) {
    let mut in_flight: VecDeque<JoinHandle<()>> = VecDeque::new();

    while let Some(payload) = inbound.recv().await {
        if in_flight.len() >= MAX_IN_FLIGHT_FORWARDS {
            if let Some(oldest) = in_flight.pop_front() {
                oldest.abort();
            }
        }
        let adapter = adapter.clone();
        in_flight.push_back(tokio::spawn(async move {
            if let Err(err) = adapter.lock().await.send_audio(payload).await {
                warn!(%err, "forwarding caller audio to adapter failed");
            }
        }));
        in_flight.retain(|task| !task.is_finished());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_sprop_maxcapturerate_from_fmtp_line() {
        let offer = "v=0\r\na=fmtp:111 sprop-maxcapturerate=16000;stereo=0\r\n";
        assert_eq!(sprop_maxcapturerate(offer), Some(16000));
    }

    #[test]
    fn absent_sprop_maxcapturerate_yields_none() {
        let offer = "v=0\r\na=fmtp:111 stereo=0\r\n";
        assert_eq!(sprop_maxcapturerate(offer), None);
    }
}
