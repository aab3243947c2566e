//! The negotiation automaton shared by LCP and every network control
//! protocol: Configure-Request/Ack/Nak/Reject exchange, Terminate
//! handshake, Code-Reject, retransmission with bounded retry.
//!
//! The automaton owns the protocol-specific part behind
//! [`NegotiableProtocol`] and reports layer transitions as [`FsmEvent`]s
//! instead of calling back into the session, so ownership stays a simple
//! tree: session -> fsm -> protocol.

use heapless::Vec;

use crate::magic::ProcessContext;
use crate::time::{Duration, Instant, Timeout};
use crate::wire::{
    parse_options, Code, OptionVal, Options, PPPPayload, Packet, Payload, ProtocolType,
    MAX_OPTIONS, MAX_OPTION_LEN,
};

pub(crate) type OptionData = Vec<u8, MAX_OPTION_LEN>;

/// Per-option outcome while evaluating a peer's Configure-Request.
pub(crate) enum Verdict {
    Ack,
    Nack(OptionData),
    Rej,
}

/// Outcome of an extended-code handler.
pub(crate) enum ExtVerdict {
    Handled,
    Unknown,
    /// A Protocol-Reject was received; carries the rejected protocol id.
    ProtocolRejected(u16),
}

/// The peer's Ack/Nak/Reject did not match what we sent; the packet is
/// dropped without touching negotiation state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct BadReply;

pub(crate) trait NegotiableProtocol {
    fn protocol(&self) -> ProtocolType;

    /// Rebuild the option set we are about to request, from wanted values
    /// and session configuration.
    fn reset_request(&mut self, ctx: &mut ProcessContext);

    /// Serialize the current request options in canonical order.
    fn request_options(&self, f: &mut dyn FnMut(u8, &[u8]));

    /// Peer acked our request. The payload must mirror our request byte
    /// for byte, in the same order.
    fn ack_received(&mut self, data: &[u8]) -> Result<(), BadReply>;

    /// Peer nacked some of our options. `treat_as_reject` is set once the
    /// nak-loop cap is reached. No state may stick if `opened`.
    fn nak_received(
        &mut self,
        ctx: &mut ProcessContext,
        data: &[u8],
        treat_as_reject: bool,
        opened: bool,
    ) -> Result<(), BadReply>;

    /// Peer rejected some of our options outright.
    fn rej_received(&mut self, data: &[u8], opened: bool) -> Result<(), BadReply>;

    /// A fresh Configure-Request from the peer is about to be evaluated.
    fn peer_request_start(&mut self);

    /// Evaluate one option of the peer's request. With
    /// `reject_if_disagree`, anything that would be nacked must be
    /// rejected instead (loopback-breaking magic renegotiation excepted).
    fn peer_option(
        &mut self,
        ctx: &mut ProcessContext,
        code: u8,
        data: &[u8],
        reject_if_disagree: bool,
    ) -> Verdict;

    /// Protocol-specific codes beyond the common seven. Anything left
    /// unhandled is answered with a Code-Reject.
    fn extended_code(
        &mut self,
        _state: State,
        _code: Code,
        _id: u8,
        _data: &mut [u8],
        _tx: &mut dyn FnMut(Packet<'_>),
    ) -> ExtVerdict {
        ExtVerdict::Unknown
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum State {
    /// Lower layer down, no open wanted.
    Initial,
    /// Lower layer down, open wanted.
    Starting,
    /// Lower layer up, no open wanted.
    Closed,
    /// Negotiation gave up or peer closed; waiting for the peer to retry.
    Stopped,
    /// Terminate-Request sent after close().
    Closing,
    /// Terminate-Request sent while staying open-willing.
    Stopping,
    ReqSent,
    AckRcvd,
    AckSent,
    Opened,
}

/// Layer transitions surfaced to the owner of the automaton.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum FsmEvent {
    Up,
    Down,
    Starting,
    Finished,
    ProtocolRejected(u16),
}

pub(crate) type Events = Vec<FsmEvent, 4>;

#[derive(Debug, Copy, Clone)]
pub(crate) struct FsmSettings {
    pub timeout_time: Duration,
    pub max_configure: u8,
    pub max_terminate: u8,
    pub max_failure: u8,
}

impl Default for FsmSettings {
    fn default() -> Self {
        Self {
            timeout_time: Duration::from_secs(6),
            max_configure: 10,
            max_terminate: 2,
            max_failure: 5,
        }
    }
}

pub(crate) struct Fsm<P> {
    proto: P,
    state: State,
    passive: bool,
    silent: bool,

    id: u8,
    reqid: u8,
    seen_ack: bool,
    nak_loops: u8,  // Naks we have sent this negotiation round
    rnak_loops: u8, // Naks received for our request
    retransmits: u8,
    timeout: Timeout,
    term_reason: Vec<u8, 32>,

    cfg: FsmSettings,
}

impl<P: NegotiableProtocol> Fsm<P> {
    pub fn new(proto: P, cfg: FsmSettings) -> Self {
        Self {
            proto,
            state: State::Initial,
            passive: false,
            silent: false,
            id: 0,
            reqid: 0,
            seen_ack: false,
            nak_loops: 0,
            rnak_loops: 0,
            retransmits: 0,
            timeout: Timeout::new(),
            term_reason: Vec::new(),
            cfg,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_opened(&self) -> bool {
        self.state == State::Opened
    }

    pub fn proto(&self) -> &P {
        &self.proto
    }

    pub fn proto_mut(&mut self) -> &mut P {
        &mut self.proto
    }

    pub fn configure(&mut self, cfg: FsmSettings) {
        self.cfg = cfg;
    }

    pub fn set_mode(&mut self, passive: bool, silent: bool) {
        self.passive = passive;
        self.silent = silent;
    }

    pub fn poll_at(&self) -> Option<Instant> {
        self.timeout.at()
    }

    /// Force the automaton into Stopped; used when an armed delayed-up is
    /// cancelled by a close before the lower layer ever came up.
    pub fn force_stopped(&mut self) {
        self.set_state(State::Stopped);
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(
                "{:?}: state {:?} -> {:?}",
                self.proto.protocol(),
                self.state,
                state
            );
            self.state = state;
        }
        if state == State::Opened {
            // No retransmission can be outstanding once both sides acked.
            self.timeout.cancel();
        }
    }

    fn next_id(&mut self) -> u8 {
        self.id = self.id.wrapping_add(1);
        self.id
    }

    /// The lower layer is able to carry packets.
    pub fn lowerup(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Events {
        let events = Events::new();
        match self.state {
            State::Initial => self.set_state(State::Closed),
            State::Starting => {
                if self.silent {
                    self.set_state(State::Stopped);
                } else {
                    self.send_configure_request(ctx, now, false, tx);
                    self.set_state(State::ReqSent);
                }
            }
            _ => debug!(
                "{:?}: unexpected lowerup in state {:?}",
                self.proto.protocol(),
                self.state
            ),
        }
        events
    }

    /// The lower layer can no longer carry packets.
    pub fn lowerdown(&mut self) -> Events {
        let mut events = Events::new();
        match self.state {
            State::Closed => self.set_state(State::Initial),
            State::Stopped => {
                self.set_state(State::Starting);
                unwrap!(events.push(FsmEvent::Starting).ok());
            }
            State::Closing => {
                self.timeout.cancel();
                self.set_state(State::Initial);
            }
            State::Stopping | State::ReqSent | State::AckRcvd | State::AckSent => {
                self.timeout.cancel();
                self.set_state(State::Starting);
            }
            State::Opened => {
                self.set_state(State::Starting);
                unwrap!(events.push(FsmEvent::Down).ok());
            }
            _ => debug!(
                "{:?}: unexpected lowerdown in state {:?}",
                self.proto.protocol(),
                self.state
            ),
        }
        events
    }

    /// The protocol is allowed to come up.
    pub fn open(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Events {
        let mut events = Events::new();
        match self.state {
            State::Initial => {
                self.set_state(State::Starting);
                unwrap!(events.push(FsmEvent::Starting).ok());
            }
            State::Closed => {
                if self.silent {
                    self.set_state(State::Stopped);
                } else {
                    self.send_configure_request(ctx, now, false, tx);
                    self.set_state(State::ReqSent);
                }
            }
            State::Closing => self.set_state(State::Stopping),
            _ => {}
        }
        events
    }

    /// Start a graceful shutdown. `reason` rides along in the
    /// Terminate-Request for the peer's logs.
    pub fn close(
        &mut self,
        now: Instant,
        reason: &str,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Events {
        let mut events = Events::new();
        match self.state {
            State::Starting => self.set_state(State::Initial),
            State::Stopped => self.set_state(State::Closed),
            State::Stopping => self.set_state(State::Closing),
            State::ReqSent | State::AckRcvd | State::AckSent | State::Opened => {
                if self.state == State::Opened {
                    unwrap!(events.push(FsmEvent::Down).ok());
                } else {
                    self.timeout.cancel();
                }
                self.term_reason.clear();
                let n = reason.len().min(self.term_reason.capacity());
                unwrap!(self.term_reason.extend_from_slice(&reason.as_bytes()[..n]).ok());

                self.retransmits = self.cfg.max_terminate;
                self.reqid = self.next_id();
                self.send_terminate_request(tx);
                self.timeout.schedule(now + self.cfg.timeout_time);
                self.retransmits = self.retransmits.saturating_sub(1);
                self.set_state(State::Closing);
            }
            _ => {}
        }
        events
    }

    /// Retransmission timer service; call whenever the host clock reaches
    /// [`Fsm::poll_at`].
    pub fn poll(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Events {
        let mut events = Events::new();
        if !self.timeout.poll(now) {
            return events;
        }

        match self.state {
            State::Closing | State::Stopping => {
                if self.retransmits == 0 {
                    // Peer is not answering our Terminate-Requests.
                    let next = if self.state == State::Closing {
                        State::Closed
                    } else {
                        State::Stopped
                    };
                    self.set_state(next);
                    unwrap!(events.push(FsmEvent::Finished).ok());
                } else {
                    self.reqid = self.next_id();
                    self.send_terminate_request(tx);
                    self.timeout.schedule(now + self.cfg.timeout_time);
                    self.retransmits -= 1;
                }
            }
            State::ReqSent | State::AckRcvd | State::AckSent => {
                if self.retransmits == 0 {
                    warn!(
                        "{:?}: timeout sending Config-Requests",
                        self.proto.protocol()
                    );
                    self.set_state(State::Stopped);
                    if !self.passive {
                        unwrap!(events.push(FsmEvent::Finished).ok());
                    }
                } else {
                    self.send_configure_request(ctx, now, true, tx);
                    if self.state == State::AckRcvd {
                        self.set_state(State::ReqSent);
                    }
                }
            }
            _ => {}
        }
        events
    }

    /// Feed one inbound control packet, protocol field included.
    pub fn input(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        pkt: &mut [u8],
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Events {
        let mut events = Events::new();

        if pkt.len() < 6 {
            warn!("{:?}: packet too short", self.proto.protocol());
            return events;
        }
        let code = Code::from(pkt[2]);
        let id = pkt[3];
        let len = u16::from_be_bytes([pkt[4], pkt[5]]) as usize;
        if len < 4 || len + 2 > pkt.len() {
            warn!("{:?}: bad packet length", self.proto.protocol());
            return events;
        }
        if matches!(self.state, State::Initial | State::Starting) {
            warn!(
                "{:?}: packet received in state {:?}",
                self.proto.protocol(),
                self.state
            );
            return events;
        }
        let data = &mut pkt[6..len + 2];

        debug!("{:?}: rx {:?} id={}", self.proto.protocol(), code, id);
        match code {
            Code::ConfigureReq => self.rconfreq(ctx, now, id, data, tx, &mut events),
            Code::ConfigureAck => self.rconfack(ctx, now, id, data, tx, &mut events),
            Code::ConfigureNack | Code::ConfigureRej => {
                self.rconfnakrej(ctx, now, code, id, data, tx, &mut events)
            }
            Code::TerminateReq => self.rtermreq(now, id, data, tx, &mut events),
            Code::TerminateAck => self.rtermack(ctx, now, tx, &mut events),
            Code::CodeRej => self.rcoderej(data),
            _ => match self.proto.extended_code(self.state, code, id, data, tx) {
                ExtVerdict::Handled => {}
                ExtVerdict::ProtocolRejected(prot) => {
                    unwrap!(events.push(FsmEvent::ProtocolRejected(prot)).ok());
                }
                ExtVerdict::Unknown => {
                    let id = self.next_id();
                    tx(Packet {
                        proto: self.proto.protocol(),
                        payload: Payload::PPP(Code::CodeRej, id, PPPPayload::Raw(data)),
                    });
                }
            },
        }
        events
    }

    fn rconfreq(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        id: u8,
        data: &mut [u8],
        tx: &mut dyn FnMut(Packet<'_>),
        events: &mut Events,
    ) {
        match self.state {
            State::Closed => {
                // Go away, we're closed.
                self.send_terminate_ack(id, tx);
                return;
            }
            State::Closing | State::Stopping => return,
            _ => {}
        }

        // Evaluate the options before touching the automaton, so a
        // malformed request is dropped without any side effect on state.
        let reject_if_disagree = self.nak_loops >= self.cfg.max_failure;
        let mut code = Code::ConfigureAck;
        let mut opts: Vec<OptionVal, MAX_OPTIONS> = Vec::new();
        let mut overflow = false;

        self.proto.peer_request_start();
        let proto = &mut self.proto;
        let eval_ctx = &mut *ctx;
        let parsed = parse_options(data, |ocode, odata| {
            let verdict = proto.peer_option(eval_ctx, ocode, odata, reject_if_disagree);
            let (ret_code, val): (Code, &[u8]) = match &verdict {
                Verdict::Ack => (Code::ConfigureAck, odata),
                Verdict::Nack(d) => (Code::ConfigureNack, &d[..]),
                Verdict::Rej => (Code::ConfigureRej, odata),
            };

            // A Reject poisons any pending Ack/Nak reply and vice versa;
            // only options matching the final code are echoed back.
            if code < ret_code {
                code = ret_code;
                opts.clear();
            }
            if code == ret_code && opts.push(OptionVal::new(ocode, val)).is_err() {
                overflow = true;
            }
        });
        if parsed.is_err() || overflow {
            warn!("{:?}: dropping malformed Configure-Request", self.proto.protocol());
            return;
        }

        match self.state {
            State::Opened => {
                // Renegotiation: drop out of Opened and restart our side.
                unwrap!(events.push(FsmEvent::Down).ok());
                self.send_configure_request(ctx, now, false, tx);
                self.set_state(State::ReqSent);
            }
            State::Stopped => {
                // Negotiation started by the peer.
                self.send_configure_request(ctx, now, false, tx);
                self.set_state(State::ReqSent);
            }
            _ => {}
        }

        tx(Packet {
            proto: self.proto.protocol(),
            payload: Payload::PPP(code, id, PPPPayload::Options(Options(opts))),
        });

        if code == Code::ConfigureAck {
            let next = if self.state == State::AckRcvd {
                State::Opened
            } else {
                State::AckSent
            };
            self.set_state(next);
            self.nak_loops = 0;
            if self.state == State::Opened {
                unwrap!(events.push(FsmEvent::Up).ok());
            }
        } else {
            if self.state != State::AckRcvd {
                self.set_state(State::ReqSent);
            }
            if code == Code::ConfigureNack {
                self.nak_loops = self.nak_loops.saturating_add(1);
            }
        }
    }

    fn rconfack(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        id: u8,
        data: &[u8],
        tx: &mut dyn FnMut(Packet<'_>),
        events: &mut Events,
    ) {
        if id != self.reqid || self.seen_ack {
            return; // stale or duplicate
        }
        if self.proto.ack_received(data).is_err() {
            error!("{:?}: received bad Configure-Ack", self.proto.protocol());
            return;
        }
        self.seen_ack = true;

        match self.state {
            State::Closed | State::Stopped => self.send_terminate_ack(id, tx),
            State::ReqSent => {
                self.set_state(State::AckRcvd);
                self.retransmits = self.cfg.max_configure;
            }
            State::AckRcvd => {
                // An extra valid Ack? Restart our request.
                self.timeout.cancel();
                self.send_configure_request(ctx, now, false, tx);
                self.set_state(State::ReqSent);
            }
            State::AckSent => {
                self.retransmits = self.cfg.max_configure;
                self.set_state(State::Opened);
                unwrap!(events.push(FsmEvent::Up).ok());
            }
            State::Opened => {
                unwrap!(events.push(FsmEvent::Down).ok());
                self.send_configure_request(ctx, now, false, tx);
                self.set_state(State::ReqSent);
            }
            _ => {}
        }
    }

    fn rconfnakrej(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        code: Code,
        id: u8,
        data: &[u8],
        tx: &mut dyn FnMut(Packet<'_>),
        events: &mut Events,
    ) {
        if id != self.reqid || self.seen_ack {
            return;
        }

        let opened = self.state == State::Opened;
        let result = if code == Code::ConfigureNack {
            self.rnak_loops = self.rnak_loops.saturating_add(1);
            let treat_as_reject = self.rnak_loops >= self.cfg.max_failure;
            self.proto.nak_received(ctx, data, treat_as_reject, opened)
        } else {
            self.rnak_loops = 0;
            self.proto.rej_received(data, opened)
        };
        if result.is_err() {
            error!("{:?}: received bad {:?}", self.proto.protocol(), code);
            return;
        }
        self.seen_ack = true;

        match self.state {
            State::Closed | State::Stopped => self.send_terminate_ack(id, tx),
            State::ReqSent | State::AckSent => {
                // They didn't like our request; try the pared-down one.
                self.timeout.cancel();
                self.send_configure_request(ctx, now, false, tx);
            }
            State::AckRcvd => {
                self.timeout.cancel();
                self.send_configure_request(ctx, now, false, tx);
                self.set_state(State::ReqSent);
            }
            State::Opened => {
                unwrap!(events.push(FsmEvent::Down).ok());
                self.send_configure_request(ctx, now, false, tx);
                self.set_state(State::ReqSent);
            }
            _ => {}
        }
    }

    fn rtermreq(
        &mut self,
        now: Instant,
        id: u8,
        data: &[u8],
        tx: &mut dyn FnMut(Packet<'_>),
        events: &mut Events,
    ) {
        match self.state {
            State::AckRcvd | State::AckSent => self.set_state(State::ReqSent),
            State::Opened => {
                if !data.is_empty() {
                    info!("{:?}: terminated by peer", self.proto.protocol());
                } else {
                    info!("{:?}: terminated by peer (no reason)", self.proto.protocol());
                }
                self.retransmits = 0;
                self.set_state(State::Stopping);
                unwrap!(events.push(FsmEvent::Down).ok());
                // Give the peer time to see our Terminate-Ack.
                self.timeout.schedule(now + self.cfg.timeout_time);
            }
            _ => {}
        }
        self.send_terminate_ack(id, tx);
    }

    fn rtermack(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        tx: &mut dyn FnMut(Packet<'_>),
        events: &mut Events,
    ) {
        match self.state {
            State::Closing => {
                self.timeout.cancel();
                self.set_state(State::Closed);
                unwrap!(events.push(FsmEvent::Finished).ok());
            }
            State::Stopping => {
                self.timeout.cancel();
                self.set_state(State::Stopped);
                unwrap!(events.push(FsmEvent::Finished).ok());
            }
            State::AckRcvd => self.set_state(State::ReqSent),
            State::Opened => {
                unwrap!(events.push(FsmEvent::Down).ok());
                self.send_configure_request(ctx, now, false, tx);
                self.set_state(State::ReqSent);
            }
            _ => {}
        }
    }

    fn rcoderej(&mut self, data: &[u8]) {
        if data.len() < 4 {
            warn!("{:?}: short Code-Reject", self.proto.protocol());
            return;
        }
        warn!(
            "{:?}: peer rejected our code {} id {}",
            self.proto.protocol(),
            data[0],
            data[1]
        );
        if self.state == State::AckRcvd {
            self.set_state(State::ReqSent);
        }
    }

    /// The peer Protocol-Rejected this whole protocol: shut it down
    /// without prejudice (Stopped, not Closed).
    pub fn protocol_rejected(&mut self, now: Instant, tx: &mut dyn FnMut(Packet<'_>)) -> Events {
        let mut events = Events::new();
        match self.state {
            State::Closing | State::Closed => {
                self.timeout.cancel();
                self.set_state(State::Closed);
                unwrap!(events.push(FsmEvent::Finished).ok());
            }
            State::Stopping
            | State::ReqSent
            | State::AckRcvd
            | State::AckSent
            | State::Stopped => {
                self.timeout.cancel();
                self.set_state(State::Stopped);
                unwrap!(events.push(FsmEvent::Finished).ok());
            }
            State::Opened => {
                unwrap!(events.push(FsmEvent::Down).ok());
                self.retransmits = self.cfg.max_terminate;
                self.reqid = self.next_id();
                self.send_terminate_request(tx);
                self.timeout.schedule(now + self.cfg.timeout_time);
                self.retransmits = self.retransmits.saturating_sub(1);
                self.set_state(State::Stopping);
            }
            _ => {}
        }
        events
    }

    fn send_configure_request(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        retransmit: bool,
        tx: &mut dyn FnMut(Packet<'_>),
    ) {
        if !matches!(
            self.state,
            State::ReqSent | State::AckRcvd | State::AckSent
        ) {
            // Not currently negotiating: start from the wanted options.
            self.proto.reset_request(ctx);
            self.nak_loops = 0;
            self.rnak_loops = 0;
        }

        if !retransmit {
            self.retransmits = self.cfg.max_configure;
            self.reqid = self.next_id();
        }
        self.seen_ack = false;

        let mut opts: Vec<OptionVal, MAX_OPTIONS> = Vec::new();
        self.proto.request_options(&mut |code, data| {
            if opts.push(OptionVal::new(code, data)).is_err() {
                panic!("tx ConfigureReq: too many options")
            }
        });

        tx(Packet {
            proto: self.proto.protocol(),
            payload: Payload::PPP(Code::ConfigureReq, self.reqid, PPPPayload::Options(Options(opts))),
        });

        self.retransmits = self.retransmits.saturating_sub(1);
        self.timeout.schedule(now + self.cfg.timeout_time);
    }

    fn send_terminate_request(&mut self, tx: &mut dyn FnMut(Packet<'_>)) {
        let mut reason = self.term_reason.clone();
        tx(Packet {
            proto: self.proto.protocol(),
            payload: Payload::PPP(Code::TerminateReq, self.reqid, PPPPayload::Raw(&mut reason)),
        });
    }

    fn send_terminate_ack(&mut self, id: u8, tx: &mut dyn FnMut(Packet<'_>)) {
        tx(Packet {
            proto: self.proto.protocol(),
            payload: Payload::PPP(Code::TerminateAck, id, PPPPayload::Raw(&mut [])),
        });
    }

    /// Reject an inbound packet of an unsupported protocol. Only LCP does
    /// this, and only once it is opened.
    pub fn send_protocol_reject<'a>(&mut self, pkt: &'a mut [u8]) -> Packet<'a> {
        Packet {
            proto: self.proto.protocol(),
            payload: Payload::PPP(Code::ProtocolRej, self.next_id(), PPPPayload::Raw(pkt)),
        }
    }
}
