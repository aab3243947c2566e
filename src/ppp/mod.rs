//! One PPP session: the phase machine from Dead to Running and back,
//! packet dispatch, the authentication phase, and the network-protocol
//! sequencer.

pub(crate) mod auth;
mod chap;
mod eap;
pub(crate) mod fsm;
pub(crate) mod ipv4cp;
pub(crate) mod ipv6cp;
pub(crate) mod lcp;
mod pap;
pub(crate) mod settings;

use core::net::Ipv4Addr;

use self::auth::{select_method, AuthBits, AuthResult, Method};
use self::chap::{Chap, ChapConfig};
use self::eap::{Eap, EapConfig};
use self::fsm::{Events, Fsm, FsmEvent, FsmSettings};
use self::ipv4cp::Ipv4cp;
use self::ipv6cp::Ipv6cp;
use self::lcp::{EchoOutcome, Lcp, LcpConfig, DEFAULT_MRU};
use self::pap::{Pap, PapConfig};
use crate::magic::ProcessContext;
use crate::time::{earliest, Duration, Instant, Timeout};
use crate::wire::{Packet, ProtocolType};

pub use self::auth::CredentialDigests;
pub use self::ipv4cp::Ipv4Status;
pub use self::ipv6cp::Ipv6Status;
pub use self::settings::{auth_type, mppe, Settings};

/// Where the link currently is in its life cycle. Ordering matters: the
/// input gates compare phases.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    Dead,
    /// Multilink bundle head; never entered by this implementation.
    Master,
    Holdoff,
    Initialize,
    SerialConn,
    Dormant,
    Establish,
    Authenticate,
    Callback,
    Network,
    Running,
    Terminate,
    Disconnect,
}

/// Why the session went (or is going) down.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    Param = 1,
    Open = 2,
    Device = 3,
    Alloc = 4,
    User = 5,
    Connect = 6,
    AuthFail = 7,
    Protocol = 8,
    PeerDead = 9,
    IdleTimeout = 10,
    ConnectTime = 11,
    Loopback = 12,
}

/// Operation not permitted in the current phase.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidPhaseError;

/// Contract with the framing layer underneath, plus notification entry
/// points. All methods except [`LinkDriver::transmit`] default to no-ops,
/// so a driver implements exactly what it cares about.
pub trait LinkDriver {
    /// Put one PPP packet (protocol field included) on the wire.
    fn transmit(&mut self, pkt: Packet<'_>);

    /// Adjust transmit-side framing after negotiation.
    fn send_config(&mut self, _mtu: u16, _asyncmap: u32, _pcomp: bool, _accomp: bool) {}
    /// Adjust receive-side framing after negotiation.
    fn recv_config(&mut self, _mru: u16, _asyncmap: u32, _pcomp: bool, _accomp: bool) {}
    fn set_mtu(&mut self, _mtu: u16) {}

    fn phase_changed(&mut self, _phase: Phase) {}
    /// The session reached Dead (or failed to come up); `err` says why.
    fn link_status(&mut self, _err: ErrorCode) {}

    fn ipv4_up(&mut self, _status: Ipv4Status) {}
    fn ipv4_down(&mut self) {}
    fn ipv6_up(&mut self, _status: Ipv6Status) {}
    fn ipv6_down(&mut self) {}
}

/// What [`Session::input`] did with a packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Received {
    /// Consumed by the control machinery (or dropped).
    None,
    /// An IPv4 data packet; payload starts after the 2-byte protocol field.
    Ipv4,
    /// An IPv6 data packet.
    Ipv6,
}

/// Snapshot of the session for the host.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Status {
    pub phase: Phase,
    /// IPv4 configuration; `None` while IPCP is not up.
    pub ipv4: Option<Ipv4Status>,
    pub ipv6: Option<Ipv6Status>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Ncp {
    Ipv4,
    Ipv6,
}

pub struct Session<'a> {
    settings: Settings<'a>,
    phase: Phase,
    err_code: ErrorCode,

    lcp: Fsm<Lcp>,
    ipcp: Option<Fsm<Ipv4cp>>,
    ipv6cp: Option<Fsm<Ipv6cp>>,
    pap: Pap<'a>,
    chap: Chap<'a>,
    eap: Eap<'a>,

    auth_pending: AuthBits,
    auth_done: AuthBits,

    peer_mru: u16,
    num_np_open: u8,
    num_np_up: u8,
    ipcp_counted: bool,
    ipv6cp_counted: bool,
    ipcp_up: bool,
    ipv6cp_up: bool,

    lower_up: bool,
    lcp_delayed: bool,
    delay_timer: Timeout,
    holdoff_timer: Timeout,
    idle_timer: Timeout,
    maxconnect_timer: Timeout,

    pkts_in: u32,
    last_traffic: Instant,
}

impl<'a> Session<'a> {
    pub fn new(settings: Settings<'a>) -> Self {
        Self {
            settings,
            phase: Phase::Dead,
            err_code: ErrorCode::None,

            lcp: Fsm::new(Lcp::new(), FsmSettings::default()),
            ipcp: Some(Fsm::new(Ipv4cp::new(), FsmSettings::default())),
            ipv6cp: Some(Fsm::new(Ipv6cp::new(), FsmSettings::default())),
            pap: Pap::new(),
            chap: Chap::new(),
            eap: Eap::new(),

            auth_pending: AuthBits::default(),
            auth_done: AuthBits::default(),

            peer_mru: DEFAULT_MRU,
            num_np_open: 0,
            num_np_up: 0,
            ipcp_counted: false,
            ipv6cp_counted: false,
            ipcp_up: false,
            ipv6cp_up: false,

            lower_up: false,
            lcp_delayed: false,
            delay_timer: Timeout::new(),
            holdoff_timer: Timeout::new(),
            idle_timer: Timeout::new(),
            maxconnect_timer: Timeout::new(),

            pkts_in: 0,
            last_traffic: Instant::ZERO,
        }
    }

    // --- configuration (Dead phase only) ----------------------------------

    fn in_dead(&self) -> Result<(), InvalidPhaseError> {
        if self.phase == Phase::Dead {
            Ok(())
        } else {
            Err(InvalidPhaseError)
        }
    }

    /// Access the whole settings bundle for adjustment.
    pub fn settings_mut(&mut self) -> Result<&mut Settings<'a>, InvalidPhaseError> {
        self.in_dead()?;
        Ok(&mut self.settings)
    }

    /// Select authentication methods and credentials. `authtype` is a
    /// bitmask from [`auth_type`]; absent bits become refusals.
    pub fn set_auth(
        &mut self,
        authtype: u8,
        user: &'a str,
        passwd: &'a str,
    ) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.settings.refuse_pap = authtype & auth_type::PAP == 0;
        self.settings.refuse_chap = authtype & auth_type::CHAP == 0;
        self.settings.refuse_mschap = authtype & auth_type::MSCHAP == 0;
        self.settings.refuse_mschap_v2 = authtype & auth_type::MSCHAP_V2 == 0;
        self.settings.refuse_eap = authtype & auth_type::EAP == 0;
        self.settings.user = user;
        self.settings.passwd = passwd;
        Ok(())
    }

    pub fn set_auth_required(&mut self, required: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.settings.auth_required = required;
        Ok(())
    }

    pub fn set_mppe(&mut self, flags: u8) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.settings.mppe = flags;
        Ok(())
    }

    pub fn set_listen_time(&mut self, time: Duration) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.settings.listen_time = time;
        Ok(())
    }

    pub fn set_passive(&mut self, passive: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.lcp.proto_mut().want.passive = passive;
        Ok(())
    }

    pub fn set_silent(&mut self, silent: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.lcp.proto_mut().want.silent = silent;
        Ok(())
    }

    pub fn set_neg_pcomp(&mut self, neg: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.lcp.proto_mut().want.neg_pcompression = neg;
        Ok(())
    }

    pub fn set_neg_accomp(&mut self, neg: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.lcp.proto_mut().want.neg_accompression = neg;
        Ok(())
    }

    pub fn set_neg_asyncmap(&mut self, neg: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.lcp.proto_mut().want.neg_asyncmap = neg;
        Ok(())
    }

    pub fn set_asyncmap(&mut self, map: u32) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.lcp.proto_mut().want.asyncmap = map;
        Ok(())
    }

    pub fn set_usepeerdns(&mut self, use_dns: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.settings.usepeerdns = use_dns;
        Ok(())
    }

    pub fn set_ipcp_ouraddr(&mut self, addr: Ipv4Addr) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        if let Some(ipcp) = &mut self.ipcp {
            ipcp.proto_mut().want_address = addr;
        }
        Ok(())
    }

    pub fn set_ipcp_hisaddr(&mut self, addr: Ipv4Addr) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        if let Some(ipcp) = &mut self.ipcp {
            ipcp.proto_mut().want_peer_address = addr;
        }
        Ok(())
    }

    /// Leave IPv4 (IPv6) entirely out of the session.
    pub fn enable_ipv4(&mut self, enable: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        if enable && self.ipcp.is_none() {
            self.ipcp = Some(Fsm::new(Ipv4cp::new(), FsmSettings::default()));
        } else if !enable {
            self.ipcp = None;
        }
        Ok(())
    }

    pub fn enable_ipv6(&mut self, enable: bool) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        if enable && self.ipv6cp.is_none() {
            self.ipv6cp = Some(Fsm::new(Ipv6cp::new(), FsmSettings::default()));
        } else if !enable {
            self.ipv6cp = None;
        }
        Ok(())
    }

    // --- observation ------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The last recorded failure cause; cleared when a new connection
    /// attempt starts.
    pub fn error_code(&self) -> ErrorCode {
        self.err_code
    }

    pub fn status(&self) -> Status {
        Status {
            phase: self.phase,
            ipv4: match &self.ipcp {
                Some(ipcp) if self.ipcp_up => Some(ipcp.proto().status()),
                _ => None,
            },
            ipv6: match &self.ipv6cp {
                Some(cp) if self.ipv6cp_up => Some(cp.proto().status()),
                _ => None,
            },
        }
    }

    /// Negotiated maximum receive unit of the peer.
    pub fn peer_mru(&self) -> u16 {
        self.peer_mru
    }

    /// Record data-plane transmit activity for the idle timer; inbound
    /// traffic is counted by [`Session::input`] itself.
    pub fn note_activity(&mut self, now: Instant) {
        self.last_traffic = now;
    }

    // --- external commands ------------------------------------------------

    /// Start opening the link. With a non-zero `holdoff` the attempt is
    /// delayed that long first.
    pub fn connect<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        holdoff: Duration,
        driver: &mut D,
    ) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.err_code = ErrorCode::None;
        if holdoff > Duration::ZERO {
            self.new_phase(Phase::Holdoff, driver);
            self.holdoff_timer.schedule(now + holdoff);
            return Ok(());
        }
        self.do_connect(ctx, now, driver);
        Ok(())
    }

    /// Wait for the peer to open the link: silent mode, no holdoff.
    pub fn listen<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        driver: &mut D,
    ) -> Result<(), InvalidPhaseError> {
        self.in_dead()?;
        self.lcp.proto_mut().want.silent = true;
        self.do_connect(ctx, now, driver);
        Ok(())
    }

    fn do_connect<D: LinkDriver>(&mut self, ctx: &mut ProcessContext, now: Instant, driver: &mut D) {
        self.new_phase(Phase::Initialize, driver);
        self.err_code = ErrorCode::None;
        self.pkts_in = 0;
        self.last_traffic = now;
        self.sync_settings();
        self.new_phase(Phase::Establish, driver);
        self.lcp_open(ctx, now, driver);
        self.lcp_lowerup(ctx, now, driver);
    }

    /// Push configuration into the protocol instances; negotiation reads
    /// from these copies only.
    fn sync_settings(&mut self) {
        let s = &self.settings;
        let fsm_cfg = FsmSettings {
            timeout_time: s.fsm_timeout_time,
            max_configure: s.fsm_max_conf_req_transmits,
            max_terminate: s.fsm_max_term_transmits,
            max_failure: s.fsm_max_nak_loops,
        };
        self.lcp.configure(fsm_cfg);
        self.lcp.proto_mut().cfg = LcpConfig {
            have_credentials: s.have_credentials(),
            auth_required: s.auth_required,
            refuse_pap: s.refuse_pap,
            refuse_chap: s.refuse_chap,
            refuse_mschap: s.refuse_mschap,
            refuse_mschap_v2: s.refuse_mschap_v2,
            refuse_eap: s.refuse_eap,
            noendpoint: s.noendpoint,
            loopback_fail: s.lcp_loopbackfail,
            echo_interval: s.lcp_echo_interval,
            echo_fails: s.lcp_echo_fails,
            echo_adaptive: s.lcp_echo_adaptive,
        };
        self.pap.configure(PapConfig {
            timeout_time: s.pap_timeout_time,
            max_transmits: s.pap_max_transmits,
            req_timeout: s.pap_req_timeout,
        });
        self.chap.configure(ChapConfig {
            timeout_time: s.chap_timeout_time,
            max_transmits: s.chap_max_transmits,
            rechallenge_time: s.chap_rechallenge_time,
        });
        self.eap.configure(EapConfig {
            req_time: s.eap_req_time,
            allow_req: s.eap_allow_req,
            timeout_time: s.eap_timeout_time,
            max_transmits: s.eap_max_transmits,
        });
        if let Some(ipcp) = &mut self.ipcp {
            ipcp.configure(fsm_cfg);
            ipcp.proto_mut().usepeerdns = s.usepeerdns;
            ipcp.proto_mut().noremoteip = s.noremoteip;
        }
        if let Some(cp) = &mut self.ipv6cp {
            cp.configure(fsm_cfg);
        }
    }

    /// Request an orderly shutdown. With `nocarrier` the line is assumed
    /// gone and the Terminate handshake is skipped.
    pub fn close<D: LinkDriver>(&mut self, now: Instant, nocarrier: bool, driver: &mut D) {
        self.err_code = ErrorCode::User;

        if self.phase == Phase::Holdoff {
            self.holdoff_timer.cancel();
            self.new_phase(Phase::Dead, driver);
        }
        if self.phase == Phase::Dead {
            driver.link_status(self.err_code);
            return;
        }
        if self.phase >= Phase::Terminate {
            // Already on the way down.
            return;
        }
        if self.phase < Phase::Establish {
            self.new_phase(Phase::Disconnect, driver);
            self.link_end(driver);
            return;
        }
        if nocarrier && self.phase == Phase::Running {
            debug!("carrier lost, taking LCP down");
            self.lcp_lowerdown(now, driver);
            self.link_terminated(now, driver);
            return;
        }
        self.lcp_close(now, "User request", driver);
    }

    /// Consume the session. Only legal in the Dead phase; otherwise the
    /// session is handed back untouched.
    pub fn free(self) -> Result<(), Self> {
        if self.phase == Phase::Dead {
            Ok(())
        } else {
            Err(self)
        }
    }

    // --- LCP control surface ----------------------------------------------

    fn lcp_open<D: LinkDriver>(&mut self, ctx: &mut ProcessContext, now: Instant, driver: &mut D) {
        let (passive, silent) = {
            let want = &self.lcp.proto().want;
            (want.passive, want.silent)
        };
        self.lcp.set_mode(passive, silent);
        let mut tx = |p: Packet<'_>| driver.transmit(p);
        let events = self.lcp.open(ctx, now, &mut tx);
        drop(tx);
        self.process_lcp_events(ctx, now, events, driver);
    }

    fn lcp_lowerup<D: LinkDriver>(&mut self, ctx: &mut ProcessContext, now: Instant, driver: &mut D) {
        let (neg_pcomp, neg_accomp) = {
            let want = &self.lcp.proto().want;
            (want.neg_pcompression, want.neg_accompression)
        };
        // Transmit uncompressed until negotiation says otherwise, but be
        // ready to receive what we are about to ask for.
        driver.send_config(DEFAULT_MRU, 0xffffffff, false, false);
        driver.recv_config(
            DEFAULT_MRU,
            if self.settings.lax_recv { 0 } else { 0xffffffff },
            neg_pcomp,
            neg_accomp,
        );
        self.peer_mru = DEFAULT_MRU;
        self.lower_up = true;

        if self.settings.listen_time > Duration::ZERO {
            self.lcp_delayed = true;
            self.delay_timer.schedule(now + self.settings.listen_time);
        } else {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = self.lcp.lowerup(ctx, now, &mut tx);
            drop(tx);
            self.process_lcp_events(ctx, now, events, driver);
        }
    }

    fn lcp_lowerdown<D: LinkDriver>(&mut self, now: Instant, driver: &mut D) {
        if !self.lower_up {
            return;
        }
        self.lower_up = false;
        if self.lcp_delayed {
            self.lcp_delayed = false;
            self.delay_timer.cancel();
            return;
        }
        let events = self.lcp.lowerdown();
        for ev in events {
            if ev == FsmEvent::Down {
                self.lcp_down(now, driver);
            }
        }
    }

    fn lcp_close<D: LinkDriver>(&mut self, now: Instant, reason: &str, driver: &mut D) {
        if self.phase != Phase::Dead && self.phase != Phase::Master {
            self.new_phase(Phase::Terminate, driver);
        }
        let was_delayed = self.lcp_delayed;
        if self.lcp_delayed {
            self.lcp_delayed = false;
            self.delay_timer.cancel();
            self.lcp.force_stopped();
        }
        let oldstate = self.lcp.state();
        let mut tx = |p: Packet<'_>| driver.transmit(p);
        let events = self.lcp.close(now, reason, &mut tx);
        drop(tx);
        let mut finished = false;
        for ev in events {
            match ev {
                FsmEvent::Down => self.lcp_down(now, driver),
                FsmEvent::Finished => finished = true,
                _ => {}
            }
        }
        let want = &self.lcp.proto().want;
        if oldstate == fsm::State::Stopped && (want.passive || want.silent || was_delayed) {
            // Nothing was ever established; there is no Terminate
            // handshake to wait for.
            finished = true;
        }
        if finished {
            self.link_terminated(now, driver);
        }
    }

    // --- packet input -----------------------------------------------------

    /// Feed one inbound PPP packet (protocol field first). Returns whether
    /// the packet is data the host should take.
    pub fn input<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        pkt: &mut [u8],
        driver: &mut D,
    ) -> Received {
        ctx.magic.randomize(now);

        if pkt.len() < 2 {
            debug!("packet too short");
            return Received::None;
        }
        self.pkts_in = self.pkts_in.wrapping_add(1);
        self.last_traffic = now;

        let raw_proto = u16::from_be_bytes([pkt[0], pkt[1]]);
        let proto = ProtocolType::from(raw_proto);

        // Toss all non-LCP packets unless LCP is open.
        if proto != ProtocolType::LCP && !self.lcp.is_opened() {
            debug!("discarded proto {:?} while LCP not open", proto);
            return Received::None;
        }
        // Until authentication is done, only link and auth traffic passes.
        if self.phase <= Phase::Authenticate
            && !matches!(
                proto,
                ProtocolType::LCP | ProtocolType::PAP | ProtocolType::CHAP | ProtocolType::EAP
            )
        {
            debug!("discarding proto {:?} in phase {:?}", proto, self.phase);
            return Received::None;
        }

        match proto {
            ProtocolType::LCP => {
                // Traffic from the peer ends the listen delay early.
                if self.lcp_delayed {
                    self.lcp_delayed = false;
                    self.delay_timer.cancel();
                    let mut tx = |p: Packet<'_>| driver.transmit(p);
                    let events = self.lcp.lowerup(ctx, now, &mut tx);
                    drop(tx);
                    self.process_lcp_events(ctx, now, events, driver);
                }
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                let events = self.lcp.input(ctx, now, pkt, &mut tx);
                drop(tx);
                self.process_lcp_events(ctx, now, events, driver);
                if self.lcp.proto_mut().take_loopback() {
                    self.err_code = ErrorCode::Loopback;
                    self.lcp_close(now, "Loopback detected", driver);
                }
                Received::None
            }
            ProtocolType::PAP => {
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                let r = self.pap.input(now, pkt, &mut tx);
                drop(tx);
                if let Some(r) = r {
                    self.handle_auth_result(ctx, now, Method::Pap, r, driver);
                }
                Received::None
            }
            ProtocolType::CHAP => {
                let digests = self.settings.digests;
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                let r = self.chap.input(now, pkt, digests, &mut tx);
                drop(tx);
                if let Some(r) = r {
                    let digest = self.lcp.proto().got.chap_mdtype.digest().unwrap_or(0);
                    self.handle_auth_result(ctx, now, Method::Chap(digest), r, driver);
                }
                Received::None
            }
            ProtocolType::EAP => {
                let digests = self.settings.digests;
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                let r = self.eap.input(ctx, now, pkt, digests, &mut tx);
                drop(tx);
                if let Some(r) = r {
                    self.handle_auth_result(ctx, now, Method::Eap, r, driver);
                }
                Received::None
            }
            ProtocolType::IPv4CP => {
                if let Some(mut ipcp) = self.ipcp.take() {
                    let mut tx = |p: Packet<'_>| driver.transmit(p);
                    let events = ipcp.input(ctx, now, pkt, &mut tx);
                    drop(tx);
                    self.ipcp = Some(ipcp);
                    self.process_ncp_events(now, Ncp::Ipv4, events, driver);
                }
                Received::None
            }
            ProtocolType::IPv6CP => {
                if let Some(mut cp) = self.ipv6cp.take() {
                    let mut tx = |p: Packet<'_>| driver.transmit(p);
                    let events = cp.input(ctx, now, pkt, &mut tx);
                    drop(tx);
                    self.ipv6cp = Some(cp);
                    self.process_ncp_events(now, Ncp::Ipv6, events, driver);
                }
                Received::None
            }
            ProtocolType::IPv4 => Received::Ipv4,
            ProtocolType::IPv6 => Received::Ipv6,
            _ => {
                // Nobody here speaks this protocol.
                warn!("unsupported protocol {} received", raw_proto);
                let reject = self.lcp.send_protocol_reject(pkt);
                driver.transmit(reject);
                Received::None
            }
        }
    }

    // --- timers -----------------------------------------------------------

    /// Run every timer that is due. Call whenever the clock reaches
    /// [`Session::poll_at`].
    pub fn poll<D: LinkDriver>(&mut self, ctx: &mut ProcessContext, now: Instant, driver: &mut D) {
        if self.holdoff_timer.poll(now) && self.phase == Phase::Holdoff {
            self.do_connect(ctx, now, driver);
        }

        if self.delay_timer.poll(now) && self.lcp_delayed {
            self.lcp_delayed = false;
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = self.lcp.lowerup(ctx, now, &mut tx);
            drop(tx);
            self.process_lcp_events(ctx, now, events, driver);
        }

        let mut tx = |p: Packet<'_>| driver.transmit(p);
        let events = self.lcp.poll(ctx, now, &mut tx);
        drop(tx);
        self.process_lcp_events(ctx, now, events, driver);

        if self.lcp.is_opened() {
            let pkts_in = self.pkts_in;
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let outcome = self.lcp.proto_mut().echo_poll(now, pkts_in, &mut tx);
            drop(tx);
            if let EchoOutcome::PeerDead = outcome {
                info!("peer not responding to echo-requests");
                self.err_code = ErrorCode::PeerDead;
                self.lcp_close(now, "Peer not responding", driver);
            }
        }

        let mut tx = |p: Packet<'_>| driver.transmit(p);
        let r = self.pap.poll(now, &mut tx);
        drop(tx);
        if let Some(r) = r {
            self.handle_auth_result(ctx, now, Method::Pap, r, driver);
        }

        let mut tx = |p: Packet<'_>| driver.transmit(p);
        let r = self.chap.poll(ctx, now, &mut tx);
        drop(tx);
        if let Some(r) = r {
            let digest = self.lcp.proto().got.chap_mdtype.digest().unwrap_or(0);
            self.handle_auth_result(ctx, now, Method::Chap(digest), r, driver);
        }

        let mut tx = |p: Packet<'_>| driver.transmit(p);
        let r = self.eap.poll(now, &mut tx);
        drop(tx);
        if let Some(r) = r {
            self.handle_auth_result(ctx, now, Method::Eap, r, driver);
        }

        if let Some(mut ipcp) = self.ipcp.take() {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = ipcp.poll(ctx, now, &mut tx);
            drop(tx);
            self.ipcp = Some(ipcp);
            self.process_ncp_events(now, Ncp::Ipv4, events, driver);
        }
        if let Some(mut cp) = self.ipv6cp.take() {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = cp.poll(ctx, now, &mut tx);
            drop(tx);
            self.ipv6cp = Some(cp);
            self.process_ncp_events(now, Ncp::Ipv6, events, driver);
        }

        if self.idle_timer.poll(now) && self.phase == Phase::Running {
            let idle = now.saturating_since(self.last_traffic);
            if idle >= self.settings.idle_time_limit {
                info!("terminating connection due to lack of activity");
                self.err_code = ErrorCode::IdleTimeout;
                self.lcp_close(now, "Link inactive", driver);
            } else {
                // Traffic was seen; wait out the remainder.
                let remaining = self.settings.idle_time_limit.as_millis() - idle.as_millis();
                self.idle_timer
                    .schedule(now + Duration::from_millis(remaining));
            }
        }

        if self.maxconnect_timer.poll(now) && self.phase == Phase::Running {
            info!("connect time expired");
            self.err_code = ErrorCode::ConnectTime;
            self.lcp_close(now, "Connect time expired", driver);
        }
    }

    /// Next instant at which [`Session::poll`] has work to do.
    pub fn poll_at(&self) -> Option<Instant> {
        let mut at = self.holdoff_timer.at();
        at = earliest(at, self.delay_timer.at());
        at = earliest(at, self.lcp.poll_at());
        at = earliest(at, self.lcp.proto().echo_at());
        at = earliest(at, self.pap.poll_at());
        at = earliest(at, self.chap.poll_at());
        at = earliest(at, self.eap.poll_at());
        if let Some(ipcp) = &self.ipcp {
            at = earliest(at, ipcp.poll_at());
        }
        if let Some(cp) = &self.ipv6cp {
            at = earliest(at, cp.poll_at());
        }
        at = earliest(at, self.idle_timer.at());
        at = earliest(at, self.maxconnect_timer.at());
        at
    }

    // --- phase machinery --------------------------------------------------

    fn new_phase<D: LinkDriver>(&mut self, phase: Phase, driver: &mut D) {
        if self.phase != phase {
            debug!("phase {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
            driver.phase_changed(phase);
        }
    }

    fn process_lcp_events<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        events: Events,
        driver: &mut D,
    ) {
        for ev in events {
            match ev {
                FsmEvent::Up => self.lcp_up(ctx, now, driver),
                FsmEvent::Down => self.lcp_down(now, driver),
                FsmEvent::Starting => {}
                FsmEvent::Finished => self.link_terminated(now, driver),
                FsmEvent::ProtocolRejected(proto) => {
                    self.protocol_rejected(ctx, now, proto, driver)
                }
            }
        }
    }

    /// LCP reached Opened: configure the wire, start the keepalive, move
    /// on to authentication.
    fn lcp_up<D: LinkDriver>(&mut self, ctx: &mut ProcessContext, now: Instant, driver: &mut D) {
        {
            let lcp = self.lcp.proto_mut();
            if !lcp.got.neg_magicnumber {
                lcp.got.magicnumber = 0;
            }
            if !lcp.his.neg_magicnumber {
                lcp.his.magicnumber = 0;
            }
        }

        let (go, ho, allow_mru, want_mru) = {
            let lcp = self.lcp.proto();
            (
                lcp.got.clone(),
                lcp.his.clone(),
                lcp.allow.mru,
                lcp.want.mru,
            )
        };

        // Our MTU is bounded by what the peer can receive and what we
        // allow; our MRU is at least what we asked for.
        let mtu = if ho.neg_mru { ho.mru } else { DEFAULT_MRU };
        let mru = if go.neg_mru {
            want_mru.max(go.mru)
        } else {
            DEFAULT_MRU
        };
        driver.set_mtu(mtu.min(mru).min(allow_mru));
        driver.send_config(
            mtu,
            if ho.neg_asyncmap { ho.asyncmap } else { 0xffffffff },
            ho.neg_pcompression,
            ho.neg_accompression,
        );
        driver.recv_config(
            mru,
            if self.settings.lax_recv {
                0
            } else if go.neg_asyncmap {
                go.asyncmap
            } else {
                0xffffffff
            },
            go.neg_pcompression,
            go.neg_accompression,
        );
        if ho.neg_mru {
            self.peer_mru = ho.mru;
        }

        let pkts_in = self.pkts_in;
        let mut tx = |p: Packet<'_>| driver.transmit(p);
        self.lcp.proto_mut().echo_start(now, pkts_in, &mut tx);
        drop(tx);

        self.link_established(ctx, now, driver);
    }

    /// LCP left Opened: stop the keepalive, tear the upper layers down.
    /// Unless a teardown is in progress, the session goes back to
    /// Establish and renegotiates.
    fn lcp_down<D: LinkDriver>(&mut self, now: Instant, driver: &mut D) {
        self.lcp.proto_mut().echo_stop();
        self.upper_layers_down(now, driver);
        if self.phase != Phase::Dead && self.phase != Phase::Master && self.phase < Phase::Terminate
        {
            self.new_phase(Phase::Establish, driver);
        }

        let go = self.lcp.proto().got.clone();
        driver.send_config(DEFAULT_MRU, 0xffffffff, false, false);
        driver.recv_config(
            DEFAULT_MRU,
            if go.neg_asyncmap { go.asyncmap } else { 0xffffffff },
            go.neg_pcompression,
            go.neg_accompression,
        );
        self.peer_mru = DEFAULT_MRU;
    }

    fn upper_layers_down<D: LinkDriver>(&mut self, now: Instant, driver: &mut D) {
        self.pap.lowerdown();
        self.chap.lowerdown();
        self.eap.lowerdown();
        if let Some(mut ipcp) = self.ipcp.take() {
            let mut all = Events::new();
            for ev in ipcp.lowerdown() {
                let _ = all.push(ev);
            }
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            for ev in ipcp.close(now, "LCP down", &mut tx) {
                let _ = all.push(ev);
            }
            drop(tx);
            self.ipcp = Some(ipcp);
            for ev in all {
                if ev == FsmEvent::Down && self.ipcp_up {
                    self.ipcp_up = false;
                    driver.ipv4_down();
                }
            }
        }
        if let Some(mut cp) = self.ipv6cp.take() {
            let mut all = Events::new();
            for ev in cp.lowerdown() {
                let _ = all.push(ev);
            }
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            for ev in cp.close(now, "LCP down", &mut tx) {
                let _ = all.push(ev);
            }
            drop(tx);
            self.ipv6cp = Some(cp);
            for ev in all {
                if ev == FsmEvent::Down && self.ipv6cp_up {
                    self.ipv6cp_up = false;
                    driver.ipv6_down();
                }
            }
        }
        self.num_np_open = 0;
        self.num_np_up = 0;
        self.ipcp_counted = false;
        self.ipv6cp_counted = false;
        self.idle_timer.cancel();
        self.maxconnect_timer.cancel();
    }

    /// LCP finished for good: lower layer down, session dead.
    fn link_terminated<D: LinkDriver>(&mut self, now: Instant, driver: &mut D) {
        if self.phase == Phase::Dead || self.phase == Phase::Master {
            return;
        }
        self.new_phase(Phase::Disconnect, driver);
        info!("connection terminated");
        self.lcp_lowerdown(now, driver);
        self.link_end(driver);
    }

    fn link_end<D: LinkDriver>(&mut self, driver: &mut D) {
        self.new_phase(Phase::Dead, driver);
        if self.err_code == ErrorCode::None {
            self.err_code = ErrorCode::Connect;
        }
        driver.link_status(self.err_code);
    }

    // --- authentication phase ---------------------------------------------

    /// The link is established: hand the upper layers a carrier and decide
    /// who authenticates whom.
    fn link_established<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        driver: &mut D,
    ) {
        // Carrier for the upper protocols.
        {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            self.pap.lowerup(now, &mut tx);
        }
        self.chap.lowerup();
        if let Some(mut ipcp) = self.ipcp.take() {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = ipcp.lowerup(ctx, now, &mut tx);
            drop(tx);
            self.ipcp = Some(ipcp);
            self.process_ncp_events(now, Ncp::Ipv4, events, driver);
        }
        if let Some(mut cp) = self.ipv6cp.take() {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = cp.lowerup(ctx, now, &mut tx);
            drop(tx);
            self.ipv6cp = Some(cp);
            self.process_ncp_events(now, Ncp::Ipv6, events, driver);
        }

        let go = self.lcp.proto().got.clone();
        let ho = self.lcp.proto().his.clone();

        if self.settings.auth_required && select_method(&go).is_none() {
            // We insisted on authentication and the peer talked us out of
            // every method.
            if !self.settings.null_login || !self.lcp.proto().want.neg_upap {
                warn!("peer refused to authenticate: terminating link");
                self.err_code = ErrorCode::AuthFail;
                self.lcp_close(now, "peer refused to authenticate", driver);
                return;
            }
        }

        self.new_phase(Phase::Authenticate, driver);
        let mut pending = AuthBits::default();

        // Demanding side: verify the peer with the method it acked.
        match select_method(&go) {
            Some(Method::Eap) => {
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                self.eap.auth_peer(
                    now,
                    self.settings.user.as_bytes(),
                    self.settings.passwd.as_bytes(),
                    &mut tx,
                );
                pending.set(AuthBits::EAP_PEER);
            }
            Some(Method::Chap(digest)) => {
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                self.chap.auth_peer(
                    ctx,
                    now,
                    self.settings.user.as_bytes(),
                    self.settings.passwd.as_bytes(),
                    digest,
                    &mut tx,
                );
                pending.set(AuthBits::CHAP_PEER);
            }
            Some(Method::Pap) => {
                self.pap.auth_peer(
                    now,
                    self.settings.user.as_bytes(),
                    self.settings.passwd.as_bytes(),
                    self.settings.null_login,
                );
                pending.set(AuthBits::PAP_PEER);
            }
            None => {}
        }

        // Obliged side: prove ourselves with the method we acked.
        match select_method(&ho) {
            Some(Method::Eap) => {
                self.eap.auth_with_peer(
                    now,
                    self.settings.user.as_bytes(),
                    self.settings.passwd.as_bytes(),
                );
                pending.set(AuthBits::EAP_WITHPEER);
            }
            Some(Method::Chap(digest)) => {
                self.chap.auth_with_peer(
                    self.settings.user.as_bytes(),
                    self.settings.passwd.as_bytes(),
                    digest,
                );
                pending.set(AuthBits::CHAP_WITHPEER);
            }
            Some(Method::Pap) => {
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                self.pap.auth_with_peer(
                    now,
                    self.settings.user.as_bytes(),
                    self.settings.passwd.as_bytes(),
                    &mut tx,
                );
                pending.set(AuthBits::PAP_WITHPEER);
            }
            None => {}
        }

        self.auth_pending = pending;
        self.auth_done = AuthBits::default();

        if pending.is_empty() {
            self.network_phase(ctx, now, driver);
        }
    }

    fn handle_auth_result<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        method: Method,
        result: AuthResult,
        driver: &mut D,
    ) {
        match result {
            AuthResult::PeerSuccess(flavor) => {
                let bit = match method {
                    Method::Pap => AuthBits::PAP_PEER,
                    Method::Chap(_) => AuthBits::chap_bits(flavor, false),
                    Method::Eap => AuthBits::EAP_PEER,
                };
                self.auth_done.set(bit);
                self.auth_pending.clear(bit);
                if self.auth_pending.is_empty() && self.phase == Phase::Authenticate {
                    self.network_phase(ctx, now, driver);
                }
            }
            AuthResult::WithPeerSuccess(flavor) => {
                let bit = match method {
                    Method::Pap => AuthBits::PAP_WITHPEER,
                    Method::Chap(_) => AuthBits::chap_bits(flavor, true),
                    Method::Eap => AuthBits::EAP_WITHPEER,
                };
                self.auth_done.set(bit);
                self.auth_pending.clear(bit);
                if self.auth_pending.is_empty() && self.phase == Phase::Authenticate {
                    self.network_phase(ctx, now, driver);
                }
            }
            AuthResult::PeerFailure => {
                self.err_code = ErrorCode::AuthFail;
                self.lcp_close(now, "Authentication failed", driver);
            }
            AuthResult::WithPeerFailure => {
                self.err_code = ErrorCode::AuthFail;
                self.lcp_close(now, "Failed to authenticate ourselves to peer", driver);
            }
        }
    }

    // --- network phase ----------------------------------------------------

    fn network_phase<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        driver: &mut D,
    ) {
        self.start_networks(ctx, now, driver);
    }

    fn start_networks<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        driver: &mut D,
    ) {
        self.new_phase(Phase::Network, driver);

        // With encryption demanded, the IP protocols wait until the
        // compression layer reports ready via continue_networks().
        if self.settings.mppe & mppe::ENABLE != 0 {
            debug!("holding NCPs until the encryption layer is ready");
            return;
        }
        self.continue_networks(ctx, now, driver);
    }

    /// Open the real network protocols. Called automatically unless an
    /// encryption gate is configured, in which case the host calls it once
    /// its compression layer is up.
    pub fn continue_networks<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        driver: &mut D,
    ) {
        if let Some(mut ipcp) = self.ipcp.take() {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = ipcp.open(ctx, now, &mut tx);
            drop(tx);
            self.ipcp = Some(ipcp);
            self.num_np_open += 1;
            self.ipcp_counted = true;
            self.process_ncp_events(now, Ncp::Ipv4, events, driver);
        }
        if let Some(mut cp) = self.ipv6cp.take() {
            let mut tx = |p: Packet<'_>| driver.transmit(p);
            let events = cp.open(ctx, now, &mut tx);
            drop(tx);
            self.ipv6cp = Some(cp);
            self.num_np_open += 1;
            self.ipv6cp_counted = true;
            self.process_ncp_events(now, Ncp::Ipv6, events, driver);
        }

        if self.num_np_open == 0 {
            // Nothing to run over the link.
            self.lcp_close(now, "No network protocols running", driver);
        }
    }

    fn process_ncp_events<D: LinkDriver>(
        &mut self,
        now: Instant,
        ncp: Ncp,
        events: Events,
        driver: &mut D,
    ) {
        for ev in events {
            match ev {
                FsmEvent::Up => {
                    match ncp {
                        Ncp::Ipv4 => {
                            self.ipcp_up = true;
                            if let Some(ipcp) = &self.ipcp {
                                driver.ipv4_up(ipcp.proto().status());
                            }
                        }
                        Ncp::Ipv6 => {
                            self.ipv6cp_up = true;
                            if let Some(cp) = &self.ipv6cp {
                                driver.ipv6_up(cp.proto().status());
                            }
                        }
                    }
                    self.np_up(now, driver);
                }
                FsmEvent::Down => {
                    match ncp {
                        Ncp::Ipv4 => {
                            if self.ipcp_up {
                                self.ipcp_up = false;
                                driver.ipv4_down();
                            }
                        }
                        Ncp::Ipv6 => {
                            if self.ipv6cp_up {
                                self.ipv6cp_up = false;
                                driver.ipv6_down();
                            }
                        }
                    }
                    self.np_down(driver);
                }
                FsmEvent::Finished => self.np_finished(now, ncp, driver),
                FsmEvent::Starting => {}
                FsmEvent::ProtocolRejected(_) => {}
            }
        }
    }

    /// A network protocol came up; the first one makes the session Running
    /// and arms the wall-clock limits.
    fn np_up<D: LinkDriver>(&mut self, now: Instant, driver: &mut D) {
        if self.num_np_up == 0 {
            self.new_phase(Phase::Running, driver);
            if self.settings.idle_time_limit > Duration::ZERO {
                self.idle_timer
                    .schedule(now + self.settings.idle_time_limit);
            }
            if self.settings.maxconnect > Duration::ZERO {
                self.maxconnect_timer
                    .schedule(now + self.settings.maxconnect);
            }
        }
        self.num_np_up += 1;
    }

    fn np_down<D: LinkDriver>(&mut self, driver: &mut D) {
        if self.num_np_up > 0 {
            self.num_np_up -= 1;
            if self.num_np_up == 0 {
                self.idle_timer.cancel();
                self.maxconnect_timer.cancel();
                self.new_phase(Phase::Network, driver);
            }
        }
    }

    fn np_finished<D: LinkDriver>(&mut self, now: Instant, ncp: Ncp, driver: &mut D) {
        let counted = match ncp {
            Ncp::Ipv4 => core::mem::replace(&mut self.ipcp_counted, false),
            Ncp::Ipv6 => core::mem::replace(&mut self.ipv6cp_counted, false),
        };
        if counted {
            self.num_np_open -= 1;
            if self.num_np_open == 0 {
                // No further use for the link.
                self.lcp_close(now, "No network protocols running", driver);
            }
        }
    }

    // --- protocol reject --------------------------------------------------

    fn protocol_rejected<D: LinkDriver>(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        proto: u16,
        driver: &mut D,
    ) {
        debug!("Protocol-Reject for protocol {} received", proto);
        match ProtocolType::from(proto) {
            ProtocolType::LCP => {
                // Can't reject LCP!
                error!("Received Protocol-Reject for LCP!");
                self.err_code = ErrorCode::Protocol;
                if self.phase != Phase::Dead && self.phase != Phase::Master {
                    self.new_phase(Phase::Terminate, driver);
                }
                let mut tx = |p: Packet<'_>| driver.transmit(p);
                let events = self.lcp.protocol_rejected(now, &mut tx);
                drop(tx);
                self.process_lcp_events(ctx, now, events, driver);
            }
            ProtocolType::IPv4CP => {
                if let Some(mut ipcp) = self.ipcp.take() {
                    let mut tx = |p: Packet<'_>| driver.transmit(p);
                    let events = ipcp.protocol_rejected(now, &mut tx);
                    drop(tx);
                    self.ipcp = Some(ipcp);
                    self.process_ncp_events(now, Ncp::Ipv4, events, driver);
                }
            }
            ProtocolType::IPv6CP => {
                if let Some(mut cp) = self.ipv6cp.take() {
                    let mut tx = |p: Packet<'_>| driver.transmit(p);
                    let events = cp.protocol_rejected(now, &mut tx);
                    drop(tx);
                    self.ipv6cp = Some(cp);
                    self.process_ncp_events(now, Ncp::Ipv6, events, driver);
                }
            }
            ProtocolType::PAP => {
                if let Some(r) = self.pap.protocol_rejected() {
                    self.handle_auth_result(ctx, now, Method::Pap, r, driver);
                }
            }
            ProtocolType::CHAP => {
                if let Some(r) = self.chap.protocol_rejected() {
                    let digest = self.lcp.proto().got.chap_mdtype.digest().unwrap_or(0);
                    self.handle_auth_result(ctx, now, Method::Chap(digest), r, driver);
                }
            }
            ProtocolType::EAP => {
                if let Some(r) = self.eap.protocol_rejected() {
                    self.handle_auth_result(ctx, now, Method::Eap, r, driver);
                }
            }
            _ => {
                warn!("Protocol-Reject for unsupported protocol {}", proto);
            }
        }
    }
}
