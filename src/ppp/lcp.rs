//! Link Control Protocol: the option codec, the control surface on top of
//! the shared automaton, and the echo keepalive.
//!
//! Four option records drive a negotiation cycle: `want` is what we intend
//! to ask for, `got` is the request currently in flight (pared down by the
//! peer's Naks and Rejects), `allow` bounds what we accept from the peer,
//! and `his` is what we acked in the peer's most recent request.

use heapless::Vec;
use num_enum::{FromPrimitive, IntoPrimitive};

use super::fsm::{BadReply, ExtVerdict, NegotiableProtocol, OptionData, State, Verdict};
use crate::magic::ProcessContext;
use crate::time::{Duration, Instant, Timeout};
use crate::wire::{Code, Packet, ProtocolType};

pub(crate) const DEFAULT_MRU: u16 = 1500;
pub(crate) const MIN_MRU: u16 = 128;
/// Value byte of the Callback option selecting CBCP.
const CBCP_OPT: u8 = 6;
const MAX_ENDPOINT_LEN: usize = 20;

/// CHAP digest codes on the wire.
pub(crate) const CHAP_MD5: u8 = 5;
pub(crate) const CHAP_MICROSOFT: u8 = 0x80;
pub(crate) const CHAP_MICROSOFT_V2: u8 = 0x81;

#[derive(FromPrimitive, IntoPrimitive, Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
enum Option_ {
    #[num_enum(default)]
    Unknown = 0,
    Mru = 1,
    Asyncmap = 2,
    Auth = 3,
    Quality = 4,
    Magic = 5,
    Pcomp = 7,
    Accomp = 8,
    Callback = 13,
    Mrru = 17,
    Ssnhf = 18,
    Epdisc = 19,
}

/// Set of acceptable CHAP digest algorithms, in preference order
/// MD5 > MS-CHAPv2 > MS-CHAP.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct MdType(u8);

impl MdType {
    const MD5: u8 = 0x4;
    const MICROSOFT_V2: u8 = 0x2;
    const MICROSOFT: u8 = 0x1;

    pub const NONE: MdType = MdType(0);
    pub const ALL: MdType = MdType(0x7);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Wire code of the most preferred enabled digest.
    pub fn digest(self) -> Option<u8> {
        if self.0 & Self::MD5 != 0 {
            Some(CHAP_MD5)
        } else if self.0 & Self::MICROSOFT_V2 != 0 {
            Some(CHAP_MICROSOFT_V2)
        } else if self.0 & Self::MICROSOFT != 0 {
            Some(CHAP_MICROSOFT)
        } else {
            None
        }
    }

    pub fn supports(self, digest: u8) -> bool {
        !(self & MdType::from_digest(digest)).is_empty()
    }

    pub fn from_digest(digest: u8) -> MdType {
        match digest {
            CHAP_MD5 => MdType(Self::MD5),
            CHAP_MICROSOFT_V2 => MdType(Self::MICROSOFT_V2),
            CHAP_MICROSOFT => MdType(Self::MICROSOFT),
            _ => MdType::NONE,
        }
    }

    /// Drop the digest [`MdType::digest`] currently resolves to.
    pub fn drop_preferred(&mut self) {
        if let Some(d) = self.digest() {
            *self = *self - MdType::from_digest(d);
        }
    }

    pub fn without_md5(self) -> MdType {
        MdType(self.0 & !Self::MD5)
    }

    pub fn without_microsoft(self) -> MdType {
        MdType(self.0 & !Self::MICROSOFT)
    }

    pub fn without_microsoft_v2(self) -> MdType {
        MdType(self.0 & !Self::MICROSOFT_V2)
    }
}

impl core::ops::BitAnd for MdType {
    type Output = MdType;
    fn bitand(self, rhs: MdType) -> MdType {
        MdType(self.0 & rhs.0)
    }
}

impl core::ops::BitOr for MdType {
    type Output = MdType;
    fn bitor(self, rhs: MdType) -> MdType {
        MdType(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for MdType {
    fn bitor_assign(&mut self, rhs: MdType) {
        self.0 |= rhs.0;
    }
}

impl core::ops::Sub for MdType {
    type Output = MdType;
    fn sub(self, rhs: MdType) -> MdType {
        MdType(self.0 & !rhs.0)
    }
}

/// Endpoint discriminator (multilink bundle identity).
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub(crate) struct Epdisc {
    pub class: u8,
    pub value: Vec<u8, MAX_ENDPOINT_LEN>,
}

/// One negotiation record. See the module comment for the four roles.
#[derive(Clone, Debug, Default)]
pub(crate) struct LcpOptions {
    pub passive: bool,
    pub silent: bool,

    pub neg_mru: bool,
    pub neg_asyncmap: bool,
    pub neg_upap: bool,
    pub neg_chap: bool,
    pub neg_eap: bool,
    pub neg_magicnumber: bool,
    pub neg_pcompression: bool,
    pub neg_accompression: bool,
    pub neg_lqr: bool,
    pub neg_cbcp: bool,
    pub neg_mrru: bool,
    pub neg_ssnhf: bool,
    pub neg_endpoint: bool,

    pub mru: u16,
    pub mrru: u16,
    pub chap_mdtype: MdType,
    pub asyncmap: u32,
    pub magicnumber: u32,
    pub numloops: u8,
    pub lqr_period: u32,
    pub endpoint: Epdisc,
}

impl LcpOptions {
    /// What we request by default.
    pub fn wanted() -> Self {
        Self {
            neg_mru: true,
            mru: DEFAULT_MRU,
            neg_asyncmap: true,
            neg_magicnumber: true,
            neg_pcompression: true,
            neg_accompression: true,
            ..Self::default()
        }
    }

    /// What we accept from the peer by default.
    pub fn allowed() -> Self {
        Self {
            neg_mru: true,
            mru: DEFAULT_MRU,
            neg_asyncmap: true,
            neg_upap: true,
            neg_chap: true,
            chap_mdtype: MdType::ALL,
            neg_eap: true,
            neg_magicnumber: true,
            neg_pcompression: true,
            neg_accompression: true,
            neg_endpoint: true,
            ..Self::default()
        }
    }
}

/// The slice of session configuration LCP needs while negotiating.
#[derive(Clone, Debug, Default)]
pub(crate) struct LcpConfig {
    pub have_credentials: bool,
    pub auth_required: bool,
    pub refuse_pap: bool,
    pub refuse_chap: bool,
    pub refuse_mschap: bool,
    pub refuse_mschap_v2: bool,
    pub refuse_eap: bool,
    pub noendpoint: bool,
    pub loopback_fail: u8,
    pub echo_interval: Duration,
    pub echo_fails: u8,
    pub echo_adaptive: bool,
}

pub(crate) enum EchoOutcome {
    Ok,
    /// The unanswered-echo threshold was crossed.
    PeerDead,
}

pub(crate) struct Lcp {
    pub want: LcpOptions,
    pub got: LcpOptions,
    pub allow: LcpOptions,
    pub his: LcpOptions,

    pub cfg: LcpConfig,

    /// Set when magic renegotiation looped often enough to call the line
    /// looped back; the session turns this into a Loopback teardown.
    loopback: bool,

    echos_pending: u8,
    echo_number: u8,
    echo_timer: Timeout,
    echo_pkts_in: u32,
}

impl Lcp {
    pub fn new() -> Self {
        Self {
            want: LcpOptions::wanted(),
            got: LcpOptions::wanted(),
            allow: LcpOptions::allowed(),
            his: LcpOptions::default(),
            cfg: LcpConfig {
                loopback_fail: 10,
                echo_fails: 3,
                ..LcpConfig::default()
            },
            loopback: false,
            echos_pending: 0,
            echo_number: 0,
            echo_timer: Timeout::new(),
            echo_pkts_in: 0,
        }
    }

    pub fn take_loopback(&mut self) -> bool {
        core::mem::replace(&mut self.loopback, false)
    }

    // --- echo keepalive ---------------------------------------------------

    pub fn echo_at(&self) -> Option<Instant> {
        self.echo_timer.at()
    }

    /// Keepalive starts as soon as LCP opens; the first request goes out
    /// immediately, then every `echo_interval`.
    pub fn echo_start(&mut self, now: Instant, pkts_in: u32, tx: &mut dyn FnMut(Packet<'_>)) {
        self.echos_pending = 0;
        self.echo_number = 0;
        self.echo_pkts_in = pkts_in;
        self.echo_timer.cancel();
        if self.cfg.echo_interval > Duration::ZERO {
            self.send_echo_request(tx);
            self.echo_timer.schedule(now + self.cfg.echo_interval);
        }
    }

    pub fn echo_stop(&mut self) {
        self.echo_timer.cancel();
    }

    pub fn echo_poll(
        &mut self,
        now: Instant,
        pkts_in: u32,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> EchoOutcome {
        if !self.echo_timer.poll(now) {
            return EchoOutcome::Ok;
        }

        if self.cfg.echo_fails != 0 && self.echos_pending >= self.cfg.echo_fails {
            info!("no response to {} echo-requests", self.echos_pending);
            self.echos_pending = 0;
            return EchoOutcome::PeerDead;
        }

        if self.cfg.echo_adaptive && pkts_in != self.echo_pkts_in {
            // Link is carrying traffic; no need to probe it.
            self.echo_pkts_in = pkts_in;
        } else {
            self.send_echo_request(tx);
        }

        self.echo_timer.schedule(now + self.cfg.echo_interval);
        EchoOutcome::Ok
    }

    fn send_echo_request(&mut self, tx: &mut dyn FnMut(Packet<'_>)) {
        let mut data = self.got.magicnumber.to_be_bytes();
        let id = self.echo_number;
        self.echo_number = self.echo_number.wrapping_add(1);
        tx(Packet {
            proto: ProtocolType::LCP,
            payload: crate::wire::Payload::PPP(
                Code::EchoReq,
                id,
                crate::wire::PPPPayload::Raw(&mut data),
            ),
        });
        self.echos_pending = self.echos_pending.saturating_add(1);
    }

    fn receive_echo_reply(&mut self, data: &[u8]) {
        if data.len() < 4 {
            debug!("short Echo-Reply, length {}", data.len());
            return;
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if self.got.neg_magicnumber && magic == self.got.magicnumber {
            warn!("appear to have received our own echo-reply!");
            return;
        }
        self.echos_pending = 0;
    }

    // --- request serialization -------------------------------------------

    /// Serialize the request into raw TLV bytes; used for byte-exact Ack
    /// validation.
    fn request_bytes(&self) -> Vec<u8, 96> {
        let mut out = Vec::new();
        self.request_options(&mut |code, data| {
            unwrap!(out.push(code).ok());
            unwrap!(out.push(data.len() as u8 + 2).ok());
            unwrap!(out.extend_from_slice(data).ok());
        });
        out
    }
}

fn get_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

fn get_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Consume one TLV of exactly `len` total bytes with type `opt`, returning
/// its value field. No match leaves the cursor untouched.
fn take<'a>(p: &mut &'a [u8], opt: Option_, len: usize) -> Option<&'a [u8]> {
    let buf = *p;
    if buf.len() >= len && buf[0] == u8::from(opt) && buf[1] as usize == len {
        *p = &buf[len..];
        Some(&buf[2..len])
    } else {
        None
    }
}

fn nak(data: &[u8]) -> Verdict {
    Verdict::Nack(unwrap!(OptionData::from_slice(data).ok()))
}

/// Tracks which of our options this Nak already touched, to police the
/// trailing unsolicited-option section.
#[derive(Default)]
struct SeenNaks {
    mru: bool,
    asyncmap: bool,
    upap: bool,
    chap: bool,
    eap: bool,
    lqr: bool,
    cbcp: bool,
    magic: bool,
    pcomp: bool,
    accomp: bool,
    mrru: bool,
    ssnhf: bool,
    endpoint: bool,
}

impl NegotiableProtocol for Lcp {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::LCP
    }

    fn reset_request(&mut self, ctx: &mut ProcessContext) {
        let cfg = &self.cfg;
        let ao = &mut self.allow;
        let wo = &mut self.want;

        // Recompute which authentication we can offer and demand.
        ao.neg_upap = true;
        ao.chap_mdtype = MdType::ALL;
        ao.neg_eap = true;
        if cfg.have_credentials {
            if cfg.refuse_pap {
                ao.neg_upap = false;
            }
            if cfg.refuse_chap {
                ao.chap_mdtype = ao.chap_mdtype.without_md5();
            }
            if cfg.refuse_mschap {
                ao.chap_mdtype = ao.chap_mdtype.without_microsoft();
            }
            if cfg.refuse_mschap_v2 {
                ao.chap_mdtype = ao.chap_mdtype.without_microsoft_v2();
            }
            ao.neg_chap = !ao.chap_mdtype.is_empty();
            if cfg.refuse_eap {
                ao.neg_eap = false;
            }

            if cfg.auth_required {
                // We are the authenticator: demand the peer's best method.
                wo.neg_upap = !cfg.refuse_pap;
                wo.chap_mdtype = MdType::NONE;
                if !cfg.refuse_chap {
                    wo.chap_mdtype |= MdType::from_digest(CHAP_MD5);
                }
                if !cfg.refuse_mschap {
                    wo.chap_mdtype |= MdType::from_digest(CHAP_MICROSOFT);
                }
                if !cfg.refuse_mschap_v2 {
                    wo.chap_mdtype |= MdType::from_digest(CHAP_MICROSOFT_V2);
                }
                wo.neg_chap = !wo.chap_mdtype.is_empty();
                wo.neg_eap = !cfg.refuse_eap;
            }
        } else {
            ao.neg_upap = false;
            ao.neg_chap = false;
            ao.chap_mdtype = MdType::NONE;
            ao.neg_eap = false;
        }
        debug!(
            "auth protocols: PAP={} CHAP={} EAP={}",
            ao.neg_upap, ao.neg_chap, ao.neg_eap
        );

        wo.magicnumber = ctx.magic.magic();
        wo.numloops = 0;
        self.got = wo.clone();
        // No multilink: never request bundle options ourselves.
        self.got.neg_mrru = false;
        self.got.neg_ssnhf = false;
        self.got.neg_endpoint = false;
        if cfg.noendpoint {
            self.allow.neg_endpoint = false;
        }
        self.loopback = false;
    }

    fn request_options(&self, f: &mut dyn FnMut(u8, &[u8])) {
        let go = &self.got;

        if go.neg_mru && go.mru != DEFAULT_MRU {
            f(Option_::Mru.into(), &go.mru.to_be_bytes());
        }
        if go.neg_asyncmap && go.asyncmap != 0xFFFFFFFF {
            f(Option_::Asyncmap.into(), &go.asyncmap.to_be_bytes());
        }
        // Only one authentication option per request, the most preferred.
        if go.neg_eap {
            f(Option_::Auth.into(), &u16::from(ProtocolType::EAP).to_be_bytes());
        } else if go.neg_chap {
            let proto = u16::from(ProtocolType::CHAP).to_be_bytes();
            let digest = unwrap!(go.chap_mdtype.digest());
            f(Option_::Auth.into(), &[proto[0], proto[1], digest]);
        } else if go.neg_upap {
            f(Option_::Auth.into(), &u16::from(ProtocolType::PAP).to_be_bytes());
        }
        if go.neg_lqr {
            let proto = u16::from(ProtocolType::LQR).to_be_bytes();
            let period = go.lqr_period.to_be_bytes();
            f(
                Option_::Quality.into(),
                &[proto[0], proto[1], period[0], period[1], period[2], period[3]],
            );
        }
        if go.neg_cbcp {
            f(Option_::Callback.into(), &[CBCP_OPT]);
        }
        if go.neg_magicnumber {
            f(Option_::Magic.into(), &go.magicnumber.to_be_bytes());
        }
        if go.neg_pcompression {
            f(Option_::Pcomp.into(), &[]);
        }
        if go.neg_accompression {
            f(Option_::Accomp.into(), &[]);
        }
        if go.neg_mrru {
            f(Option_::Mrru.into(), &go.mrru.to_be_bytes());
        }
        if go.neg_ssnhf {
            f(Option_::Ssnhf.into(), &[]);
        }
        if go.neg_endpoint {
            let mut buf: Vec<u8, 21> = Vec::new();
            unwrap!(buf.push(go.endpoint.class).ok());
            unwrap!(buf.extend_from_slice(&go.endpoint.value).ok());
            f(Option_::Epdisc.into(), &buf);
        }
    }

    fn ack_received(&mut self, data: &[u8]) -> Result<(), BadReply> {
        // The Ack must mirror our request exactly, order included.
        if data == &self.request_bytes()[..] {
            Ok(())
        } else {
            Err(BadReply)
        }
    }

    fn nak_received(
        &mut self,
        ctx: &mut ProcessContext,
        data: &[u8],
        treat_as_reject: bool,
        opened: bool,
    ) -> Result<(), BadReply> {
        let go = self.got.clone();
        let mut try_ = self.got.clone();
        let mut no = SeenNaks::default();
        let mut looped_back = false;
        let mut p = data;

        // Nacked options appear in the order we sent them, but any may be
        // absent. Each rule concedes toward the peer's hint.
        if go.neg_mru && go.mru != DEFAULT_MRU {
            if let Some(d) = take(&mut p, Option_::Mru, 4) {
                no.mru = true;
                let v = get_u16(d);
                // Accept any MRU up to what we wanted, or up to the default.
                if v <= self.want.mru || v <= DEFAULT_MRU {
                    try_.mru = v;
                }
            }
        }
        if go.neg_asyncmap && go.asyncmap != 0xFFFFFFFF {
            if let Some(d) = take(&mut p, Option_::Asyncmap, 6) {
                no.asyncmap = true;
                try_.asyncmap = go.asyncmap | get_u32(d);
            }
        }

        // Authentication: the peer proposes a different protocol or a
        // different CHAP digest.
        if (go.neg_chap || go.neg_upap || go.neg_eap)
            && p.len() >= 4
            && p[0] == u8::from(Option_::Auth)
            && p[1] >= 4
            && p[1] as usize <= p.len()
        {
            let cilen = p[1] as usize;
            no.chap = go.neg_chap;
            no.upap = go.neg_upap;
            no.eap = go.neg_eap;
            let proto = get_u16(&p[2..4]);

            if proto == ProtocolType::PAP.into() && cilen == 4 {
                if go.neg_eap {
                    try_.neg_eap = false;
                } else if go.neg_chap {
                    try_.neg_chap = false;
                } else {
                    // We were already asking for PAP; nacking it with PAP
                    // makes no sense.
                    return Err(BadReply);
                }
            } else if proto == ProtocolType::CHAP.into() && cilen == 5 {
                let digest = p[4];
                if go.neg_eap {
                    try_.neg_eap = false;
                    if go.chap_mdtype.supports(digest) {
                        try_.chap_mdtype = MdType::from_digest(digest);
                    }
                } else if go.neg_chap {
                    if digest != unwrap!(go.chap_mdtype.digest()) {
                        if go.chap_mdtype.supports(digest) {
                            // Use their suggestion if we support it...
                            try_.chap_mdtype = MdType::from_digest(digest);
                        } else {
                            // ...otherwise fall back to our next choice.
                            try_.chap_mdtype.drop_preferred();
                            if try_.chap_mdtype.is_empty() {
                                try_.neg_chap = false;
                            }
                        }
                    } else {
                        // They nacked our digest and then suggested it back.
                        return Err(BadReply);
                    }
                } else {
                    try_.neg_upap = false;
                }
            } else {
                if proto == ProtocolType::EAP.into() && cilen == 4 && go.neg_eap {
                    debug!("unexpected Configure-Nak for EAP");
                }
                // Unrecognized suggestion: stop asking for what we asked.
                if go.neg_eap {
                    try_.neg_eap = false;
                } else if go.neg_chap {
                    try_.neg_chap = false;
                } else {
                    try_.neg_upap = false;
                }
            }
            p = &p[cilen..];
        }

        if go.neg_lqr {
            if let Some(d) = take(&mut p, Option_::Quality, 8) {
                no.lqr = true;
                if get_u16(&d[0..2]) != ProtocolType::LQR.into() {
                    try_.neg_lqr = false;
                } else {
                    try_.lqr_period = get_u32(&d[2..6]);
                }
            }
        }
        if go.neg_cbcp {
            if take(&mut p, Option_::Callback, 3).is_some() {
                no.cbcp = true;
                try_.neg_cbcp = false;
            }
        }

        // A nacked magic number means the peer saw its own: looped line.
        if go.neg_magicnumber {
            if take(&mut p, Option_::Magic, 6).is_some() {
                no.magic = true;
                try_.magicnumber = ctx.magic.magic();
                looped_back = true;
            }
        }

        // Nak of the boolean options is illegal; honor it like a Reject.
        if go.neg_pcompression {
            if take(&mut p, Option_::Pcomp, 2).is_some() {
                no.pcomp = true;
                try_.neg_pcompression = false;
            }
        }
        if go.neg_accompression {
            if take(&mut p, Option_::Accomp, 2).is_some() {
                no.accomp = true;
                try_.neg_accompression = false;
            }
        }
        if go.neg_mrru {
            if let Some(d) = take(&mut p, Option_::Mrru, 4) {
                no.mrru = true;
                if treat_as_reject {
                    try_.neg_mrru = false;
                } else if get_u16(d) <= self.want.mrru {
                    try_.mrru = get_u16(d);
                }
            }
        }
        if go.neg_ssnhf {
            if take(&mut p, Option_::Ssnhf, 2).is_some() {
                no.ssnhf = true;
                try_.neg_ssnhf = false;
            }
        }
        if go.neg_endpoint
            && p.len() >= 3
            && p[0] == u8::from(Option_::Epdisc)
            && p[1] >= 3
            && p[1] as usize <= p.len()
        {
            let l = p[1] as usize;
            p = &p[l..];
            no.endpoint = true;
            try_.neg_endpoint = false;
        }

        // Remaining options are the peer asking us to negotiate something
        // we didn't request. Anything we did request, or saw earlier in
        // this packet, makes the Nak bad.
        while p.len() >= 2 {
            let citype = p[0];
            let cilen = p[1] as usize;
            if cilen < 2 || cilen > p.len() {
                return Err(BadReply);
            }
            let d = &p[2..cilen];
            match Option_::from(citype) {
                Option_::Mru => {
                    if (go.neg_mru && go.mru != DEFAULT_MRU) || no.mru || cilen != 4 {
                        return Err(BadReply);
                    }
                    let v = get_u16(d);
                    if v < DEFAULT_MRU {
                        try_.neg_mru = true;
                        try_.mru = v;
                    }
                }
                Option_::Asyncmap => {
                    if (go.neg_asyncmap && go.asyncmap != 0xFFFFFFFF)
                        || no.asyncmap
                        || cilen != 6
                    {
                        return Err(BadReply);
                    }
                }
                Option_::Auth => {
                    if go.neg_chap || no.chap || go.neg_upap || no.upap || go.neg_eap || no.eap {
                        return Err(BadReply);
                    }
                }
                Option_::Magic => {
                    if go.neg_magicnumber || no.magic || cilen != 6 {
                        return Err(BadReply);
                    }
                }
                Option_::Pcomp => {
                    if go.neg_pcompression || no.pcomp || cilen != 2 {
                        return Err(BadReply);
                    }
                }
                Option_::Accomp => {
                    if go.neg_accompression || no.accomp || cilen != 2 {
                        return Err(BadReply);
                    }
                }
                Option_::Quality => {
                    if go.neg_lqr || no.lqr || cilen != 8 {
                        return Err(BadReply);
                    }
                }
                Option_::Mrru => {
                    if go.neg_mrru || no.mrru || cilen != 4 {
                        return Err(BadReply);
                    }
                }
                Option_::Ssnhf => {
                    if go.neg_ssnhf || no.ssnhf || cilen != 2 {
                        return Err(BadReply);
                    }
                    try_.neg_ssnhf = true;
                }
                Option_::Epdisc => {
                    if go.neg_endpoint || no.endpoint || cilen < 3 {
                        return Err(BadReply);
                    }
                }
                _ => {}
            }
            p = &p[cilen..];
        }

        // The Nak is good; commit unless the link is already up.
        if !opened {
            if looped_back {
                try_.numloops = try_.numloops.saturating_add(1);
                if try_.numloops >= self.cfg.loopback_fail {
                    info!("serial line is looped back");
                    self.loopback = true;
                }
            } else {
                try_.numloops = 0;
            }
            self.got = try_;
        }
        Ok(())
    }

    fn rej_received(&mut self, data: &[u8], opened: bool) -> Result<(), BadReply> {
        let go = self.got.clone();
        let mut try_ = self.got.clone();
        let mut p = data;

        // Rejected options must come in the order we sent them, carrying
        // exactly the values we sent.
        if go.neg_mru {
            if let Some(d) = take(&mut p, Option_::Mru, 4) {
                if get_u16(d) != go.mru {
                    return Err(BadReply);
                }
                try_.neg_mru = false;
            }
        }
        if go.neg_asyncmap {
            if let Some(d) = take(&mut p, Option_::Asyncmap, 6) {
                if get_u32(d) != go.asyncmap {
                    return Err(BadReply);
                }
                try_.neg_asyncmap = false;
            }
        }
        if go.neg_eap {
            if let Some(d) = take(&mut p, Option_::Auth, 4) {
                if get_u16(d) != ProtocolType::EAP.into() {
                    return Err(BadReply);
                }
                try_.neg_eap = false;
            }
        }
        if !go.neg_eap {
            if go.neg_chap {
                if let Some(d) = take(&mut p, Option_::Auth, 5) {
                    if get_u16(&d[0..2]) != ProtocolType::CHAP.into()
                        || d[2] != unwrap!(go.chap_mdtype.digest())
                    {
                        return Err(BadReply);
                    }
                    // Peer plainly does not want to talk authentication:
                    // drop the fallbacks along with CHAP.
                    try_.neg_chap = false;
                    try_.neg_eap = false;
                    try_.neg_upap = false;
                }
            }
            if !go.neg_chap && go.neg_upap {
                if let Some(d) = take(&mut p, Option_::Auth, 4) {
                    if get_u16(d) != ProtocolType::PAP.into() {
                        return Err(BadReply);
                    }
                    try_.neg_upap = false;
                }
            }
        }
        if go.neg_lqr {
            if let Some(d) = take(&mut p, Option_::Quality, 8) {
                if get_u16(&d[0..2]) != ProtocolType::LQR.into() || get_u32(&d[2..6]) != go.lqr_period
                {
                    return Err(BadReply);
                }
                try_.neg_lqr = false;
            }
        }
        if go.neg_cbcp {
            if let Some(d) = take(&mut p, Option_::Callback, 3) {
                if d[0] != CBCP_OPT {
                    return Err(BadReply);
                }
                try_.neg_cbcp = false;
            }
        }
        if go.neg_magicnumber {
            if let Some(d) = take(&mut p, Option_::Magic, 6) {
                if get_u32(d) != go.magicnumber {
                    return Err(BadReply);
                }
                try_.neg_magicnumber = false;
            }
        }
        if go.neg_pcompression && take(&mut p, Option_::Pcomp, 2).is_some() {
            try_.neg_pcompression = false;
        }
        if go.neg_accompression && take(&mut p, Option_::Accomp, 2).is_some() {
            try_.neg_accompression = false;
        }
        if go.neg_mrru {
            if let Some(d) = take(&mut p, Option_::Mrru, 4) {
                if get_u16(d) != go.mrru {
                    return Err(BadReply);
                }
                try_.neg_mrru = false;
            }
        }
        if go.neg_ssnhf && take(&mut p, Option_::Ssnhf, 2).is_some() {
            try_.neg_ssnhf = false;
        }
        if go.neg_endpoint {
            let total = 3 + go.endpoint.value.len();
            if let Some(d) = take(&mut p, Option_::Epdisc, total) {
                if d[0] != go.endpoint.class || &d[1..] != &go.endpoint.value[..] {
                    return Err(BadReply);
                }
                try_.neg_endpoint = false;
            }
        }

        if !p.is_empty() {
            return Err(BadReply);
        }
        if !opened {
            self.got = try_;
        }
        Ok(())
    }

    fn peer_request_start(&mut self) {
        self.his = LcpOptions::default();
    }

    fn peer_option(
        &mut self,
        ctx: &mut ProcessContext,
        code: u8,
        data: &[u8],
        reject_if_disagree: bool,
    ) -> Verdict {
        let opt = Option_::from(code);
        trace!("LCP: rx option {:?} {:?}", code, data);
        let ao = &self.allow;
        let go = &self.got;
        let ho = &mut self.his;

        let verdict = match opt {
            Option_::Mru => {
                if !ao.neg_mru || data.len() != 2 {
                    Verdict::Rej
                } else {
                    let v = get_u16(data);
                    // The peer must be able to receive at least our
                    // minimum; large values are simply ignored later.
                    if v < MIN_MRU {
                        nak(&MIN_MRU.to_be_bytes())
                    } else {
                        ho.neg_mru = true;
                        ho.mru = v;
                        Verdict::Ack
                    }
                }
            }
            Option_::Asyncmap => {
                if !ao.neg_asyncmap || data.len() != 4 {
                    Verdict::Rej
                } else {
                    let v = get_u32(data);
                    // It must cover at least the characters we insist on.
                    if ao.asyncmap & !v != 0 {
                        nak(&(ao.asyncmap | v).to_be_bytes())
                    } else {
                        ho.neg_asyncmap = true;
                        ho.asyncmap = v;
                        Verdict::Ack
                    }
                }
            }
            Option_::Auth => {
                if data.len() < 2 || !(ao.neg_upap || ao.neg_chap || ao.neg_eap) {
                    debug!("no auth is possible");
                    Verdict::Rej
                } else {
                    let proto = get_u16(&data[0..2]);
                    // Only one authentication method per request; the
                    // first acceptable one wins.
                    if proto == ProtocolType::PAP.into() {
                        if ho.neg_chap || ho.neg_eap || data.len() != 2 {
                            Verdict::Rej
                        } else if !ao.neg_upap {
                            // Suggest something stronger.
                            if ao.neg_eap {
                                nak(&u16::from(ProtocolType::EAP).to_be_bytes())
                            } else {
                                let p = u16::from(ProtocolType::CHAP).to_be_bytes();
                                nak(&[p[0], p[1], unwrap!(ao.chap_mdtype.digest())])
                            }
                        } else {
                            ho.neg_upap = true;
                            Verdict::Ack
                        }
                    } else if proto == ProtocolType::CHAP.into() {
                        if ho.neg_upap || ho.neg_eap || data.len() != 3 {
                            Verdict::Rej
                        } else if !ao.neg_chap {
                            if ao.neg_eap {
                                nak(&u16::from(ProtocolType::EAP).to_be_bytes())
                            } else {
                                nak(&u16::from(ProtocolType::PAP).to_be_bytes())
                            }
                        } else {
                            let digest = data[2];
                            if !ao.chap_mdtype.supports(digest) {
                                // Counter-propose our preferred digest.
                                let p = u16::from(ProtocolType::CHAP).to_be_bytes();
                                nak(&[p[0], p[1], unwrap!(ao.chap_mdtype.digest())])
                            } else {
                                ho.chap_mdtype = MdType::from_digest(digest);
                                ho.neg_chap = true;
                                Verdict::Ack
                            }
                        }
                    } else if proto == ProtocolType::EAP.into() {
                        if ho.neg_chap || ho.neg_upap || data.len() != 2 {
                            Verdict::Rej
                        } else if !ao.neg_eap {
                            if ao.neg_chap {
                                let p = u16::from(ProtocolType::CHAP).to_be_bytes();
                                nak(&[p[0], p[1], unwrap!(ao.chap_mdtype.digest())])
                            } else {
                                nak(&u16::from(ProtocolType::PAP).to_be_bytes())
                            }
                        } else {
                            ho.neg_eap = true;
                            Verdict::Ack
                        }
                    } else {
                        // Unknown protocol: counter with the best we do.
                        if ao.neg_eap {
                            nak(&u16::from(ProtocolType::EAP).to_be_bytes())
                        } else if ao.neg_chap {
                            let p = u16::from(ProtocolType::CHAP).to_be_bytes();
                            nak(&[p[0], p[1], unwrap!(ao.chap_mdtype.digest())])
                        } else {
                            nak(&u16::from(ProtocolType::PAP).to_be_bytes())
                        }
                    }
                }
            }
            Option_::Quality => {
                if !ao.neg_lqr || data.len() != 6 {
                    Verdict::Rej
                } else if get_u16(&data[0..2]) != ProtocolType::LQR.into() {
                    let p = u16::from(ProtocolType::LQR).to_be_bytes();
                    let period = ao.lqr_period.to_be_bytes();
                    nak(&[p[0], p[1], period[0], period[1], period[2], period[3]])
                } else {
                    ho.neg_lqr = true;
                    ho.lqr_period = get_u32(&data[2..6]);
                    Verdict::Ack
                }
            }
            Option_::Magic => {
                if !(ao.neg_magicnumber || go.neg_magicnumber) || data.len() != 4 {
                    Verdict::Rej
                } else {
                    let v = get_u32(data);
                    if go.neg_magicnumber && v == go.magicnumber {
                        // The peer must pick a different magic number.
                        let fresh = ctx.magic.magic();
                        nak(&fresh.to_be_bytes())
                    } else {
                        ho.neg_magicnumber = true;
                        ho.magicnumber = v;
                        Verdict::Ack
                    }
                }
            }
            Option_::Pcomp => {
                if !ao.neg_pcompression || !data.is_empty() {
                    Verdict::Rej
                } else {
                    ho.neg_pcompression = true;
                    Verdict::Ack
                }
            }
            Option_::Accomp => {
                if !ao.neg_accompression || !data.is_empty() {
                    Verdict::Rej
                } else {
                    ho.neg_accompression = true;
                    Verdict::Ack
                }
            }
            Option_::Mrru => {
                if !ao.neg_mrru || data.len() != 2 {
                    Verdict::Rej
                } else {
                    ho.neg_mrru = true;
                    ho.mrru = get_u16(data);
                    Verdict::Ack
                }
            }
            Option_::Ssnhf => {
                if !ao.neg_ssnhf || !data.is_empty() {
                    Verdict::Rej
                } else {
                    ho.neg_ssnhf = true;
                    Verdict::Ack
                }
            }
            Option_::Epdisc => {
                if !ao.neg_endpoint || data.is_empty() || data.len() > 1 + MAX_ENDPOINT_LEN {
                    Verdict::Rej
                } else {
                    ho.neg_endpoint = true;
                    ho.endpoint.class = data[0];
                    ho.endpoint.value = unwrap!(Vec::from_slice(&data[1..]).ok());
                    Verdict::Ack
                }
            }
            _ => {
                debug!("LCP: rx unknown option {}", code);
                Verdict::Rej
            }
        };

        // Past the nak-loop cap we get tough: everything that would be
        // nacked is rejected, except the loopback-breaking magic exchange.
        match verdict {
            Verdict::Nack(_) if reject_if_disagree && opt != Option_::Magic => Verdict::Rej,
            v => v,
        }
    }

    fn extended_code(
        &mut self,
        state: State,
        code: Code,
        id: u8,
        data: &mut [u8],
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> ExtVerdict {
        match code {
            Code::ProtocolRej => {
                // Protocol-Rejects outside OPENED are silently discarded.
                if state != State::Opened {
                    debug!("Protocol-Reject discarded in state {:?}", state);
                    return ExtVerdict::Handled;
                }
                if data.len() < 2 {
                    debug!("short Protocol-Reject");
                    return ExtVerdict::Handled;
                }
                ExtVerdict::ProtocolRejected(get_u16(data))
            }
            Code::EchoReq => {
                if state != State::Opened {
                    debug!("ignoring Echo-Request in state {:?}", state);
                    return ExtVerdict::Handled;
                }
                if data.len() < 4 {
                    return ExtVerdict::Handled;
                }
                data[0..4].copy_from_slice(&self.got.magicnumber.to_be_bytes());
                tx(Packet {
                    proto: ProtocolType::LCP,
                    payload: crate::wire::Payload::PPP(
                        Code::EchoReply,
                        id,
                        crate::wire::PPPPayload::Raw(data),
                    ),
                });
                ExtVerdict::Handled
            }
            Code::EchoReply => {
                self.receive_echo_reply(data);
                ExtVerdict::Handled
            }
            Code::DiscardReq | Code::Identification | Code::TimeRemaining => ExtVerdict::Handled,
            _ => ExtVerdict::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ppp::fsm::{Fsm, FsmSettings};

    fn ctx() -> ProcessContext {
        ProcessContext::new(99)
    }

    fn lcp() -> Lcp {
        let mut l = Lcp::new();
        l.got.magicnumber = 0xdead_beef;
        l
    }

    fn capture(out: &mut std::vec::Vec<std::vec::Vec<u8>>) -> impl FnMut(Packet<'_>) + '_ {
        |pkt| {
            let mut buf = vec![0; pkt.buffer_len()];
            pkt.emit(&mut buf);
            out.push(buf);
        }
    }

    #[test]
    fn request_suppresses_defaults() {
        // MRU at its default stays home; asyncmap 0, magic, pcomp and
        // accomp go out in canonical order.
        let l = lcp();
        let req = l.request_bytes();
        assert_eq!(
            &req[..],
            &[
                0x02, 0x06, 0x00, 0x00, 0x00, 0x00, // asyncmap 0
                0x05, 0x06, 0xde, 0xad, 0xbe, 0xef, // magic
                0x07, 0x02, // pcomp
                0x08, 0x02, // accomp
            ]
        );
    }

    #[test]
    fn request_emits_nondefault_mru_first() {
        let mut l = lcp();
        l.got.mru = 1400;
        let req = l.request_bytes();
        assert_eq!(&req[..4], &[0x01, 0x04, 0x05, 0x78]);
    }

    #[test]
    fn request_emits_single_auth_option() {
        let mut l = lcp();
        l.got.neg_upap = true;
        l.got.neg_chap = true;
        l.got.chap_mdtype = MdType::ALL;
        let req = l.request_bytes();
        // CHAP wins over PAP, carrying the MD5 digest.
        let auth = &req[6..11];
        assert_eq!(auth, &[0x03, 0x05, 0xc2, 0x23, 0x05]);
        // No second auth option anywhere.
        assert!(!req[11..].windows(2).any(|w| w[0] == 0x03));
    }

    #[test]
    fn ack_must_mirror_request() {
        let mut l = lcp();
        let good = l.request_bytes();
        assert!(l.ack_received(&good).is_ok());

        let mut reordered = good.clone();
        reordered.swap(0, 6);
        assert!(l.ack_received(&reordered).is_err());

        let mut tweaked = good.clone();
        *tweaked.last_mut().unwrap() ^= 1;
        assert!(l.ack_received(&tweaked).is_err());
    }

    #[test]
    fn nak_auth_pap_downgrades_chap() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.got.neg_chap = true;
        l.got.chap_mdtype = MdType::from_digest(CHAP_MD5);
        l.got.neg_upap = true;

        let data = [0x03, 0x04, 0xc0, 0x23];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert!(!l.got.neg_chap);
        assert!(l.got.neg_upap);
        // Next request proposes PAP.
        let req = l.request_bytes();
        assert!(req.windows(4).any(|w| w == [0x03, 0x04, 0xc0, 0x23]));
    }

    #[test]
    fn nak_chap_digest_switches_if_supported() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.got.neg_chap = true;
        l.got.chap_mdtype = MdType::ALL; // proposing MD5

        let data = [0x03, 0x05, 0xc2, 0x23, CHAP_MICROSOFT_V2];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert!(l.got.neg_chap);
        assert_eq!(l.got.chap_mdtype.digest(), Some(CHAP_MICROSOFT_V2));
    }

    #[test]
    fn nak_chap_with_our_own_digest_is_bad() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.got.neg_chap = true;
        l.got.chap_mdtype = MdType::from_digest(CHAP_MD5);

        let data = [0x03, 0x05, 0xc2, 0x23, CHAP_MD5];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_err());
        assert!(l.got.neg_chap);
    }

    #[test]
    fn nak_chap_unsupported_digest_falls_back_then_disables() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.got.neg_chap = true;
        l.got.neg_upap = true;
        l.got.chap_mdtype = MdType::from_digest(CHAP_MD5) | MdType::from_digest(CHAP_MICROSOFT);

        // Peer wants a digest we never heard of.
        let data = [0x03, 0x05, 0xc2, 0x23, 0x42];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert_eq!(l.got.chap_mdtype.digest(), Some(CHAP_MICROSOFT));

        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert!(!l.got.neg_chap);
        assert!(l.got.neg_upap);
    }

    #[test]
    fn nak_asyncmap_ors_peer_bits() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.got.asyncmap = 0x0000_00ff;
        let data = [0x02, 0x06, 0x00, 0x0a, 0x00, 0x00];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert_eq!(l.got.asyncmap, 0x000a_00ff);
    }

    #[test]
    fn nak_magic_counts_loops_and_flags_loopback() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.cfg.loopback_fail = 2;

        let data = [0x05, 0x06, 0x12, 0x34, 0x56, 0x78];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert_eq!(l.got.numloops, 1);
        assert!(!l.take_loopback());

        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert_eq!(l.got.numloops, 2);
        assert!(l.take_loopback());
        assert!(!l.take_loopback());
    }

    #[test]
    fn non_magic_nak_resets_loop_count() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.got.numloops = 3;
        let data = [0x02, 0x06, 0x00, 0x00, 0x00, 0x01];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert_eq!(l.got.numloops, 0);
    }

    #[test]
    fn nak_pcomp_honored_as_reject() {
        let mut ctx = ctx();
        let mut l = lcp();
        let data = [0x07, 0x02];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert!(!l.got.neg_pcompression);
    }

    #[test]
    fn unsolicited_small_mru_in_nak_is_adopted() {
        let mut ctx = ctx();
        let mut l = lcp();
        // MRU at default: not in our request, so it lands in the trailing
        // section and may be picked up.
        let data = [0x01, 0x04, 0x00, 0x64];
        assert!(l.nak_received(&mut ctx, &data, false, false).is_ok());
        assert!(l.got.neg_mru);
        assert_eq!(l.got.mru, 100);
    }

    #[test]
    fn duplicate_magic_in_nak_is_bad() {
        let mut ctx = ctx();
        let l0 = lcp();
        let mut l = l0;
        let data = [
            0x05, 0x06, 0x12, 0x34, 0x56, 0x78, // consumed by ordered walk
            0x05, 0x06, 0x12, 0x34, 0x56, 0x78, // trailing duplicate: bad
        ];
        let before = l.got.numloops;
        assert!(l.nak_received(&mut ctx, &data, false, false).is_err());
        assert_eq!(l.got.numloops, before);
    }

    #[test]
    fn nak_not_committed_while_opened() {
        let mut ctx = ctx();
        let mut l = lcp();
        let data = [0x02, 0x06, 0xff, 0x00, 0x00, 0x00];
        assert!(l.nak_received(&mut ctx, &data, false, true).is_ok());
        assert_eq!(l.got.asyncmap, 0);
    }

    #[test]
    fn rej_drops_option_with_exact_value() {
        let mut l = lcp();
        let data = [0x05, 0x06, 0xde, 0xad, 0xbe, 0xef];
        assert!(l.rej_received(&data, false).is_ok());
        assert!(!l.got.neg_magicnumber);
    }

    #[test]
    fn rej_with_wrong_value_is_bad() {
        let mut l = lcp();
        let data = [0x05, 0x06, 0x00, 0x00, 0x00, 0x01];
        assert!(l.rej_received(&data, false).is_err());
        assert!(l.got.neg_magicnumber);
    }

    #[test]
    fn rej_chap_clears_weaker_methods_too() {
        let mut l = lcp();
        l.got.neg_chap = true;
        l.got.chap_mdtype = MdType::from_digest(CHAP_MD5);
        l.got.neg_upap = true;

        let data = [0x03, 0x05, 0xc2, 0x23, CHAP_MD5];
        assert!(l.rej_received(&data, false).is_ok());
        assert!(!l.got.neg_chap);
        assert!(!l.got.neg_upap);
        assert!(!l.got.neg_eap);
    }

    #[test]
    fn rej_trailing_garbage_is_bad() {
        let mut l = lcp();
        let data = [0x05, 0x06, 0xde, 0xad, 0xbe, 0xef, 0x01];
        assert!(l.rej_received(&data, false).is_err());
    }

    #[test]
    fn reqci_mru_below_floor_is_nacked_with_floor() {
        let mut ctx = ctx();
        let mut l = lcp();
        match l.peer_option(&mut ctx, 1, &[0x00, 0x40], false) {
            Verdict::Nack(d) => assert_eq!(&d[..], &[0x00, 0x80]),
            _ => panic!("expected nak"),
        }
        // With the gloves off it becomes a reject.
        assert!(matches!(
            l.peer_option(&mut ctx, 1, &[0x00, 0x40], true),
            Verdict::Rej
        ));
    }

    #[test]
    fn reqci_mru_is_recorded() {
        let mut ctx = ctx();
        let mut l = lcp();
        assert!(matches!(
            l.peer_option(&mut ctx, 1, &[0x05, 0xdc], false),
            Verdict::Ack
        ));
        assert!(l.his.neg_mru);
        assert_eq!(l.his.mru, 1500);
    }

    #[test]
    fn reqci_magic_collision_nacks_fresh_value() {
        let mut ctx = ctx();
        let mut l = lcp();
        let ours = l.got.magicnumber.to_be_bytes();
        match l.peer_option(&mut ctx, 5, &ours, false) {
            Verdict::Nack(d) => assert_ne!(&d[..], &ours),
            _ => panic!("expected nak"),
        }
        // Magic renegotiation survives reject_if_disagree.
        assert!(matches!(
            l.peer_option(&mut ctx, 5, &ours, true),
            Verdict::Nack(_)
        ));
    }

    #[test]
    fn reqci_asyncmap_must_cover_ours() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.allow.asyncmap = 0x000a_0000;
        match l.peer_option(&mut ctx, 2, &[0, 0, 0, 0], false) {
            Verdict::Nack(d) => assert_eq!(&d[..], &[0x00, 0x0a, 0x00, 0x00]),
            _ => panic!("expected nak"),
        }
        assert!(matches!(
            l.peer_option(&mut ctx, 2, &[0x00, 0x0a, 0x00, 0x01], false),
            Verdict::Ack
        ));
    }

    #[test]
    fn reqci_auth_first_method_wins() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.allow.neg_upap = true;
        l.allow.neg_chap = true;
        l.allow.chap_mdtype = MdType::ALL;

        assert!(matches!(
            l.peer_option(&mut ctx, 3, &[0xc2, 0x23, CHAP_MD5], false),
            Verdict::Ack
        ));
        assert!(l.his.neg_chap);
        // A second method in the same request is rejected.
        assert!(matches!(
            l.peer_option(&mut ctx, 3, &[0xc0, 0x23], false),
            Verdict::Rej
        ));
    }

    #[test]
    fn reqci_auth_unwanted_digest_counterproposes_ours() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.allow.neg_chap = true;
        l.allow.chap_mdtype = MdType::from_digest(CHAP_MD5);
        match l.peer_option(&mut ctx, 3, &[0xc2, 0x23, 0x42], false) {
            Verdict::Nack(d) => assert_eq!(&d[..], &[0xc2, 0x23, CHAP_MD5]),
            _ => panic!("expected nak"),
        }
    }

    #[test]
    fn reqci_auth_rejected_without_credentials() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.allow.neg_upap = false;
        l.allow.neg_chap = false;
        l.allow.neg_eap = false;
        assert!(matches!(
            l.peer_option(&mut ctx, 3, &[0xc0, 0x23], false),
            Verdict::Rej
        ));
    }

    #[test]
    fn reqci_pap_when_we_want_stronger_nacks_chap() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.allow.neg_upap = false;
        l.allow.neg_chap = true;
        l.allow.chap_mdtype = MdType::ALL;
        l.allow.neg_eap = false;
        match l.peer_option(&mut ctx, 3, &[0xc0, 0x23], false) {
            Verdict::Nack(d) => assert_eq!(&d[..], &[0xc2, 0x23, CHAP_MD5]),
            _ => panic!("expected nak"),
        }
    }

    #[test]
    fn reqci_unknown_option_rejected() {
        let mut ctx = ctx();
        let mut l = lcp();
        assert!(matches!(
            l.peer_option(&mut ctx, 0x20, &[1, 2], false),
            Verdict::Rej
        ));
    }

    #[test]
    fn reset_request_applies_refusals() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.cfg.have_credentials = true;
        l.cfg.auth_required = true;
        l.cfg.refuse_pap = true;
        l.cfg.refuse_eap = true;
        l.reset_request(&mut ctx);

        assert!(!l.want.neg_upap);
        assert!(l.want.neg_chap);
        assert!(!l.want.neg_eap);
        assert!(!l.allow.neg_upap);
        assert!(l.allow.neg_chap);
        assert!(!l.allow.neg_eap);
        // The in-flight copy mirrors the wanted record, magic included.
        assert_eq!(l.got.magicnumber, l.want.magicnumber);
        assert!(!l.got.neg_endpoint);
    }

    #[test]
    fn reset_request_disables_auth_without_credentials() {
        let mut ctx = ctx();
        let mut l = lcp();
        l.cfg.have_credentials = false;
        l.reset_request(&mut ctx);
        assert!(!l.allow.neg_upap);
        assert!(!l.allow.neg_chap);
        assert!(!l.allow.neg_eap);
    }

    #[test]
    fn rej_beats_nak_in_request_evaluation() {
        // Driven through the automaton to exercise reply assembly: an
        // unknown option forces a Reject, and the would-be Nak of the
        // tiny MRU is dropped from the reply.
        let mut ctx = ctx();
        let mut f = Fsm::new(lcp(), FsmSettings::default());
        let mut out = std::vec::Vec::new();
        let mut tx = capture(&mut out);
        f.open(&mut ctx, Instant::ZERO, &mut tx);
        f.lowerup(&mut ctx, Instant::ZERO, &mut tx);

        let mut req = vec![
            0xc0, 0x21, 0x01, 0x01, 0x00, 0x0c, // header
            0x20, 0x04, 0xaa, 0xbb, // unknown option -> Rej
            0x01, 0x04, 0x00, 0x40, // MRU 64 -> would be Nak
        ];
        f.input(&mut ctx, Instant::ZERO, &mut req, &mut tx);
        drop(tx);

        let reply = out.last().unwrap();
        assert_eq!(reply[2], 0x04); // ConfigureRej
        assert_eq!(&reply[6..], &[0x20, 0x04, 0xaa, 0xbb]);
    }

    #[test]
    fn echo_timeout_declares_peer_dead_after_threshold() {
        let mut l = lcp();
        l.cfg.echo_interval = Duration::from_secs(30);
        l.cfg.echo_fails = 4;

        let mut out = std::vec::Vec::new();
        let mut now = Instant::ZERO;
        l.echo_start(now, 0, &mut capture(&mut out));
        assert_eq!(out.len(), 1); // first probe goes out immediately
        assert_eq!(out[0][2], 9); // EchoReq
        assert_eq!(&out[0][6..], &[0xde, 0xad, 0xbe, 0xef]);

        for _ in 0..3 {
            now += Duration::from_secs(30);
            assert!(matches!(
                l.echo_poll(now, 0, &mut capture(&mut out)),
                EchoOutcome::Ok
            ));
        }
        assert_eq!(out.len(), 4);

        now += Duration::from_secs(30);
        assert!(matches!(
            l.echo_poll(now, 0, &mut capture(&mut out)),
            EchoOutcome::PeerDead
        ));
    }

    #[test]
    fn echo_reply_resets_pending_unless_self_echo() {
        let mut l = lcp();
        l.cfg.echo_interval = Duration::from_secs(30);
        l.cfg.echo_fails = 4;
        let mut out = std::vec::Vec::new();
        l.echo_start(Instant::ZERO, 0, &mut capture(&mut out));
        assert_eq!(l.echos_pending, 1);

        // Our own magic bounced back: ignored.
        l.receive_echo_reply(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(l.echos_pending, 1);

        l.receive_echo_reply(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(l.echos_pending, 0);
    }

    #[test]
    fn echo_adaptive_suppresses_probe_when_traffic_flows() {
        let mut l = lcp();
        l.cfg.echo_interval = Duration::from_secs(10);
        l.cfg.echo_fails = 0;
        l.cfg.echo_adaptive = true;

        let mut out = std::vec::Vec::new();
        l.echo_start(Instant::ZERO, 5, &mut capture(&mut out));
        assert_eq!(out.len(), 1);

        // Packets arrived since the last tick: no probe.
        l.echo_poll(Instant::from_secs(10), 9, &mut capture(&mut out));
        assert_eq!(out.len(), 1);

        // Quiet interval: probe again.
        l.echo_poll(Instant::from_secs(20), 9, &mut capture(&mut out));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn echo_request_is_answered_with_our_magic() {
        let mut ctx = ctx();
        let mut l = lcp();
        let mut out = std::vec::Vec::new();
        let mut data = [0x11, 0x22, 0x33, 0x44, 0xaa];
        let v = l.extended_code(
            State::Opened,
            Code::EchoReq,
            7,
            &mut data,
            &mut capture(&mut out),
        );
        assert!(matches!(v, ExtVerdict::Handled));
        let reply = &out[0];
        assert_eq!(reply[2], 10); // EchoReply
        assert_eq!(reply[3], 7);
        assert_eq!(&reply[6..10], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(reply[10], 0xaa); // trailing data preserved
        let _ = ctx;
    }

    #[test]
    fn echo_request_ignored_unless_opened() {
        let mut l = lcp();
        let mut out = std::vec::Vec::new();
        let mut data = [0, 0, 0, 0];
        l.extended_code(
            State::ReqSent,
            Code::EchoReq,
            1,
            &mut data,
            &mut capture(&mut out),
        );
        assert!(out.is_empty());
    }

    #[test]
    fn protocol_reject_surfaces_rejected_protocol() {
        let mut l = lcp();
        let mut out = std::vec::Vec::new();
        let mut data = [0x80, 0x21, 0x01, 0x02];
        match l.extended_code(
            State::Opened,
            Code::ProtocolRej,
            3,
            &mut data,
            &mut capture(&mut out),
        ) {
            ExtVerdict::ProtocolRejected(p) => assert_eq!(p, 0x8021),
            _ => panic!("expected protocol reject"),
        }
        // Discarded outside Opened.
        let mut data = [0x80, 0x21];
        assert!(matches!(
            l.extended_code(
                State::ReqSent,
                Code::ProtocolRej,
                3,
                &mut data,
                &mut capture(&mut out)
            ),
            ExtVerdict::Handled
        ));
    }
}
