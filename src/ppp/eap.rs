//! Extensible Authentication Protocol, restricted to the Identity and
//! MD5-Challenge methods. Anything else offered by a peer is answered
//! with a legacy Nak proposing MD5-Challenge.

use heapless::Vec;

use crate::magic::ProcessContext;
use crate::ppp::auth::{AuthResult, CredentialDigests};
use crate::ppp::lcp::CHAP_MD5;
use crate::time::{Duration, Instant, Timeout};
use crate::wire::{Packet, Payload, ProtocolType};

const REQUEST: u8 = 1;
const RESPONSE: u8 = 2;
const SUCCESS: u8 = 3;
const FAILURE: u8 = 4;

const TYPE_IDENTITY: u8 = 1;
const TYPE_NAK: u8 = 3;
const TYPE_MD5_CHALLENGE: u8 = 4;

const CHALLENGE_LEN: usize = 16;
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ServerState {
    Idle,
    /// Identity request outstanding.
    Identify,
    /// MD5 challenge outstanding.
    Md5Chall,
    Open,
    BadAuth,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ClientState {
    Idle,
    /// Answering the authenticator's requests.
    Listen,
    Open,
    BadAuth,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct EapConfig {
    /// Client: patience per request round.
    pub req_time: Duration,
    /// Client: how many requests we answer before calling it an attack.
    pub allow_req: u8,
    /// Server: retransmission interval.
    pub timeout_time: Duration,
    /// Server: transmissions per request.
    pub max_transmits: u8,
}

impl Default for EapConfig {
    fn default() -> Self {
        Self {
            req_time: Duration::from_secs(20),
            allow_req: 20,
            timeout_time: Duration::from_secs(6),
            max_transmits: 10,
        }
    }
}

pub(crate) struct Eap<'a> {
    server: ServerState,
    client: ClientState,
    cfg: EapConfig,

    name: &'a [u8],
    secret: &'a [u8],

    id: u8,
    transmits: u8,
    reqs_seen: u8,
    challenge: Vec<u8, CHALLENGE_LEN>,
    last_request: Vec<u8, { 2 + CHALLENGE_LEN + MAX_NAME_LEN }>,
    timer: Timeout,
    client_timer: Timeout,
}

impl<'a> Eap<'a> {
    pub fn new() -> Self {
        Self {
            server: ServerState::Idle,
            client: ClientState::Idle,
            cfg: EapConfig::default(),
            name: &[],
            secret: &[],
            id: 0,
            transmits: 0,
            reqs_seen: 0,
            challenge: Vec::new(),
            last_request: Vec::new(),
            timer: Timeout::new(),
            client_timer: Timeout::new(),
        }
    }

    pub fn configure(&mut self, cfg: EapConfig) {
        self.cfg = cfg;
    }

    pub fn poll_at(&self) -> Option<Instant> {
        crate::time::earliest(self.timer.at(), self.client_timer.at())
    }

    pub fn lowerdown(&mut self) {
        self.timer.cancel();
        self.client_timer.cancel();
        self.server = ServerState::Idle;
        self.client = ClientState::Idle;
    }

    /// Authenticate the peer: start with an Identity round.
    pub fn auth_peer(
        &mut self,
        now: Instant,
        name: &'a [u8],
        secret: &'a [u8],
        tx: &mut dyn FnMut(Packet<'_>),
    ) {
        self.name = name;
        self.secret = secret;
        self.id = self.id.wrapping_add(1);
        self.transmits = 0;
        self.server = ServerState::Identify;
        self.send_request(now, TYPE_IDENTITY, &[], tx);
    }

    /// Answer the authenticator's requests with the given identity.
    pub fn auth_with_peer(&mut self, now: Instant, name: &'a [u8], secret: &'a [u8]) {
        self.name = name;
        self.secret = secret;
        self.reqs_seen = 0;
        self.client = ClientState::Listen;
        if self.cfg.req_time > Duration::ZERO {
            self.client_timer.schedule(now + self.cfg.req_time);
        }
    }

    pub fn protocol_rejected(&mut self) -> Option<AuthResult> {
        if self.client == ClientState::Listen {
            error!("EAP authentication of us rejected by peer");
            self.client = ClientState::BadAuth;
            self.client_timer.cancel();
            return Some(AuthResult::WithPeerFailure);
        }
        if self.server == ServerState::Identify || self.server == ServerState::Md5Chall {
            error!("EAP authentication of peer rejected by peer");
            self.server = ServerState::BadAuth;
            self.timer.cancel();
            return Some(AuthResult::PeerFailure);
        }
        None
    }

    pub fn poll(&mut self, now: Instant, tx: &mut dyn FnMut(Packet<'_>)) -> Option<AuthResult> {
        if self.timer.poll(now)
            && (self.server == ServerState::Identify || self.server == ServerState::Md5Chall)
        {
            if self.transmits >= self.cfg.max_transmits {
                warn!("peer failed to respond to EAP request");
                self.server = ServerState::BadAuth;
                return Some(AuthResult::PeerFailure);
            }
            self.resend_request(now, tx);
        }
        if self.client_timer.poll(now) && self.client == ClientState::Listen {
            warn!("no EAP requests from authenticator");
            self.client = ClientState::BadAuth;
            return Some(AuthResult::WithPeerFailure);
        }
        None
    }

    pub fn input(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        pkt: &[u8],
        digests: Option<&dyn CredentialDigests>,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if pkt.len() < 6 {
            warn!("EAP packet too short");
            return None;
        }
        let code = pkt[2];
        let id = pkt[3];
        let len = u16::from_be_bytes([pkt[4], pkt[5]]) as usize;
        if len < 4 || len + 2 > pkt.len() {
            warn!("EAP bad packet length");
            return None;
        }
        let data = &pkt[6..len + 2];

        match code {
            REQUEST => self.rrequest(now, id, data, digests, tx),
            RESPONSE => self.rresponse(ctx, now, id, data, digests, tx),
            SUCCESS => self.rsuccess(),
            FAILURE => self.rfailure(),
            _ => {
                debug!("EAP: unknown code {}", code);
                None
            }
        }
    }

    // --- client ----------------------------------------------------------

    fn rrequest(
        &mut self,
        now: Instant,
        id: u8,
        data: &[u8],
        digests: Option<&dyn CredentialDigests>,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if self.client != ClientState::Listen {
            debug!("EAP: request while not listening");
            return None;
        }
        if data.is_empty() {
            return None;
        }
        self.reqs_seen = self.reqs_seen.saturating_add(1);
        if self.reqs_seen > self.cfg.allow_req {
            warn!("too many EAP requests");
            self.client = ClientState::BadAuth;
            self.client_timer.cancel();
            return Some(AuthResult::WithPeerFailure);
        }
        if self.cfg.req_time > Duration::ZERO {
            self.client_timer.schedule(now + self.cfg.req_time);
        }

        match data[0] {
            TYPE_IDENTITY => {
                let mut payload: Vec<u8, { 1 + MAX_NAME_LEN }> = Vec::new();
                unwrap!(payload.push(TYPE_IDENTITY).ok());
                unwrap!(payload
                    .extend_from_slice(&self.name[..self.name.len().min(MAX_NAME_LEN)])
                    .ok());
                self.send_packet(RESPONSE, id, &payload, tx);
                None
            }
            TYPE_MD5_CHALLENGE => {
                if data.len() < 2 {
                    return None;
                }
                let vlen = data[1] as usize;
                if data.len() < 2 + vlen {
                    warn!("EAP: truncated MD5 challenge");
                    return None;
                }
                let value = &data[2..2 + vlen];
                let mut response = [0u8; 64];
                let n = match digests
                    .and_then(|d| d.response(CHAP_MD5, id, self.secret, value, &mut response))
                {
                    Some(n) => n,
                    None => {
                        error!("EAP: no MD5 digest provider");
                        self.client = ClientState::BadAuth;
                        self.client_timer.cancel();
                        return Some(AuthResult::WithPeerFailure);
                    }
                };
                let mut payload: Vec<u8, { 2 + 64 + MAX_NAME_LEN }> = Vec::new();
                unwrap!(payload.push(TYPE_MD5_CHALLENGE).ok());
                unwrap!(payload.push(n as u8).ok());
                unwrap!(payload.extend_from_slice(&response[..n]).ok());
                unwrap!(payload
                    .extend_from_slice(&self.name[..self.name.len().min(MAX_NAME_LEN)])
                    .ok());
                self.send_packet(RESPONSE, id, &payload, tx);
                None
            }
            other => {
                // A method we don't speak: Nak, proposing MD5-Challenge.
                debug!("EAP: nakking request type {}", other);
                self.send_packet(RESPONSE, id, &[TYPE_NAK, TYPE_MD5_CHALLENGE], tx);
                None
            }
        }
    }

    fn rsuccess(&mut self) -> Option<AuthResult> {
        if self.client == ClientState::Listen {
            self.client = ClientState::Open;
            self.client_timer.cancel();
            info!("EAP authentication succeeded");
            return Some(AuthResult::WithPeerSuccess(CHAP_MD5));
        }
        None
    }

    fn rfailure(&mut self) -> Option<AuthResult> {
        if self.client == ClientState::Listen {
            self.client = ClientState::BadAuth;
            self.client_timer.cancel();
            error!("EAP authentication failed");
            return Some(AuthResult::WithPeerFailure);
        }
        None
    }

    // --- server ----------------------------------------------------------

    fn rresponse(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        id: u8,
        data: &[u8],
        digests: Option<&dyn CredentialDigests>,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if id != self.id {
            debug!("EAP: response id mismatch");
            return None;
        }
        if data.is_empty() {
            return None;
        }

        match (self.server, data[0]) {
            (ServerState::Identify, TYPE_IDENTITY) => {
                // Identity is advisory; the secret check is what counts.
                self.timer.cancel();
                self.id = self.id.wrapping_add(1);
                self.transmits = 0;
                let mut value = [0u8; CHALLENGE_LEN];
                ctx.magic.fill_bytes(&mut value);
                self.challenge = unwrap!(Vec::from_slice(&value).ok());

                let mut payload: Vec<u8, { 2 + CHALLENGE_LEN + MAX_NAME_LEN }> = Vec::new();
                unwrap!(payload.push(TYPE_MD5_CHALLENGE).ok());
                unwrap!(payload.push(CHALLENGE_LEN as u8).ok());
                unwrap!(payload.extend_from_slice(&self.challenge).ok());
                unwrap!(payload
                    .extend_from_slice(&self.name[..self.name.len().min(MAX_NAME_LEN)])
                    .ok());
                self.server = ServerState::Md5Chall;
                self.send_request_payload(now, &payload, tx);
                None
            }
            (ServerState::Md5Chall, TYPE_MD5_CHALLENGE) => {
                if data.len() < 2 {
                    return None;
                }
                let vlen = data[1] as usize;
                if data.len() < 2 + vlen {
                    warn!("EAP: truncated MD5 response");
                    return None;
                }
                let value = &data[2..2 + vlen];
                self.timer.cancel();
                let ok = digests
                    .map(|d| d.verify(CHAP_MD5, id, self.secret, &self.challenge, value))
                    .unwrap_or(false);
                if ok {
                    self.send_packet(SUCCESS, id, &[], tx);
                    self.server = ServerState::Open;
                    info!("EAP peer authentication succeeded");
                    Some(AuthResult::PeerSuccess(CHAP_MD5))
                } else {
                    self.send_packet(FAILURE, id, &[], tx);
                    self.server = ServerState::BadAuth;
                    warn!("EAP peer authentication failed");
                    Some(AuthResult::PeerFailure)
                }
            }
            (ServerState::Md5Chall, TYPE_NAK) => {
                // We only have one method to offer; a Nak of it is final.
                warn!("EAP: peer nakked MD5-Challenge");
                self.timer.cancel();
                self.send_packet(FAILURE, id, &[], tx);
                self.server = ServerState::BadAuth;
                Some(AuthResult::PeerFailure)
            }
            _ => {
                debug!("EAP: unexpected response type {}", data[0]);
                None
            }
        }
    }

    fn send_request(
        &mut self,
        now: Instant,
        type_: u8,
        data: &[u8],
        tx: &mut dyn FnMut(Packet<'_>),
    ) {
        let mut payload: Vec<u8, { 2 + CHALLENGE_LEN + MAX_NAME_LEN }> = Vec::new();
        unwrap!(payload.push(type_).ok());
        unwrap!(payload.extend_from_slice(data).ok());
        self.send_request_payload(now, &payload, tx);
    }

    fn send_request_payload(&mut self, now: Instant, payload: &[u8], tx: &mut dyn FnMut(Packet<'_>)) {
        // Keep the payload for retransmission.
        self.last_request = unwrap!(Vec::from_slice(payload).ok());
        self.send_packet(REQUEST, self.id, payload, tx);
        self.transmits = self.transmits.saturating_add(1);
        self.timer.schedule(now + self.cfg.timeout_time);
    }

    fn resend_request(&mut self, now: Instant, tx: &mut dyn FnMut(Packet<'_>)) {
        let payload = self.last_request.clone();
        self.send_packet(REQUEST, self.id, &payload, tx);
        self.transmits = self.transmits.saturating_add(1);
        self.timer.schedule(now + self.cfg.timeout_time);
    }

    fn send_packet(&mut self, code: u8, id: u8, payload: &[u8], tx: &mut dyn FnMut(Packet<'_>)) {
        let mut buf: Vec<u8, { 4 + 2 + CHALLENGE_LEN + 64 + MAX_NAME_LEN }> = Vec::new();
        unwrap!(buf.push(code).ok());
        unwrap!(buf.push(id).ok());
        unwrap!(buf.extend_from_slice(&((4 + payload.len()) as u16).to_be_bytes()).ok());
        unwrap!(buf.extend_from_slice(payload).ok());
        tx(Packet {
            proto: ProtocolType::EAP,
            payload: Payload::Raw(&mut buf),
        });
    }
}
