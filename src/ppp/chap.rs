//! Challenge Handshake Authentication Protocol.
//!
//! The server issues challenges and verifies responses; the client answers
//! whatever challenges arrive. Digest arithmetic is delegated to the
//! session's [`CredentialDigests`] provider, keyed by the digest code
//! negotiated in LCP.

use heapless::Vec;

use crate::magic::ProcessContext;
use crate::ppp::auth::{AuthResult, CredentialDigests};
use crate::time::{Duration, Instant, Timeout};
use crate::wire::{Packet, Payload, ProtocolType};

const CHALLENGE: u8 = 1;
const RESPONSE: u8 = 2;
const SUCCESS: u8 = 3;
const FAILURE: u8 = 4;

const CHALLENGE_LEN: usize = 16;
const MAX_RESPONSE_LEN: usize = 64;
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ServerState {
    Idle,
    /// Challenge sent, awaiting the response.
    ChallengeSent,
    Open,
    BadAuth,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ClientState {
    Idle,
    /// Waiting for (more) challenges.
    Listen,
    Open,
    BadAuth,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct ChapConfig {
    pub timeout_time: Duration,
    pub max_transmits: u8,
    /// Re-challenge an authenticated peer this often; zero disables.
    pub rechallenge_time: Duration,
}

impl Default for ChapConfig {
    fn default() -> Self {
        Self {
            timeout_time: Duration::from_secs(6),
            max_transmits: 10,
            rechallenge_time: Duration::ZERO,
        }
    }
}

pub(crate) struct Chap<'a> {
    server: ServerState,
    client: ClientState,
    cfg: ChapConfig,
    lower_up: bool,

    digest: u8,
    name: &'a [u8],
    secret: &'a [u8],

    id: u8,
    transmits: u8,
    challenge: Vec<u8, CHALLENGE_LEN>,
    timer: Timeout,
    rechallenge: Timeout,
}

impl<'a> Chap<'a> {
    pub fn new() -> Self {
        Self {
            server: ServerState::Idle,
            client: ClientState::Idle,
            cfg: ChapConfig::default(),
            lower_up: false,
            digest: 0,
            name: &[],
            secret: &[],
            id: 0,
            transmits: 0,
            challenge: Vec::new(),
            timer: Timeout::new(),
            rechallenge: Timeout::new(),
        }
    }

    pub fn configure(&mut self, cfg: ChapConfig) {
        self.cfg = cfg;
    }

    pub fn poll_at(&self) -> Option<Instant> {
        crate::time::earliest(self.timer.at(), self.rechallenge.at())
    }

    pub fn lowerup(&mut self) {
        self.lower_up = true;
    }

    pub fn lowerdown(&mut self) {
        self.lower_up = false;
        self.timer.cancel();
        self.rechallenge.cancel();
        self.server = ServerState::Idle;
        self.client = ClientState::Idle;
    }

    /// Authenticate the peer: issue a challenge under our name.
    pub fn auth_peer(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        name: &'a [u8],
        secret: &'a [u8],
        digest: u8,
        tx: &mut dyn FnMut(Packet<'_>),
    ) {
        self.name = name;
        self.secret = secret;
        self.digest = digest;
        self.transmits = 0;
        self.new_challenge(ctx);
        self.send_challenge(now, tx);
        self.server = ServerState::ChallengeSent;
    }

    /// Be ready to answer challenges with the given identity.
    pub fn auth_with_peer(&mut self, name: &'a [u8], secret: &'a [u8], digest: u8) {
        self.name = name;
        self.secret = secret;
        self.digest = digest;
        self.client = ClientState::Listen;
    }

    pub fn protocol_rejected(&mut self) -> Option<AuthResult> {
        if self.client == ClientState::Listen {
            error!("CHAP authentication of us rejected by peer");
            self.client = ClientState::BadAuth;
            return Some(AuthResult::WithPeerFailure);
        }
        if self.server == ServerState::ChallengeSent {
            error!("CHAP authentication of peer rejected by peer");
            self.server = ServerState::BadAuth;
            self.timer.cancel();
            return Some(AuthResult::PeerFailure);
        }
        None
    }

    pub fn poll(
        &mut self,
        ctx: &mut ProcessContext,
        now: Instant,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if self.timer.poll(now) && self.server == ServerState::ChallengeSent {
            if self.transmits >= self.cfg.max_transmits {
                warn!("peer failed to respond to CHAP challenge");
                self.server = ServerState::BadAuth;
                return Some(AuthResult::PeerFailure);
            }
            self.send_challenge(now, tx);
        }
        if self.rechallenge.poll(now) && self.server == ServerState::Open {
            // Periodic proof that the peer is still who it was.
            self.new_challenge(ctx);
            self.transmits = 0;
            self.send_challenge(now, tx);
            self.server = ServerState::ChallengeSent;
        }
        None
    }

    pub fn input(
        &mut self,
        now: Instant,
        pkt: &[u8],
        digests: Option<&dyn CredentialDigests>,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if pkt.len() < 6 {
            warn!("CHAP packet too short");
            return None;
        }
        let code = pkt[2];
        let id = pkt[3];
        let len = u16::from_be_bytes([pkt[4], pkt[5]]) as usize;
        if len < 4 || len + 2 > pkt.len() {
            warn!("CHAP bad packet length");
            return None;
        }
        let data = &pkt[6..len + 2];

        match code {
            CHALLENGE => self.rchallenge(now, id, data, digests, tx),
            RESPONSE => self.rresponse(now, id, data, digests, tx),
            SUCCESS => self.rsuccess(id),
            FAILURE => self.rfailure(id),
            _ => {
                debug!("CHAP: unknown code {}", code);
                None
            }
        }
    }

    fn rchallenge(
        &mut self,
        now: Instant,
        id: u8,
        data: &[u8],
        digests: Option<&dyn CredentialDigests>,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if self.client != ClientState::Listen && self.client != ClientState::Open {
            debug!("CHAP: challenge while not listening");
            return None;
        }
        if data.is_empty() {
            return None;
        }
        let vlen = data[0] as usize;
        if data.len() < 1 + vlen {
            warn!("CHAP: truncated challenge");
            return None;
        }
        let value = &data[1..1 + vlen];

        let mut response = [0u8; MAX_RESPONSE_LEN];
        let n = match digests
            .and_then(|d| d.response(self.digest, id, self.secret, value, &mut response))
        {
            Some(n) => n,
            None => {
                error!("CHAP: no digest provider for algorithm {}", self.digest);
                self.client = ClientState::BadAuth;
                return Some(AuthResult::WithPeerFailure);
            }
        };

        let mut buf: Vec<u8, { 4 + 1 + MAX_RESPONSE_LEN + MAX_NAME_LEN }> = Vec::new();
        unwrap!(buf.push(RESPONSE).ok());
        unwrap!(buf.push(id).ok());
        let total = 4 + 1 + n + self.name.len().min(MAX_NAME_LEN);
        unwrap!(buf.extend_from_slice(&(total as u16).to_be_bytes()).ok());
        unwrap!(buf.push(n as u8).ok());
        unwrap!(buf.extend_from_slice(&response[..n]).ok());
        unwrap!(buf
            .extend_from_slice(&self.name[..self.name.len().min(MAX_NAME_LEN)])
            .ok());
        tx(Packet {
            proto: ProtocolType::CHAP,
            payload: Payload::Raw(&mut buf),
        });
        let _ = now;
        None
    }

    fn rresponse(
        &mut self,
        now: Instant,
        id: u8,
        data: &[u8],
        digests: Option<&dyn CredentialDigests>,
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if self.server != ServerState::ChallengeSent {
            debug!("CHAP: unexpected response");
            return None;
        }
        if id != self.id {
            debug!("CHAP: response id mismatch");
            return None;
        }
        if data.is_empty() {
            return None;
        }
        let vlen = data[0] as usize;
        if data.len() < 1 + vlen {
            warn!("CHAP: truncated response");
            return None;
        }
        let value = &data[1..1 + vlen];

        self.timer.cancel();
        let ok = digests
            .map(|d| d.verify(self.digest, id, self.secret, &self.challenge, value))
            .unwrap_or(false);

        if ok {
            self.send_result(SUCCESS, id, b"Welcome", tx);
            self.server = ServerState::Open;
            if self.cfg.rechallenge_time > Duration::ZERO {
                self.rechallenge.schedule(now + self.cfg.rechallenge_time);
            }
            info!("CHAP peer authentication succeeded");
            Some(AuthResult::PeerSuccess(self.digest))
        } else {
            self.send_result(FAILURE, id, b"Access denied", tx);
            self.server = ServerState::BadAuth;
            warn!("CHAP peer authentication failed");
            Some(AuthResult::PeerFailure)
        }
    }

    fn rsuccess(&mut self, _id: u8) -> Option<AuthResult> {
        match self.client {
            ClientState::Listen => {
                self.client = ClientState::Open;
                info!("CHAP authentication succeeded");
                Some(AuthResult::WithPeerSuccess(self.digest))
            }
            // Success for a rechallenge round: already reported.
            ClientState::Open => None,
            _ => None,
        }
    }

    fn rfailure(&mut self, _id: u8) -> Option<AuthResult> {
        if self.client == ClientState::Listen || self.client == ClientState::Open {
            self.client = ClientState::BadAuth;
            error!("CHAP authentication failed");
            return Some(AuthResult::WithPeerFailure);
        }
        None
    }

    fn new_challenge(&mut self, ctx: &mut ProcessContext) {
        self.id = self.id.wrapping_add(1);
        let mut value = [0u8; CHALLENGE_LEN];
        ctx.magic.fill_bytes(&mut value);
        self.challenge = unwrap!(Vec::from_slice(&value).ok());
    }

    fn send_challenge(&mut self, now: Instant, tx: &mut dyn FnMut(Packet<'_>)) {
        let mut buf: Vec<u8, { 4 + 1 + CHALLENGE_LEN + MAX_NAME_LEN }> = Vec::new();
        unwrap!(buf.push(CHALLENGE).ok());
        unwrap!(buf.push(self.id).ok());
        let total = 4 + 1 + self.challenge.len() + self.name.len().min(MAX_NAME_LEN);
        unwrap!(buf.extend_from_slice(&(total as u16).to_be_bytes()).ok());
        unwrap!(buf.push(self.challenge.len() as u8).ok());
        unwrap!(buf.extend_from_slice(&self.challenge).ok());
        unwrap!(buf
            .extend_from_slice(&self.name[..self.name.len().min(MAX_NAME_LEN)])
            .ok());
        tx(Packet {
            proto: ProtocolType::CHAP,
            payload: Payload::Raw(&mut buf),
        });
        self.transmits = self.transmits.saturating_add(1);
        self.timer.schedule(now + self.cfg.timeout_time);
    }

    fn send_result(&mut self, code: u8, id: u8, msg: &[u8], tx: &mut dyn FnMut(Packet<'_>)) {
        let mut buf: Vec<u8, 64> = Vec::new();
        unwrap!(buf.push(code).ok());
        unwrap!(buf.push(id).ok());
        unwrap!(buf.extend_from_slice(&((4 + msg.len()) as u16).to_be_bytes()).ok());
        unwrap!(buf.extend_from_slice(msg).ok());
        tx(Packet {
            proto: ProtocolType::CHAP,
            payload: Payload::Raw(&mut buf),
        });
    }
}
