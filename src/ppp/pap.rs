//! Password Authentication Protocol, client and server sides.
//!
//! The client fires Authenticate-Requests with bounded retransmission;
//! the server listens with a patience timer and answers with
//! Authenticate-Ack/Nak.

use crate::ppp::auth::AuthResult;
use crate::time::{Duration, Instant, Timeout};
use crate::wire::{Code, PPPPayload, Packet, Payload, ProtocolType};

const AUTH_REQ: u8 = 1;
const AUTH_ACK: u8 = 2;
const AUTH_NAK: u8 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ClientState {
    /// Lower layer down.
    Initial,
    /// Lower layer up, nothing requested.
    Closed,
    /// Authentication wanted before the lower layer came up.
    Pending,
    /// Authenticate-Request sent.
    AuthReq,
    /// Ack received.
    Open,
    /// Nak received.
    BadAuth,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ServerState {
    Initial,
    Closed,
    Pending,
    /// Waiting for the peer's Authenticate-Request.
    Listen,
    /// Ack sent.
    Open,
    /// Nak sent.
    BadAuth,
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct PapConfig {
    pub timeout_time: Duration,
    pub max_transmits: u8,
    pub req_timeout: Duration,
}

impl Default for PapConfig {
    fn default() -> Self {
        Self {
            timeout_time: Duration::from_secs(6),
            max_transmits: 10,
            req_timeout: Duration::from_secs(30),
        }
    }
}

pub(crate) struct Pap<'a> {
    client: ClientState,
    server: ServerState,
    cfg: PapConfig,

    user: &'a [u8],
    passwd: &'a [u8],
    server_user: &'a [u8],
    server_passwd: &'a [u8],
    null_login: bool,

    id: u8,
    transmits: u8,
    timer: Timeout,
    req_timer: Timeout,
}

impl<'a> Pap<'a> {
    pub fn new() -> Self {
        Self {
            client: ClientState::Initial,
            server: ServerState::Initial,
            cfg: PapConfig::default(),
            user: &[],
            passwd: &[],
            server_user: &[],
            server_passwd: &[],
            null_login: false,
            id: 0,
            transmits: 0,
            timer: Timeout::new(),
            req_timer: Timeout::new(),
        }
    }

    pub fn configure(&mut self, cfg: PapConfig) {
        self.cfg = cfg;
    }

    pub fn client_state(&self) -> ClientState {
        self.client
    }

    pub fn server_state(&self) -> ServerState {
        self.server
    }

    pub fn poll_at(&self) -> Option<Instant> {
        crate::time::earliest(self.timer.at(), self.req_timer.at())
    }

    pub fn lowerup(&mut self, now: Instant, tx: &mut dyn FnMut(Packet<'_>)) {
        match self.client {
            ClientState::Initial => self.client = ClientState::Closed,
            ClientState::Pending => {
                self.client = ClientState::AuthReq;
                self.transmits = 0;
                self.send_auth_request(now, tx);
            }
            _ => {}
        }
        match self.server {
            ServerState::Initial => self.server = ServerState::Closed,
            ServerState::Pending => {
                self.server = ServerState::Listen;
                if self.cfg.req_timeout > Duration::ZERO {
                    self.req_timer.schedule(now + self.cfg.req_timeout);
                }
            }
            _ => {}
        }
    }

    pub fn lowerdown(&mut self) {
        self.timer.cancel();
        self.req_timer.cancel();
        self.client = ClientState::Initial;
        self.server = ServerState::Initial;
    }

    /// Start authenticating ourselves to the peer.
    pub fn auth_with_peer(
        &mut self,
        now: Instant,
        user: &'a [u8],
        passwd: &'a [u8],
        tx: &mut dyn FnMut(Packet<'_>),
    ) {
        self.user = user;
        self.passwd = passwd;
        if self.client == ClientState::Initial || self.client == ClientState::Pending {
            self.client = ClientState::Pending;
            return;
        }
        self.client = ClientState::AuthReq;
        self.transmits = 0;
        self.send_auth_request(now, tx);
    }

    /// Start authenticating the peer against the given credentials.
    pub fn auth_peer(
        &mut self,
        now: Instant,
        user: &'a [u8],
        passwd: &'a [u8],
        null_login: bool,
    ) {
        self.server_user = user;
        self.server_passwd = passwd;
        self.null_login = null_login;
        if self.server == ServerState::Initial || self.server == ServerState::Pending {
            self.server = ServerState::Pending;
            return;
        }
        self.server = ServerState::Listen;
        if self.cfg.req_timeout > Duration::ZERO {
            self.req_timer.schedule(now + self.cfg.req_timeout);
        }
    }

    /// The peer rejected PAP outright.
    pub fn protocol_rejected(&mut self) -> Option<AuthResult> {
        if self.client == ClientState::AuthReq || self.client == ClientState::Pending {
            warn!("PAP authentication of us rejected by peer");
            self.client = ClientState::BadAuth;
            return Some(AuthResult::WithPeerFailure);
        }
        if self.server == ServerState::Listen || self.server == ServerState::Pending {
            warn!("PAP authentication of peer rejected by peer");
            self.server = ServerState::BadAuth;
            return Some(AuthResult::PeerFailure);
        }
        None
    }

    pub fn poll(&mut self, now: Instant, tx: &mut dyn FnMut(Packet<'_>)) -> Option<AuthResult> {
        if self.timer.poll(now) && self.client == ClientState::AuthReq {
            if self.transmits >= self.cfg.max_transmits {
                warn!("no response to PAP authenticate-requests");
                self.client = ClientState::BadAuth;
                return Some(AuthResult::WithPeerFailure);
            }
            self.send_auth_request(now, tx);
        }
        if self.req_timer.poll(now) && self.server == ServerState::Listen {
            warn!("no PAP authenticate-request from peer");
            return Some(AuthResult::PeerFailure);
        }
        None
    }

    pub fn input(
        &mut self,
        now: Instant,
        pkt: &[u8],
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        if pkt.len() < 6 {
            warn!("PAP packet too short");
            return None;
        }
        let code = pkt[2];
        let id = pkt[3];
        let len = u16::from_be_bytes([pkt[4], pkt[5]]) as usize;
        if len < 4 || len + 2 > pkt.len() {
            warn!("PAP bad packet length");
            return None;
        }
        let data = &pkt[6..len + 2];

        match code {
            AUTH_REQ => self.rauth_req(now, id, data, tx),
            AUTH_ACK => self.rauth_ack(id, data),
            AUTH_NAK => self.rauth_nak(id, data),
            _ => {
                debug!("PAP: unknown code {}", code);
                None
            }
        }
    }

    fn rauth_req(
        &mut self,
        now: Instant,
        id: u8,
        data: &[u8],
        tx: &mut dyn FnMut(Packet<'_>),
    ) -> Option<AuthResult> {
        match self.server {
            ServerState::Open => {
                // Duplicate request: remind the peer it already passed.
                self.send_response(AUTH_ACK, id, b"Login ok", tx);
                return None;
            }
            ServerState::BadAuth => {
                self.send_response(AUTH_NAK, id, b"Login incorrect", tx);
                return None;
            }
            ServerState::Listen => {}
            _ => return None,
        }

        // [userlen, user..., passwdlen, passwd...]
        if data.is_empty() {
            return None;
        }
        let ulen = data[0] as usize;
        if data.len() < 1 + ulen + 1 {
            warn!("PAP: truncated authenticate-request");
            return None;
        }
        let user = &data[1..1 + ulen];
        let plen = data[1 + ulen] as usize;
        if data.len() < 1 + ulen + 1 + plen {
            warn!("PAP: truncated authenticate-request");
            return None;
        }
        let passwd = &data[1 + ulen + 1..1 + ulen + 1 + plen];

        let ok = (self.null_login && user.is_empty() && passwd.is_empty())
            || (!self.server_user.is_empty()
                && user == self.server_user
                && passwd == self.server_passwd);

        self.req_timer.cancel();
        let _ = now;
        if ok {
            self.send_response(AUTH_ACK, id, b"Login ok", tx);
            self.server = ServerState::Open;
            info!("PAP peer authentication succeeded");
            Some(AuthResult::PeerSuccess(0))
        } else {
            self.send_response(AUTH_NAK, id, b"Login incorrect", tx);
            self.server = ServerState::BadAuth;
            warn!("PAP peer authentication failed");
            Some(AuthResult::PeerFailure)
        }
    }

    fn rauth_ack(&mut self, id: u8, _data: &[u8]) -> Option<AuthResult> {
        if self.client != ClientState::AuthReq || id != self.id {
            return None;
        }
        self.timer.cancel();
        self.client = ClientState::Open;
        info!("PAP authentication succeeded");
        Some(AuthResult::WithPeerSuccess(0))
    }

    fn rauth_nak(&mut self, id: u8, _data: &[u8]) -> Option<AuthResult> {
        if self.client != ClientState::AuthReq || id != self.id {
            return None;
        }
        self.timer.cancel();
        self.client = ClientState::BadAuth;
        error!("PAP authentication failed");
        Some(AuthResult::WithPeerFailure)
    }

    fn send_auth_request(&mut self, now: Instant, tx: &mut dyn FnMut(Packet<'_>)) {
        self.id = self.id.wrapping_add(1);
        tx(Packet {
            proto: ProtocolType::PAP,
            payload: Payload::PPP(
                Code::from(AUTH_REQ),
                self.id,
                PPPPayload::PAP(self.user, self.passwd),
            ),
        });
        self.transmits = self.transmits.saturating_add(1);
        self.timer.schedule(now + self.cfg.timeout_time);
    }

    fn send_response(&mut self, code: u8, id: u8, msg: &[u8], tx: &mut dyn FnMut(Packet<'_>)) {
        let mut buf: heapless::Vec<u8, 64> = heapless::Vec::new();
        unwrap!(buf.push(msg.len() as u8).ok());
        unwrap!(buf.extend_from_slice(msg).ok());
        tx(Packet {
            proto: ProtocolType::PAP,
            payload: Payload::PPP(Code::from(code), id, PPPPayload::Raw(&mut buf)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(out: &mut std::vec::Vec<std::vec::Vec<u8>>) -> impl FnMut(Packet<'_>) + '_ {
        |pkt| {
            let mut buf = vec![0; pkt.buffer_len()];
            pkt.emit(&mut buf);
            out.push(buf);
        }
    }

    fn request(id: u8, user: &[u8], pass: &[u8]) -> std::vec::Vec<u8> {
        let mut p = vec![0xc0, 0x23, AUTH_REQ, id];
        let len = 4 + 1 + user.len() + 1 + pass.len();
        p.extend_from_slice(&(len as u16).to_be_bytes());
        p.push(user.len() as u8);
        p.extend_from_slice(user);
        p.push(pass.len() as u8);
        p.extend_from_slice(pass);
        p
    }

    #[test]
    fn client_sends_credentials_and_opens_on_ack() {
        let mut pap = Pap::new();
        let mut out = std::vec::Vec::new();
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));
        pap.auth_with_peer(Instant::ZERO, b"user", b"pw", &mut capture(&mut out));
        assert_eq!(pap.client_state(), ClientState::AuthReq);
        assert_eq!(
            &out[0][..],
            &[0xc0, 0x23, 1, 1, 0, 12, 4, b'u', b's', b'e', b'r', 2, b'p', b'w']
        );

        let ack = vec![0xc0, 0x23, AUTH_ACK, 1, 0, 4];
        let r = pap.input(Instant::ZERO, &ack, &mut capture(&mut out));
        assert_eq!(r, Some(AuthResult::WithPeerSuccess(0)));
        assert_eq!(pap.client_state(), ClientState::Open);
    }

    #[test]
    fn client_retransmits_then_fails() {
        let mut pap = Pap::new();
        pap.configure(PapConfig {
            timeout_time: Duration::from_secs(3),
            max_transmits: 2,
            req_timeout: Duration::from_secs(30),
        });
        let mut out = std::vec::Vec::new();
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));
        pap.auth_with_peer(Instant::ZERO, b"u", b"p", &mut capture(&mut out));

        assert!(pap.poll(Instant::from_secs(3), &mut capture(&mut out)).is_none());
        assert_eq!(out.len(), 2);
        // Retransmission uses a fresh id.
        assert_eq!(out[1][3], 2);

        let r = pap.poll(Instant::from_secs(6), &mut capture(&mut out));
        assert_eq!(r, Some(AuthResult::WithPeerFailure));
        assert_eq!(pap.client_state(), ClientState::BadAuth);
    }

    #[test]
    fn client_nak_fails_authentication() {
        let mut pap = Pap::new();
        let mut out = std::vec::Vec::new();
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));
        pap.auth_with_peer(Instant::ZERO, b"u", b"p", &mut capture(&mut out));

        let nak = vec![0xc0, 0x23, AUTH_NAK, 1, 0, 4];
        let r = pap.input(Instant::ZERO, &nak, &mut capture(&mut out));
        assert_eq!(r, Some(AuthResult::WithPeerFailure));
    }

    #[test]
    fn server_acks_good_credentials() {
        let mut pap = Pap::new();
        let mut out = std::vec::Vec::new();
        pap.auth_peer(Instant::ZERO, b"user", b"secret", false);
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));
        assert_eq!(pap.server_state(), ServerState::Listen);

        let req = request(9, b"user", b"secret");
        let r = pap.input(Instant::ZERO, &req, &mut capture(&mut out));
        assert_eq!(r, Some(AuthResult::PeerSuccess(0)));
        assert_eq!(pap.server_state(), ServerState::Open);
        // Ack with "Login ok", echoing the request id.
        assert_eq!(out[0][2], AUTH_ACK);
        assert_eq!(out[0][3], 9);
        assert_eq!(&out[0][7..], b"Login ok");
    }

    #[test]
    fn server_naks_bad_credentials() {
        let mut pap = Pap::new();
        let mut out = std::vec::Vec::new();
        pap.auth_peer(Instant::ZERO, b"user", b"secret", false);
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));

        let req = request(3, b"user", b"wrong");
        let r = pap.input(Instant::ZERO, &req, &mut capture(&mut out));
        assert_eq!(r, Some(AuthResult::PeerFailure));
        assert_eq!(out[0][2], AUTH_NAK);
        assert_eq!(&out[0][7..], b"Login incorrect");
    }

    #[test]
    fn server_accepts_empty_login_when_allowed() {
        let mut pap = Pap::new();
        let mut out = std::vec::Vec::new();
        pap.auth_peer(Instant::ZERO, b"", b"", true);
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));

        let req = request(1, b"", b"");
        let r = pap.input(Instant::ZERO, &req, &mut capture(&mut out));
        assert_eq!(r, Some(AuthResult::PeerSuccess(0)));
    }

    #[test]
    fn server_listen_timeout_fails_peer() {
        let mut pap = Pap::new();
        pap.configure(PapConfig {
            req_timeout: Duration::from_secs(30),
            ..PapConfig::default()
        });
        let mut out = std::vec::Vec::new();
        pap.auth_peer(Instant::ZERO, b"u", b"p", false);
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));

        let r = pap.poll(Instant::from_secs(30), &mut capture(&mut out));
        assert_eq!(r, Some(AuthResult::PeerFailure));
    }

    #[test]
    fn duplicate_request_after_open_is_reacked() {
        let mut pap = Pap::new();
        let mut out = std::vec::Vec::new();
        pap.auth_peer(Instant::ZERO, b"u", b"p", false);
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));
        let req = request(1, b"u", b"p");
        pap.input(Instant::ZERO, &req, &mut capture(&mut out));

        let req2 = request(2, b"u", b"p");
        let r = pap.input(Instant::ZERO, &req2, &mut capture(&mut out));
        assert!(r.is_none());
        assert_eq!(out.last().unwrap()[2], AUTH_ACK);
    }

    #[test]
    fn truncated_request_is_dropped() {
        let mut pap = Pap::new();
        let mut out = std::vec::Vec::new();
        pap.auth_peer(Instant::ZERO, b"u", b"p", false);
        pap.lowerup(Instant::ZERO, &mut capture(&mut out));

        // Claims a 10-byte username but carries 2 bytes.
        let req = vec![0xc0, 0x23, AUTH_REQ, 1, 0, 7, 10, b'a', b'b'];
        let r = pap.input(Instant::ZERO, &req, &mut capture(&mut out));
        assert!(r.is_none());
        assert!(out.is_empty());
    }
}
