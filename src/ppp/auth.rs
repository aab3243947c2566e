//! Authentication coordinator: which methods run in which direction, and
//! when the authenticate phase is over.
//!
//! The actual challenge/response arithmetic lives behind
//! [`CredentialDigests`]; this module only sequences the protocols and
//! keeps the two completion bitmasks.

use super::lcp::{LcpOptions, CHAP_MD5, CHAP_MICROSOFT, CHAP_MICROSOFT_V2};

/// Pending/done bits, one per method and direction. `PEER` bits mean "the
/// peer authenticates itself to us", `WITHPEER` bits mean "we authenticate
/// ourselves to the peer". CHAP carries flavor bits on top.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct AuthBits(pub u16);

impl AuthBits {
    pub const PAP_WITHPEER: u16 = 0x001;
    pub const PAP_PEER: u16 = 0x002;
    pub const CHAP_WITHPEER: u16 = 0x004;
    pub const CHAP_PEER: u16 = 0x008;
    pub const EAP_WITHPEER: u16 = 0x010;
    pub const EAP_PEER: u16 = 0x020;
    pub const CHAP_MD5_WITHPEER: u16 = 0x040;
    pub const CHAP_MD5_PEER: u16 = 0x080;
    pub const CHAP_MS_WITHPEER: u16 = 0x100;
    pub const CHAP_MS_PEER: u16 = 0x200;
    pub const CHAP_MS2_WITHPEER: u16 = 0x400;
    pub const CHAP_MS2_PEER: u16 = 0x800;

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn set(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn clear(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    /// The completion bits for a CHAP result of the given flavor.
    pub fn chap_bits(digest: u8, withpeer: bool) -> u16 {
        let base = if withpeer {
            Self::CHAP_WITHPEER
        } else {
            Self::CHAP_PEER
        };
        let flavor = match (digest, withpeer) {
            (CHAP_MD5, true) => Self::CHAP_MD5_WITHPEER,
            (CHAP_MD5, false) => Self::CHAP_MD5_PEER,
            (CHAP_MICROSOFT, true) => Self::CHAP_MS_WITHPEER,
            (CHAP_MICROSOFT, false) => Self::CHAP_MS_PEER,
            (CHAP_MICROSOFT_V2, true) => Self::CHAP_MS2_WITHPEER,
            (CHAP_MICROSOFT_V2, false) => Self::CHAP_MS2_PEER,
            _ => 0,
        };
        base | flavor
    }
}

/// What an authentication protocol reports back to the session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum AuthResult {
    /// The peer proved itself to us. Carries the CHAP/EAP digest flavor
    /// (0 for PAP).
    PeerSuccess(u8),
    PeerFailure,
    /// We proved ourselves to the peer.
    WithPeerSuccess(u8),
    WithPeerFailure,
}

/// Contract with the external digest crypto used by CHAP and EAP-MD5.
/// Implementations compute `hash(id | secret | challenge)` for the digest
/// algorithms they support and say no to the rest.
pub trait CredentialDigests {
    /// Compute the response value for `digest`, writing into `out`.
    /// Returns the response length, or `None` if the digest is not
    /// supported.
    fn response(
        &self,
        digest: u8,
        id: u8,
        secret: &[u8],
        challenge: &[u8],
        out: &mut [u8],
    ) -> Option<usize>;

    /// Check a peer's response against the expected secret.
    fn verify(&self, digest: u8, id: u8, secret: &[u8], challenge: &[u8], response: &[u8]) -> bool {
        let mut buf = [0u8; 64];
        match self.response(digest, id, secret, challenge, &mut buf) {
            Some(n) => buf[..n] == *response,
            None => false,
        }
    }
}

/// Which method we launch to authenticate the peer, given what the peer
/// acked of our demands. Preference is EAP, then CHAP, then PAP.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Method {
    Eap,
    Chap(u8),
    Pap,
}

pub(crate) fn select_method(opts: &LcpOptions) -> Option<Method> {
    if opts.neg_eap {
        Some(Method::Eap)
    } else if opts.neg_chap {
        opts.chap_mdtype.digest().map(Method::Chap)
    } else if opts.neg_upap {
        Some(Method::Pap)
    } else {
        None
    }
}
