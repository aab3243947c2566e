//! Session configuration. Everything here may only change while the
//! session sits in the Dead phase; the [`super::Session`] setters enforce
//! that.

use crate::ppp::auth::CredentialDigests;
use crate::time::Duration;

/// Authentication-method bitmask for [`super::Session::set_auth`].
pub mod auth_type {
    pub const NONE: u8 = 0x00;
    pub const PAP: u8 = 0x01;
    pub const CHAP: u8 = 0x02;
    pub const MSCHAP: u8 = 0x04;
    pub const MSCHAP_V2: u8 = 0x08;
    pub const EAP: u8 = 0x10;
    pub const ANY: u8 = 0xff;
}

/// MPPE request flags for [`super::Session::set_mppe`].
pub mod mppe {
    pub const DISABLE: u8 = 0x00;
    pub const ENABLE: u8 = 0x01;
    pub const ALLOW_STATEFUL: u8 = 0x02;
    pub const REFUSE_40: u8 = 0x04;
    pub const REFUSE_128: u8 = 0x08;
}

#[derive(Clone)]
pub struct Settings<'a> {
    /// Peer is required to authenticate (server role).
    pub auth_required: bool,
    /// An empty username and password pair is acceptable.
    pub null_login: bool,
    pub refuse_pap: bool,
    pub refuse_chap: bool,
    pub refuse_mschap: bool,
    pub refuse_mschap_v2: bool,
    pub refuse_eap: bool,

    pub user: &'a str,
    pub passwd: &'a str,
    /// Digest provider for CHAP and EAP-MD5; with none set, negotiating
    /// those methods fails authentication.
    pub digests: Option<&'a dyn CredentialDigests>,

    pub usepeerdns: bool,
    /// Keep trying to open the connection after it terminates.
    pub persist: bool,
    pub noremoteip: bool,
    /// Accept all control characters on receive.
    pub lax_recv: bool,
    /// Never send or accept an endpoint discriminator.
    pub noendpoint: bool,
    /// MPPE request flags; non-zero gates the IP protocols on the
    /// compression layer reporting ready.
    pub mppe: u8,

    /// Wait this long for peer traffic before sending the first
    /// Configure-Request; zero starts immediately.
    pub listen_time: Duration,
    /// Tear the link down after this much inactivity; zero disables.
    pub idle_time_limit: Duration,
    /// Absolute cap on a session's running time; zero disables.
    pub maxconnect: Duration,

    pub pap_timeout_time: Duration,
    pub pap_max_transmits: u8,
    pub pap_req_timeout: Duration,

    pub chap_timeout_time: Duration,
    pub chap_max_transmits: u8,
    pub chap_rechallenge_time: Duration,

    pub eap_req_time: Duration,
    pub eap_allow_req: u8,
    pub eap_timeout_time: Duration,
    pub eap_max_transmits: u8,

    pub fsm_timeout_time: Duration,
    pub fsm_max_conf_req_transmits: u8,
    pub fsm_max_term_transmits: u8,
    pub fsm_max_nak_loops: u8,

    /// Magic-number collisions tolerated before declaring loopback.
    pub lcp_loopbackfail: u8,
    pub lcp_echo_interval: Duration,
    pub lcp_echo_fails: u8,
    /// Suppress echo probes while inbound traffic flows.
    pub lcp_echo_adaptive: bool,
}

impl<'a> Default for Settings<'a> {
    fn default() -> Self {
        Self {
            auth_required: false,
            null_login: false,
            refuse_pap: false,
            refuse_chap: false,
            refuse_mschap: false,
            refuse_mschap_v2: false,
            refuse_eap: false,

            user: "",
            passwd: "",
            digests: None,

            usepeerdns: false,
            persist: false,
            noremoteip: false,
            lax_recv: false,
            noendpoint: false,
            mppe: mppe::DISABLE,

            listen_time: Duration::ZERO,
            idle_time_limit: Duration::ZERO,
            maxconnect: Duration::ZERO,

            pap_timeout_time: Duration::from_secs(6),
            pap_max_transmits: 10,
            pap_req_timeout: Duration::from_secs(30),

            chap_timeout_time: Duration::from_secs(6),
            chap_max_transmits: 10,
            chap_rechallenge_time: Duration::ZERO,

            eap_req_time: Duration::from_secs(20),
            eap_allow_req: 20,
            eap_timeout_time: Duration::from_secs(6),
            eap_max_transmits: 10,

            fsm_timeout_time: Duration::from_secs(6),
            fsm_max_conf_req_transmits: 10,
            fsm_max_term_transmits: 2,
            fsm_max_nak_loops: 5,

            lcp_loopbackfail: 10,
            lcp_echo_interval: Duration::ZERO,
            lcp_echo_fails: 3,
            lcp_echo_adaptive: false,
        }
    }
}

impl<'a> Settings<'a> {
    pub(crate) fn have_credentials(&self) -> bool {
        !self.user.is_empty() || !self.passwd.is_empty()
    }
}
