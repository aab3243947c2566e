//! Two sessions wired back to back: the whole life cycle from connect to
//! teardown, including authentication, keepalive failure and the wall
//! clock limits.

use core::net::Ipv4Addr;

use ppplink::time::{Duration, Instant};
use ppplink::wire::Packet;
use ppplink::{
    auth_type, mppe, CredentialDigests, ErrorCode, LinkDriver, Phase, ProcessContext, Received,
    Session, Settings,
};

#[derive(Default)]
struct TestDriver {
    out: Vec<Vec<u8>>,
    phases: Vec<Phase>,
    statuses: Vec<ErrorCode>,
    ipv4: Option<ppplink::Ipv4Status>,
}

impl LinkDriver for TestDriver {
    fn transmit(&mut self, pkt: Packet<'_>) {
        let mut buf = vec![0; pkt.buffer_len()];
        pkt.emit(&mut buf);
        self.out.push(buf);
    }

    fn phase_changed(&mut self, phase: Phase) {
        self.phases.push(phase);
    }

    fn link_status(&mut self, err: ErrorCode) {
        self.statuses.push(err);
    }

    fn ipv4_up(&mut self, status: ppplink::Ipv4Status) {
        self.ipv4 = Some(status);
    }

    fn ipv4_down(&mut self) {
        self.ipv4 = None;
    }
}

/// Deterministic stand-in for the MD5 digest arithmetic.
struct XorDigests;

impl CredentialDigests for XorDigests {
    fn response(
        &self,
        digest: u8,
        id: u8,
        secret: &[u8],
        challenge: &[u8],
        out: &mut [u8],
    ) -> Option<usize> {
        if digest != 5 {
            return None;
        }
        let mut acc = id;
        for &b in secret.iter().chain(challenge.iter()) {
            acc ^= b;
        }
        for (i, o) in out[..16].iter_mut().enumerate() {
            *o = acc ^ i as u8;
        }
        Some(16)
    }
}

/// Shuttle queued packets between the two sessions until the wire goes
/// quiet.
fn pump(
    ctx: &mut ProcessContext,
    now: Instant,
    a: &mut Session<'_>,
    da: &mut TestDriver,
    b: &mut Session<'_>,
    db: &mut TestDriver,
) {
    for _ in 0..100 {
        let from_a: Vec<_> = da.out.drain(..).collect();
        let from_b: Vec<_> = db.out.drain(..).collect();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for mut pkt in from_a {
            b.input(ctx, now, &mut pkt, db);
        }
        for mut pkt in from_b {
            a.input(ctx, now, &mut pkt, da);
        }
    }
    panic!("negotiation did not converge");
}

fn ctx() -> ProcessContext {
    ProcessContext::new(0xfeed)
}

fn connect_pair<'s>(
    ctx: &mut ProcessContext,
    a: &mut Session<'s>,
    da: &mut TestDriver,
    b: &mut Session<'s>,
    db: &mut TestDriver,
) {
    let now = Instant::ZERO;
    a.connect(ctx, now, Duration::ZERO, da).unwrap();
    b.listen(ctx, now, db).unwrap();
    pump(ctx, now, a, da, b, db);
}

#[test]
fn negotiates_to_running_without_auth() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    a.set_ipcp_ouraddr(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
    b.set_ipcp_ouraddr(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();

    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    assert_eq!(a.phase(), Phase::Running);
    assert_eq!(b.phase(), Phase::Running);
    assert_eq!(
        da.phases,
        vec![
            Phase::Initialize,
            Phase::Establish,
            Phase::Authenticate,
            Phase::Network,
            Phase::Running
        ]
    );

    let st = da.ipv4.as_ref().expect("ipv4 up");
    assert_eq!(st.address, Some(Ipv4Addr::new(10, 0, 0, 1)));
    assert_eq!(st.peer_address, Some(Ipv4Addr::new(10, 0, 0, 2)));
    assert!(a.status().ipv6.is_some());
    assert_eq!(a.error_code(), ErrorCode::None);
}

#[test]
fn pap_authentication_reaches_running() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    a.set_auth(auth_type::PAP, "user", "pw").unwrap();
    b.set_auth(auth_type::PAP, "user", "pw").unwrap();
    b.set_auth_required(true).unwrap();
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();

    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    assert_eq!(a.phase(), Phase::Running);
    assert_eq!(b.phase(), Phase::Running);
    // Both walked through the authenticate phase.
    assert!(da.phases.contains(&Phase::Authenticate));
    assert!(db.phases.contains(&Phase::Authenticate));
}

#[test]
fn pap_wrong_password_fails_link() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    a.set_auth(auth_type::PAP, "user", "wrong").unwrap();
    b.set_auth(auth_type::PAP, "user", "pw").unwrap();
    b.set_auth_required(true).unwrap();
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();

    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    assert_eq!(a.phase(), Phase::Dead);
    assert_eq!(b.phase(), Phase::Dead);
    assert_eq!(a.error_code(), ErrorCode::AuthFail);
    assert_eq!(b.error_code(), ErrorCode::AuthFail);
    assert!(da.statuses.contains(&ErrorCode::AuthFail));
}

#[test]
fn chap_authentication_with_digest_provider() {
    let digests = XorDigests;
    let mut sa = Settings::default();
    sa.digests = Some(&digests);
    let mut sb = Settings::default();
    sb.digests = Some(&digests);

    let mut ctx = ctx();
    let mut a = Session::new(sa);
    let mut b = Session::new(sb);
    a.set_auth(auth_type::CHAP, "user", "secret").unwrap();
    b.set_auth(auth_type::CHAP, "user", "secret").unwrap();
    b.set_auth_required(true).unwrap();
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();

    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    assert_eq!(a.phase(), Phase::Running);
    assert_eq!(b.phase(), Phase::Running);
}

#[test]
fn peer_refusing_auth_closes_link() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    // The authenticator demands PAP but the peer has no credentials at
    // all, so it rejects the option.
    b.set_auth(auth_type::PAP, "user", "pw").unwrap();
    b.set_auth_required(true).unwrap();
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();

    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    assert_eq!(b.error_code(), ErrorCode::AuthFail);
    assert_eq!(b.phase(), Phase::Dead);
}

#[test]
fn echo_failure_declares_peer_dead() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    {
        let s = a.settings_mut().unwrap();
        s.lcp_echo_interval = Duration::from_secs(30);
        s.lcp_echo_fails = 4;
    }
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);
    assert_eq!(a.phase(), Phase::Running);

    // The peer goes silent: echo requests pile up unanswered.
    let mut now = Instant::ZERO;
    for _ in 0..5 {
        now += Duration::from_secs(30);
        a.poll(&mut ctx, now, &mut da);
        if a.phase() != Phase::Running {
            break;
        }
    }
    assert_eq!(a.error_code(), ErrorCode::PeerDead);
    assert_eq!(a.phase(), Phase::Terminate);
}

#[test]
fn keepalive_survives_while_peer_answers() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    {
        let s = a.settings_mut().unwrap();
        s.lcp_echo_interval = Duration::from_secs(30);
        s.lcp_echo_fails = 2;
    }
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    let mut now = Instant::ZERO;
    for _ in 0..6 {
        now += Duration::from_secs(30);
        a.poll(&mut ctx, now, &mut da);
        pump(&mut ctx, now, &mut a, &mut da, &mut b, &mut db);
    }
    assert_eq!(a.phase(), Phase::Running);
}

#[test]
fn lcp_protocol_reject_is_fatal() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    // Protocol-Reject naming LCP itself.
    let mut pkt = vec![0xc0, 0x21, 0x08, 0x09, 0x00, 0x06, 0xc0, 0x21];
    a.input(&mut ctx, Instant::ZERO, &mut pkt, &mut da);
    assert_eq!(a.error_code(), ErrorCode::Protocol);
    assert_eq!(a.phase(), Phase::Terminate);
}

#[test]
fn unknown_protocol_is_protocol_rejected() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);
    da.out.clear();

    let mut pkt = vec![0x80, 0x35, 0x01, 0x01, 0x00, 0x04];
    let r = a.input(&mut ctx, Instant::ZERO, &mut pkt, &mut da);
    assert_eq!(r, Received::None);
    let reject = da.out.last().expect("protocol-reject sent");
    assert_eq!(reject[2], 0x08);
    assert!(reject.ends_with(&[0x80, 0x35, 0x01, 0x01, 0x00, 0x04]));
}

#[test]
fn non_lcp_traffic_dropped_until_lcp_opens() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::ZERO, &mut da)
        .unwrap();
    let sent_before = da.out.len();

    let mut pap = vec![0xc0, 0x23, 0x01, 0x01, 0x00, 0x06, 0x00, 0x00];
    let r = a.input(&mut ctx, Instant::ZERO, &mut pap, &mut da);
    assert_eq!(r, Received::None);
    assert_eq!(da.out.len(), sent_before);

    let mut ip = vec![0x00, 0x21, 0x45, 0x00];
    assert_eq!(
        a.input(&mut ctx, Instant::ZERO, &mut ip, &mut da),
        Received::None
    );
}

#[test]
fn data_packets_surface_once_running() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    let mut ip = vec![0x00, 0x21, 0x45, 0x00, 0x00, 0x14];
    assert_eq!(
        a.input(&mut ctx, Instant::ZERO, &mut ip, &mut da),
        Received::Ipv4
    );
    let mut ip6 = vec![0x00, 0x57, 0x60, 0x00];
    assert_eq!(
        a.input(&mut ctx, Instant::ZERO, &mut ip6, &mut da),
        Received::Ipv6
    );
}

#[test]
fn orderly_close_reaches_dead_on_both_ends() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    a.close(Instant::ZERO, false, &mut da);
    assert_eq!(a.phase(), Phase::Terminate);
    pump(&mut ctx, Instant::ZERO, &mut a, &mut da, &mut b, &mut db);

    assert_eq!(a.phase(), Phase::Dead);
    assert_eq!(a.error_code(), ErrorCode::User);
    assert_eq!(da.statuses, vec![ErrorCode::User]);
    // The passive end went down too, but not by user request.
    assert_ne!(b.phase(), Phase::Running);
}

#[test]
fn nocarrier_close_skips_terminate_handshake() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);
    da.out.clear();

    a.close(Instant::ZERO, true, &mut da);
    assert_eq!(a.phase(), Phase::Dead);
    assert_eq!(a.error_code(), ErrorCode::User);
    // No Terminate-Request went out.
    assert!(da.out.iter().all(|p| p.get(2) != Some(&0x05)));
}

#[test]
fn idle_timeout_closes_link() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.settings_mut().unwrap().idle_time_limit = Duration::from_secs(5);
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);
    assert_eq!(a.phase(), Phase::Running);

    a.poll(&mut ctx, Instant::from_secs(5), &mut da);
    assert_eq!(a.error_code(), ErrorCode::IdleTimeout);
    assert_eq!(a.phase(), Phase::Terminate);
}

#[test]
fn idle_timer_rearms_when_traffic_was_seen() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.settings_mut().unwrap().idle_time_limit = Duration::from_secs(5);
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    a.note_activity(Instant::from_secs(3));
    a.poll(&mut ctx, Instant::from_secs(5), &mut da);
    assert_eq!(a.phase(), Phase::Running);
    // Remaining time was rescheduled.
    assert_eq!(a.poll_at(), Some(Instant::from_secs(8)));
}

#[test]
fn maxconnect_closes_link() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.settings_mut().unwrap().maxconnect = Duration::from_secs(60);
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();
    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    a.note_activity(Instant::from_secs(59));
    a.poll(&mut ctx, Instant::from_secs(60), &mut da);
    assert_eq!(a.error_code(), ErrorCode::ConnectTime);
    assert_eq!(a.phase(), Phase::Terminate);
}

#[test]
fn holdoff_defers_connection() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::from_secs(2), &mut da)
        .unwrap();
    assert_eq!(a.phase(), Phase::Holdoff);
    assert!(da.out.is_empty());

    a.poll(&mut ctx, Instant::from_secs(2), &mut da);
    assert_eq!(a.phase(), Phase::Establish);
    assert!(!da.out.is_empty());
}

#[test]
fn close_during_holdoff_cancels_attempt() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::from_secs(2), &mut da)
        .unwrap();
    a.close(Instant::ZERO, false, &mut da);
    assert_eq!(a.phase(), Phase::Dead);
    assert_eq!(da.statuses, vec![ErrorCode::User]);

    // The cancelled timer stays cancelled.
    a.poll(&mut ctx, Instant::from_secs(2), &mut da);
    assert_eq!(a.phase(), Phase::Dead);
}

#[test]
fn listen_time_delays_first_request() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.set_listen_time(Duration::from_millis(100)).unwrap();
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::ZERO, &mut da)
        .unwrap();
    assert!(da.out.is_empty());

    a.poll(&mut ctx, Instant::from_millis(99), &mut da);
    assert!(da.out.is_empty());
    a.poll(&mut ctx, Instant::from_millis(100), &mut da);
    assert_eq!(da.out.len(), 1);
    assert_eq!(da.out[0][2], 0x01); // ConfigureReq
}

#[test]
fn inbound_traffic_ends_listen_delay_early() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.set_listen_time(Duration::from_secs(10)).unwrap();
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::ZERO, &mut da)
        .unwrap();
    assert!(da.out.is_empty());

    // The peer speaks first; we answer right away.
    let mut req = vec![0xc0, 0x21, 0x01, 0x01, 0x00, 0x04];
    a.input(&mut ctx, Instant::from_millis(5), &mut req, &mut da);
    assert!(!da.out.is_empty());
}

#[test]
fn no_network_protocols_terminates_link() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.enable_ipv4(false).unwrap();
    a.enable_ipv6(false).unwrap();
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();

    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);

    assert_eq!(a.phase(), Phase::Dead);
    assert_eq!(a.error_code(), ErrorCode::Connect);
}

#[test]
fn mppe_gate_defers_ncps_until_continue() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.set_mppe(mppe::ENABLE).unwrap();
    let mut b = Session::new(Settings::default());
    let mut da = TestDriver::default();
    let mut db = TestDriver::default();

    connect_pair(&mut ctx, &mut a, &mut da, &mut b, &mut db);
    assert_eq!(a.phase(), Phase::Network);
    // No IPCP request has left yet.
    assert!(!da.out.iter().any(|p| p.starts_with(&[0x80, 0x21])));

    a.continue_networks(&mut ctx, Instant::ZERO, &mut da);
    pump(&mut ctx, Instant::ZERO, &mut a, &mut da, &mut b, &mut db);
    // The peer's own NCP requests were Terminate-Acked while we were
    // gated; its retransmission completes the bring-up.
    let now = Instant::from_secs(6);
    b.poll(&mut ctx, now, &mut db);
    a.poll(&mut ctx, now, &mut da);
    pump(&mut ctx, now, &mut a, &mut da, &mut b, &mut db);
    assert_eq!(a.phase(), Phase::Running);
}

#[test]
fn looped_back_line_is_detected() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    a.settings_mut().unwrap().lcp_loopbackfail = 3;
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::ZERO, &mut da)
        .unwrap();

    // Mirror everything the session says straight back at it.
    for _ in 0..50 {
        if a.phase() != Phase::Establish {
            break;
        }
        let echoed: Vec<_> = da.out.drain(..).collect();
        for mut pkt in echoed {
            a.input(&mut ctx, Instant::ZERO, &mut pkt, &mut da);
        }
    }

    assert_eq!(a.error_code(), ErrorCode::Loopback);
    assert_eq!(a.phase(), Phase::Terminate);
}

#[test]
fn setters_refused_outside_dead() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::ZERO, &mut da)
        .unwrap();
    assert!(a.set_auth(auth_type::PAP, "u", "p").is_err());
    assert!(a.set_listen_time(Duration::from_secs(1)).is_err());
    assert!(a.settings_mut().is_err());
    // A second connect is refused as well.
    assert!(a
        .connect(&mut ctx, Instant::ZERO, Duration::ZERO, &mut da)
        .is_err());
}

#[test]
fn free_requires_dead_phase() {
    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut da = TestDriver::default();
    a.connect(&mut ctx, Instant::ZERO, Duration::ZERO, &mut da)
        .unwrap();
    let mut a = match a.free() {
        Ok(()) => panic!("free in Establish must fail"),
        Err(s) => s,
    };

    // A close with nobody answering rides the Terminate retry cap down.
    a.close(Instant::ZERO, false, &mut da);
    assert_eq!(a.phase(), Phase::Terminate);
    a.poll(&mut ctx, Instant::from_secs(6), &mut da);
    a.poll(&mut ctx, Instant::from_secs(12), &mut da);
    assert_eq!(a.phase(), Phase::Dead);
    a.free().map_err(|_| ()).unwrap();
}

#[test]
fn negotiated_mru_is_applied_to_the_driver() {
    #[derive(Default)]
    struct MtuDriver {
        inner: TestDriver,
        mtu: Option<u16>,
        send_mru: Option<u16>,
    }
    impl LinkDriver for MtuDriver {
        fn transmit(&mut self, pkt: Packet<'_>) {
            self.inner.transmit(pkt);
        }
        fn set_mtu(&mut self, mtu: u16) {
            self.mtu = Some(mtu);
        }
        fn send_config(&mut self, mtu: u16, _asyncmap: u32, _pcomp: bool, _accomp: bool) {
            self.send_mru = Some(mtu);
        }
    }

    let mut ctx = ctx();
    let mut a = Session::new(Settings::default());
    let mut b = Session::new(Settings::default());
    let mut da = MtuDriver::default();
    let mut db = TestDriver::default();

    let now = Instant::ZERO;
    a.connect(&mut ctx, now, Duration::ZERO, &mut da).unwrap();
    b.listen(&mut ctx, now, &mut db).unwrap();
    for _ in 0..100 {
        let from_a: Vec<_> = da.inner.out.drain(..).collect();
        let from_b: Vec<_> = db.out.drain(..).collect();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for mut pkt in from_a {
            b.input(&mut ctx, now, &mut pkt, &mut db);
        }
        for mut pkt in from_b {
            a.input(&mut ctx, now, &mut pkt, &mut da);
        }
    }
    assert_eq!(a.phase(), Phase::Running);
    assert_eq!(da.mtu, Some(1500));
    assert_eq!(da.send_mru, Some(1500));
}
