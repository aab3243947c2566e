//! Two sessions wired back to back in memory: one dials, one listens,
//! and the simulated clock ticks until both ends are Running (or one of
//! them gives up). Handy for watching a full negotiation in the logs:
//!
//!     RUST_LOG=debug cargo run -p demos -- --auth pap

use std::net::Ipv4Addr;

use clap::{Parser, ValueEnum};
use rand::RngCore;

use ppplink::time::{Duration, Instant};
use ppplink::wire::Packet;
use ppplink::{
    auth_type, CredentialDigests, ErrorCode, LinkDriver, Phase, ProcessContext, Session, Settings,
};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum AuthMode {
    None,
    Pap,
    Chap,
}

#[derive(Parser)]
struct Opts {
    /// Authentication the listening side demands.
    #[clap(long, value_enum, default_value = "none")]
    auth: AuthMode,
    /// Shared username.
    #[clap(long, default_value = "demo")]
    user: String,
    /// Shared password.
    #[clap(long, default_value = "swordfish")]
    password: String,
    /// Close the link again once it is up.
    #[clap(long)]
    hangup: bool,
}

struct Wire {
    name: &'static str,
    out: Vec<Vec<u8>>,
}

impl LinkDriver for Wire {
    fn transmit(&mut self, pkt: Packet<'_>) {
        let mut buf = vec![0; pkt.buffer_len()];
        pkt.emit(&mut buf);
        log::trace!("{}: tx {:02x?}", self.name, buf);
        self.out.push(buf);
    }

    fn phase_changed(&mut self, phase: Phase) {
        log::info!("{}: phase {:?}", self.name, phase);
    }

    fn link_status(&mut self, err: ErrorCode) {
        log::info!("{}: link status {:?}", self.name, err);
    }

    fn ipv4_up(&mut self, status: ppplink::Ipv4Status) {
        log::info!("{}: ipv4 up {:?}", self.name, status);
    }

    fn set_mtu(&mut self, mtu: u16) {
        log::info!("{}: mtu {}", self.name, mtu);
    }
}

/// Toy digest so the CHAP demo runs without pulling in real crypto.
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

fn main() {
    env_logger::init();
    let opts: Opts = Opts::parse();

    let digests = XorDigests;
    let mut settings = Settings::default();
    settings.digests = Some(&digests);

    let mut ctx = ProcessContext::new(rand::thread_rng().next_u64());
    let mut client = Session::new(settings.clone());
    let mut server = Session::new(settings);

    let authtype = match opts.auth {
        AuthMode::None => auth_type::NONE,
        AuthMode::Pap => auth_type::PAP,
        AuthMode::Chap => auth_type::CHAP,
    };
    if authtype != auth_type::NONE {
        client.set_auth(authtype, &opts.user, &opts.password).unwrap();
        server.set_auth(authtype, &opts.user, &opts.password).unwrap();
        server.set_auth_required(true).unwrap();
    }
    server.set_ipcp_ouraddr(Ipv4Addr::new(10, 64, 64, 1)).unwrap();
    server.set_ipcp_hisaddr(Ipv4Addr::new(10, 64, 64, 2)).unwrap();

    let mut cw = Wire { name: "client", out: Vec::new() };
    let mut sw = Wire { name: "server", out: Vec::new() };

    let mut now = Instant::ZERO;
    client.connect(&mut ctx, now, Duration::ZERO, &mut cw).unwrap();
    server.listen(&mut ctx, now, &mut sw).unwrap();

    let mut hung_up = false;
    for step in 0..1000 {
        // Move packets both ways.
        for mut pkt in cw.out.drain(..).collect::<Vec<_>>() {
            server.input(&mut ctx, now, &mut pkt, &mut sw);
        }
        for mut pkt in sw.out.drain(..).collect::<Vec<_>>() {
            client.input(&mut ctx, now, &mut pkt, &mut cw);
        }

        if client.phase() == Phase::Running && server.phase() == Phase::Running && !hung_up {
            log::info!("link is up after {} steps", step);
            log::info!("client status: {:?}", client.status());
            if !opts.hangup {
                break;
            }
            hung_up = true;
            client.close(now, false, &mut cw);
        }
        if hung_up && client.phase() == Phase::Dead {
            break;
        }

        // Advance the clock to the next deadline if the wire is idle.
        if cw.out.is_empty() && sw.out.is_empty() {
            match [client.poll_at(), server.poll_at()]
                .into_iter()
                .flatten()
                .min()
            {
                Some(at) => now = at.max(now),
                None => break,
            }
            client.poll(&mut ctx, now, &mut cw);
            server.poll(&mut ctx, now, &mut sw);
        }
    }

    log::info!(
        "done: client {:?} ({:?}), server {:?} ({:?})",
        client.phase(),
        client.error_code(),
        server.phase(),
        server.error_code()
    );
}
