//! PPP link negotiation for tunneling daemons: LCP option negotiation,
//! PAP/CHAP/EAP authentication sequencing, IPCP/IPv6CP bring-up, echo
//! keepalive and loopback detection.
//!
//! The crate is transport-agnostic and clock-agnostic: the host owns the
//! event loop, feeds inbound packets to [`Session::input`], services
//! timers through [`Session::poll`]/[`Session::poll_at`] and implements
//! [`LinkDriver`] over its framing layer.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod magic;
mod ppp;
pub mod time;
pub mod wire;

pub use magic::{Magic, ProcessContext};
pub use ppp::{
    auth_type, mppe, CredentialDigests, ErrorCode, InvalidPhaseError, Ipv4Status, Ipv6Status,
    LinkDriver, Phase, Received, Session, Settings, Status,
};
