//! IPv6 Control Protocol: interface-identifier negotiation.

use num_enum::{FromPrimitive, IntoPrimitive};

use super::fsm::{BadReply, NegotiableProtocol, Verdict};
use crate::magic::ProcessContext;
use crate::wire::{parse_options, ProtocolType};

#[derive(FromPrimitive, IntoPrimitive, Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
enum OptionCode {
    #[num_enum(default)]
    Unknown = 0,
    InterfaceId = 1,
}

/// Status of the IPv6 connection. Identifiers form the lower 64 bits of
/// the respective link-local addresses.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ipv6Status {
    pub interface_id: Option<[u8; 8]>,
    pub peer_interface_id: Option<[u8; 8]>,
}

pub(crate) struct Ipv6cp {
    /// Preferred identifier; all-zero means "make one up".
    pub want_interface_id: [u8; 8],

    interface_id: [u8; 8],
    id_rejected: bool,
    peer_interface_id: [u8; 8],
}

impl Ipv6cp {
    pub fn new() -> Self {
        Self {
            want_interface_id: [0; 8],
            interface_id: [0; 8],
            id_rejected: false,
            peer_interface_id: [0; 8],
        }
    }

    pub fn status(&self) -> Ipv6Status {
        Ipv6Status {
            interface_id: (!self.id_rejected && self.interface_id != [0; 8])
                .then_some(self.interface_id),
            peer_interface_id: (self.peer_interface_id != [0; 8]).then_some(self.peer_interface_id),
        }
    }
}

impl NegotiableProtocol for Ipv6cp {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::IPv6CP
    }

    fn reset_request(&mut self, ctx: &mut ProcessContext) {
        self.id_rejected = false;
        self.interface_id = self.want_interface_id;
        if self.interface_id == [0; 8] {
            ctx.magic.fill_bytes(&mut self.interface_id);
        }
    }

    fn request_options(&self, f: &mut dyn FnMut(u8, &[u8])) {
        if !self.id_rejected {
            f(OptionCode::InterfaceId.into(), &self.interface_id);
        }
    }

    fn ack_received(&mut self, data: &[u8]) -> Result<(), BadReply> {
        let mut expected: heapless::Vec<u8, 10> = heapless::Vec::new();
        self.request_options(&mut |code, d| {
            unwrap!(expected.push(code).ok());
            unwrap!(expected.push(d.len() as u8 + 2).ok());
            unwrap!(expected.extend_from_slice(d).ok());
        });
        if data == &expected[..] {
            Ok(())
        } else {
            Err(BadReply)
        }
    }

    fn nak_received(
        &mut self,
        _ctx: &mut ProcessContext,
        data: &[u8],
        _treat_as_reject: bool,
        opened: bool,
    ) -> Result<(), BadReply> {
        if opened {
            return Ok(());
        }
        let id = &mut self.interface_id;
        let rejected = &mut self.id_rejected;
        parse_options(data, |code, d| {
            if OptionCode::from(code) == OptionCode::InterfaceId {
                match <[u8; 8]>::try_from(d) {
                    Ok(suggested) if suggested != [0; 8] => *id = suggested,
                    // A zero or malformed suggestion cannot be used.
                    _ => *rejected = true,
                }
            }
        })
        .map_err(|_| BadReply)
    }

    fn rej_received(&mut self, data: &[u8], opened: bool) -> Result<(), BadReply> {
        if opened {
            return Ok(());
        }
        let rejected = &mut self.id_rejected;
        parse_options(data, |code, _| {
            if OptionCode::from(code) == OptionCode::InterfaceId {
                *rejected = true;
            }
        })
        .map_err(|_| BadReply)
    }

    fn peer_request_start(&mut self) {
        self.peer_interface_id = [0; 8];
    }

    fn peer_option(
        &mut self,
        ctx: &mut ProcessContext,
        code: u8,
        data: &[u8],
        _reject_if_disagree: bool,
    ) -> Verdict {
        trace!("IPv6CP: rx option {:?} {:?}", code, data);
        match OptionCode::from(code) {
            OptionCode::InterfaceId => {
                let id = match <[u8; 8]>::try_from(data) {
                    Ok(id) => id,
                    Err(_) => return Verdict::Rej,
                };
                if id == [0; 8] || id == self.interface_id {
                    // Collision (or no identifier at all): suggest a
                    // random one that differs from ours.
                    let mut suggestion = [0u8; 8];
                    loop {
                        ctx.magic.fill_bytes(&mut suggestion);
                        if suggestion != self.interface_id && suggestion != [0; 8] {
                            break;
                        }
                    }
                    return Verdict::Nack(unwrap!(heapless::Vec::from_slice(&suggestion).ok()));
                }
                self.peer_interface_id = id;
                Verdict::Ack
            }
            _ => Verdict::Rej,
        }
    }
}
