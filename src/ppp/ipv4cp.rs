//! IPv4 Control Protocol: address assignment and (optionally) DNS server
//! discovery.

use core::net::Ipv4Addr;

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
    IpAddress = 3,
    Dns1 = 129,
    Dns2 = 131,
}

struct IpOption {
    address: Ipv4Addr,
    is_rejected: bool,
}

impl IpOption {
    fn new() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            is_rejected: false,
        }
    }

    fn get(&self) -> Option<Ipv4Addr> {
        if self.is_rejected || self.address.is_unspecified() {
            None
        } else {
            Some(self.address)
        }
    }

    fn nacked(&mut self, data: &[u8], is_rej: bool) {
        if is_rej {
            self.is_rejected = true
        } else {
            match <[u8; 4]>::try_from(data) {
                // Peer's suggested address: adopt it.
                Ok(data) => self.address = Ipv4Addr::from(data),
                // Peer wants us to use an address that's not 4 bytes.
                // Should never happen, but mark the option rejected to
                // avoid an endless loop.
                Err(_) => self.is_rejected = true,
            }
        }
    }
}

/// Status of the IPv4 connection.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ipv4Status {
    /// Our address.
    pub address: Option<Ipv4Addr>,
    /// The peer's address.
    pub peer_address: Option<Ipv4Addr>,
    /// DNS servers provided by the peer.
    pub dns_servers: [Option<Ipv4Addr>; 2],
}

pub(crate) struct Ipv4cp {
    /// Address we start asking with; 0.0.0.0 means "peer assigns".
    pub want_address: Ipv4Addr,
    /// Address we insist the peer uses; unspecified means "whatever".
    pub want_peer_address: Ipv4Addr,
    pub usepeerdns: bool,
    /// Tolerate a peer that declines to reveal any address.
    pub noremoteip: bool,

    peer_address: Ipv4Addr,
    address: IpOption,
    dns_server_1: IpOption,
    dns_server_2: IpOption,
}

impl Ipv4cp {
    pub fn new() -> Self {
        Self {
            want_address: Ipv4Addr::UNSPECIFIED,
            want_peer_address: Ipv4Addr::UNSPECIFIED,
            usepeerdns: false,
            noremoteip: false,

            peer_address: Ipv4Addr::UNSPECIFIED,
            address: IpOption::new(),
            dns_server_1: IpOption::new(),
            dns_server_2: IpOption::new(),
        }
    }

    pub fn status(&self) -> Ipv4Status {
        let peer_address = if self.peer_address.is_unspecified() {
            None
        } else {
            Some(self.peer_address)
        };

        Ipv4Status {
            address: self.address.get(),
            peer_address,
            dns_servers: [self.dns_server_1.get(), self.dns_server_2.get()],
        }
    }
}

impl NegotiableProtocol for Ipv4cp {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::IPv4CP
    }

    fn reset_request(&mut self, _ctx: &mut ProcessContext) {
        self.address = IpOption::new();
        self.address.address = self.want_address;
        self.dns_server_1 = IpOption::new();
        self.dns_server_1.is_rejected = !self.usepeerdns;
        self.dns_server_2 = IpOption::new();
        self.dns_server_2.is_rejected = !self.usepeerdns;
    }

    fn request_options(&self, f: &mut dyn FnMut(u8, &[u8])) {
        if !self.address.is_rejected {
            f(OptionCode::IpAddress.into(), &self.address.address.octets());
        }
        if !self.dns_server_1.is_rejected {
            f(OptionCode::Dns1.into(), &self.dns_server_1.address.octets());
        }
        if !self.dns_server_2.is_rejected {
            f(OptionCode::Dns2.into(), &self.dns_server_2.address.octets());
        }
    }

    fn ack_received(&mut self, data: &[u8]) -> Result<(), BadReply> {
        let mut expected: heapless::Vec<u8, 24> = heapless::Vec::new();
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
        let address = &mut self.address;
        let dns1 = &mut self.dns_server_1;
        let dns2 = &mut self.dns_server_2;
        parse_options(data, |code, d| {
            trace!("IPv4CP nak {:?} {:?}", code, d);
            match OptionCode::from(code) {
                OptionCode::IpAddress => address.nacked(d, false),
                OptionCode::Dns1 => dns1.nacked(d, false),
                OptionCode::Dns2 => dns2.nacked(d, false),
                OptionCode::Unknown => {}
            }
        })
        .map_err(|_| BadReply)
    }

    fn rej_received(&mut self, data: &[u8], opened: bool) -> Result<(), BadReply> {
        if opened {
            return Ok(());
        }
        let address = &mut self.address;
        let dns1 = &mut self.dns_server_1;
        let dns2 = &mut self.dns_server_2;
        parse_options(data, |code, d| {
            trace!("IPv4CP rej {:?} {:?}", code, d);
            match OptionCode::from(code) {
                OptionCode::IpAddress => address.nacked(d, true),
                OptionCode::Dns1 => dns1.nacked(d, true),
                OptionCode::Dns2 => dns2.nacked(d, true),
                OptionCode::Unknown => {}
            }
        })
        .map_err(|_| BadReply)
    }

    fn peer_request_start(&mut self) {
        self.peer_address = Ipv4Addr::UNSPECIFIED;
    }

    fn peer_option(
        &mut self,
        _ctx: &mut ProcessContext,
        code: u8,
        data: &[u8],
        _reject_if_disagree: bool,
    ) -> Verdict {
        let opt = OptionCode::from(code);
        trace!("IPv4CP: rx option {:?} {:?}", code, data);
        match opt {
            OptionCode::IpAddress => {
                let addr = match <[u8; 4]>::try_from(data) {
                    Ok(a) => Ipv4Addr::from(a),
                    Err(_) => return Verdict::Rej,
                };
                let wanted = self.want_peer_address;
                if !wanted.is_unspecified() && addr != wanted {
                    // We assign the peer's address.
                    return Verdict::Nack(unwrap!(heapless::Vec::from_slice(&wanted.octets())
                        .ok()));
                }
                if addr.is_unspecified() {
                    // Peer refuses to name an address and we have none to
                    // hand out.
                    return if self.noremoteip {
                        Verdict::Ack
                    } else {
                        Verdict::Rej
                    };
                }
                self.peer_address = addr;
                Verdict::Ack
            }
            // We are not a DNS-serving peer.
            _ => Verdict::Rej,
        }
    }
}
