//! The outbound control message and its endpoint records.
//!
//! A [`WhackMessage`] is built once per command, packed by
//! [`crate::pack`] into a fixed-layout header plus string pool, and sent
//! over the control socket. Strings are ordinary owned values here; the
//! packer replaces them with pool offsets.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

use whackctl_config::AutoStart;

use crate::error::Result;
use crate::pack::Packer;

/// Magic value leading every message (`"whk"` plus the ABI revision).
pub const WHACK_MAGIC: u32 = u32::from_be_bytes([b'w', b'h', b'k', 25]);

/// Operation flags carried in the message header.
pub mod op {
    /// Add (or replace) a connection definition.
    pub const ADD_CONN: u16 = 0b0000_0001;
    /// Upload a public key for `keyid`.
    pub const KEY: u16 = 0b0000_0010;
    /// Install the connection's routes / policies.
    pub const ROUTE: u16 = 0b0000_0100;
    /// Start negotiating the connection.
    pub const INITIATE: u16 = 0b0000_1000;
    /// Do not wait for the negotiation to finish.
    pub const ASYNC: u16 = 0b0001_0000;
    /// Start listening on the IKE ports.
    pub const LISTEN: u16 = 0b0010_0000;
}

/// Declares a wire enum: one byte on the wire, zero reserved for "unset".
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal => $kw:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Byte written to the header for this value.
            pub fn wire_code(self) -> u8 {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            /// Parse the configuration keyword for this value.
            pub fn from_keyword(s: &str) -> Option<Self> {
                match s {
                    $($kw => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// Address family of the hosts or of the protected clients.
    AddressFamily { Ipv4 = 4 => "ipv4", Ipv6 = 6 => "ipv6" }
}

wire_enum! {
    /// IPsec encapsulation mode.
    EncapMode { Tunnel = 1 => "tunnel", Transport = 2 => "transport" }
}

wire_enum! {
    /// Action taken when dead-peer detection fires.
    DpdAction { Clear = 1 => "clear", Hold = 2 => "hold", Restart = 3 => "restart" }
}

wire_enum! {
    /// Which CA certificates are sent with our own.
    SendCa { None = 1 => "none", Issuer = 2 => "issuer", All = 3 => "all" }
}

wire_enum! {
    /// UDP encapsulation of ESP.
    Encapsulation { Yes = 1 => "yes", No = 2 => "no", Auto = 3 => "auto" }
}

wire_enum! {
    /// IKE over TCP.
    TcpMode { No = 1 => "no", Yes = 2 => "yes", Fallback = 3 => "fallback" }
}

wire_enum! {
    /// When an end sends its certificate.
    SendCert { Always = 1 => "always", IfAsked = 2 => "ifasked", Never = 3 => "never" }
}

wire_enum! {
    /// Authentication method of one end.
    EndAuth {
        Rsasig = 1 => "rsasig",
        Ecdsa = 2 => "ecdsa",
        Secret = 3 => "secret",
        Null = 4 => "null",
        EapOnly = 5 => "eaponly",
    }
}

wire_enum! {
    /// EAP method of one end.
    Eap { None = 1 => "none", Tls = 2 => "tls" }
}

wire_enum! {
    /// Public key algorithm, keyed by the option that carried the key.
    PubkeyAlg { Rsa = 2 => "rsasigkey", Ecdsa = 3 => "ecdsakey", Raw = 4 => "pubkey" }
}

fn autostart_code(auto: AutoStart) -> u8 {
    match auto {
        AutoStart::Ignore => 1,
        AutoStart::Add => 2,
        AutoStart::Route => 3,
        AutoStart::OnDemand => 4,
        AutoStart::Start => 5,
    }
}

impl AddressFamily {
    /// Family of a concrete address.
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// The family's unspecified address (`0.0.0.0` / `::`).
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// How one end's host address is selected.
///
/// Only [`Address`](Self::Address) and [`Interface`](Self::Interface) carry an
/// address onto the wire; every other mode leaves the address unset and lets
/// the daemon resolve it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSelector {
    /// An explicit address.
    Address(IpAddr),
    /// The address of a local interface.
    Interface { name: String, addr: IpAddr },
    /// Whatever address the default route uses.
    DefaultRoute,
    /// A DNS name resolved by the daemon.
    Hostname(String),
    /// Opportunistic encryption.
    Opportunistic,
    /// A policy group.
    Group,
    /// A policy group with opportunistic fallback.
    OpportunisticGroup,
    /// Any peer address.
    Any,
}

impl HostSelector {
    /// Host type byte written to the header.
    pub fn wire_code(&self) -> u8 {
        match self {
            Self::Address(_) => 1,
            Self::Interface { .. } => 2,
            Self::DefaultRoute => 3,
            Self::Hostname(_) => 4,
            Self::Opportunistic => 5,
            Self::Group => 6,
            Self::OpportunisticGroup => 7,
            Self::Any => 8,
        }
    }

    /// Address placed in the header for this mode.
    pub fn address(&self) -> Option<IpAddr> {
        match self {
            Self::Address(addr) | Self::Interface { addr, .. } => Some(*addr),
            // the name travels in `host_addr_name`
            Self::DefaultRoute | Self::Hostname(_) => None,
            Self::Opportunistic | Self::Group | Self::OpportunisticGroup => None,
            Self::Any => None,
        }
    }
}

/// An address with a prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    fn max_prefix(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr_part, prefix_part) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr_part
            .parse()
            .map_err(|e| format!("bad address {addr_part:?}: {e}"))?;
        let max = Self::max_prefix(&addr);
        let prefix = match prefix_part {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("bad prefix length {p:?} (0-{max})"))?,
            None => max,
        };
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// One side of a connection as the daemon sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhackEnd {
    /// `"left"` or `"right"`.
    pub leftright: Option<String>,
    pub id: Option<String>,
    /// Unset on messages that carry no connection definition.
    pub host: Option<HostSelector>,
    /// The host text as configured (address, name, keyword).
    pub host_addr_name: Option<String>,
    pub nexthop: Option<IpAddr>,
    pub sourceip: Option<String>,
    pub host_vtiip: Option<Cidr>,
    pub ifaceip: Option<Cidr>,
    pub subnet: Option<Cidr>,
    pub subnets: Option<String>,
    pub ikeport: u16,
    pub protoport: Option<String>,
    pub cert: Option<String>,
    pub ckaid: Option<String>,
    pub ca: Option<String>,
    pub pubkey_alg: Option<PubkeyAlg>,
    pub pubkey: Option<String>,
    pub sendcert: Option<SendCert>,
    pub auth: Option<EndAuth>,
    pub eap: Option<Eap>,
    pub updown: Option<String>,
    pub virt: Option<String>,
    pub key_from_dns_on_demand: bool,
    pub xauth_server: Option<bool>,
    pub xauth_client: Option<bool>,
    pub xauth_username: Option<String>,
    pub groundhog: Option<String>,
    pub modecfg_server: Option<bool>,
    pub modecfg_client: Option<bool>,
    pub cat: Option<bool>,
    pub addresspool: Option<String>,
}

impl WhackEnd {
    fn write_to(&self, w: &mut Packer) -> Result<()> {
        w.str("leftright", self.leftright.as_deref())?;
        w.str("id", self.id.as_deref())?;
        w.u8(self.host.as_ref().map_or(0, HostSelector::wire_code));
        w.addr(self.host.as_ref().and_then(HostSelector::address));
        w.str("host_addr_name", self.host_addr_name.as_deref())?;
        w.addr(self.nexthop);
        w.str("sourceip", self.sourceip.as_deref())?;
        w.cidr(self.host_vtiip);
        w.cidr(self.ifaceip);
        w.cidr(self.subnet);
        w.str("subnets", self.subnets.as_deref())?;
        w.u16(self.ikeport);
        w.str("protoport", self.protoport.as_deref())?;
        w.str("cert", self.cert.as_deref())?;
        w.str("ckaid", self.ckaid.as_deref())?;
        w.str("ca", self.ca.as_deref())?;
        w.code(self.pubkey_alg.map(PubkeyAlg::wire_code));
        w.str("pubkey", self.pubkey.as_deref())?;
        w.code(self.sendcert.map(SendCert::wire_code));
        w.code(self.auth.map(EndAuth::wire_code));
        w.code(self.eap.map(Eap::wire_code));
        w.str("updown", self.updown.as_deref())?;
        w.str("virt", self.virt.as_deref())?;
        w.bool(self.key_from_dns_on_demand);
        w.tristate(self.xauth_server);
        w.tristate(self.xauth_client);
        w.str("xauth_username", self.xauth_username.as_deref())?;
        w.str("groundhog", self.groundhog.as_deref())?;
        w.tristate(self.modecfg_server);
        w.tristate(self.modecfg_client);
        w.tristate(self.cat);
        w.str("addresspool", self.addresspool.as_deref())?;
        Ok(())
    }
}

/// The control message: a fixed header of typed fields plus the strings the
/// packer moves into the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhackMessage {
    /// Bitwise OR of [`op`] flags.
    pub ops: u16,
    pub name: Option<String>,
    pub host_afi: Option<AddressFamily>,
    pub child_afi: Option<AddressFamily>,
    pub dnshostname: Option<String>,
    pub ike_version: u8,
    pub autostart: Option<AutoStart>,
    pub encap_mode: Option<EncapMode>,
    pub pfs: Option<bool>,
    pub compress: Option<bool>,
    pub ikelifetime: Option<Duration>,
    pub ipsec_lifetime: Option<Duration>,
    pub rekey_margin: Duration,
    pub rekeyfuzz_percent: u32,
    pub ipsec_max_bytes: Option<u64>,
    pub ipsec_max_packets: Option<u64>,
    pub keyingtries: Option<u32>,
    pub replay_window: u32,
    pub retransmit_interval: Duration,
    pub retransmit_timeout: Duration,
    pub mtu: Option<u32>,
    pub priority: Option<u32>,
    pub tfc: Option<u32>,
    pub nflog_group: Option<u32>,
    pub reqid: Option<u32>,
    pub tcp_remoteport: Option<u16>,
    pub enable_tcp: Option<TcpMode>,
    pub dpd_action: Option<DpdAction>,
    pub dpd_delay: Option<Duration>,
    pub dpd_timeout: Option<Duration>,
    pub send_ca: Option<SendCa>,
    pub encapsulation: Option<Encapsulation>,
    pub nat_keepalive: bool,
    pub mobike: Option<bool>,
    pub intermediate: Option<bool>,
    pub aggressive: Option<bool>,
    pub narrowing: Option<bool>,
    pub rekey: Option<bool>,
    pub reauth: Option<bool>,
    pub ipsec_interface: Option<String>,
    pub sec_label: Option<String>,
    pub modecfg_dns: Option<String>,
    pub modecfg_domains: Option<String>,
    pub modecfg_banner: Option<String>,
    pub conn_mark_both: Option<String>,
    pub conn_mark_in: Option<String>,
    pub conn_mark_out: Option<String>,
    pub vti_interface: Option<String>,
    pub ppk_ids: Option<String>,
    pub redirect_to: Option<String>,
    pub accept_redirect_to: Option<String>,
    pub connalias: Option<String>,
    pub esp: Option<String>,
    pub ike: Option<String>,
    pub left: WhackEnd,
    pub right: WhackEnd,
    pub keyid: Option<String>,
    pub pubkey_alg: Option<PubkeyAlg>,
    /// Decoded key bytes for a key upload.
    pub keyval: Option<Vec<u8>>,
}

impl WhackMessage {
    /// An empty message with the given operation flags set.
    pub fn with_ops(ops: u16) -> Self {
        Self {
            ops,
            ..Default::default()
        }
    }

    /// Whether every flag in `flags` is set.
    pub fn has_ops(&self, flags: u16) -> bool {
        self.ops & flags == flags
    }

    /// Write header fields and pool strings in their fixed order.
    pub(crate) fn write_to(&self, w: &mut Packer) -> Result<()> {
        w.u32(WHACK_MAGIC);
        w.u16(self.ops);
        w.str("name", self.name.as_deref())?;
        w.code(self.host_afi.map(AddressFamily::wire_code));
        w.code(self.child_afi.map(AddressFamily::wire_code));
        w.str("dnshostname", self.dnshostname.as_deref())?;
        w.u8(self.ike_version);
        w.code(self.autostart.map(autostart_code));
        w.code(self.encap_mode.map(EncapMode::wire_code));
        w.tristate(self.pfs);
        w.tristate(self.compress);
        w.opt_duration(self.ikelifetime);
        w.opt_duration(self.ipsec_lifetime);
        w.duration(self.rekey_margin);
        w.u32(self.rekeyfuzz_percent);
        w.opt_u64(self.ipsec_max_bytes);
        w.opt_u64(self.ipsec_max_packets);
        w.opt_u32(self.keyingtries);
        w.u32(self.replay_window);
        w.duration(self.retransmit_interval);
        w.duration(self.retransmit_timeout);
        w.opt_u32(self.mtu);
        w.opt_u32(self.priority);
        w.opt_u32(self.tfc);
        w.opt_u32(self.nflog_group);
        w.opt_u32(self.reqid);
        w.opt_u32(self.tcp_remoteport.map(u32::from));
        w.code(self.enable_tcp.map(TcpMode::wire_code));
        w.code(self.dpd_action.map(DpdAction::wire_code));
        w.opt_duration(self.dpd_delay);
        w.opt_duration(self.dpd_timeout);
        w.code(self.send_ca.map(SendCa::wire_code));
        w.code(self.encapsulation.map(Encapsulation::wire_code));
        w.bool(self.nat_keepalive);
        w.tristate(self.mobike);
        w.tristate(self.intermediate);
        w.tristate(self.aggressive);
        w.tristate(self.narrowing);
        w.tristate(self.rekey);
        w.tristate(self.reauth);
        w.str("ipsec_interface", self.ipsec_interface.as_deref())?;
        w.str("sec_label", self.sec_label.as_deref())?;
        w.str("modecfg_dns", self.modecfg_dns.as_deref())?;
        w.str("modecfg_domains", self.modecfg_domains.as_deref())?;
        w.str("modecfg_banner", self.modecfg_banner.as_deref())?;
        w.str("conn_mark_both", self.conn_mark_both.as_deref())?;
        w.str("conn_mark_in", self.conn_mark_in.as_deref())?;
        w.str("conn_mark_out", self.conn_mark_out.as_deref())?;
        w.str("vti_interface", self.vti_interface.as_deref())?;
        w.str("ppk_ids", self.ppk_ids.as_deref())?;
        w.str("redirect_to", self.redirect_to.as_deref())?;
        w.str("accept_redirect_to", self.accept_redirect_to.as_deref())?;
        w.str("connalias", self.connalias.as_deref())?;
        w.str("esp", self.esp.as_deref())?;
        w.str("ike", self.ike.as_deref())?;

        w.enter("left.");
        self.left.write_to(w)?;
        w.enter("right.");
        self.right.write_to(w)?;
        w.enter("");

        w.str("keyid", self.keyid.as_deref())?;
        w.code(self.pubkey_alg.map(PubkeyAlg::wire_code));
        w.bytes("keyval", self.keyval.as_deref())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_spells_whk() {
        assert_eq!(&WHACK_MAGIC.to_be_bytes()[..3], b"whk");
    }

    #[test]
    fn test_only_address_modes_carry_an_address() {
        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        let modes = [
            (HostSelector::Address(v4), Some(v4)),
            (
                HostSelector::Interface {
                    name: "eth0".to_string(),
                    addr: v4,
                },
                Some(v4),
            ),
            (HostSelector::DefaultRoute, None),
            (HostSelector::Hostname("vpn.example.com".to_string()), None),
            (HostSelector::Opportunistic, None),
            (HostSelector::Group, None),
            (HostSelector::OpportunisticGroup, None),
            (HostSelector::Any, None),
        ];
        for (mode, expected) in modes {
            assert_eq!(mode.address(), expected, "{mode:?}");
            assert_ne!(mode.wire_code(), 0);
        }
    }

    #[test]
    fn test_cidr_parse() {
        let c: Cidr = "10.0.1.0/24".parse().unwrap();
        assert_eq!(c.prefix, 24);
        assert_eq!(c.to_string(), "10.0.1.0/24");

        let host: Cidr = "2001:db8::1".parse().unwrap();
        assert_eq!(host.prefix, 128);

        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("not-an-address/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_wire_enum_keywords() {
        assert_eq!(SendCert::from_keyword("ifasked"), Some(SendCert::IfAsked));
        assert_eq!(SendCert::from_keyword("sometimes"), None);
        assert_eq!(PubkeyAlg::Rsa.wire_code(), 2);
        assert_eq!(autostart_code(AutoStart::Start), 5);
    }

    #[test]
    fn test_unspecified_per_family() {
        assert_eq!(
            AddressFamily::Ipv4.unspecified(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert_eq!(
            AddressFamily::Ipv6.unspecified(),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn test_ops_flags() {
        let msg = WhackMessage::with_ops(op::INITIATE | op::ASYNC);
        assert!(msg.has_ops(op::INITIATE));
        assert!(msg.has_ops(op::INITIATE | op::ASYNC));
        assert!(!msg.has_ops(op::ROUTE));
    }
}
