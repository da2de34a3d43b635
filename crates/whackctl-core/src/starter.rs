//! Translation of configured connections into control messages.
//!
//! [`add_conn_message`] builds the "add connection" request for a
//! [`ConnConfig`]; [`pubkey_message`] builds the follow-up key upload for
//! one end. Both only translate: nothing here touches the socket.

use std::borrow::Cow;
use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, error};
use whackctl_config::{ConnConfig, EndConfig};

use crate::error::{Result, WhackError};
use crate::message::{
    AddressFamily, Cidr, DpdAction, Eap, EncapMode, EndAuth, Encapsulation, HostSelector,
    PubkeyAlg, SendCa, SendCert, TcpMode, WhackEnd, WhackMessage, op,
};
use crate::pubkey;

/// Largest reqid that may be assigned by hand.
pub const IPSEC_MANUAL_REQID_MAX: i64 = 0x3fff;

/// Name the connection is known by: `%auto` becomes `conn_<id>`.
pub fn connection_name(name: &str, id: u64) -> Cow<'_, str> {
    if name == "%auto" {
        Cow::Owned(format!("conn_{id}"))
    } else {
        Cow::Borrowed(name)
    }
}

/// Resolve an end's `host` setting into an address-selection mode.
pub fn host_selector(side: &str, end: &EndConfig) -> Result<HostSelector> {
    let host = match end.host.as_deref() {
        Some(h) if !h.is_empty() => h,
        _ => {
            return Err(WhackError::EndpointUnset {
                side: side.to_string(),
            });
        }
    };

    let selector = match host {
        "%defaultroute" => HostSelector::DefaultRoute,
        "%any" => HostSelector::Any,
        "%opportunistic" => HostSelector::Opportunistic,
        "%group" => HostSelector::Group,
        "%opportunisticgroup" => HostSelector::OpportunisticGroup,
        _ if end.is_interface_host() => {
            let text = end.interface_addr.as_deref().unwrap_or_default();
            let addr = text.parse().map_err(|e| WhackError::InvalidValue {
                conn: String::new(),
                key: format!("{side}.interface_addr"),
                value: text.to_string(),
                reason: format!("{e}"),
            })?;
            HostSelector::Interface {
                name: host[1..].to_string(),
                addr,
            }
        }
        _ => match host.parse::<IpAddr>() {
            Ok(addr) => HostSelector::Address(addr),
            Err(_) => HostSelector::Hostname(host.to_string()),
        },
    };
    Ok(selector)
}

/// Address family an end lives in: its host address, else its next hop,
/// else IPv4.
fn end_family(end: &EndConfig) -> AddressFamily {
    [end.host.as_deref(), end.interface_addr.as_deref(), end.nexthop.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|s| s.parse::<IpAddr>().ok())
        .map_or(AddressFamily::Ipv4, |a| AddressFamily::of(&a))
}

/// Collects translation failures against one connection.
struct Translator<'a> {
    conn: &'a str,
}

impl Translator<'_> {
    fn invalid(&self, key: &str, value: &str, reason: impl Into<String>) -> WhackError {
        WhackError::InvalidValue {
            conn: self.conn.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn keyword<T>(
        &self,
        key: &str,
        value: Option<&str>,
        parse: fn(&str) -> Option<T>,
    ) -> Result<Option<T>> {
        value
            .map(|v| parse(v).ok_or_else(|| self.invalid(key, v, "unknown keyword")))
            .transpose()
    }

    fn cidr(&self, key: &str, value: Option<&str>) -> Result<Option<Cidr>> {
        value
            .map(|v| v.parse::<Cidr>().map_err(|reason| self.invalid(key, v, reason)))
            .transpose()
    }

    /// Log a string option that is copied into the message.
    fn log_val(&self, key: &str, value: Option<&str>) {
        if let Some(value) = value {
            debug!(conn = self.conn, key, value, "conn option");
        }
    }

    fn end(&self, side: &str, end: &EndConfig) -> Result<WhackEnd> {
        let host = host_selector(side, end).map_err(|e| match e {
            WhackError::InvalidValue {
                key, value, reason, ..
            } => self.invalid(&key, &value, reason),
            other => other,
        })?;
        let family = end_family(end);

        let nexthop = match end.nexthop.as_deref() {
            None | Some("%defaultroute") => Some(family.unspecified()),
            Some(text) => Some(
                text.parse::<IpAddr>()
                    .map_err(|e| self.invalid(&format!("{side}.nexthop"), text, e.to_string()))?,
            ),
        };

        // only pre-exchanged keys travel with the connection
        let mut pubkey_alg = None;
        let mut pubkey = None;
        let mut key_from_dns_on_demand = false;
        if let Some((key, text)) = end.pubkey_setting() {
            match text {
                "%dnsondemand" => key_from_dns_on_demand = true,
                "%cert" => {}
                _ => {
                    pubkey_alg = PubkeyAlg::from_keyword(key);
                    pubkey = Some(text.to_string());
                }
            }
        }

        let key = |name: &str| format!("{side}.{name}");
        Ok(WhackEnd {
            leftright: Some(side.to_string()),
            id: end.id.clone(),
            host_addr_name: end.host.clone(),
            host: Some(host),
            nexthop,
            sourceip: end.sourceip.clone(),
            host_vtiip: self.cidr(&key("vti_ip"), end.vti_ip.as_deref())?,
            ifaceip: self.cidr(&key("interface_ip"), end.interface_ip.as_deref())?,
            subnet: self.cidr(&key("subnet"), end.subnet.as_deref())?,
            subnets: end.subnets.clone(),
            ikeport: end.ikeport.unwrap_or(0),
            protoport: end.protoport.clone(),
            cert: end.cert.clone(),
            ckaid: end.ckaid.clone(),
            ca: end.ca.clone(),
            pubkey_alg,
            pubkey,
            sendcert: Some(
                self.keyword(&key("sendcert"), end.sendcert.as_deref(), SendCert::from_keyword)?
                    .unwrap_or(SendCert::Always),
            ),
            auth: self.keyword(&key("auth"), end.auth.as_deref(), EndAuth::from_keyword)?,
            eap: Some(
                self.keyword(&key("eap"), end.eap.as_deref(), Eap::from_keyword)?
                    .unwrap_or(Eap::None),
            ),
            updown: end.updown.clone(),
            virt: end.virt.clone(),
            key_from_dns_on_demand,
            xauth_server: end.xauth_server,
            xauth_client: end.xauth_client,
            xauth_username: end.username.clone(),
            groundhog: end.groundhog.clone(),
            modecfg_server: end.modecfg_server,
            modecfg_client: end.modecfg_client,
            cat: end.cat,
            addresspool: end.addresspool.clone(),
        })
    }
}

/// Translate one end of a connection.
pub fn whack_end(side: &str, end: &EndConfig) -> Result<WhackEnd> {
    Translator { conn: "" }.end(side, end)
}

/// Build the "add connection" request for `conn`.
pub fn add_conn_message(conn: &ConnConfig) -> Result<WhackMessage> {
    let name = connection_name(&conn.name, conn.id);
    let t = Translator { conn: &name };

    let mut msg = WhackMessage::with_ops(op::ADD_CONN);
    msg.name = Some(name.to_string());

    msg.left = t.end("left", &conn.left)?;
    msg.right = t.end("right", &conn.right)?;

    msg.host_afi = Some(end_family(&conn.left));
    msg.child_afi = [&conn.left.subnet, &conn.right.subnet]
        .into_iter()
        .flatten()
        .find_map(|s| s.parse::<Cidr>().ok())
        .map(|c| AddressFamily::of(&c.addr))
        .or(msg.host_afi);

    if let Some(HostSelector::Hostname(host)) = &msg.right.host {
        msg.dnshostname = Some(host.clone());
    }

    msg.ike_version = conn.ike_version.unwrap_or(2);
    msg.autostart = Some(conn.autostart());
    msg.encap_mode = t.keyword("type", conn.conn_type.as_deref(), EncapMode::from_keyword)?;
    msg.pfs = conn.pfs;
    msg.compress = conn.compress;

    msg.ikelifetime = conn.ikelifetime_ms.map(Duration::from_millis);
    msg.ipsec_lifetime = conn.ipsec_lifetime_ms.map(Duration::from_millis);
    msg.rekey_margin = Duration::from_millis(conn.rekeymargin_ms);
    msg.rekeyfuzz_percent = conn.rekeyfuzz;
    msg.ipsec_max_bytes = conn.ipsec_max_bytes;
    msg.ipsec_max_packets = conn.ipsec_max_packets;
    msg.keyingtries = conn.keyingtries;
    msg.replay_window = conn.replay_window;
    msg.retransmit_interval = Duration::from_millis(conn.retransmit_interval_ms);
    msg.retransmit_timeout = Duration::from_millis(conn.retransmit_timeout_ms);

    msg.mtu = conn.mtu;
    msg.priority = conn.priority;
    msg.tfc = conn.tfc;
    msg.nflog_group = conn.nflog_group;

    if let Some(reqid) = conn.reqid {
        if (1..=IPSEC_MANUAL_REQID_MAX).contains(&reqid) {
            msg.reqid = u32::try_from(reqid).ok();
        } else {
            error!(
                conn = %name,
                reqid,
                "Ignoring reqid value - range must be 1-{IPSEC_MANUAL_REQID_MAX}"
            );
        }
    }

    msg.tcp_remoteport = conn.tcp_remoteport;
    msg.enable_tcp = t.keyword("enable_tcp", conn.enable_tcp.as_deref(), TcpMode::from_keyword)?;
    msg.dpd_action = t.keyword("dpdaction", conn.dpdaction.as_deref(), DpdAction::from_keyword)?;
    msg.dpd_delay = conn.dpddelay_ms.map(Duration::from_millis);
    msg.dpd_timeout = conn.dpdtimeout_ms.map(Duration::from_millis);
    msg.send_ca = Some(
        t.keyword("send_ca", conn.send_ca.as_deref(), SendCa::from_keyword)?
            .unwrap_or(SendCa::None),
    );
    msg.encapsulation = t.keyword(
        "encapsulation",
        conn.encapsulation.as_deref(),
        Encapsulation::from_keyword,
    )?;
    msg.nat_keepalive = conn.nat_keepalive.unwrap_or(true);

    msg.mobike = conn.mobike;
    msg.intermediate = conn.intermediate;
    msg.aggressive = conn.aggressive;
    msg.narrowing = conn.narrowing;
    msg.rekey = conn.rekey;
    msg.reauth = conn.reauth;

    let strings: [(&str, &Option<String>, &mut Option<String>); 15] = [
        ("ipsec-interface", &conn.ipsec_interface, &mut msg.ipsec_interface),
        ("sec_label", &conn.sec_label, &mut msg.sec_label),
        ("modecfgdns", &conn.modecfg_dns, &mut msg.modecfg_dns),
        ("modecfgdomains", &conn.modecfg_domains, &mut msg.modecfg_domains),
        ("modecfgbanner", &conn.modecfg_banner, &mut msg.modecfg_banner),
        ("mark", &conn.mark, &mut msg.conn_mark_both),
        ("mark-in", &conn.mark_in, &mut msg.conn_mark_in),
        ("mark-out", &conn.mark_out, &mut msg.conn_mark_out),
        ("vti-interface", &conn.vti_interface, &mut msg.vti_interface),
        ("ppk-ids", &conn.ppk_ids, &mut msg.ppk_ids),
        ("redirect-to", &conn.redirect_to, &mut msg.redirect_to),
        ("accept-redirect-to", &conn.accept_redirect_to, &mut msg.accept_redirect_to),
        ("connalias", &conn.connalias, &mut msg.connalias),
        ("esp", &conn.esp, &mut msg.esp),
        ("ike", &conn.ike, &mut msg.ike),
    ];
    for (key, value, field) in strings {
        t.log_val(key, value.as_deref());
        *field = value.clone();
    }

    Ok(msg)
}

/// Build the key upload for one end, if that end carries a pre-exchanged
/// key and an id to file it under.
///
/// Keys taken from DNS or from a certificate are the daemon's business and
/// yield `None`.
pub fn pubkey_message(conn: &ConnConfig, side: &str, end: &EndConfig) -> Result<Option<WhackMessage>> {
    let name = connection_name(&conn.name, conn.id);
    let Some((key, text)) = end.pubkey_setting() else {
        return Ok(None);
    };
    let Some(id) = end.id.as_deref() else {
        debug!(conn = %name, side, "no id, {side}{key} not sent");
        return Ok(None);
    };

    match text {
        "%dnsondemand" => {
            debug!("conn {name}/{side} has key from DNS");
            return Ok(None);
        }
        "%cert" => {
            debug!("conn {name}/{side} has key from certificate");
            return Ok(None);
        }
        _ => {}
    }

    let alg = PubkeyAlg::from_keyword(key).ok_or_else(|| WhackError::InvalidValue {
        conn: name.to_string(),
        key: format!("{side}.{key}"),
        value: text.to_string(),
        reason: "unknown key algorithm".to_string(),
    })?;
    let keyval = pubkey::decode(alg, text).map_err(|reason| WhackError::MalformedPubkey {
        conn: name.to_string(),
        side: side.to_string(),
        alg: key,
        reason,
    })?;
    debug!("\tsending {name} {side}{key}={text}");

    let mut msg = WhackMessage::with_ops(op::KEY);
    msg.keyid = Some(id.to_string());
    msg.pubkey_alg = Some(alg);
    msg.keyval = Some(keyval);
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use whackctl_config::AutoStart;

    fn end(host: &str) -> EndConfig {
        EndConfig {
            host: Some(host.to_string()),
            ..Default::default()
        }
    }

    fn conn(left: &str, right: &str) -> ConnConfig {
        let mut c = ConnConfig::named("home");
        c.left = end(left);
        c.right = end(right);
        c
    }

    #[test]
    fn test_connection_name() {
        assert_eq!(connection_name("home", 7), "home");
        assert_eq!(connection_name("%auto", 7), "conn_7");
        assert!(matches!(connection_name("home", 1), Cow::Borrowed(_)));
    }

    #[test]
    fn test_host_selector_modes() {
        let cases = [
            ("%defaultroute", HostSelector::DefaultRoute),
            ("%any", HostSelector::Any),
            ("%opportunistic", HostSelector::Opportunistic),
            ("%group", HostSelector::Group),
            ("%opportunisticgroup", HostSelector::OpportunisticGroup),
            (
                "192.0.2.1",
                HostSelector::Address(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            ),
            ("2001:db8::1", HostSelector::Address("2001:db8::1".parse().unwrap())),
            (
                "vpn.example.com",
                HostSelector::Hostname("vpn.example.com".to_string()),
            ),
        ];
        for (host, expected) in cases {
            assert_eq!(host_selector("left", &end(host)).unwrap(), expected, "{host}");
        }

        let mut iface = end("%eth0");
        iface.interface_addr = Some("198.51.100.4".to_string());
        assert_eq!(
            host_selector("left", &iface).unwrap(),
            HostSelector::Interface {
                name: "eth0".to_string(),
                addr: "198.51.100.4".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_missing_host_is_endpoint_unset() {
        let err = whack_end("right", &EndConfig::default()).unwrap_err();
        assert_eq!(err.to_string(), "Failed to load connection right= is not set");
        assert_eq!(err.status(), crate::error::CLIENT_FAILURE);
    }

    #[test]
    fn test_non_address_modes_leave_address_unset() {
        for host in ["%defaultroute", "%any", "%group", "vpn.example.com"] {
            let w = whack_end("left", &end(host)).unwrap();
            assert_eq!(w.host.as_ref().and_then(HostSelector::address), None, "{host}");
            assert_eq!(w.host_addr_name.as_deref(), Some(host));
        }
    }

    #[test]
    fn test_nexthop_defaults_to_unspecified_of_family() {
        let w = whack_end("left", &end("%defaultroute")).unwrap();
        assert_eq!(w.nexthop, Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));

        let w = whack_end("left", &end("2001:db8::1")).unwrap();
        assert_eq!(w.nexthop, Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)));

        let mut e = end("192.0.2.1");
        e.nexthop = Some("192.0.2.254".to_string());
        let w = whack_end("left", &e).unwrap();
        assert_eq!(w.nexthop, Some("192.0.2.254".parse().unwrap()));

        e.nexthop = Some("gateway".to_string());
        assert!(matches!(
            whack_end("left", &e),
            Err(WhackError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_end_defaults() {
        let w = whack_end("left", &end("%any")).unwrap();
        assert_eq!(w.sendcert, Some(SendCert::Always));
        assert_eq!(w.eap, Some(Eap::None));
        assert_eq!(w.auth, None);
        assert_eq!(w.leftright.as_deref(), Some("left"));
    }

    #[test]
    fn test_only_preexchanged_keys_travel_with_the_end() {
        let mut e = end("%any");
        e.rsasigkey = Some("0sAwEAAQ==".to_string());
        let w = whack_end("left", &e).unwrap();
        assert_eq!(w.pubkey_alg, Some(PubkeyAlg::Rsa));
        assert_eq!(w.pubkey.as_deref(), Some("0sAwEAAQ=="));

        e.rsasigkey = Some("%cert".to_string());
        let w = whack_end("left", &e).unwrap();
        assert_eq!(w.pubkey, None);
        assert!(!w.key_from_dns_on_demand);

        e.rsasigkey = Some("%dnsondemand".to_string());
        let w = whack_end("left", &e).unwrap();
        assert!(w.key_from_dns_on_demand);
    }

    #[test]
    fn test_add_conn_message_defaults() {
        let msg = add_conn_message(&conn("%defaultroute", "%defaultroute")).unwrap();
        assert!(msg.has_ops(op::ADD_CONN));
        assert_eq!(msg.name.as_deref(), Some("home"));
        assert_eq!(msg.ike_version, 2);
        assert_eq!(msg.autostart, Some(AutoStart::Ignore));
        assert_eq!(msg.send_ca, Some(SendCa::None));
        assert_eq!(msg.dpd_action, None);
        assert!(msg.nat_keepalive);
        assert_eq!(msg.rekey_margin, Duration::from_secs(540));
        assert_eq!(msg.retransmit_interval, Duration::from_millis(500));
        assert_eq!(msg.host_afi, Some(AddressFamily::Ipv4));
        assert_eq!(msg.dnshostname, None);
    }

    #[test]
    fn test_add_conn_message_options() {
        let mut c = conn("192.0.2.1", "vpn.example.com");
        c.name = "%auto".to_string();
        c.id = 12;
        c.conn_type = Some("transport".to_string());
        c.ikelifetime_ms = Some(3_600_000);
        c.dpdaction = Some("restart".to_string());
        c.nat_keepalive = Some(false);
        c.mark = Some("5/0xffffffff".to_string());
        c.esp = Some("aes_gcm256".to_string());
        c.left.subnet = Some("10.0.1.0/24".to_string());

        let msg = add_conn_message(&c).unwrap();
        assert_eq!(msg.name.as_deref(), Some("conn_12"));
        assert_eq!(msg.encap_mode, Some(EncapMode::Transport));
        assert_eq!(msg.ikelifetime, Some(Duration::from_secs(3600)));
        assert_eq!(msg.dpd_action, Some(DpdAction::Restart));
        assert!(!msg.nat_keepalive);
        assert_eq!(msg.conn_mark_both.as_deref(), Some("5/0xffffffff"));
        assert_eq!(msg.esp.as_deref(), Some("aes_gcm256"));
        assert_eq!(msg.dnshostname.as_deref(), Some("vpn.example.com"));
        assert_eq!(msg.child_afi, Some(AddressFamily::Ipv4));
        assert_eq!(msg.left.subnet, Some("10.0.1.0/24".parse().unwrap()));
    }

    #[test]
    fn test_reqid_range() {
        let mut c = conn("%any", "%any");
        c.reqid = Some(100);
        assert_eq!(add_conn_message(&c).unwrap().reqid, Some(100));

        for bad in [0, -4, IPSEC_MANUAL_REQID_MAX + 1] {
            c.reqid = Some(bad);
            assert_eq!(add_conn_message(&c).unwrap().reqid, None, "{bad}");
        }
    }

    #[test]
    fn test_unknown_keyword_is_invalid_value() {
        let mut c = conn("%any", "%any");
        c.right.sendcert = Some("sometimes".to_string());
        match add_conn_message(&c).unwrap_err() {
            WhackError::InvalidValue { conn, key, value, .. } => {
                assert_eq!(conn, "home");
                assert_eq!(key, "right.sendcert");
                assert_eq!(value, "sometimes");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_bad_subnet_names_the_connection() {
        let mut c = conn("%any", "%any");
        c.left.subnet = Some("10.0.0.0/40".to_string());
        assert!(matches!(
            add_conn_message(&c),
            Err(WhackError::InvalidValue { ref conn, .. }) if conn == "home"
        ));
    }

    #[test]
    fn test_pubkey_message_for_preexchanged_key() {
        let mut c = conn("%any", "%any");
        c.left.id = Some("@west".to_string());
        c.left.rsasigkey = Some("0x03010001".to_string());

        let msg = pubkey_message(&c, "left", &c.left).unwrap().unwrap();
        assert!(msg.has_ops(op::KEY));
        assert_eq!(msg.keyid.as_deref(), Some("@west"));
        assert_eq!(msg.pubkey_alg, Some(PubkeyAlg::Rsa));
        assert_eq!(msg.keyval, Some(vec![0x03, 0x01, 0x00, 0x01]));
    }

    #[test]
    fn test_pubkey_message_skips_indirect_keys() {
        let mut c = conn("%any", "%any");
        c.left.id = Some("@west".to_string());
        for key in ["%cert", "%dnsondemand"] {
            c.left.ecdsakey = Some(key.to_string());
            assert_eq!(pubkey_message(&c, "left", &c.left).unwrap(), None);
        }

        // no id to file the key under
        c.right.pubkey = Some("AwEAAQ==".to_string());
        assert_eq!(pubkey_message(&c, "right", &c.right).unwrap(), None);
    }

    #[test]
    fn test_malformed_pubkey() {
        let mut c = conn("%any", "%any");
        c.right.id = Some("@east".to_string());
        c.right.rsasigkey = Some("0xnothex".to_string());
        let err = pubkey_message(&c, "right", &c.right).unwrap_err();
        assert_eq!(err.status(), 1);
        assert!(err.to_string().starts_with("conn home: rightrsasigkey malformed ["));
    }
}
