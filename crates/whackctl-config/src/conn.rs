//! Connection definitions as written in the `[[conn]]` tables.
//!
//! Values are kept close to their textual form here; the core crate turns
//! them into typed wire records (addresses, durations, enums) and reports
//! anything it cannot interpret.

use serde::{Deserialize, Serialize};

/// Host keywords that select an address mode instead of naming an address.
pub const HOST_KEYWORDS: &[&str] = &[
    "%defaultroute",
    "%any",
    "%opportunistic",
    "%group",
    "%opportunisticgroup",
];

/// When a connection is acted upon by `autostart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AutoStart {
    Ignore,
    Add,
    Route,
    OnDemand,
    Start,
}

impl AutoStart {
    /// Parse the `auto=` keyword.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "ignore" => Some(Self::Ignore),
            "add" => Some(Self::Add),
            "route" => Some(Self::Route),
            "ondemand" => Some(Self::OnDemand),
            "start" => Some(Self::Start),
            _ => None,
        }
    }
}

/// One `[[conn]]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnConfig {
    /// Connection name; `%auto` asks for a synthesized `conn_<id>` name.
    pub name: String,

    /// Numeric id used when the name is `%auto`. Defaults to the 1-based
    /// position of the table in the file.
    #[serde(default)]
    pub id: u64,

    /// `ignore`, `add`, `route`, `ondemand` or `start`.
    #[serde(default = "default_auto")]
    pub auto: String,

    /// Encapsulation: `tunnel` or `transport`.
    #[serde(default, rename = "type")]
    pub conn_type: Option<String>,

    /// IKE major version (1 or 2).
    #[serde(default)]
    pub ike_version: Option<u8>,

    #[serde(default)]
    pub ikelifetime_ms: Option<u64>,

    #[serde(default)]
    pub ipsec_lifetime_ms: Option<u64>,

    #[serde(default = "default_rekeymargin_ms")]
    pub rekeymargin_ms: u64,

    #[serde(default = "default_rekeyfuzz")]
    pub rekeyfuzz: u32,

    #[serde(default)]
    pub ipsec_max_bytes: Option<u64>,

    #[serde(default)]
    pub ipsec_max_packets: Option<u64>,

    #[serde(default)]
    pub keyingtries: Option<u32>,

    #[serde(default = "default_replay_window")]
    pub replay_window: u32,

    #[serde(default = "default_retransmit_interval_ms")]
    pub retransmit_interval_ms: u64,

    #[serde(default = "default_retransmit_timeout_ms")]
    pub retransmit_timeout_ms: u64,

    #[serde(default)]
    pub pfs: Option<bool>,

    #[serde(default)]
    pub compress: Option<bool>,

    #[serde(default)]
    pub mtu: Option<u32>,

    #[serde(default)]
    pub priority: Option<u32>,

    #[serde(default)]
    pub tfc: Option<u32>,

    #[serde(default)]
    pub nflog_group: Option<u32>,

    /// Manual reqid; out-of-range values are ignored with an error log.
    #[serde(default)]
    pub reqid: Option<i64>,

    #[serde(default)]
    pub tcp_remoteport: Option<u16>,

    /// `no`, `yes` or `fallback`.
    #[serde(default)]
    pub enable_tcp: Option<String>,

    /// `clear`, `hold` or `restart`.
    #[serde(default)]
    pub dpdaction: Option<String>,

    #[serde(default)]
    pub dpddelay_ms: Option<u64>,

    #[serde(default)]
    pub dpdtimeout_ms: Option<u64>,

    /// `none`, `issuer` or `all`.
    #[serde(default)]
    pub send_ca: Option<String>,

    /// `yes`, `no` or `auto`.
    #[serde(default)]
    pub encapsulation: Option<String>,

    #[serde(default)]
    pub nat_keepalive: Option<bool>,

    #[serde(default)]
    pub mobike: Option<bool>,

    #[serde(default)]
    pub intermediate: Option<bool>,

    #[serde(default)]
    pub aggressive: Option<bool>,

    #[serde(default)]
    pub narrowing: Option<bool>,

    #[serde(default)]
    pub rekey: Option<bool>,

    #[serde(default)]
    pub reauth: Option<bool>,

    #[serde(default)]
    pub ipsec_interface: Option<String>,

    #[serde(default)]
    pub sec_label: Option<String>,

    #[serde(default)]
    pub modecfg_dns: Option<String>,

    #[serde(default)]
    pub modecfg_domains: Option<String>,

    #[serde(default)]
    pub modecfg_banner: Option<String>,

    #[serde(default)]
    pub mark: Option<String>,

    #[serde(default)]
    pub mark_in: Option<String>,

    #[serde(default)]
    pub mark_out: Option<String>,

    #[serde(default)]
    pub vti_interface: Option<String>,

    #[serde(default)]
    pub ppk_ids: Option<String>,

    #[serde(default)]
    pub redirect_to: Option<String>,

    #[serde(default)]
    pub accept_redirect_to: Option<String>,

    #[serde(default)]
    pub connalias: Option<String>,

    /// Phase 2 proposal list.
    #[serde(default)]
    pub esp: Option<String>,

    /// IKE proposal list.
    #[serde(default)]
    pub ike: Option<String>,

    #[serde(default)]
    pub left: EndConfig,

    #[serde(default)]
    pub right: EndConfig,
}

impl ConnConfig {
    /// A connection with the given name and every option at its default.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: 0,
            auto: default_auto(),
            conn_type: None,
            ike_version: None,
            ikelifetime_ms: None,
            ipsec_lifetime_ms: None,
            rekeymargin_ms: default_rekeymargin_ms(),
            rekeyfuzz: default_rekeyfuzz(),
            ipsec_max_bytes: None,
            ipsec_max_packets: None,
            keyingtries: None,
            replay_window: default_replay_window(),
            retransmit_interval_ms: default_retransmit_interval_ms(),
            retransmit_timeout_ms: default_retransmit_timeout_ms(),
            pfs: None,
            compress: None,
            mtu: None,
            priority: None,
            tfc: None,
            nflog_group: None,
            reqid: None,
            tcp_remoteport: None,
            enable_tcp: None,
            dpdaction: None,
            dpddelay_ms: None,
            dpdtimeout_ms: None,
            send_ca: None,
            encapsulation: None,
            nat_keepalive: None,
            mobike: None,
            intermediate: None,
            aggressive: None,
            narrowing: None,
            rekey: None,
            reauth: None,
            ipsec_interface: None,
            sec_label: None,
            modecfg_dns: None,
            modecfg_domains: None,
            modecfg_banner: None,
            mark: None,
            mark_in: None,
            mark_out: None,
            vti_interface: None,
            ppk_ids: None,
            redirect_to: None,
            accept_redirect_to: None,
            connalias: None,
            esp: None,
            ike: None,
            left: EndConfig::default(),
            right: EndConfig::default(),
        }
    }

    /// The parsed `auto=` value, `Ignore` when unrecognised.
    pub fn autostart(&self) -> AutoStart {
        AutoStart::from_keyword(&self.auto).unwrap_or(AutoStart::Ignore)
    }
}

fn default_auto() -> String {
    "ignore".to_string()
}

fn default_rekeymargin_ms() -> u64 {
    540_000 // 9 minutes
}

fn default_rekeyfuzz() -> u32 {
    100
}

fn default_replay_window() -> u32 {
    128
}

fn default_retransmit_interval_ms() -> u64 {
    500
}

fn default_retransmit_timeout_ms() -> u64 {
    60_000
}

/// One side (`left` / `right`) of a connection.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EndConfig {
    /// Address, hostname, `%<iface>` or one of [`HOST_KEYWORDS`].
    #[serde(default)]
    pub host: Option<String>,

    /// Resolved address of the interface when `host` is `%<iface>`.
    #[serde(default)]
    pub interface_addr: Option<String>,

    /// Address or `%defaultroute`.
    #[serde(default)]
    pub nexthop: Option<String>,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub sourceip: Option<String>,

    #[serde(default)]
    pub vti_ip: Option<String>,

    #[serde(default)]
    pub interface_ip: Option<String>,

    #[serde(default)]
    pub subnet: Option<String>,

    #[serde(default)]
    pub subnets: Option<String>,

    #[serde(default)]
    pub ikeport: Option<u16>,

    #[serde(default)]
    pub protoport: Option<String>,

    #[serde(default)]
    pub cert: Option<String>,

    #[serde(default)]
    pub ckaid: Option<String>,

    #[serde(default)]
    pub ca: Option<String>,

    #[serde(default)]
    pub updown: Option<String>,

    #[serde(default)]
    pub virt: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub groundhog: Option<String>,

    #[serde(default)]
    pub addresspool: Option<String>,

    /// RSA public key, `%cert` or `%dnsondemand`.
    #[serde(default)]
    pub rsasigkey: Option<String>,

    /// ECDSA public key, `%cert` or `%dnsondemand`.
    #[serde(default)]
    pub ecdsakey: Option<String>,

    /// Raw base64 public key.
    #[serde(default)]
    pub pubkey: Option<String>,

    /// `always`, `ifasked` or `never`.
    #[serde(default)]
    pub sendcert: Option<String>,

    /// `rsasig`, `ecdsa`, `secret`, `null` or `eaponly`.
    #[serde(default)]
    pub auth: Option<String>,

    /// `none` or `tls`.
    #[serde(default)]
    pub eap: Option<String>,

    #[serde(default)]
    pub xauth_server: Option<bool>,

    #[serde(default)]
    pub xauth_client: Option<bool>,

    #[serde(default)]
    pub modecfg_server: Option<bool>,

    #[serde(default)]
    pub modecfg_client: Option<bool>,

    #[serde(default)]
    pub cat: Option<bool>,
}

impl EndConfig {
    /// Whether `host` names a local interface (`%eth0` style).
    pub fn is_interface_host(&self) -> bool {
        self.host
            .as_deref()
            .is_some_and(|h| h.len() > 1 && h.starts_with('%') && !HOST_KEYWORDS.contains(&h))
    }

    /// Public key text and the option it came from, if any key is set.
    pub fn pubkey_setting(&self) -> Option<(&'static str, &str)> {
        [
            ("rsasigkey", &self.rsasigkey),
            ("ecdsakey", &self.ecdsakey),
            ("pubkey", &self.pubkey),
        ]
        .into_iter()
        .find_map(|(key, value)| value.as_deref().map(|v| (key, v)))
    }

    pub(crate) fn pubkey_count(&self) -> usize {
        [&self.rsasigkey, &self.ecdsakey, &self.pubkey]
            .iter()
            .filter(|v| v.is_some())
            .count()
    }
}
