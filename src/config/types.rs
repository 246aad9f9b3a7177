//! Optional TOML configuration file types
//!
//! Everything here can also be given on the command line; file values fill in
//! whatever the command line leaves unset.

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub tap: TapSection,
    #[serde(default)]
    pub ip4: IpSection,
    #[serde(default)]
    pub ip6: IpSection,
    #[serde(default)]
    pub forward: ForwardSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    /// error, warn, info, debug, trace
    pub level: Option<String>,
    /// pretty, compact, json
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TapSection {
    /// "stream" or "ns"
    pub mode: Option<String>,
    /// Unix socket path (stream mode)
    pub socket: Option<String>,
    /// Network namespace: PID or path (ns mode)
    pub netns: Option<String>,
    /// User namespace path, or "none" to attach the netns only
    pub userns: Option<String>,
    /// Interface name inside the namespace
    pub ifname: Option<String>,
    /// Exit after the first tap client disconnects (stream mode)
    pub one_off: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpSection {
    pub addr: Option<String>,
    pub gateway: Option<String>,
    pub dns: Option<String>,
    /// Address presented to the guest for DNS redirection
    pub dns_match: Option<String>,
    /// Outbound bind address
    pub outbound: Option<String>,
    /// Outbound bind interface
    pub outbound_if: Option<String>,
    /// Disable gateway-to-loopback mapping
    pub no_map_gw: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardSection {
    pub tcp_in: Option<String>,
    pub tcp_out: Option<String>,
    pub udp_in: Option<String>,
    pub udp_out: Option<String>,
}
