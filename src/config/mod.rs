//! Configuration: command line merged over an optional TOML file

pub mod types;

use crate::{Error, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use types::FileConfig;

/// Tap transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Length-prefixed Unix stream accepted from a hypervisor
    Stream,
    /// tuntap device inside a network namespace
    Ns,
}

/// Fully resolved runtime options.
#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    pub socket_path: Option<String>,
    pub netns: Option<String>,
    pub userns: Option<String>,
    pub netns_only: bool,
    pub ifname: String,
    pub one_off: bool,

    pub addr4: Option<Ipv4Addr>,
    pub gw4: Option<Ipv4Addr>,
    pub dns4: Option<Ipv4Addr>,
    pub dns_match4: Option<Ipv4Addr>,
    pub outbound4: Option<Ipv4Addr>,
    pub outbound_if4: Option<String>,

    pub addr6: Option<Ipv6Addr>,
    pub gw6: Option<Ipv6Addr>,
    pub dns6: Option<Ipv6Addr>,
    pub dns_match6: Option<Ipv6Addr>,
    pub outbound6: Option<Ipv6Addr>,
    pub outbound_if6: Option<String>,

    pub no_map_gw: bool,

    pub tcp_in: String,
    pub tcp_out: String,
    pub udp_in: String,
    pub udp_out: String,

    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: Mode::Stream,
            socket_path: None,
            netns: None,
            userns: None,
            netns_only: false,
            ifname: "tap0".into(),
            one_off: false,
            addr4: None,
            gw4: None,
            dns4: None,
            dns_match4: None,
            outbound4: None,
            outbound_if4: None,
            addr6: None,
            gw6: None,
            dns6: None,
            dns_match6: None,
            outbound6: None,
            outbound_if6: None,
            no_map_gw: false,
            tcp_in: "none".into(),
            tcp_out: "none".into(),
            udp_in: "none".into(),
            udp_out: "none".into(),
            log_level: None,
            log_format: None,
        }
    }
}

/// Load and parse a TOML configuration file.
pub fn load(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
}

fn parse_opt<T: std::str::FromStr>(v: &Option<String>, what: &str) -> Result<Option<T>> {
    match v {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid {what}: {s}"))),
    }
}

impl Options {
    /// Fill unset fields from a configuration file.
    pub fn merge_file(&mut self, file: &FileConfig) -> Result<()> {
        if let Some(mode) = &file.tap.mode {
            self.mode = match mode.as_str() {
                "stream" => Mode::Stream,
                "ns" => Mode::Ns,
                other => return Err(Error::Config(format!("unknown mode: {other}"))),
            };
        }
        if self.socket_path.is_none() {
            self.socket_path = file.tap.socket.clone();
        }
        if self.netns.is_none() {
            self.netns = file.tap.netns.clone();
        }
        if self.userns.is_none() {
            match file.tap.userns.as_deref() {
                Some("none") => self.netns_only = true,
                Some(p) => self.userns = Some(p.to_string()),
                None => {}
            }
        }
        if let Some(ifname) = &file.tap.ifname {
            self.ifname = ifname.clone();
        }
        self.one_off |= file.tap.one_off.unwrap_or(false);

        self.addr4 = self.addr4.or(parse_opt(&file.ip4.addr, "IPv4 address")?);
        self.gw4 = self.gw4.or(parse_opt(&file.ip4.gateway, "IPv4 gateway")?);
        self.dns4 = self.dns4.or(parse_opt(&file.ip4.dns, "IPv4 DNS")?);
        self.dns_match4 = self
            .dns_match4
            .or(parse_opt(&file.ip4.dns_match, "IPv4 DNS match")?);
        self.outbound4 = self
            .outbound4
            .or(parse_opt(&file.ip4.outbound, "IPv4 outbound address")?);
        if self.outbound_if4.is_none() {
            self.outbound_if4 = file.ip4.outbound_if.clone();
        }

        self.addr6 = self.addr6.or(parse_opt(&file.ip6.addr, "IPv6 address")?);
        self.gw6 = self.gw6.or(parse_opt(&file.ip6.gateway, "IPv6 gateway")?);
        self.dns6 = self.dns6.or(parse_opt(&file.ip6.dns, "IPv6 DNS")?);
        self.dns_match6 = self
            .dns_match6
            .or(parse_opt(&file.ip6.dns_match, "IPv6 DNS match")?);
        self.outbound6 = self
            .outbound6
            .or(parse_opt(&file.ip6.outbound, "IPv6 outbound address")?);
        if self.outbound_if6.is_none() {
            self.outbound_if6 = file.ip6.outbound_if.clone();
        }

        self.no_map_gw |=
            file.ip4.no_map_gw.unwrap_or(false) || file.ip6.no_map_gw.unwrap_or(false);

        if let Some(s) = &file.forward.tcp_in {
            self.tcp_in = s.clone();
        }
        if let Some(s) = &file.forward.tcp_out {
            self.tcp_out = s.clone();
        }
        if let Some(s) = &file.forward.udp_in {
            self.udp_in = s.clone();
        }
        if let Some(s) = &file.forward.udp_out {
            self.udp_out = s.clone();
        }

        if self.log_level.is_none() {
            self.log_level = file.log.level.clone();
        }
        if self.log_format.is_none() {
            self.log_format = file.log.format.clone();
        }
        Ok(())
    }

    /// Cross-field validation before startup.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Ns && self.netns.is_none() {
            return Err(Error::Config("ns mode requires a target namespace".into()));
        }
        if self.mode == Mode::Stream && self.netns.is_some() {
            return Err(Error::Config(
                "namespace attach only makes sense in ns mode".into(),
            ));
        }
        if self.addr4.is_none() && self.addr6.is_none() {
            return Err(Error::Config(
                "at least one of IPv4/IPv6 addressing must be configured".into(),
            ));
        }
        if self.addr4.is_some() && self.gw4.is_none() {
            return Err(Error::Config("IPv4 configured without a gateway".into()));
        }
        if self.addr6.is_some() && self.gw6.is_none() {
            return Err(Error::Config("IPv6 configured without a gateway".into()));
        }
        if self.dns_match4.is_some() && self.dns4.is_none() {
            return Err(Error::Config(
                "IPv4 DNS redirection requires a host DNS address".into(),
            ));
        }
        if self.dns_match6.is_some() && self.dns6.is_none() {
            return Err(Error::Config(
                "IPv6 DNS redirection requires a host DNS address".into(),
            ));
        }
        // Auto-discovery scans the peer namespace's procfs
        if self.mode == Mode::Stream {
            for (name, spec) in [
                ("tcp-out", &self.tcp_out),
                ("udp-out", &self.udp_out),
            ] {
                if spec == "auto" {
                    return Err(Error::Config(format!(
                        "{name}=auto requires ns mode"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_base() -> Options {
        Options {
            addr4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            gw4: Some(Ipv4Addr::new(10, 0, 0, 254)),
            ..Options::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        valid_base().validate().unwrap();
    }

    #[test]
    fn test_validate_requires_gateway() {
        let mut o = valid_base();
        o.gw4 = None;
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_validate_ns_mode_needs_netns() {
        let mut o = valid_base();
        o.mode = Mode::Ns;
        assert!(o.validate().is_err());
        o.netns = Some("/run/netns/test".into());
        o.validate().unwrap();
    }

    #[test]
    fn test_validate_auto_needs_ns_mode() {
        let mut o = valid_base();
        o.tcp_out = "auto".into();
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_merge_file() {
        let toml = r#"
            [log]
            level = "debug"

            [tap]
            mode = "ns"
            netns = "/run/netns/peer"

            [ip4]
            addr = "192.168.44.2"
            gateway = "192.168.44.1"

            [forward]
            tcp_in = "22:2222"
        "#;
        let file: FileConfig = toml::from_str(toml).unwrap();
        let mut o = Options::default();
        o.merge_file(&file).unwrap();
        assert_eq!(o.mode, Mode::Ns);
        assert_eq!(o.addr4, Some(Ipv4Addr::new(192, 168, 44, 2)));
        assert_eq!(o.tcp_in, "22:2222");
        assert_eq!(o.log_level.as_deref(), Some("debug"));
        o.validate().unwrap();
    }

    #[test]
    fn test_bad_address_rejected() {
        let toml = r#"
            [ip4]
            addr = "not-an-address"
        "#;
        let file: FileConfig = toml::from_str(toml).unwrap();
        let mut o = Options::default();
        assert!(o.merge_file(&file).is_err());
    }
}
