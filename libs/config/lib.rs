//! Resolves the effective [`Configuration`] the way `systemd-resolved` does: a main
//! `resolved.conf`, drop-ins that accumulate on top of it, and — if no `DNS=` ends up
//! configured — a discovery chain through `networkctl`, `/etc/resolv.conf`, and finally
//! promoting the first `FallbackDNS` entry.

use std::{
    fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    path::{Path, PathBuf},
    process::Command,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/systemd/resolved.conf";
pub const DEFAULT_DROP_IN_DIR: &str = "/etc/systemd/resolved.conf.d";
pub const DEFAULT_RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
pub const DEFAULT_BIND_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 53);
const DEFAULT_PORT: u16 = 53;

/// The immutable, fully-resolved configuration the rest of the proxy runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub dns: Vec<SocketAddr>,
    pub fallback_dns: Vec<SocketAddr>,
    pub cache: bool,
    pub dns_stub_listener: bool,
    pub dns_stub_listener_extra: Vec<SocketAddr>,
    pub bind_address: IpAddr,
    /// A human-readable note about a non-fatal decision made while resolving the
    /// configuration (e.g. fallback promotion). Surfaced once at startup.
    pub warning: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{0}` is not a valid DNS server endpoint")]
    InvalidEndpoint(String),
    #[error("`{0}` is not a valid bind address")]
    InvalidBindAddress(String),
    #[error(
        "No DNS configured. Checked `DNS=`, `networkctl status`, `/etc/resolv.conf` and `FallbackDNS=`, all empty."
    )]
    NoDnsConfigured,
}

/// A source of nameservers discovered outside of `resolved.conf` itself.
///
/// Exists so tests can stub out `networkctl` without spawning a subprocess; the only
/// production implementation is [`SystemNetworkctl`].
pub trait NetworkctlSource {
    fn status(&self) -> Option<String>;
}

/// Spawns the real `networkctl status` binary.
pub struct SystemNetworkctl;

impl NetworkctlSource for SystemNetworkctl {
    fn status(&self) -> Option<String> {
        let output = Command::new("networkctl").arg("status").output().ok()?;

        if !output.status.success() {
            tracing::debug!(status = %output.status, "`networkctl status` did not exit successfully");
            return None;
        }

        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Resolves a [`Configuration`] from a main config file, its drop-ins, and the
/// discovery chain described in `resolved.conf`'s documentation.
pub struct ConfigParser {
    pub config_path: PathBuf,
    pub drop_in_dir: PathBuf,
    pub resolv_conf_path: PathBuf,
    pub networkctl: Box<dyn NetworkctlSource + Send + Sync>,
}

impl Default for ConfigParser {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            drop_in_dir: PathBuf::from(DEFAULT_DROP_IN_DIR),
            resolv_conf_path: PathBuf::from(DEFAULT_RESOLV_CONF_PATH),
            networkctl: Box::new(SystemNetworkctl),
        }
    }
}

impl ConfigParser {
    pub fn with_config_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            ..Self::default()
        }
    }

    pub fn resolve(&self) -> Result<Configuration, ConfigError> {
        let mut raw = RawConfig::default();

        if let Ok(text) = fs::read_to_string(&self.config_path) {
            raw.merge_ini(&text);
        } else {
            tracing::debug!(path = %self.config_path.display(), "No main config file, using defaults");
        }

        for drop_in in self.drop_ins() {
            match fs::read_to_string(&drop_in) {
                Ok(text) => raw.merge_ini(&text),
                Err(error) => {
                    tracing::warn!(path = %drop_in.display(), %error, "Failed to read drop-in, skipping")
                }
            }
        }

        let dns = parse_endpoints(&raw.dns)?;
        let fallback_dns = parse_endpoints(&raw.fallback_dns)?;
        let dns_stub_listener_extra = parse_endpoints(&raw.dns_stub_listener_extra)?;

        let (dns, warning) = if dns.is_empty() {
            self.discover_dns(&fallback_dns)?
        } else {
            (dns, None)
        };

        let bind_address = match raw.bind_address {
            Some(s) => s
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddress(s.clone()))?,
            None => IpAddr::V4(DEFAULT_BIND_ADDRESS),
        };

        Ok(Configuration {
            dns,
            fallback_dns,
            cache: raw.cache.unwrap_or(true),
            dns_stub_listener: raw.dns_stub_listener.unwrap_or(true),
            dns_stub_listener_extra,
            bind_address,
            warning,
        })
    }

    /// Drop-in files, sorted lexicographically by filename so later files can append
    /// to accumulating keys and override scalar ones.
    fn drop_ins(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.drop_in_dir) else {
            return Vec::new();
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "conf"))
            .collect();

        paths.sort();
        paths
    }

    fn discover_dns(
        &self,
        fallback_dns: &[SocketAddr],
    ) -> Result<(Vec<SocketAddr>, Option<String>), ConfigError> {
        if let Some(status) = self.networkctl.status() {
            let found = parse_networkctl_status(&status);
            if !found.is_empty() {
                return Ok((found, None));
            }
        }

        if let Ok(text) = fs::read_to_string(&self.resolv_conf_path) {
            match resolv_conf::Config::parse(&text) {
                Ok(parsed) => {
                    let found: Vec<SocketAddr> = parsed
                        .nameservers
                        .iter()
                        .filter_map(scoped_ip_to_socket_addr)
                        .collect();
                    if !found.is_empty() {
                        return Ok((found, None));
                    }
                }
                Err(error) => {
                    tracing::warn!(path = %self.resolv_conf_path.display(), %error, "Failed to parse `resolv.conf`");
                }
            }
        }

        if let Some(first) = fallback_dns.first().copied() {
            let warning =
                format!("No DNS configured. Using first FallbackDNS ({first}) as primary DNS.");
            tracing::warn!("{warning}");
            return Ok((vec![first], Some(warning)));
        }

        Err(ConfigError::NoDnsConfigured)
    }
}

#[derive(Default, Debug, Clone)]
struct RawConfig {
    dns: Vec<String>,
    fallback_dns: Vec<String>,
    dns_stub_listener_extra: Vec<String>,
    cache: Option<bool>,
    dns_stub_listener: Option<bool>,
    bind_address: Option<String>,
}

impl RawConfig {
    /// Applies one INI-style file's `[Resolve]` section on top of the existing state.
    /// List keys append, scalar keys overwrite.
    fn merge_ini(&mut self, text: &str) {
        let mut in_resolve_section = false;

        for line in text.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                in_resolve_section = name.eq_ignore_ascii_case("Resolve");
                continue;
            }

            if !in_resolve_section {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "DNS" => self.dns.extend(value.split_whitespace().map(str::to_owned)),
                "FallbackDNS" => self
                    .fallback_dns
                    .extend(value.split_whitespace().map(str::to_owned)),
                "DNSStubListenerExtra" => self
                    .dns_stub_listener_extra
                    .extend(value.split_whitespace().map(str::to_owned)),
                "Cache" if !value.is_empty() => self.cache = Some(parse_bool(value)),
                "DNSStubListener" if !value.is_empty() => {
                    self.dns_stub_listener = Some(parse_bool(value))
                }
                "BindAddress" if !value.is_empty() => self.bind_address = Some(value.to_owned()),
                "Cache" | "DNSStubListener" | "BindAddress" => {}
                other => tracing::warn!(key = other, "Unknown key in resolved.conf, ignoring"),
            }
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "yes" | "true" | "1")
}

fn parse_endpoints(values: &[String]) -> Result<Vec<SocketAddr>, ConfigError> {
    values.iter().map(|v| parse_endpoint(v)).collect()
}

/// Parses a single DNS server endpoint.
///
/// `[host]`, `[host]:port`, a bare (unbracketed) IPv6 address, `host:port`, or a bare
/// host — in that priority order. Missing ports default to 53.
pub fn parse_endpoint(s: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint(s.to_owned());

    if let Some(rest) = s.strip_prefix('[') {
        let (host, remainder) = rest.split_once(']').ok_or_else(invalid)?;
        let ip: Ipv6Addr = host.parse().map_err(|_| invalid())?;
        let port = match remainder.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None => DEFAULT_PORT,
        };
        return Ok(SocketAddr::new(IpAddr::V6(ip), port));
    }

    if s.matches(':').count() > 1 {
        let ip: Ipv6Addr = s.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(IpAddr::V6(ip), DEFAULT_PORT));
    }

    if let Some((host, port)) = s.split_once(':') {
        let ip: IpAddr = host.parse().map_err(|_| invalid())?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, port));
    }

    let ip: IpAddr = s.parse().map_err(|_| invalid())?;
    Ok(SocketAddr::new(ip, DEFAULT_PORT))
}

fn parse_networkctl_status(text: &str) -> Vec<SocketAddr> {
    let mut found = Vec::new();

    for line in text.lines() {
        let Some(rest) = line.trim_start().strip_prefix("DNS:") else {
            continue;
        };

        for token in rest.split_whitespace() {
            if let Ok(ip) = token.parse::<IpAddr>() {
                if !is_localhost(ip) {
                    found.push(SocketAddr::new(ip, DEFAULT_PORT));
                }
            }
        }
    }

    found
}

fn scoped_ip_to_socket_addr(ip: &resolv_conf::ScopedIp) -> Option<SocketAddr> {
    let text = ip.to_string();
    let host = text.split('%').next().unwrap_or(&text);
    let ip: IpAddr = host.parse().ok()?;

    if is_localhost(ip) {
        return None;
    }

    Some(SocketAddr::new(ip, DEFAULT_PORT))
}

fn is_localhost(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 127,
        IpAddr::V6(v6) => v6 == Ipv6Addr::LOCALHOST,
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::Ipv4Addr};

    use super::*;

    fn write_conf(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    struct NoNetworkctl;
    impl NetworkctlSource for NoNetworkctl {
        fn status(&self) -> Option<String> {
            None
        }
    }

    struct StaticNetworkctl(&'static str);
    impl NetworkctlSource for StaticNetworkctl {
        fn status(&self) -> Option<String> {
            Some(self.0.to_owned())
        }
    }

    #[test]
    fn parses_bare_ipv4() {
        let endpoint = parse_endpoint("1.1.1.1").unwrap();
        assert_eq!(endpoint, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53));
    }

    #[test]
    fn parses_ipv4_with_port() {
        let endpoint = parse_endpoint("1.1.1.1:5353").unwrap();
        assert_eq!(
            endpoint,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 5353)
        );
    }

    #[test]
    fn parses_bare_ipv6() {
        let endpoint = parse_endpoint("::1").unwrap();
        assert_eq!(endpoint.port(), 53);
        assert!(endpoint.is_ipv6());
    }

    #[test]
    fn parses_bracketed_ipv6_with_port() {
        let endpoint = parse_endpoint("[2001:4860:4860::8888]:8053").unwrap();
        assert_eq!(endpoint.port(), 8053);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_endpoint("not-an-ip").is_err());
    }

    #[test]
    fn accumulates_dns_across_lines_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let main = write_conf(
            dir.path(),
            "resolved.conf",
            "[Resolve]\nDNS=1.1.1.1\nDNS=8.8.8.8\n",
        );

        let parser = ConfigParser {
            config_path: main,
            drop_in_dir: dir.path().join("does-not-exist.d"),
            resolv_conf_path: dir.path().join("resolv.conf"),
            networkctl: Box::new(NoNetworkctl),
        };

        let config = parser.resolve().unwrap();
        assert_eq!(
            config.dns,
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            ]
        );
    }

    #[test]
    fn drop_ins_append_after_main_file_in_filename_order() {
        let dir = tempfile::tempdir().unwrap();
        let drop_in_dir = dir.path().join("resolved.conf.d");
        fs::create_dir_all(&drop_in_dir).unwrap();

        let main = write_conf(dir.path(), "resolved.conf", "[Resolve]\nDNS=1.1.1.1\n");
        write_conf(&drop_in_dir, "20-b.conf", "[Resolve]\nDNS=9.9.9.9\n");
        write_conf(&drop_in_dir, "10-a.conf", "[Resolve]\nDNS=8.8.8.8\n");

        let parser = ConfigParser {
            config_path: main,
            drop_in_dir,
            resolv_conf_path: dir.path().join("resolv.conf"),
            networkctl: Box::new(NoNetworkctl),
        };

        let config = parser.resolve().unwrap();
        assert_eq!(
            config.dns,
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53),
            ]
        );
    }

    #[test]
    fn falls_back_to_networkctl_when_dns_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let main = write_conf(dir.path(), "resolved.conf", "[Resolve]\n");

        let parser = ConfigParser {
            config_path: main,
            drop_in_dir: dir.path().join("does-not-exist.d"),
            resolv_conf_path: dir.path().join("resolv.conf"),
            networkctl: Box::new(StaticNetworkctl(
                "●  1: eth0\n         DNS: 10.0.0.1\n              1.1.1.1\n",
            )),
        };

        let config = parser.resolve().unwrap();
        assert_eq!(
            config.dns,
            vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 53),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53),
            ]
        );
    }

    #[test]
    fn falls_back_to_resolv_conf_when_networkctl_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let main = write_conf(dir.path(), "resolved.conf", "[Resolve]\n");
        write_conf(
            dir.path(),
            "resolv.conf",
            "nameserver 127.0.0.53\nnameserver 9.9.9.9\n",
        );

        let parser = ConfigParser {
            config_path: main,
            drop_in_dir: dir.path().join("does-not-exist.d"),
            resolv_conf_path: dir.path().join("resolv.conf"),
            networkctl: Box::new(NoNetworkctl),
        };

        let config = parser.resolve().unwrap();
        assert_eq!(
            config.dns,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53)]
        );
    }

    #[test]
    fn promotes_first_fallback_dns_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let main = write_conf(
            dir.path(),
            "resolved.conf",
            "[Resolve]\nFallbackDNS=8.8.8.8 8.8.4.4\n",
        );

        let parser = ConfigParser {
            config_path: main,
            drop_in_dir: dir.path().join("does-not-exist.d"),
            resolv_conf_path: dir.path().join("resolv.conf"),
            networkctl: Box::new(NoNetworkctl),
        };

        let config = parser.resolve().unwrap();
        assert_eq!(
            config.dns,
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53)]
        );
        assert!(config.warning.unwrap().contains("8.8.8.8"));
    }

    #[test]
    fn refuses_to_start_with_no_dns_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        let main = write_conf(dir.path(), "resolved.conf", "[Resolve]\n");

        let parser = ConfigParser {
            config_path: main,
            drop_in_dir: dir.path().join("does-not-exist.d"),
            resolv_conf_path: dir.path().join("does-not-exist-either"),
            networkctl: Box::new(NoNetworkctl),
        };

        assert!(matches!(
            parser.resolve(),
            Err(ConfigError::NoDnsConfigured)
        ));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut raw = RawConfig::default();
        raw.merge_ini("[Resolve]\nDNSSEC=yes\nDNS=1.1.1.1\n");
        assert_eq!(raw.dns, vec!["1.1.1.1"]);
    }

    #[test]
    fn non_resolve_sections_are_ignored() {
        let mut raw = RawConfig::default();
        raw.merge_ini("[Network]\nDNS=1.1.1.1\n[Resolve]\nDNS=8.8.8.8\n");
        assert_eq!(raw.dns, vec!["8.8.8.8"]);
    }
}
