use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

use crate::mircat::net;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Invalid configuration value. Raised before any socket is opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field}: address is empty")]
    EmptyAddress { field: &'static str },
    #[error("{field}: {value:?} is not a bindable IP address")]
    InvalidBindAddress { field: &'static str, value: String },
    #[error("{field}: port is empty")]
    EmptyPort { field: &'static str },
    #[error("{field}: {value:?} is not a port in 1-65535")]
    InvalidPort { field: &'static str, value: String },
    #[error("Server: udpAddr and udpPort must be set together")]
    PartialUdp,
    #[error("missing {0} section")]
    MissingSection(&'static str),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    Server,
    Client,
    Both,
    /// Relay Transfer.src straight to Transfer.dst inside one process, no channel.
    Local,
}

impl Role {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "server" => Ok(Role::Server),
            "client" => Ok(Role::Client),
            "both" => Ok(Role::Both),
            "local" => Ok(Role::Local),
            other => Err(ConfigError::Invalid {
                field: "role",
                reason: format!("unknown role {other:?} (expected server|client|both|local)"),
            }),
        }
    }

    pub fn runs_server(self) -> bool {
        matches!(self, Role::Server | Role::Both)
    }

    pub fn runs_client(self) -> bool {
        matches!(self, Role::Client | Role::Both)
    }

    pub fn runs_local(self) -> bool {
        self == Role::Local
    }
}

/// Public bind endpoints of the server role.
///
/// `udp_addr`/`udp_port` are optional as a pair: both blank disables the UDP relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub tcp_addr: String,
    pub tcp_port: u16,
    pub udp_addr: String,
    pub udp_port: u16,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tcp_bind()?;
        self.udp_bind()?;
        Ok(())
    }

    /// Control listener address (`tcpAddr:tcpPort`).
    pub fn tcp_bind(&self) -> Result<SocketAddr, ConfigError> {
        bind_addr("Server.tcpAddr", &self.tcp_addr, "Server.tcpPort", self.tcp_port)
    }

    /// Public UDP listener address, `None` when the UDP relay is disabled.
    pub fn udp_bind(&self) -> Result<Option<SocketAddr>, ConfigError> {
        let addr_blank = self.udp_addr.trim().is_empty();
        match (addr_blank, self.udp_port) {
            (true, 0) => Ok(None),
            (true, _) | (false, 0) => Err(ConfigError::PartialUdp),
            (false, port) => {
                bind_addr("Server.udpAddr", &self.udp_addr, "Server.udpPort", port).map(Some)
            }
        }
    }
}

/// The single forwarding rule: public `src` endpoint to private `dst` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.src_bind()?;
        self.dst_target()?;
        Ok(())
    }

    /// Public TCP listener address (`srcAddr:srcPort`).
    pub fn src_bind(&self) -> Result<SocketAddr, ConfigError> {
        bind_addr("Transfer.srcAddr", &self.src_addr, "Transfer.srcPort", self.src_port)
    }

    /// Destination the client dials (`dstAddr:dstPort`), hostnames allowed.
    pub fn dst_target(&self) -> Result<String, ConfigError> {
        dial_target("Transfer.dstAddr", &self.dst_addr, "Transfer.dstPort", self.dst_port)
    }
}

/// The server a client dials to establish its control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_ip: String,
    pub server_port: u16,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_target().map(|_| ())
    }

    pub fn server_target(&self) -> Result<String, ConfigError> {
        dial_target("Client.ServerIp", &self.server_ip, "Client.ServerPort", self.server_port)
    }
}

fn bind_addr(
    addr_field: &'static str,
    addr: &str,
    port_field: &'static str,
    port: u16,
) -> Result<SocketAddr, ConfigError> {
    if addr.trim().is_empty() {
        return Err(ConfigError::EmptyAddress { field: addr_field });
    }
    if port == 0 {
        return Err(ConfigError::InvalidPort {
            field: port_field,
            value: "0".into(),
        });
    }
    net::bind_socket_addr(addr, port).ok_or_else(|| ConfigError::InvalidBindAddress {
        field: addr_field,
        value: addr.trim().to_string(),
    })
}

fn dial_target(
    addr_field: &'static str,
    addr: &str,
    port_field: &'static str,
    port: u16,
) -> Result<String, ConfigError> {
    if addr.trim().is_empty() {
        return Err(ConfigError::EmptyAddress { field: addr_field });
    }
    if port == 0 {
        return Err(ConfigError::InvalidPort {
            field: port_field,
            value: "0".into(),
        });
    }
    Ok(net::join_host_port(addr, port))
}

/// Policy when a second client connects while a control channel is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPolicy {
    /// Close the active channel and install the new one.
    #[default]
    Replace,
    /// Refuse the newcomer; the active channel stays.
    Reject,
}

impl std::fmt::Display for ChannelPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelPolicy::Replace => write!(f, "replace"),
            ChannelPolicy::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayTuning {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    pub dial_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// 0 = retry forever.
    pub max_retries: u32,
    pub udp_idle_timeout: Duration,
    /// 0 = TCP sessions never expire on idleness.
    pub tcp_idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub sniff_timeout: Duration,
    pub stream_window_bytes: u32,
    pub channel_policy: ChannelPolicy,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            max_retries: 0,
            udp_idle_timeout: Duration::from_secs(60),
            tcp_idle_timeout: Duration::ZERO,
            sweep_interval: Duration::from_secs(1),
            sniff_timeout: Duration::from_millis(300),
            stream_window_bytes: 256 * 1024,
            channel_policy: ChannelPolicy::Replace,
        }
    }
}

impl RelayTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "relay.heartbeat_interval_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid {
                field: "relay.heartbeat_timeout_ms",
                reason: "must be greater than heartbeat_interval_ms".into(),
            });
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "relay.sweep_interval_ms",
                reason: "must be > 0".into(),
            });
        }
        if self.backoff_initial.is_zero() || self.backoff_max < self.backoff_initial {
            return Err(ConfigError::Invalid {
                field: "relay.backoff_max_ms",
                reason: "backoff must be > 0 and backoff_max_ms >= backoff_initial_ms".into(),
            });
        }
        // yamux refuses windows below its initial 256 KiB.
        if self.stream_window_bytes < 256 * 1024 {
            return Err(ConfigError::Invalid {
                field: "relay.stream_window_bytes",
                reason: "must be >= 262144".into(),
            });
        }
        Ok(())
    }
}

/// Everything the relay core consumes. Immutable once built.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub server: Option<ServerConfig>,
    pub transfer: TransferConfig,
    pub client: Option<ClientConfig>,
    pub tuning: RelayTuning,
}

impl RelayConfig {
    pub fn server_parts(&self) -> Result<(&ServerConfig, &TransferConfig), ConfigError> {
        let server = self
            .server
            .as_ref()
            .ok_or(ConfigError::MissingSection("Server"))?;
        server.validate()?;
        self.transfer.src_bind()?;
        self.tuning.validate()?;
        Ok((server, &self.transfer))
    }

    pub fn client_parts(&self) -> Result<(&ClientConfig, &TransferConfig), ConfigError> {
        let client = self
            .client
            .as_ref()
            .ok_or(ConfigError::MissingSection("Client"))?;
        client.validate()?;
        self.transfer.dst_target()?;
        self.tuning.validate()?;
        Ok((client, &self.transfer))
    }

    /// The local transfer needs both ends of the Transfer rule and nothing else.
    pub fn local_parts(&self) -> Result<&TransferConfig, ConfigError> {
        self.transfer.validate()?;
        self.tuning.validate()?;
        Ok(&self.transfer)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    if let Some(p) = std::env::var_os("MIRCAT_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("mircat.toml"));
        }
        return Ok(p);
    }

    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    // config.json is what the desktop build wrote next to the executable.
    let candidates = ["mircat.toml", "mircat.yaml", "mircat.yml", "config.json"];
    for c in candidates {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no mircat.* or config.json found")
}

#[cfg(target_os = "linux")]
fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(PathBuf::from("/etc/mircat/mircat.toml"))
}

#[cfg(not(target_os = "linux"))]
fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj = directories::ProjectDirs::from("com", "mircat", "mircat")
        .context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("mircat.toml"))
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        "json" => Ok(DEFAULT_CONFIG_TEMPLATE_JSON),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml, .yaml/.yml or .json)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        "json" => {
            serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {}", other),
    };

    let cfg = Config::from_file_config(fc)
        .with_context(|| format!("config: invalid {}", path.display()))?;
    Ok(cfg)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    role: Option<String>,

    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    #[serde(rename = "Server", alias = "server")]
    server: Option<FileServer>,

    #[serde(rename = "Transfer", alias = "transfer")]
    transfer: Option<FileTransfer>,

    #[serde(rename = "Client", alias = "client")]
    client: Option<FileClient>,

    relay: Option<FileRelay>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileServer {
    #[serde(default, alias = "tcp_addr")]
    tcp_addr: String,
    #[serde(alias = "tcp_port")]
    tcp_port: Option<PortValue>,
    #[serde(default, alias = "udp_addr")]
    udp_addr: String,
    #[serde(alias = "udp_port")]
    udp_port: Option<PortValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileTransfer {
    #[serde(default, alias = "src_addr")]
    src_addr: String,
    #[serde(alias = "src_port")]
    src_port: Option<PortValue>,
    #[serde(default, alias = "dst_addr")]
    dst_addr: String,
    #[serde(alias = "dst_port")]
    dst_port: Option<PortValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    #[serde(default, rename = "ServerIp", alias = "server_ip", alias = "serverIp")]
    server_ip: String,
    #[serde(rename = "ServerPort", alias = "server_port", alias = "serverPort")]
    server_port: Option<PortValue>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    heartbeat_interval_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
    connect_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    backoff_initial_ms: Option<i64>,
    backoff_max_ms: Option<i64>,
    max_retries: Option<i64>,
    udp_idle_timeout_ms: Option<i64>,
    tcp_idle_timeout_ms: Option<i64>,
    sweep_interval_ms: Option<i64>,
    sniff_timeout_ms: Option<i64>,
    stream_window_bytes: Option<i64>,
    channel_policy: Option<String>,
}

/// Ports were stored as strings by the desktop app; accept both forms.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum PortValue {
    Num(i64),
    Text(String),
}

impl PortValue {
    fn is_blank(&self) -> bool {
        matches!(self, PortValue::Text(s) if s.trim().is_empty())
    }
}

fn port_is_blank(p: &Option<PortValue>) -> bool {
    p.as_ref().is_none_or(PortValue::is_blank)
}

/// Parse a required port.
fn parse_port(field: &'static str, p: &Option<PortValue>) -> Result<u16, ConfigError> {
    match p {
        None => Err(ConfigError::EmptyPort { field }),
        Some(PortValue::Num(n)) => u16::try_from(*n)
            .ok()
            .filter(|v| *v != 0)
            .ok_or_else(|| ConfigError::InvalidPort {
                field,
                value: n.to_string(),
            }),
        Some(PortValue::Text(s)) => {
            let t = s.trim();
            if t.is_empty() {
                return Err(ConfigError::EmptyPort { field });
            }
            t.parse::<u16>()
                .ok()
                .filter(|v| *v != 0)
                .ok_or_else(|| ConfigError::InvalidPort {
                    field,
                    value: t.to_string(),
                })
        }
    }
}

/// Parse a port that may be left blank (0 means unset).
fn parse_optional_port(field: &'static str, p: &Option<PortValue>) -> Result<u16, ConfigError> {
    if port_is_blank(p) {
        return Ok(0);
    }
    parse_port(field, p)
}

fn non_negative_ms(field: &'static str, v: Option<i64>, default: Duration) -> Result<Duration, ConfigError> {
    match v {
        None => Ok(default),
        Some(n) if n < 0 => Err(ConfigError::Invalid {
            field,
            reason: format!("{n} is negative"),
        }),
        Some(n) => Ok(Duration::from_millis(n as u64)),
    }
}

impl FileServer {
    fn is_blank(&self) -> bool {
        self.tcp_addr.trim().is_empty()
            && port_is_blank(&self.tcp_port)
            && self.udp_addr.trim().is_empty()
            && port_is_blank(&self.udp_port)
    }

    fn into_model(self) -> Result<ServerConfig, ConfigError> {
        let cfg = ServerConfig {
            tcp_addr: self.tcp_addr.trim().to_string(),
            tcp_port: parse_port("Server.tcpPort", &self.tcp_port)?,
            udp_addr: self.udp_addr.trim().to_string(),
            udp_port: parse_optional_port("Server.udpPort", &self.udp_port)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl FileTransfer {
    fn into_model(self) -> Result<TransferConfig, ConfigError> {
        let cfg = TransferConfig {
            src_addr: self.src_addr.trim().to_string(),
            src_port: parse_port("Transfer.srcPort", &self.src_port)?,
            dst_addr: self.dst_addr.trim().to_string(),
            dst_port: parse_port("Transfer.dstPort", &self.dst_port)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl FileClient {
    fn is_blank(&self) -> bool {
        self.server_ip.trim().is_empty() && port_is_blank(&self.server_port)
    }

    fn into_model(self) -> Result<ClientConfig, ConfigError> {
        let cfg = ClientConfig {
            server_ip: self.server_ip.trim().to_string(),
            server_port: parse_port("Client.ServerPort", &self.server_port)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

impl FileRelay {
    fn into_tuning(self) -> Result<RelayTuning, ConfigError> {
        let d = RelayTuning::default();
        let max_retries = match self.max_retries {
            None => d.max_retries,
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::Invalid {
                field: "relay.max_retries",
                reason: format!("{n} is out of range"),
            })?,
        };
        let stream_window_bytes = match self.stream_window_bytes {
            None => d.stream_window_bytes,
            Some(n) => u32::try_from(n).map_err(|_| ConfigError::Invalid {
                field: "relay.stream_window_bytes",
                reason: format!("{n} is out of range"),
            })?,
        };
        let channel_policy = match self
            .channel_policy
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("replace") => ChannelPolicy::Replace,
            Some("reject") => ChannelPolicy::Reject,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    field: "relay.channel_policy",
                    reason: format!("unknown policy {other:?} (expected replace|reject)"),
                });
            }
        };

        let tuning = RelayTuning {
            heartbeat_interval: non_negative_ms(
                "relay.heartbeat_interval_ms",
                self.heartbeat_interval_ms,
                d.heartbeat_interval,
            )?,
            heartbeat_timeout: non_negative_ms(
                "relay.heartbeat_timeout_ms",
                self.heartbeat_timeout_ms,
                d.heartbeat_timeout,
            )?,
            connect_timeout: non_negative_ms(
                "relay.connect_timeout_ms",
                self.connect_timeout_ms,
                d.connect_timeout,
            )?,
            dial_timeout: non_negative_ms("relay.dial_timeout_ms", self.dial_timeout_ms, d.dial_timeout)?,
            backoff_initial: non_negative_ms(
                "relay.backoff_initial_ms",
                self.backoff_initial_ms,
                d.backoff_initial,
            )?,
            backoff_max: non_negative_ms("relay.backoff_max_ms", self.backoff_max_ms, d.backoff_max)?,
            max_retries,
            udp_idle_timeout: non_negative_ms(
                "relay.udp_idle_timeout_ms",
                self.udp_idle_timeout_ms,
                d.udp_idle_timeout,
            )?,
            tcp_idle_timeout: non_negative_ms(
                "relay.tcp_idle_timeout_ms",
                self.tcp_idle_timeout_ms,
                d.tcp_idle_timeout,
            )?,
            sweep_interval: non_negative_ms(
                "relay.sweep_interval_ms",
                self.sweep_interval_ms,
                d.sweep_interval,
            )?,
            sniff_timeout: non_negative_ms(
                "relay.sniff_timeout_ms",
                self.sniff_timeout_ms,
                d.sniff_timeout,
            )?,
            stream_window_bytes,
            channel_policy,
        };
        tuning.validate()?;
        Ok(tuning)
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> Result<Config, ConfigError> {
        let role = Role::parse(fc.role.as_deref().unwrap_or(""))?;

        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.level = level.to_string();
            }
            if let Some(fmt) = l.format.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.format = fmt.to_string();
            }
            if let Some(out) = l.output.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.output = out.to_string();
            }
            logging.add_source = l.add_source;
        }

        // A section left entirely blank (the desktop app always wrote all three)
        // counts as absent.
        let server = match fc.server {
            Some(s) if !s.is_blank() => Some(s.into_model()?),
            _ => None,
        };
        let client = match fc.client {
            Some(c) if !c.is_blank() => Some(c.into_model()?),
            _ => None,
        };
        let transfer = fc
            .transfer
            .ok_or(ConfigError::MissingSection("Transfer"))?
            .into_model()?;
        let tuning = fc.relay.unwrap_or_default().into_tuning()?;

        if role.runs_server() && server.is_none() {
            return Err(ConfigError::MissingSection("Server"));
        }
        if role.runs_client() && client.is_none() {
            return Err(ConfigError::MissingSection("Client"));
        }

        Ok(Config {
            role,
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            relay: RelayConfig {
                server,
                transfer,
                client,
                tuning,
            },
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# MirCat configuration (auto-generated)
#
# This file was created because MirCat could not find a configuration file at
# the resolved config path.
#
# role = "server": listen for the client on Server.tcpAddr:tcpPort and expose
#   Transfer.srcAddr:srcPort (TCP) and Server.udpAddr:udpPort (UDP).
# role = "client": dial Client.ServerIp:ServerPort and forward traffic to
#   Transfer.dstAddr:dstPort.
# role = "local": accept on Transfer.srcAddr:srcPort and dial Transfer.dstAddr:dstPort
#   directly, without a server/client pair.
#
# When srcPort equals tcpPort the server shares one TCP port between the control
# channel and public traffic.

role = "server"
admin_addr = ""

[Server]
tcpAddr = "0.0.0.0"
tcpPort = "9000"
udpAddr = "0.0.0.0"
udpPort = "9000"

[Transfer]
srcAddr = "0.0.0.0"
srcPort = "9000"
dstAddr = "127.0.0.1"
dstPort = "8080"

[Client]
ServerIp = "127.0.0.1"
ServerPort = "9000"

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[relay]
heartbeat_interval_ms = 5000
heartbeat_timeout_ms = 15000
dial_timeout_ms = 5000
udp_idle_timeout_ms = 60000
channel_policy = "replace" # replace | reject
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# MirCat configuration (auto-generated)
#
# This file was created because MirCat could not find a configuration file at
# the resolved config path.
#
# role: server -> listen for the client on Server.tcpAddr:tcpPort and expose
#   Transfer.srcAddr:srcPort (TCP) and Server.udpAddr:udpPort (UDP).
# role: client -> dial Client.ServerIp:ServerPort and forward traffic to
#   Transfer.dstAddr:dstPort.
# role: local -> accept on Transfer.srcAddr:srcPort and dial Transfer.dstAddr:dstPort
#   directly, without a server/client pair.

role: "server"
admin_addr: ""

Server:
  tcpAddr: "0.0.0.0"
  tcpPort: "9000"
  udpAddr: "0.0.0.0"
  udpPort: "9000"

Transfer:
  srcAddr: "0.0.0.0"
  srcPort: "9000"
  dstAddr: "127.0.0.1"
  dstPort: "8080"

Client:
  ServerIp: "127.0.0.1"
  ServerPort: "9000"

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

relay:
  heartbeat_interval_ms: 5000
  heartbeat_timeout_ms: 15000
  dial_timeout_ms: 5000
  udp_idle_timeout_ms: 60000
  channel_policy: "replace" # replace | reject
"#;

const DEFAULT_CONFIG_TEMPLATE_JSON: &str = r#"{
  "role": "server",
  "Server": { "tcpAddr": "0.0.0.0", "tcpPort": "9000", "udpAddr": "0.0.0.0", "udpPort": "9000" },
  "Transfer": { "srcAddr": "0.0.0.0", "srcPort": "9000", "dstAddr": "127.0.0.1", "dstPort": "8080" },
  "Client": { "ServerIp": "127.0.0.1", "ServerPort": "9000" }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "mircat_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn config_error(err: &anyhow::Error) -> ConfigError {
        err.downcast_ref::<ConfigError>()
            .cloned()
            .unwrap_or_else(|| panic!("expected ConfigError, got: {err:#}"))
    }

    #[test]
    fn loads_desktop_json_with_string_ports() {
        let dir = temp_dir("desktop_json");
        let cfg_path = dir.join("config.json");

        let json = r#"{
  "Server": {"tcpAddr": "0.0.0.0", "tcpPort": "9000", "udpAddr": "", "udpPort": ""},
  "Transfer": {"srcAddr": "0.0.0.0", "srcPort": "9000", "dstAddr": "127.0.0.1", "dstPort": "8080"},
  "Client": {"ServerIp": "server-host", "ServerPort": " 9000 "}
}"#;
        std::fs::write(&cfg_path, json).expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.role, Role::Server);
        let server = cfg.relay.server.clone().expect("server");
        assert_eq!(server.tcp_port, 9000);
        assert_eq!(server.udp_bind().unwrap(), None);
        assert_eq!(cfg.relay.transfer.dst_target().unwrap(), "127.0.0.1:8080");
        let client = cfg.relay.client.clone().expect("client");
        assert_eq!(client.server_target().unwrap(), "server-host:9000");
        assert_eq!(cfg.relay.tuning.channel_policy, ChannelPolicy::Replace);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn loads_toml_with_numeric_ports_and_tuning() {
        let dir = temp_dir("toml");
        let cfg_path = dir.join("mircat.toml");

        let toml = r#"
role = "client"

[client]
server_ip = "10.0.0.1"
server_port = 7000

[transfer]
src_addr = "0.0.0.0"
src_port = 7001
dst_addr = "localhost"
dst_port = 22

[relay]
udp_idle_timeout_ms = 1500
max_retries = 3
channel_policy = "Reject"
"#;
        std::fs::write(&cfg_path, toml).expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.role, Role::Client);
        assert!(cfg.relay.server.is_none());
        assert_eq!(cfg.relay.tuning.udp_idle_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.relay.tuning.max_retries, 3);
        assert_eq!(cfg.relay.tuning.channel_policy, ChannelPolicy::Reject);
        assert_eq!(cfg.relay.transfer.dst_target().unwrap(), "localhost:22");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn loads_yaml() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("mircat.yaml");

        let yaml = r#"
role: both
Server:
  tcpAddr: "::"
  tcpPort: 9000
  udpAddr: "::"
  udpPort: 9001
Transfer:
  srcAddr: "::"
  srcPort: 9002
  dstAddr: "::1"
  dstPort: 8080
Client:
  ServerIp: "::1"
  ServerPort: 9000
"#;
        std::fs::write(&cfg_path, yaml).expect("write");

        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.role, Role::Both);
        let server = cfg.relay.server.clone().unwrap();
        assert_eq!(
            server.udp_bind().unwrap(),
            Some("[::]:9001".parse().unwrap())
        );
        assert_eq!(cfg.relay.transfer.dst_target().unwrap(), "[::1]:8080");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn out_of_range_port_names_the_field() {
        let dir = temp_dir("bad_port");
        let cfg_path = dir.join("mircat.toml");

        let toml = r#"
[Server]
tcpAddr = "0.0.0.0"
tcpPort = "70000"

[Transfer]
srcAddr = "0.0.0.0"
srcPort = "9000"
dstAddr = "127.0.0.1"
dstPort = "8080"
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert_eq!(
            config_error(&err),
            ConfigError::InvalidPort {
                field: "Server.tcpPort",
                value: "70000".into()
            }
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn partial_udp_is_rejected() {
        let s = ServerConfig {
            tcp_addr: "0.0.0.0".into(),
            tcp_port: 9000,
            udp_addr: "0.0.0.0".into(),
            udp_port: 0,
        };
        assert_eq!(s.validate(), Err(ConfigError::PartialUdp));
    }

    #[test]
    fn bind_addresses_must_be_ip_literals() {
        let t = TransferConfig {
            src_addr: "public.example".into(),
            src_port: 9000,
            dst_addr: "private.example".into(),
            dst_port: 80,
        };
        assert!(matches!(
            t.validate(),
            Err(ConfigError::InvalidBindAddress {
                field: "Transfer.srcAddr",
                ..
            })
        ));
    }

    #[test]
    fn client_role_requires_client_section() {
        let dir = temp_dir("missing_client");
        let cfg_path = dir.join("config.json");

        let json = r#"{
  "role": "client",
  "Transfer": {"srcAddr": "0.0.0.0", "srcPort": "9000", "dstAddr": "127.0.0.1", "dstPort": "8080"},
  "Client": {"ServerIp": "", "ServerPort": ""}
}"#;
        std::fs::write(&cfg_path, json).expect("write");
        let err = load_config(&cfg_path).unwrap_err();
        assert_eq!(config_error(&err), ConfigError::MissingSection("Client"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn local_role_needs_only_the_transfer_rule() {
        let dir = temp_dir("local_role");
        let cfg_path = dir.join("config.json");

        let json = r#"{
  "role": "local",
  "Transfer": {"srcAddr": "127.0.0.1", "srcPort": "9001", "dstAddr": "localhost", "dstPort": "8080"}
}"#;
        std::fs::write(&cfg_path, json).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.role, Role::Local);
        assert!(!cfg.role.runs_server() && !cfg.role.runs_client());
        let transfer = cfg.relay.local_parts().expect("local parts");
        assert_eq!(transfer.dst_target().unwrap(), "localhost:8080");

        let mut bad = cfg.relay.clone();
        bad.transfer.dst_port = 0;
        assert!(matches!(
            bad.local_parts(),
            Err(ConfigError::InvalidPort {
                field: "Transfer.dstPort",
                ..
            })
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let t = RelayTuning {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(5),
            ..RelayTuning::default()
        };
        assert!(matches!(
            t.validate(),
            Err(ConfigError::Invalid {
                field: "relay.heartbeat_timeout_ms",
                ..
            })
        ));
    }

    #[test]
    fn generated_templates_load() {
        for name in ["mircat.toml", "mircat.yaml", "config.json"] {
            let dir = temp_dir("template");
            let cfg_path = dir.join(name);
            assert!(ensure_config_file(&cfg_path).expect("ensure"));
            assert!(!ensure_config_file(&cfg_path).expect("ensure again"));
            let cfg = load_config(&cfg_path).unwrap_or_else(|e| panic!("{name}: {e:#}"));
            assert_eq!(cfg.role, Role::Server);
            assert_eq!(cfg.relay.transfer.src_port, 9000);
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
