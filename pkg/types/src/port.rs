//! Host ↔ guest port bindings.
//!
//! A binding is written either as a compose short token
//! (`[hostAddr:][hostPort:]containerPort[/proto]`) or as a long-form object
//! (`{target, published, host_ip, protocol}`). Both forms parse into the same
//! [`PortBinding`]; [`PortSpec`] remembers which form was used so descriptor
//! files are written back the way they were read.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PortParseError;

/// Transport protocol of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = PortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(PortParseError::new(s, format!("unknown protocol '{}'", other))),
        }
    }
}

/// Host side of a binding as declared in a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostPort {
    /// Exactly this port.
    Fixed(u16),
    /// The engine picks a free port in `[lo, hi]`.
    Range(u16, u16),
    /// The engine picks any free port.
    Dynamic,
}

impl HostPort {
    /// Whether a concrete port reported by a backend satisfies this declaration.
    pub fn admits(&self, port: u16) -> bool {
        match *self {
            HostPort::Fixed(p) => p == port,
            HostPort::Range(lo, hi) => (lo..=hi).contains(&port),
            HostPort::Dynamic => port != 0,
        }
    }

    fn parse(input: &str, raw: &str) -> Result<Self, PortParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(HostPort::Dynamic);
        }
        if let Some((lo, hi)) = raw.split_once('-') {
            let lo = parse_port(input, lo)?;
            let hi = parse_port(input, hi)?;
            if lo > hi {
                return Err(PortParseError::new(input, "range start exceeds range end"));
            }
            if lo == hi {
                return Ok(HostPort::Fixed(lo));
            }
            return Ok(HostPort::Range(lo, hi));
        }
        Ok(HostPort::Fixed(parse_port(input, raw)?))
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostPort::Fixed(p) => write!(f, "{}", p),
            HostPort::Range(lo, hi) => write!(f, "{}-{}", lo, hi),
            HostPort::Dynamic => Ok(()),
        }
    }
}

fn parse_port(input: &str, raw: &str) -> Result<u16, PortParseError> {
    match raw.trim().parse::<u16>() {
        Ok(0) => Err(PortParseError::new(input, "port 0 is not allowed")),
        Ok(p) => Ok(p),
        Err(_) => Err(PortParseError::new(
            input,
            format!("'{}' is not a valid port number", raw),
        )),
    }
}

/// Declared binding of a guest port to the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortBinding {
    pub host_address: Option<String>,
    pub host_port: HostPort,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    pub fn new(host_port: HostPort, container_port: u16, protocol: Protocol) -> Self {
        Self {
            host_address: None,
            host_port,
            container_port,
            protocol,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.host_address = Some(address.into());
        self
    }

    /// Parse a compose short token such as `127.0.0.1:47290-47299:7149`,
    /// `[::1]::3389/udp` or `8006`.
    pub fn parse(token: &str) -> Result<Self, PortParseError> {
        let input = token.trim();
        if input.is_empty() {
            return Err(PortParseError::new(token, "empty mapping"));
        }

        let (body, protocol) = match input.rsplit_once('/') {
            Some((body, proto)) => (body, proto.parse::<Protocol>()?),
            None => (input, Protocol::Tcp),
        };

        let (host_address, rest) = if let Some(stripped) = body.strip_prefix('[') {
            let (addr, rest) = stripped
                .split_once(']')
                .ok_or_else(|| PortParseError::new(input, "unterminated '[' in host address"))?;
            let rest = rest
                .strip_prefix(':')
                .ok_or_else(|| PortParseError::new(input, "expected ':' after host address"))?;
            if addr.is_empty() {
                return Err(PortParseError::new(input, "empty host address"));
            }
            (Some(addr.to_string()), rest)
        } else {
            (None, body)
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let (host_address, host_raw, container_raw) = match (host_address, parts.as_slice()) {
            (Some(addr), [host, container]) => (Some(addr), *host, *container),
            (Some(_), _) => {
                return Err(PortParseError::new(
                    input,
                    "expected hostPort:containerPort after bracketed address",
                ));
            }
            (None, [container]) => (None, "", *container),
            (None, [host, container]) => (None, *host, *container),
            (None, [addr, host, container]) => {
                if addr.is_empty() {
                    return Err(PortParseError::new(input, "empty host address"));
                }
                (Some(addr.to_string()), *host, *container)
            }
            (None, _) => {
                return Err(PortParseError::new(
                    input,
                    "too many ':' separators (IPv6 addresses must be bracketed)",
                ));
            }
        };

        if container_raw.trim().is_empty() {
            return Err(PortParseError::new(input, "container port is required"));
        }
        let container_port = parse_port(input, container_raw)?;
        let host_port = HostPort::parse(input, host_raw)?;

        Ok(Self {
            host_address,
            host_port,
            container_port,
            protocol,
        })
    }

    /// Render as a compose short token. `/tcp` is implied and omitted.
    pub fn to_token(&self) -> String {
        let mut out = String::new();
        match (&self.host_address, self.host_port) {
            (Some(addr), hp) => {
                if addr.contains(':') {
                    out.push_str(&format!("[{}]:{}:", addr, hp));
                } else {
                    out.push_str(&format!("{}:{}:", addr, hp));
                }
            }
            (None, HostPort::Dynamic) => {}
            (None, hp) => out.push_str(&format!("{}:", hp)),
        }
        out.push_str(&self.container_port.to_string());
        if self.protocol == Protocol::Udp {
            out.push_str("/udp");
        }
        out
    }

    /// Whether `reported` is an acceptable resolution of this declaration.
    pub fn admits(&self, reported: &ResolvedPortBinding) -> bool {
        self.container_port == reported.container_port
            && self.protocol == reported.protocol
            && self.host_port.admits(reported.host_port)
    }
}

impl std::fmt::Display for PortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_token())
    }
}

impl std::str::FromStr for PortBinding {
    type Err = PortParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortBinding::parse(s)
    }
}

/// A binding whose host side is a concrete port, as reported by a running backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedPortBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_address: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl std::fmt::Display for ResolvedPortBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addr = self.host_address.as_deref().unwrap_or("0.0.0.0");
        if addr.contains(':') {
            write!(
                f,
                "[{}]:{} -> {}/{}",
                addr, self.host_port, self.container_port, self.protocol
            )
        } else {
            write!(
                f,
                "{}:{} -> {}/{}",
                addr, self.host_port, self.container_port, self.protocol
            )
        }
    }
}

// ─── Long form ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum Published {
    Number(u16),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LongPort {
    target: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    published: Option<Published>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    protocol: Option<Protocol>,
}

impl LongPort {
    fn into_binding(self) -> Result<PortBinding, PortParseError> {
        let label = format!("target {}", self.target);
        if self.target == 0 {
            return Err(PortParseError::new(label, "port 0 is not allowed"));
        }
        let host_port = match self.published {
            None => HostPort::Dynamic,
            Some(Published::Number(0)) => {
                return Err(PortParseError::new(label, "port 0 is not allowed"));
            }
            Some(Published::Number(p)) => HostPort::Fixed(p),
            Some(Published::Text(s)) => HostPort::parse(&label, &s)?,
        };
        Ok(PortBinding {
            host_address: self.host_ip.filter(|s| !s.is_empty()),
            host_port,
            container_port: self.target,
            protocol: self.protocol.unwrap_or_default(),
        })
    }

    fn from_binding(b: &PortBinding) -> Self {
        let published = match b.host_port {
            HostPort::Fixed(p) => Some(Published::Number(p)),
            HostPort::Range(lo, hi) => Some(Published::Text(format!("{}-{}", lo, hi))),
            HostPort::Dynamic => None,
        };
        Self {
            target: b.container_port,
            published,
            host_ip: b.host_address.clone(),
            protocol: Some(b.protocol),
        }
    }
}

/// Form a binding was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortForm {
    #[default]
    Short,
    Long,
}

/// A descriptor `ports:` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub binding: PortBinding,
    pub form: PortForm,
}

impl PortSpec {
    pub fn short(binding: PortBinding) -> Self {
        Self {
            binding,
            form: PortForm::Short,
        }
    }

    pub fn parse(token: &str) -> Result<Self, PortParseError> {
        Ok(Self::short(PortBinding::parse(token)?))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPortSpec {
    Number(u16),
    Token(String),
    Long(LongPort),
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawPortSpec::deserialize(deserializer)?;
        let spec = match raw {
            RawPortSpec::Number(p) => PortSpec::parse(&p.to_string()),
            RawPortSpec::Token(t) => PortSpec::parse(&t),
            RawPortSpec::Long(l) => l.into_binding().map(|binding| PortSpec {
                binding,
                form: PortForm::Long,
            }),
        };
        spec.map_err(serde::de::Error::custom)
    }
}

impl Serialize for PortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.form {
            PortForm::Short => serializer.serialize_str(&self.binding.to_token()),
            PortForm::Long => LongPort::from_binding(&self.binding).serialize(serializer),
        }
    }
}
