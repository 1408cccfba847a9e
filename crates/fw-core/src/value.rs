// Parsing of the textual IP and port values carried by matches and NAT targets
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("empty value")]
    Empty,

    #[error("invalid IP address '{0}'")]
    InvalidIp(String),

    #[error("invalid subnet '{0}'")]
    InvalidSubnet(String),

    #[error("invalid range '{0}': {1}")]
    InvalidRange(String, &'static str),

    #[error("invalid set reference '{0}'")]
    InvalidSetRef(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid interface name '{0}': must be 1-15 bytes")]
    InvalidInterface(String),
}

/// Interface names are stored NUL-padded in a 16-byte buffer
pub const IFNAMSIZ: usize = 16;

pub fn check_ifname(name: &str) -> Result<(), ValueError> {
    if name.is_empty() || name.len() >= IFNAMSIZ || name.contains('\0') {
        return Err(ValueError::InvalidInterface(name.to_string()));
    }
    Ok(())
}

/// Resolved form of an IP match value or NAT target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpValue {
    Void,
    Addr(IpAddr),
    Subnet(IpNet),
    /// Inclusive, start <= end, both of the same address family
    Range(IpAddr, IpAddr),
    /// `@name` reference to a set in the same table
    SetRef(String),
}

impl IpValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Addr(_) => "ip",
            Self::Subnet(_) => "subnet",
            Self::Range(..) => "range",
            Self::SetRef(_) => "named set",
        }
    }
}

impl FromStr for IpValue {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if value.is_empty() {
            return Ok(Self::Void);
        }

        if let Some(name) = value.strip_prefix('@') {
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(ValueError::InvalidSetRef(value.to_string()));
            }
            return Ok(Self::SetRef(name.to_string()));
        }

        if value.contains('/') {
            let net: IpNet = value
                .parse()
                .map_err(|_| ValueError::InvalidSubnet(value.to_string()))?;
            return Ok(Self::Subnet(net));
        }

        if let Some((start, end)) = value.split_once('-') {
            let start: IpAddr = start
                .trim()
                .parse()
                .map_err(|_| ValueError::InvalidRange(value.to_string(), "bad start address"))?;
            let end: IpAddr = end
                .trim()
                .parse()
                .map_err(|_| ValueError::InvalidRange(value.to_string(), "bad end address"))?;
            if start.is_ipv4() != end.is_ipv4() {
                return Err(ValueError::InvalidRange(
                    value.to_string(),
                    "mixed address families",
                ));
            }
            if start > end {
                return Err(ValueError::InvalidRange(
                    value.to_string(),
                    "start is greater than end",
                ));
            }
            return Ok(Self::Range(start, end));
        }

        let addr: IpAddr = value
            .parse()
            .map_err(|_| ValueError::InvalidIp(value.to_string()))?;
        Ok(Self::Addr(addr))
    }
}

/// Resolved form of a port match value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortValue {
    Single(u16),
    Range(u16, u16),
}

impl FromStr for PortValue {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        if value.is_empty() {
            return Err(ValueError::Empty);
        }

        match value.split_once('-') {
            Some((start, end)) => {
                let start = parse_port(start, value)?;
                let end = parse_port(end, value)?;
                if start > end {
                    return Err(ValueError::InvalidRange(
                        value.to_string(),
                        "start is greater than end",
                    ));
                }
                Ok(Self::Range(start, end))
            }
            None => Ok(Self::Single(parse_port(value, value)?)),
        }
    }
}

fn parse_port(part: &str, whole: &str) -> Result<u16, ValueError> {
    part.trim()
        .parse()
        .map_err(|_| ValueError::InvalidPort(whole.to_string()))
}
