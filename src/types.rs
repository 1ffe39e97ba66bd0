use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Literal types ────────────────────────────────────────────────────

/// The closed set of value types a Flow program can compute with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LiteralType {
    Void,
    Boolean,
    Number,
    String,
    IPAddress,
    Cidr,
    RegExp,
    Handler,
    IntArray,
    StringArray,
    IPAddrArray,
    CidrArray,
}

impl LiteralType {
    /// One-character code used inside signature strings.
    pub fn code(self) -> char {
        match self {
            LiteralType::Void => 'V',
            LiteralType::Boolean => 'B',
            LiteralType::Number => 'I',
            LiteralType::String => 'S',
            LiteralType::IPAddress => 'P',
            LiteralType::Cidr => 'C',
            LiteralType::RegExp => 'R',
            LiteralType::Handler => 'H',
            LiteralType::IntArray => 'i',
            LiteralType::StringArray => 's',
            LiteralType::IPAddrArray => 'p',
            LiteralType::CidrArray => 'c',
        }
    }

    pub fn from_code(c: char) -> Option<Self> {
        Some(match c {
            'V' => LiteralType::Void,
            'B' => LiteralType::Boolean,
            'I' => LiteralType::Number,
            'S' => LiteralType::String,
            'P' => LiteralType::IPAddress,
            'C' => LiteralType::Cidr,
            'R' => LiteralType::RegExp,
            'H' => LiteralType::Handler,
            'i' => LiteralType::IntArray,
            's' => LiteralType::StringArray,
            'p' => LiteralType::IPAddrArray,
            'c' => LiteralType::CidrArray,
            _ => return None,
        })
    }

    /// Array type holding elements of `self`, if Flow has one.
    pub fn array_of(self) -> Option<Self> {
        match self {
            LiteralType::Number => Some(LiteralType::IntArray),
            LiteralType::String => Some(LiteralType::StringArray),
            LiteralType::IPAddress => Some(LiteralType::IPAddrArray),
            LiteralType::Cidr => Some(LiteralType::CidrArray),
            _ => None,
        }
    }

    pub fn is_array(self) -> bool {
        matches!(
            self,
            LiteralType::IntArray | LiteralType::StringArray | LiteralType::IPAddrArray | LiteralType::CidrArray
        )
    }
}

impl fmt::Display for LiteralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LiteralType::Void => "void",
            LiteralType::Boolean => "bool",
            LiteralType::Number => "int",
            LiteralType::String => "string",
            LiteralType::IPAddress => "IPAddress",
            LiteralType::Cidr => "Cidr",
            LiteralType::RegExp => "RegExp",
            LiteralType::Handler => "handler",
            LiteralType::IntArray => "int[]",
            LiteralType::StringArray => "string[]",
            LiteralType::IPAddrArray => "IPAddress[]",
            LiteralType::CidrArray => "Cidr[]",
        };
        f.write_str(name)
    }
}

// ── Signature ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature '{0}' is missing its argument list")]
    MissingArgs(String),
    #[error("signature '{0}' has an empty name")]
    EmptyName(String),
    #[error("unknown type code '{code}' in signature '{signature}'")]
    UnknownTypeCode { signature: String, code: char },
    #[error("signature '{0}' must have exactly one return type code")]
    BadReturn(String),
}

/// Identity of a native callable: `name(args)ret`, one character per type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub args: Vec<LiteralType>,
    pub ret: LiteralType,
}

impl Signature {
    pub fn new(name: impl Into<String>, args: Vec<LiteralType>, ret: LiteralType) -> Self {
        Signature { name: name.into(), args, ret }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for arg in &self.args {
            write!(f, "{}", arg.code())?;
        }
        write!(f, "){}", self.ret.code())
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let open = s.find('(').ok_or_else(|| SignatureError::MissingArgs(s.to_string()))?;
        let close = s.rfind(')').filter(|&c| c > open).ok_or_else(|| SignatureError::MissingArgs(s.to_string()))?;

        let name = &s[..open];
        if name.is_empty() {
            return Err(SignatureError::EmptyName(s.to_string()));
        }

        let decode = |c: char| {
            LiteralType::from_code(c).ok_or_else(|| SignatureError::UnknownTypeCode { signature: s.to_string(), code: c })
        };

        let args = s[open + 1..close].chars().map(decode).collect::<Result<Vec<_>, _>>()?;

        let mut ret_chars = s[close + 1..].chars();
        let ret = match (ret_chars.next(), ret_chars.next()) {
            (Some(c), None) => decode(c)?,
            _ => return Err(SignatureError::BadReturn(s.to_string())),
        };

        Ok(Signature { name: name.to_string(), args, ret })
    }
}

// ── Cidr ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CidrError {
    #[error("'{0}' is not in address/prefix notation")]
    MissingPrefix(String),
    #[error("invalid address in '{0}'")]
    BadAddress(String),
    #[error("prefix length {prefix} is too large for {address}")]
    PrefixTooLong { address: IpAddr, prefix: u8 },
    #[error("invalid prefix length in '{0}'")]
    BadPrefix(String),
}

/// An IP network in CIDR notation, e.g. `10.0.0.0/8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cidr {
    address: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn new(address: IpAddr, prefix: u8) -> Result<Self, CidrError> {
        let max = match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(CidrError::PrefixTooLong { address, prefix });
        }
        Ok(Cidr { address, prefix })
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `ip` lies inside this network. Mixed address families never match.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_u32(self.prefix);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_u128(self.prefix);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_u32(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) }
}

fn prefix_mask_u128(prefix: u8) -> u128 {
    if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| CidrError::MissingPrefix(s.to_string()))?;
        let address: IpAddr = addr.parse().map_err(|_| CidrError::BadAddress(s.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| CidrError::BadPrefix(s.to_string()))?;
        Cidr::new(address, prefix)
    }
}

// ── Number semantics ─────────────────────────────────────────────────
//
// Shared by constant folding and the VM so folded and executed results agree.

/// Wrapping `base ** exp`. Negative exponents truncate toward zero.
pub(crate) fn number_pow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return match base {
            1 => 1,
            -1 if exp % 2 == 0 => 1,
            -1 => -1,
            _ => 0,
        };
    }
    base.wrapping_pow(u32::try_from(exp).unwrap_or(u32::MAX))
}

/// Lenient string-to-number conversion; unparsable input yields 0.
pub(crate) fn parse_number(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}
