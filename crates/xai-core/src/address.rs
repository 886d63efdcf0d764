//! Address encoding for the XAI network.
//!
//! An address is `prefix || base32(hash160 || checksum)` where `hash160` is
//! RIPEMD-160(SHA-256(compressed pubkey)), the checksum is the first four
//! bytes of SHA-256d(prefix || hash160), and base32 uses the RFC 4648
//! alphabet (no padding). Prefixes are per-network:
//! - Mainnet: `XAI...`
//! - Testnet: `TXAI...`
//! - Regtest: `RXAI...`
//!
//! An address is valid iff it parses, its prefix matches the active network,
//! and the checksum verifies. The prefix carries no semantics beyond network
//! selection.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::codec::{Encodable, Reader, Writer};
use crate::crypto::{PublicKey, sha256d};
use crate::error::{AddressError, CodecError};

/// RFC 4648 base32 alphabet, uppercase, no padding.
const CHARSET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Checksum length in bytes.
const CHECKSUM_BYTES: usize = 4;

/// Network identifier determining the address prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Network {
    /// Mainnet (addresses start with `XAI`).
    Mainnet,
    /// Testnet (addresses start with `TXAI`).
    Testnet,
    /// Local regression-test network (addresses start with `RXAI`).
    Regtest,
}

impl Network {
    /// Address prefix for this network.
    pub fn prefix(&self) -> &'static str {
        match self {
            Network::Mainnet => "XAI",
            Network::Testnet => "TXAI",
            Network::Regtest => "RXAI",
        }
    }

    /// Canonical single-byte id used in the binary encoding.
    pub fn id(&self) -> u8 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
            Network::Regtest => 2,
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Network::Mainnet),
            1 => Some(Network::Testnet),
            2 => Some(Network::Regtest),
            _ => None,
        }
    }

    /// All networks, longest prefix first so `TXAI`/`RXAI` are never
    /// mistaken for a mainnet `XAI` match.
    fn all() -> [Network; 3] {
        [Network::Testnet, Network::Regtest, Network::Mainnet]
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(AddressError::UnknownPrefix(other.to_string())),
        }
    }
}

/// An XAI account address: a network tag plus a 20-byte pubkey hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    network: Network,
    hash: [u8; 20],
}

impl Address {
    /// Create an address from a raw hash160 payload.
    pub fn from_hash160(hash: [u8; 20], network: Network) -> Self {
        Self { network, hash }
    }

    /// Derive the address of a public key on the given network.
    pub fn from_public_key(public_key: &PublicKey, network: Network) -> Self {
        Self { network, hash: public_key.hash160() }
    }

    /// The 20-byte hash160 payload.
    pub fn hash160(&self) -> [u8; 20] {
        self.hash
    }

    /// The network this address belongs to.
    pub fn network(&self) -> Network {
        self.network
    }

    fn checksum(network: Network, hash: &[u8; 20]) -> [u8; CHECKSUM_BYTES] {
        let mut data = Vec::with_capacity(network.prefix().len() + 20);
        data.extend_from_slice(network.prefix().as_bytes());
        data.extend_from_slice(hash);
        let digest = sha256d(&data);
        digest.0[..CHECKSUM_BYTES].try_into().expect("4 bytes")
    }

    /// Encode as the printable `prefix || base32(payload || checksum)` form.
    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(20 + CHECKSUM_BYTES);
        payload.extend_from_slice(&self.hash);
        payload.extend_from_slice(&Self::checksum(self.network, &self.hash));

        let data5 = convert_bits(&payload, 8, 5, true).expect("8→5 with padding never fails");
        let mut out = String::with_capacity(self.network.prefix().len() + data5.len());
        out.push_str(self.network.prefix());
        for v in data5 {
            out.push(CHARSET[v as usize] as char);
        }
        out
    }

    /// Decode a printable address, inferring the network from its prefix.
    pub fn decode(s: &str) -> Result<Self, AddressError> {
        if let Some(c) = s.chars().find(|c| !c.is_ascii()) {
            return Err(AddressError::InvalidCharacter(c));
        }
        let network = Network::all()
            .into_iter()
            .find(|n| s.starts_with(n.prefix()))
            .ok_or_else(|| AddressError::UnknownPrefix(s.chars().take(4).collect()))?;
        Self::decode_payload(s, network)
    }

    /// Decode and require the address to belong to `network`.
    pub fn decode_for_network(s: &str, network: Network) -> Result<Self, AddressError> {
        let addr = Self::decode(s)?;
        if addr.network != network {
            return Err(AddressError::WrongNetwork {
                expected: network.prefix().to_string(),
                got: addr.network.prefix().to_string(),
            });
        }
        Ok(addr)
    }

    fn decode_payload(s: &str, network: Network) -> Result<Self, AddressError> {
        let body = &s[network.prefix().len()..];

        let mut data5 = Vec::with_capacity(body.len());
        for c in body.chars() {
            let pos = CHARSET
                .iter()
                .position(|&ch| ch as char == c)
                .ok_or(AddressError::InvalidCharacter(c))?;
            data5.push(pos as u8);
        }

        let payload = convert_bits(&data5, 5, 8, false).ok_or(AddressError::InvalidLength)?;
        if payload.len() != 20 + CHECKSUM_BYTES {
            return Err(AddressError::InvalidLength);
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[..20]);
        if payload[20..] != Self::checksum(network, &hash) {
            return Err(AddressError::InvalidChecksum);
        }

        Ok(Self { network, hash })
    }
}

/// Check whether `s` is a valid address on `network`.
pub fn validate_address(s: &str, network: Network) -> bool {
    Address::decode_for_network(s, network).is_ok()
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Encodable for Address {
    fn encode_into(&self, w: &mut Writer) {
        w.put_u8(self.network.id());
        w.put_raw(&self.hash);
    }

    fn decode_from(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let id = r.get_u8()?;
        let network =
            Network::from_id(id).ok_or(CodecError::InvalidTag { what: "network", tag: id })?;
        Ok(Self { network, hash: r.get_array::<20>()? })
    }
}

/// Regroup bits from `from`-bit groups to `to`-bit groups.
///
/// With `pad`, leftover bits are zero-padded into a final group; without,
/// leftover bits must be zero padding or the conversion fails.
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let maxv: u32 = (1 << to) - 1;
    let mut out = Vec::new();

    for &value in data {
        if u32::from(value) >> from != 0 {
            return None;
        }
        acc = (acc << from) | u32::from(value);
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }

    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return None;
    }

    Some(out)
}
