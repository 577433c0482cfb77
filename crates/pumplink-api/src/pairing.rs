// ── Pairing identity ──
//
// The data produced once at pairing time and required to open every
// later session: the pump's radio address, the two symmetric keys, the
// key-response address byte and the pump's serial identifier.

use std::fmt;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Length of a pump radio address in bytes.
pub const ADDRESS_LEN: usize = 6;

/// Length of each symmetric cipher key in bytes.
pub const CIPHER_KEY_LEN: usize = 16;

// ── DeviceAddress ────────────────────────────────────────────────

/// Fixed-length radio address of a paired pump.
///
/// Displays and parses as colon-separated lowercase hex
/// (`"00:0e:2f:1a:b4:77"`); dashes are accepted when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; ADDRESS_LEN]);

impl DeviceAddress {
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Build an address from a byte slice, rejecting wrong lengths.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let array: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidAddress(format!(
                "expected {ADDRESS_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != ADDRESS_LEN {
            return Err(Error::InvalidAddress(s.to_owned()));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        for (slot, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(Error::InvalidAddress(s.to_owned()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidAddress(s.to_owned()))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(addr: DeviceAddress) -> Self {
        addr.to_string()
    }
}

// ── CipherKey ────────────────────────────────────────────────────

/// A symmetric session key. Zeroized on drop, redacted in `Debug`.
#[derive(Debug)]
pub struct CipherKey(SecretBox<[u8; CIPHER_KEY_LEN]>);

impl CipherKey {
    pub fn new(bytes: [u8; CIPHER_KEY_LEN]) -> Self {
        Self(SecretBox::new(Box::new(bytes)))
    }

    /// Build a key from a byte slice, returning `None` on a length mismatch.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; CIPHER_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self::new(array))
    }

    pub fn expose(&self) -> &[u8; CIPHER_KEY_LEN] {
        self.0.expose_secret()
    }
}

impl Clone for CipherKey {
    fn clone(&self) -> Self {
        Self::new(*self.expose())
    }
}

impl PartialEq for CipherKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl Eq for CipherKey {}

// ── PumpIdentity ─────────────────────────────────────────────────

/// Everything needed to open an authenticated session with one pump.
///
/// Created once at pairing, destroyed at unpairing. The replay counter
/// is deliberately not part of this record: it changes on every
/// security-sensitive exchange and is persisted through
/// [`ReplayCounterStore`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpIdentity {
    pub address: DeviceAddress,
    /// Key for client → pump packets.
    pub client_pump_key: CipherKey,
    /// Key for pump → client packets.
    pub pump_client_key: CipherKey,
    pub key_response_address: u8,
    /// Opaque serial identifier reported by the pump during pairing.
    pub pump_id: String,
}

// ── ReplayCounterStore ───────────────────────────────────────────

/// Durable home of the replay-protection counter ("tx nonce").
///
/// The channel calls [`set_replay_counter`](Self::set_replay_counter)
/// after every security-sensitive exchange and must not issue the next
/// one until the call returns `Ok`. Implementations must make the value
/// durable before returning and must refuse to move it backwards. A
/// lost increment leads to counter reuse under the same key, so errors
/// are returned rather than logged.
pub trait ReplayCounterStore: Send + Sync {
    fn replay_counter(&self) -> Result<u64, Error>;

    fn set_replay_counter(&self, value: u64) -> Result<(), Error>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display() {
        let addr = DeviceAddress::new([0x00, 0x0e, 0x2f, 0x1a, 0xb4, 0x77]);
        assert_eq!(addr.to_string(), "00:0e:2f:1a:b4:77");
        assert_eq!("00:0E:2F:1A:B4:77".parse::<DeviceAddress>().unwrap(), addr);
    }

    #[test]
    fn address_accepts_dashes() {
        let addr: DeviceAddress = "00-0e-2f-1a-b4-77".parse().unwrap();
        assert_eq!(addr.as_bytes()[5], 0x77);
    }

    #[test]
    fn address_rejects_short_input() {
        assert!("00:0e:2f".parse::<DeviceAddress>().is_err());
        assert!("00:0e:2f:1a:b4:7".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn address_from_slice_checks_length() {
        assert!(DeviceAddress::from_slice(&[1, 2, 3]).is_err());
        assert!(DeviceAddress::from_slice(&[1, 2, 3, 4, 5, 6]).is_ok());
    }

    #[test]
    fn cipher_key_debug_is_redacted() {
        let key = CipherKey::new([0xAB; CIPHER_KEY_LEN]);
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn cipher_key_from_slice_rejects_wrong_length() {
        assert!(CipherKey::from_slice(&[0u8; 15]).is_none());
        assert_eq!(
            CipherKey::from_slice(&[7u8; CIPHER_KEY_LEN]).unwrap().expose(),
            &[7u8; CIPHER_KEY_LEN]
        );
    }
}
