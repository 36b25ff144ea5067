//! Envelope wire format
//!
//! Layout (big endian):
//!
//! ```text
//! u8  version
//! u8  kind
//! u16 len + utf8   origin proxy id
//! u16 len + utf8   network id
//! u8  has_correlation, then u16 len + utf8 correlation id if 1
//! u32 len + bytes  payload
//! ```
//!
//! Payload bytes are carried opaquely and come back byte-identical.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use redisbungee_core::models::{NetworkId, ProxyId};
use redisbungee_core::ProxyIdentity;

use crate::error::{Error, Result};
use crate::store::KeySpace;

const WIRE_VERSION: u8 = 1;

/// Message kinds carried on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// A player joined, left or changed server
    PresenceChange,
    /// A dead proxy was cleaned up
    ProxyReaped,
    /// A proxy is stopping cleanly
    ProxyLeaving,
    Request,
    Response,
    /// Opaque plugin channel message
    PluginMessage,
    /// Run a command on one or all proxies
    RunCommand,
    /// Disconnect a player wherever they are connected
    Kick,
}

impl EnvelopeKind {
    pub const ALL: [Self; 8] = [
        Self::PresenceChange,
        Self::ProxyReaped,
        Self::ProxyLeaving,
        Self::Request,
        Self::Response,
        Self::PluginMessage,
        Self::RunCommand,
        Self::Kick,
    ];

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::PresenceChange => 1,
            Self::ProxyReaped => 2,
            Self::ProxyLeaving => 3,
            Self::Request => 4,
            Self::Response => 5,
            Self::PluginMessage => 6,
            Self::RunCommand => 7,
            Self::Kick => 8,
        }
    }

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::PresenceChange),
            2 => Some(Self::ProxyReaped),
            3 => Some(Self::ProxyLeaving),
            4 => Some(Self::Request),
            5 => Some(Self::Response),
            6 => Some(Self::PluginMessage),
            7 => Some(Self::RunCommand),
            8 => Some(Self::Kick),
            _ => None,
        }
    }

    /// Channel this kind travels on
    #[must_use]
    pub fn channel(self, keys: &KeySpace) -> String {
        match self {
            Self::PresenceChange => keys.channel_presence(),
            Self::Request | Self::Response => keys.channel_rpc(),
            Self::PluginMessage => keys.channel_messages(),
            Self::ProxyReaped | Self::ProxyLeaving | Self::RunCommand | Self::Kick => {
                keys.channel_all()
            }
        }
    }
}

/// A typed message unit exchanged over the bus. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub origin_proxy_id: ProxyId,
    pub network_id: NetworkId,
    /// Set on requests and echoed on their responses
    pub correlation_id: Option<String>,
    pub payload: Bytes,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: EnvelopeKind, identity: &ProxyIdentity, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            origin_proxy_id: identity.proxy_id().clone(),
            network_id: identity.network_id().clone(),
            correlation_id: None,
            payload: payload.into(),
        }
    }

    /// Build an envelope whose payload is the JSON encoding of `body`
    pub fn json<T: Serialize>(kind: EnvelopeKind, identity: &ProxyIdentity, body: &T) -> Result<Self> {
        Ok(Self::new(kind, identity, serde_json::to_vec(body)?))
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(
            8 + self.origin_proxy_id.as_str().len()
                + self.network_id.as_str().len()
                + self.correlation_id.as_ref().map_or(0, String::len)
                + self.payload.len(),
        );

        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.kind.as_u8());
        put_str(&mut buf, self.origin_proxy_id.as_str())?;
        put_str(&mut buf, self.network_id.as_str())?;
        match &self.correlation_id {
            Some(id) => {
                buf.put_u8(1);
                put_str(&mut buf, id)?;
            }
            None => buf.put_u8(0),
        }
        put_bytes(&mut buf, &self.payload)?;

        Ok(buf.freeze())
    }

    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let version = get_u8(&mut data)?;
        if version != WIRE_VERSION {
            return Err(Error::Serialization(format!(
                "Unsupported envelope version {version}"
            )));
        }

        let raw_kind = get_u8(&mut data)?;
        let kind = EnvelopeKind::from_u8(raw_kind)
            .ok_or_else(|| Error::Serialization(format!("Unknown envelope kind {raw_kind}")))?;
        let origin_proxy_id = ProxyId::from_string(get_str(&mut data)?);
        let network_id = NetworkId::from_string(get_str(&mut data)?);
        let correlation_id = match get_u8(&mut data)? {
            0 => None,
            1 => Some(get_str(&mut data)?),
            flag => {
                return Err(Error::Serialization(format!(
                    "Invalid correlation flag {flag}"
                )))
            }
        };
        let payload = get_bytes(&mut data)?;

        if data.has_remaining() {
            return Err(Error::Serialization(format!(
                "{} trailing bytes after envelope",
                data.remaining()
            )));
        }

        Ok(Self {
            kind,
            origin_proxy_id,
            network_id,
            correlation_id,
            payload,
        })
    }
}

// ==================== Primitives ====================

pub(crate) fn put_str(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::Serialization(format!("String field too long ({} bytes)", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| Error::Serialization(format!("Payload too long ({} bytes)", value.len())))?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

fn truncated(field: &str) -> Error {
    Error::Serialization(format!("Truncated envelope while reading {field}"))
}

pub(crate) fn get_u8(data: &mut &[u8]) -> Result<u8> {
    if data.remaining() < 1 {
        return Err(truncated("u8"));
    }
    Ok(data.get_u8())
}

pub(crate) fn get_str(data: &mut &[u8]) -> Result<String> {
    if data.remaining() < 2 {
        return Err(truncated("string length"));
    }
    let len = usize::from(data.get_u16());
    if data.remaining() < len {
        return Err(truncated("string"));
    }
    let raw = data.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| Error::Serialization(format!("Invalid UTF-8 in envelope: {e}")))
}

pub(crate) fn get_bytes(data: &mut &[u8]) -> Result<Bytes> {
    if data.remaining() < 4 {
        return Err(truncated("payload length"));
    }
    let len = data.get_u32() as usize;
    if data.remaining() < len {
        return Err(truncated("payload"));
    }
    Ok(data.copy_to_bytes(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ProxyIdentity {
        ProxyIdentity::new("proxy-a", "main").unwrap()
    }

    #[test]
    fn test_every_kind_round_trips() {
        let payload: Vec<u8> = (0..=255).collect();
        for kind in EnvelopeKind::ALL {
            let mut envelope = Envelope::new(kind, &identity(), payload.clone());
            if matches!(kind, EnvelopeKind::Request | EnvelopeKind::Response) {
                envelope = envelope.with_correlation("abc123");
            }

            let encoded = envelope.encode().unwrap();
            let decoded = Envelope::decode(&encoded).unwrap();
            assert_eq!(decoded, envelope);
            assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_kind_codes_are_unique() {
        for kind in EnvelopeKind::ALL {
            assert_eq!(EnvelopeKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(EnvelopeKind::from_u8(0), None);
        assert_eq!(EnvelopeKind::from_u8(9), None);
    }

    #[test]
    fn test_empty_payload() {
        let envelope = Envelope::new(EnvelopeKind::ProxyLeaving, &identity(), Bytes::new());
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded.correlation_id, None);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        let encoded = Envelope::new(EnvelopeKind::Kick, &identity(), b"payload".to_vec())
            .encode()
            .unwrap();

        // Every strict prefix is truncated
        for len in 0..encoded.len() {
            assert!(matches!(
                Envelope::decode(&encoded[..len]),
                Err(Error::Serialization(_))
            ));
        }

        let mut trailing = encoded.to_vec();
        trailing.push(0);
        assert!(Envelope::decode(&trailing).is_err());

        let mut bad_kind = encoded.to_vec();
        bad_kind[1] = 42;
        assert!(Envelope::decode(&bad_kind).is_err());

        assert!(Envelope::decode(b"{\"json\": true}").is_err());
    }

    #[test]
    fn test_json_payload() {
        let envelope =
            Envelope::json(EnvelopeKind::Response, &identity(), &vec!["a", "b"]).unwrap();
        let body: Vec<String> = envelope.decode_json().unwrap();
        assert_eq!(body, vec!["a", "b"]);
    }
}
