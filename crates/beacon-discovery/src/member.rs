//! Member metadata
//!
//! The payload carried by leadership and membership records: the member's
//! advertised endpoint plus free-form attributes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use beacon_common::{Result, local_ip};

use crate::config::Endpoint;

/// Metadata a process advertises when joining a group or campaigning.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberMetadata {
    pub endpoint: Endpoint,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl MemberMetadata {
    pub fn new(endpoint: Endpoint) -> Self {
        MemberMetadata {
            endpoint,
            attributes: BTreeMap::new(),
        }
    }

    /// Metadata advertising the local non-loopback address on `port`.
    pub fn for_local(port: u16) -> Self {
        MemberMetadata::new(Endpoint::new(local_ip(), port))
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub(crate) fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_attributes() {
        let metadata = MemberMetadata::new(Endpoint::new("10.0.0.7", 8081))
            .with_attribute("zone", "us-east-1a");

        let bytes = metadata.to_bytes().unwrap();
        let decoded = MemberMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.attributes.get("zone").unwrap(), "us-east-1a");
    }

    #[test]
    fn test_attributes_default_when_absent() {
        let decoded =
            MemberMetadata::from_bytes(br#"{"endpoint":{"host":"10.0.0.7","port":8081}}"#)
                .unwrap();
        assert_eq!(decoded.endpoint, Endpoint::new("10.0.0.7", 8081));
        assert!(decoded.attributes.is_empty());
    }

    #[test]
    fn test_for_local() {
        let metadata = MemberMetadata::for_local(8081);
        assert!(!metadata.endpoint.host.is_empty());
        assert_eq!(metadata.endpoint.port, 8081);
    }
}
