//! Component header: who this process is.
//!
//! Built exactly once at startup, before any network activity. The only
//! mutation it ever sees is redaction of the access key, and that happens on
//! a copy ([`PublicHeader`]) so the full header stays usable for registration.

use chrono::{DateTime, Utc};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ComponentConfig;
use crate::identity::{self, IdentityError, MAX_NODE_ID};

/// Placeholder replacing the access key in anything broadcast.
pub const REDACTED: &str = "hidden";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHeader {
    #[serde(rename = "componentID")]
    pub component_id: String,
    #[serde(rename = "publisherID", default)]
    pub publisher_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub intro: String,
    #[serde(default)]
    pub author: String,
    #[serde(rename = "startTime", default = "Utc::now")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "snowID", default)]
    pub snow_id: i64,
    #[serde(rename = "serverNodeID", default)]
    pub server_node_id: i64,
    #[serde(default)]
    pub pid: u32,
    #[serde(rename = "localIP", default)]
    pub local_ip: String,
    #[serde(rename = "accessKey", default)]
    pub access_key: String,
    #[serde(rename = "compEnabled", default = "enabled_flag")]
    pub comp_enabled: i32,
}

fn enabled_flag() -> i32 {
    1
}

impl ComponentHeader {
    /// Builds the header for this process from its configuration.
    ///
    /// Fails with [`IdentityError::InvalidNodeId`] when `serverID` is outside
    /// `0..=1023`.
    pub fn build(cfg: &ComponentConfig) -> Result<Self, IdentityError> {
        let node = cfg.server_id;
        let snow_id = identity::generate(node)?;
        let local_ip = local_ipv4().unwrap_or_default();

        Ok(Self {
            component_id: cfg.ntcb.component_id.clone(),
            publisher_id: cfg.ntcb.publisher_id.clone(),
            version: cfg.ntcb.app_version.clone(),
            intro: cfg.ntcb.app_intro.clone(),
            author: cfg.ntcb.app_author.clone(),
            start_time: Utc::now(),
            snow_id,
            server_node_id: node,
            pid: std::process::id(),
            local_ip,
            access_key: cfg.ntcb.access_key.clone(),
            comp_enabled: 1,
        })
    }

    pub fn node_id_valid(&self) -> bool {
        (0..=MAX_NODE_ID).contains(&self.server_node_id)
    }

    /// Copy safe to broadcast.
    pub fn public(&self) -> PublicHeader {
        PublicHeader::from(self.clone())
    }

    /// Bus client identifier: unique per live process under normal operation.
    pub fn client_id(&self) -> String {
        format!("{}_{}_{}", self.component_id, self.local_ip, self.pid)
    }
}

/// A header whose access key has been replaced by [`REDACTED`].
///
/// Lifecycle broadcasts only accept this type, so a header carrying the real
/// secret cannot reach a broadcast topic. Deserialising also redacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ComponentHeader")]
pub struct PublicHeader(ComponentHeader);

impl From<ComponentHeader> for PublicHeader {
    fn from(mut header: ComponentHeader) -> Self {
        header.access_key = REDACTED.to_string();
        PublicHeader(header)
    }
}

impl PublicHeader {
    pub fn header(&self) -> &ComponentHeader {
        &self.0
    }

    pub fn into_inner(self) -> ComponentHeader {
        self.0
    }
}

/// First non-loopback IPv4 address of this host, if any.
pub fn local_ipv4() -> Option<String> {
    let interfaces = match get_if_addrs() {
        Ok(list) => list,
        Err(e) => {
            debug!("interface enumeration failed: {e}");
            return None;
        }
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(v4.ip.to_string()),
            IfAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ComponentConfig {
        let mut cfg = ComponentConfig::default();
        cfg.server_id = 2;
        cfg.ntcb.component_id = "BotDolly".into();
        cfg.ntcb.access_key = "secret1".into();
        cfg
    }

    #[test]
    fn test_build_header() {
        let header = ComponentHeader::build(&config()).unwrap();
        assert_eq!(header.component_id, "BotDolly");
        assert_eq!(header.server_node_id, 2);
        assert_eq!(header.comp_enabled, 1);
        assert_eq!(header.pid, std::process::id());
        assert_eq!(identity::decompose(header.snow_id).1, 2);
        assert!(header.client_id().starts_with("BotDolly_"));
    }

    #[test]
    fn test_build_rejects_bad_node() {
        let mut cfg = config();
        cfg.server_id = 4096;
        assert!(matches!(
            ComponentHeader::build(&cfg),
            Err(IdentityError::InvalidNodeId(4096))
        ));
    }

    #[test]
    fn test_public_header_redacts_secret() {
        let header = ComponentHeader::build(&config()).unwrap();
        let json = serde_json::to_string(&header.public()).unwrap();
        assert!(!json.contains("secret1"));
        assert!(json.contains(r#""accessKey":"hidden""#));
        // the source header is untouched
        assert_eq!(header.access_key, "secret1");
    }

    #[test]
    fn test_decoding_public_header_redacts() {
        let json = r#"{"componentID":"X","accessKey":"leaked"}"#;
        let public: PublicHeader = serde_json::from_str(json).unwrap();
        assert_eq!(public.header().access_key, REDACTED);
    }

    #[test]
    fn test_wire_field_names() {
        let header = ComponentHeader::build(&config()).unwrap();
        let value = serde_json::to_value(&header).unwrap();
        for key in [
            "componentID", "publisherID", "version", "intro", "author", "startTime",
            "snowID", "serverNodeID", "pid", "localIP", "accessKey", "compEnabled",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_minimal_header_decodes() {
        let json = r#"{"componentID":"BotDolly","accessKey":"secret1","serverNodeID":2}"#;
        let header: ComponentHeader = serde_json::from_str(json).unwrap();
        assert_eq!(header.server_node_id, 2);
        assert_eq!(header.comp_enabled, 1);
        assert!(header.node_id_valid());
    }
}
