/// Interpretation of `isMaster` and `buildinfo` replies
use crate::core::document::{self, Document};
use crate::core::Endpoint;
use crate::node::info::{NodeType, ReplicaSetConfig, Tags};
use serde_json::Value;

/// Document size ceiling assumed when the server does not report one
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 4 * 1024 * 1024;
/// Lower bound for the message size ceiling when the server does not report one
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16_000_000;
/// Headroom a command envelope needs on top of the largest user document
pub const WIRE_DOCUMENT_OVERHEAD: usize = 16 * 1024;

/// Handshake fields that change on every reply and must not count as a change
pub const VOLATILE_FIELDS: &[&str] = &["localTime"];

/// Size ceilings that downstream batching relies on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityLimits {
    pub max_document_size: usize,
    pub max_message_size: usize,
    pub max_wire_document_size: usize,
}

impl Default for CapabilityLimits {
    fn default() -> Self {
        Self::derive(None, None, None)
    }
}

impl CapabilityLimits {
    pub fn from_handshake(is_master: &Document) -> Self {
        Self::derive(
            size_field(is_master, "maxBsonObjectSize"),
            size_field(is_master, "maxMessageSizeBytes"),
            size_field(is_master, "maxWireDocumentSize"),
        )
    }

    fn derive(
        max_document_size: Option<usize>,
        max_message_size: Option<usize>,
        max_wire_document_size: Option<usize>,
    ) -> Self {
        let max_document_size = max_document_size.unwrap_or(DEFAULT_MAX_DOCUMENT_SIZE);
        Self {
            max_document_size,
            max_message_size: max_message_size
                .unwrap_or_else(|| (max_document_size + 1024).max(DEFAULT_MAX_MESSAGE_SIZE)),
            max_wire_document_size: max_wire_document_size
                .unwrap_or(max_document_size + WIRE_DOCUMENT_OVERHEAD),
        }
    }
}

fn size_field(doc: &Document, key: &str) -> Option<usize> {
    document::get_i64(doc, key).and_then(|v| usize::try_from(v).ok())
}

/// Role precedence: replica-set membership first, then router, then standalone.
pub fn node_type(is_master: &Document) -> NodeType {
    let is_replica_set = document::flag(is_master, "isreplicaset") || is_master.contains_key("setName");

    if is_replica_set {
        if document::flag(is_master, "ismaster") {
            NodeType::Primary
        } else if document::flag(is_master, "secondary") {
            NodeType::Secondary
        } else if document::flag(is_master, "passive") || document::flag(is_master, "hidden") {
            NodeType::Passive
        } else if document::flag(is_master, "arbiterOnly") {
            NodeType::Arbiter
        } else {
            NodeType::Other
        }
    } else if document::get_str(is_master, "msg") == Some("isdbgrid") {
        NodeType::ShardRouter
    } else if document::flag(is_master, "ismaster") {
        NodeType::StandAlone
    } else {
        NodeType::Unknown
    }
}

/// Membership as seen by this node, `None` for non-members
pub fn replica_set_config(is_master: &Document) -> Option<ReplicaSetConfig> {
    let name = document::get_str(is_master, "setName")?;

    let members = ["hosts", "passives", "arbiters"]
        .iter()
        .flat_map(|field| document::get_str_array(is_master, field))
        .filter_map(|host| host.parse::<Endpoint>().ok())
        .collect();
    let primary = document::get_str(is_master, "primary").and_then(|p| p.parse().ok());
    let version = document::get_i64(is_master, "setVersion");

    Some(ReplicaSetConfig::new(
        members,
        name.to_string(),
        primary,
        version,
    ))
}

/// Member tags; non-string values are skipped
pub fn tags(is_master: &Document) -> Option<Tags> {
    let tags = is_master.get("tags")?.as_object()?;
    Some(
        tags.iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect(),
    )
}

pub fn wire_version_range(is_master: &Document) -> (i64, i64) {
    (
        document::get_i64(is_master, "minWireVersion").unwrap_or(0),
        document::get_i64(is_master, "maxWireVersion").unwrap_or(0),
    )
}

pub fn server_version(build_info: &Document) -> Option<String> {
    match build_info.get("version")? {
        Value::String(version) => Some(version.clone()),
        _ => None,
    }
}

pub fn strip_volatile_fields(mut is_master: Document) -> Document {
    for field in VOLATILE_FIELDS {
        is_master.remove(*field);
    }
    is_master
}
