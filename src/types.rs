// src/types.rs
// Record types shared across the communal memory substrate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Free-form JSON metadata attached to records.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Coarse hardware class of a device in the fleet
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HardwareTier {
    RaspberryPi,
    #[default]
    Laptop,
    Workstation,
    Server,
    Cloud,
}

/// Device connection status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
    Syncing,
    Error,
}

/// Conversation session status
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

/// Kind of change captured by a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncOperationType {
    Create,
    Update,
    Delete,
}

/// Record type a sync operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncItemType {
    Memory,
    Knowledge,
    Device,
}

/// A conversation memory in the communal store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub user_message: String,
    pub bot_response: String,
    pub embedding: Vec<f32>,
    pub device_id: String,
    /// Free-text annotation about this memory
    #[serde(default)]
    pub context: String,
    pub timestamp: DateTime<Utc>,
    /// Normalized cosine similarity in [0,1]; populated only on retrieval
    #[serde(default)]
    pub relevance_score: Option<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl MemoryItem {
    pub fn new(
        device_id: impl Into<String>,
        user_message: impl Into<String>,
        bot_response: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_message: user_message.into(),
            bot_response: bot_response.into(),
            embedding,
            device_id: device_id.into(),
            context: String::new(),
            timestamp: Utc::now(),
            relevance_score: None,
            tags: Vec::new(),
            metadata: Metadata::new(),
        }
    }
}

/// A knowledge chunk in the communal store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    /// File path, URL, or device that provided this knowledge
    pub source: String,
    pub device_id: String,
    #[serde(default)]
    pub chunk_index: i64,
    #[serde(default = "default_total_chunks")]
    pub total_chunks: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub relevance_score: Option<f32>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_total_chunks() -> i64 {
    1
}

impl KnowledgeItem {
    pub fn new(
        device_id: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            embedding,
            source: source.into(),
            device_id: device_id.into(),
            chunk_index: 0,
            total_chunks: 1,
            timestamp: Utc::now(),
            relevance_score: None,
            tags: Vec::new(),
            metadata: Metadata::new(),
        }
    }
}

/// Context information for a device in the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceContext {
    pub device_id: String,
    pub hardware_tier: HardwareTier,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 'research', 'coding', 'analysis', ...
    #[serde(default)]
    pub specialization: Option<String>,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub status: DeviceStatus,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_location() -> String {
    "unknown".to_string()
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl DeviceContext {
    pub fn new(device_id: impl Into<String>, hardware_tier: HardwareTier) -> Self {
        Self {
            device_id: device_id.into(),
            hardware_tier,
            capabilities: Vec::new(),
            specialization: None,
            location: default_location(),
            ip_address: None,
            hostname: None,
            last_seen: Utc::now(),
            status: DeviceStatus::Online,
            version: default_version(),
            metadata: Metadata::new(),
        }
    }

    /// Refresh the heartbeat timestamp to now.
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// A pending change record destined for another device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOperation {
    pub operation_id: String,
    pub operation_type: SyncOperationType,
    pub item_type: SyncItemType,
    pub item_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    /// Opaque JSON blob sufficient to apply the op on the receiving end
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub resolved: bool,
}

impl SyncOperation {
    pub fn new(
        operation_type: SyncOperationType,
        item_type: SyncItemType,
        item_id: impl Into<String>,
        device_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            operation_type,
            item_type,
            item_id: item_id.into(),
            device_id: device_id.into(),
            timestamp: Utc::now(),
            data,
            resolved: false,
        }
    }
}

/// Canonical payload carried by a sync operation, keyed by item type.
///
/// One serializer for all three record kinds so both ends of the wire agree
/// on the blob format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncPayload {
    Memory(MemoryItem),
    Knowledge(KnowledgeItem),
    Device(DeviceContext),
}

impl SyncPayload {
    pub fn item_type(&self) -> SyncItemType {
        match self {
            SyncPayload::Memory(_) => SyncItemType::Memory,
            SyncPayload::Knowledge(_) => SyncItemType::Knowledge,
            SyncPayload::Device(_) => SyncItemType::Device,
        }
    }

    pub fn item_id(&self) -> &str {
        match self {
            SyncPayload::Memory(m) => &m.id,
            SyncPayload::Knowledge(k) => &k.id,
            SyncPayload::Device(d) => &d.device_id,
        }
    }

    pub fn encode(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    /// Decode a payload blob according to the operation's item type.
    pub fn decode(
        item_type: SyncItemType,
        data: &serde_json::Value,
    ) -> serde_json::Result<Self> {
        Ok(match item_type {
            SyncItemType::Memory => SyncPayload::Memory(serde_json::from_value(data.clone())?),
            SyncItemType::Knowledge => {
                SyncPayload::Knowledge(serde_json::from_value(data.clone())?)
            }
            SyncItemType::Device => SyncPayload::Device(serde_json::from_value(data.clone())?),
        })
    }
}

/// A single turn in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_message: String,
    pub bot_response: String,
    #[serde(default)]
    pub tokens_used: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ConversationTurn {
    pub fn new(
        user_message: impl Into<String>,
        bot_response: impl Into<String>,
        tokens_used: i64,
        metadata: Metadata,
    ) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_message: user_message.into(),
            bot_response: bot_response.into(),
            tokens_used,
            metadata,
        }
    }
}

/// A complete conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub session_id: String,
    pub chatbot_name: String,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new(
        session_id: impl Into<String>,
        chatbot_name: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            chatbot_name: chatbot_name.into(),
            device_id: device_id.into(),
            start_time: Utc::now(),
            end_time: None,
            status: ConversationStatus::Active,
            metadata: Metadata::new(),
            turns: Vec::new(),
        }
    }
}

/// Summary statistics for one conversation session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub session_id: String,
    pub chatbot_name: String,
    pub device_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: ConversationStatus,
    pub total_turns: usize,
    pub total_tokens: i64,
    pub duration_seconds: Option<f64>,
    pub average_tokens_per_turn: f64,
}

/// Aggregate statistics about the communal store
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub memory_count: i64,
    pub knowledge_count: i64,
    pub device_count: usize,
    pub devices: Vec<DeviceContext>,
    pub this_device: DeviceContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trip() {
        for tier in [
            HardwareTier::RaspberryPi,
            HardwareTier::Laptop,
            HardwareTier::Workstation,
            HardwareTier::Server,
            HardwareTier::Cloud,
        ] {
            let s = tier.to_string();
            let parsed: HardwareTier = s.parse().unwrap();
            assert_eq!(tier, parsed);
        }
        assert_eq!(HardwareTier::RaspberryPi.to_string(), "raspberry_pi");
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        assert!("mainframe".parse::<HardwareTier>().is_err());
        assert!("sleeping".parse::<DeviceStatus>().is_err());
    }

    #[test]
    fn test_sync_payload_round_trip() {
        let memory = MemoryItem::new("dev-a", "hi", "hello", vec![0.0, 1.0]);
        let payload = SyncPayload::Memory(memory.clone());
        let blob = payload.encode().unwrap();

        let decoded = SyncPayload::decode(SyncItemType::Memory, &blob).unwrap();
        match decoded {
            SyncPayload::Memory(m) => {
                assert_eq!(m.id, memory.id);
                assert_eq!(m.embedding, memory.embedding);
            }
            _ => panic!("wrong payload variant"),
        }
    }

    #[test]
    fn test_conversation_blob_format() {
        let mut conv = Conversation::new("nano_ab12cd34", "nano", "dev-a");
        conv.turns
            .push(ConversationTurn::new("q", "a", 10, Metadata::new()));

        let json = serde_json::to_value(&conv).unwrap();
        assert_eq!(json["session_id"], "nano_ab12cd34");
        assert_eq!(json["status"], "active");
        assert!(json["turns"][0]["turn_id"].is_string());
        assert_eq!(json["turns"][0]["tokens_used"], 10);

        let back: Conversation = serde_json::from_value(json).unwrap();
        assert_eq!(back.turns.len(), 1);
        assert_eq!(back.status, ConversationStatus::Active);
    }
}
