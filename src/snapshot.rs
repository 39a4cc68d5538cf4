//! In-memory snapshot of the compacted schema topic
//!
//! A [`TopicSnapshot`] replays the topic the way log compaction would: a
//! record whose key was seen before replaces the earlier record and moves to
//! the end, so iteration order matches the order in which the latest value of
//! every key was written.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cluster::RawRecord;
use crate::error::{Result, TopicError};

/// Topic setting selecting the cleanup policy.
pub const CLEANUP_POLICY: &str = "cleanup.policy";

/// Cleanup policy value enabling log compaction.
pub const CLEANUP_POLICY_COMPACT: &str = "compact";

/// Schema registry record key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    Config,
    Schema,
    Noop,
    DeleteSubject,
    ClearSubject,
    Mode,
    Context,
}

/// Key of a schema registry record, as written by the registry.
#[derive(Debug, Deserialize)]
struct RegistryKey {
    keytype: KeyType,
}

/// Value of a SCHEMA record. Only the fields kept in backups are read.
#[derive(Debug, Deserialize)]
struct RegistrySchemaValue {
    subject: String,
    id: i32,
}

/// One record of the schema topic.
///
/// Equality and hashing only consider the raw key: two entries with the same
/// key are the same compacted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRecordEntry {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<i32>,
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
    /// `None` for tombstones
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt_bytes")]
    pub value: Option<Vec<u8>>,
}

impl SchemaRecordEntry {
    /// Decode a raw record from the schema topic.
    pub fn decode(record: &RawRecord) -> Result<Self> {
        let decode_error = |reason: String| TopicError::Decode {
            offset: record.offset,
            reason,
        };

        let key: RegistryKey = serde_json::from_slice(&record.key)
            .map_err(|e| decode_error(format!("invalid key: {}", e)))?;

        let (subject, schema_id) = match (&key.keytype, &record.value) {
            (KeyType::Schema, Some(value)) => {
                let value: RegistrySchemaValue = serde_json::from_slice(value)
                    .map_err(|e| decode_error(format!("invalid schema value: {}", e)))?;
                (Some(value.subject), Some(value.id))
            }
            _ => (None, None),
        };

        Ok(Self {
            key_type: key.keytype,
            subject,
            schema_id,
            key: record.key.clone(),
            value: record.value.clone(),
        })
    }
}

impl PartialEq for SchemaRecordEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SchemaRecordEntry {}

impl Hash for SchemaRecordEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Settings and records of the schema topic.
#[derive(Debug, Clone)]
pub struct TopicSnapshot {
    settings: BTreeMap<String, String>,
    records: BTreeMap<u64, SchemaRecordEntry>,
    positions: HashMap<Vec<u8>, u64>,
    next_position: u64,
}

impl Default for TopicSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicSnapshot {
    /// Empty snapshot with compaction enabled.
    pub fn new() -> Self {
        let mut settings = BTreeMap::new();
        settings.insert(CLEANUP_POLICY.to_string(), CLEANUP_POLICY_COMPACT.to_string());
        Self {
            settings,
            records: BTreeMap::new(),
            positions: HashMap::new(),
            next_position: 0,
        }
    }

    /// Build a snapshot from stored parts, replaying records in order.
    pub fn from_parts(
        settings: impl IntoIterator<Item = (String, String)>,
        records: impl IntoIterator<Item = SchemaRecordEntry>,
    ) -> Self {
        let mut snapshot = Self::new();
        snapshot.put_settings(settings);
        for record in records {
            snapshot.insert(record);
        }
        snapshot
    }

    /// Add settings. The cleanup policy always stays `compact`.
    pub fn put_settings(&mut self, settings: impl IntoIterator<Item = (String, String)>) {
        self.settings.extend(settings);
        self.settings
            .insert(CLEANUP_POLICY.to_string(), CLEANUP_POLICY_COMPACT.to_string());
    }

    /// Insert an entry, replacing and moving to the end any entry with the
    /// same key.
    pub fn insert(&mut self, entry: SchemaRecordEntry) {
        if let Some(previous) = self.positions.remove(&entry.key) {
            self.records.remove(&previous);
        }
        let position = self.next_position;
        self.next_position += 1;
        self.positions.insert(entry.key.clone(), position);
        self.records.insert(position, entry);
    }

    /// Decode and insert a raw record.
    pub fn add_record(&mut self, record: &RawRecord) -> Result<()> {
        self.insert(SchemaRecordEntry::decode(record)?);
        Ok(())
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    /// Records in replay order.
    pub fn records(&self) -> impl ExactSizeIterator<Item = &SchemaRecordEntry> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the snapshot contains the schema with ID 1. A schema topic
    /// that lost its first schema cannot be served by a registry.
    pub fn starts_at_first_id(&self) -> bool {
        self.records()
            .any(|r| r.key_type == KeyType::Schema && r.schema_id == Some(1))
    }

    /// Number of SCHEMA records.
    pub fn schema_count(&self) -> usize {
        self.records()
            .filter(|r| r.key_type == KeyType::Schema && r.schema_id.is_some())
            .count()
    }
}

impl PartialEq for TopicSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.settings == other.settings
            && self.len() == other.len()
            && self.records().zip(other.records()).all(|(a, b)| a == b)
    }
}

impl Eq for TopicSnapshot {}

/// Serialized form of a snapshot.
#[derive(Serialize)]
struct DocumentRef<'a> {
    settings: &'a BTreeMap<String, String>,
    records: Vec<&'a SchemaRecordEntry>,
}

#[derive(Deserialize)]
struct Document {
    #[serde(default)]
    settings: BTreeMap<String, String>,
    #[serde(default)]
    records: Vec<SchemaRecordEntry>,
}

impl Serialize for TopicSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        DocumentRef {
            settings: &self.settings,
            records: self.records().collect(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TopicSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let document = Document::deserialize(deserializer)?;
        Ok(Self::from_parts(document.settings, document.records))
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}
