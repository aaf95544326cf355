use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Column holding the pipeline stage on the `leads` table.
pub const STATUS_FIELD: &str = "estado";

/// Column holding the handoff flag on the `leads` table.
pub const HANDOFF_FIELD: &str = "intervencion_humana";

/// Columns the store manages itself. Never written back by a save.
pub const READ_ONLY_FIELDS: &[&str] = &["id", "fecha_creacion", "usuario_update", "fecha_update"];

/// A prospective customer as stored in the `leads` table.
///
/// Only `id`, `estado` and `intervencion_humana` are interpreted; every other
/// column rides along in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(rename = "estado", default)]
    pub status: Option<String>,
    #[serde(rename = "intervencion_humana", default, deserialize_with = "de_flag")]
    pub handoff_active: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Lead {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: None,
            handoff_active: false,
            fields: Map::new(),
        }
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Read a column by its wire name.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "id" => Some(Value::String(self.id.clone())),
            STATUS_FIELD => Some(
                self.status
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            ),
            HANDOFF_FIELD => Some(Value::Bool(self.handoff_active)),
            _ => self.fields.get(key).cloned(),
        }
    }

    /// Write a column by its wire name. Read-only columns are rejected.
    pub fn set(&mut self, key: &str, value: Value) -> Result<(), SyncError> {
        if READ_ONLY_FIELDS.contains(&key) {
            return Err(SyncError::ReadOnlyField(key.to_string()));
        }
        match key {
            STATUS_FIELD => self.status = status_from_value(&value),
            HANDOFF_FIELD => self.handoff_active = is_truthy(&value),
            _ => {
                self.fields.insert(key.to_string(), value);
            }
        }
        Ok(())
    }
}

/// Partial update for a lead, as sent to `RemoteStore::update_lead`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeadPatch {
    /// `Some(None)` clears the status.
    pub status: Option<Option<String>>,
    pub handoff_active: Option<bool>,
    pub fields: Map<String, Value>,
}

impl LeadPatch {
    pub fn status(status: &str) -> Self {
        Self {
            status: Some(Some(status.to_string())),
            ..Self::default()
        }
    }

    pub fn handoff(active: bool) -> Self {
        Self {
            handoff_active: Some(active),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.handoff_active.is_none() && self.fields.is_empty()
    }

    /// Fields that differ between `before` and `after`, read-only columns excluded.
    ///
    /// Columns dropped from `after` are written as null.
    pub fn diff(before: &Lead, after: &Lead) -> Self {
        let mut patch = Self::default();
        if before.status != after.status {
            patch.status = Some(after.status.clone());
        }
        if before.handoff_active != after.handoff_active {
            patch.handoff_active = Some(after.handoff_active);
        }
        for (key, value) in &after.fields {
            if READ_ONLY_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if before.fields.get(key) != Some(value) {
                patch.fields.insert(key.clone(), value.clone());
            }
        }
        for key in before.fields.keys() {
            if !after.fields.contains_key(key) && !READ_ONLY_FIELDS.contains(&key.as_str()) {
                patch.fields.insert(key.clone(), Value::Null);
            }
        }
        patch
    }

    pub fn apply_to(&self, lead: &mut Lead) {
        if let Some(status) = &self.status {
            lead.status = status.clone();
        }
        if let Some(active) = self.handoff_active {
            lead.handoff_active = active;
        }
        for (key, value) in &self.fields {
            if value.is_null() {
                lead.fields.remove(key);
            } else {
                lead.fields.insert(key.clone(), value.clone());
            }
        }
    }

    /// Row shape for the `leads` table.
    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = self.fields.clone();
        if let Some(status) = &self.status {
            row.insert(
                STATUS_FIELD.to_string(),
                status.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
        if let Some(active) = self.handoff_active {
            row.insert(HANDOFF_FIELD.to_string(), Value::Bool(active));
        }
        row
    }
}

/// Who a message came from, relative to the business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "entrada")]
    Inbound,
    #[serde(rename = "salida")]
    Outbound,
}

impl Direction {
    /// Rank used to break timestamp ties: inbound sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Direction::Inbound => 0,
            Direction::Outbound => 1,
        }
    }
}

/// Author of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Author {
    #[serde(rename = "agente")]
    Agent,
    #[serde(rename = "humano")]
    Operator,
}

impl Author {
    pub fn as_str(self) -> &'static str {
        match self {
            Author::Agent => "agente",
            Author::Operator => "humano",
        }
    }
}

/// One entry of a lead's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub lead_id: String,
    pub direction: Direction,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
}

/// A row from the `conversaciones` table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationRow {
    #[serde(default)]
    pub id: Option<Value>,
    pub lead_id: Value,
    #[serde(default)]
    pub mensaje_in: Option<String>,
    #[serde(default)]
    pub mensaje_out: Option<String>,
    #[serde(default)]
    pub tipo: Option<Direction>,
    #[serde(default)]
    pub autor: Option<Author>,
    #[serde(default)]
    pub envio: Option<String>,
    #[serde(default)]
    pub timestamp_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamp_out: Option<DateTime<Utc>>,
}

impl TryFrom<ConversationRow> for Message {
    type Error = SyncError;

    fn try_from(row: ConversationRow) -> Result<Self, Self::Error> {
        let id = row
            .id
            .as_ref()
            .and_then(value_to_id)
            .ok_or_else(|| SyncError::Decode("conversation row without id".to_string()))?;
        let lead_id = value_to_id(&row.lead_id)
            .ok_or_else(|| SyncError::Decode(format!("row {id} has no lead_id")))?;

        let direction = match row.tipo {
            Some(tipo) => tipo,
            None if row.mensaje_out.is_some() => Direction::Outbound,
            None => Direction::Inbound,
        };

        let (text, own_ts, other_ts) = match direction {
            Direction::Inbound => (row.mensaje_in, row.timestamp_in, row.timestamp_out),
            Direction::Outbound => (row.mensaje_out, row.timestamp_out, row.timestamp_in),
        };
        let text = text.ok_or_else(|| SyncError::Decode(format!("row {id} has no text")))?;
        let timestamp = own_ts
            .or(other_ts)
            .ok_or_else(|| SyncError::Decode(format!("row {id} has no timestamp")))?;

        let author = match direction {
            Direction::Inbound => None,
            Direction::Outbound => Some(row.autor.unwrap_or(Author::Agent)),
        };

        Ok(Message {
            id,
            lead_id,
            direction,
            text,
            timestamp,
            author,
        })
    }
}

impl From<&Message> for ConversationRow {
    fn from(msg: &Message) -> Self {
        let mut row = ConversationRow {
            id: Some(Value::String(msg.id.clone())),
            lead_id: Value::String(msg.lead_id.clone()),
            tipo: Some(msg.direction),
            autor: msg.author,
            ..Self::default()
        };
        match msg.direction {
            Direction::Inbound => {
                row.mensaje_in = Some(msg.text.clone());
                row.timestamp_in = Some(msg.timestamp);
            }
            Direction::Outbound => {
                row.mensaje_out = Some(msg.text.clone());
                row.timestamp_out = Some(msg.timestamp);
                row.envio = Some("enviado".to_string());
            }
        }
        row
    }
}

/// An operator reply about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub lead_id: String,
    pub text: String,
    pub author: Author,
    /// Client clock at send time; the store may replace it.
    pub sent_at: DateTime<Utc>,
}

/// Tables the core reads or watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Leads,
    Conversations,
    Stages,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Leads => "leads",
            Table::Conversations => "conversaciones",
            Table::Stages => "estados_crm",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A row-level notification from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub row: Value,
    pub op: ChangeOp,
}

/// Equality filter on one column, e.g. `lead_id = L1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub column: String,
    pub value: String,
}

impl ChangeFilter {
    pub fn eq(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        row.get(&self.column)
            .and_then(value_to_id)
            .is_some_and(|v| v == self.value)
    }
}

/// Normalise a string or numeric id column.
pub fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn status_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Truthiness for flag columns edited through a form.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "si" | "sí" | "yes"),
        _ => false,
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_to_id(&value).ok_or_else(|| serde::de::Error::custom("lead id must be a string or number"))
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().is_some_and(is_truthy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lead_from_row_maps_wire_columns() {
        let lead: Lead = serde_json::from_value(json!({
            "id": 42,
            "estado": "Contactado",
            "intervencion_humana": null,
            "nombre": "Ana",
            "canal": "WhatsApp",
        }))
        .unwrap();

        assert_eq!(lead.id, "42");
        assert_eq!(lead.status.as_deref(), Some("Contactado"));
        assert!(!lead.handoff_active);
        assert_eq!(lead.fields["nombre"], "Ana");
        assert!(!lead.fields.contains_key("estado"));
    }

    #[test]
    fn test_lead_set_rejects_read_only() {
        let mut lead = Lead::new("L1");
        let err = lead.set("fecha_creacion", json!("2024-01-01")).unwrap_err();
        assert_eq!(err, SyncError::ReadOnlyField("fecha_creacion".into()));

        lead.set(STATUS_FIELD, json!("Cerrado")).unwrap();
        assert_eq!(lead.status.as_deref(), Some("Cerrado"));
        lead.set(STATUS_FIELD, json!("")).unwrap();
        assert_eq!(lead.status, None);
    }

    #[test]
    fn test_patch_diff_skips_read_only_and_nulls_removed() {
        let before = Lead::new("L1")
            .with_field("nombre", json!("Ana"))
            .with_field("notas", json!("llamar"))
            .with_field("fecha_update", json!("2024-01-01"));
        let mut after = before.clone().with_status("Contactado");
        after.fields.insert("nombre".into(), json!("Ana María"));
        after.fields.remove("notas");
        after.fields.insert("fecha_update".into(), json!("2024-02-02"));

        let patch = LeadPatch::diff(&before, &after);
        assert_eq!(patch.status, Some(Some("Contactado".to_string())));
        assert_eq!(patch.fields["nombre"], "Ana María");
        assert_eq!(patch.fields["notas"], Value::Null);
        assert!(!patch.fields.contains_key("fecha_update"));

        let mut applied = before.clone();
        patch.apply_to(&mut applied);
        assert_eq!(applied.status.as_deref(), Some("Contactado"));
        assert!(!applied.fields.contains_key("notas"));
    }

    #[test]
    fn test_patch_to_row_uses_wire_names() {
        let row = LeadPatch::handoff(true).to_row();
        assert_eq!(row[HANDOFF_FIELD], true);
        let row = LeadPatch::status("Nuevo").to_row();
        assert_eq!(row[STATUS_FIELD], "Nuevo");
    }

    #[test]
    fn test_conversation_row_outbound() {
        let row: ConversationRow = serde_json::from_value(json!({
            "id": 7,
            "lead_id": "L1",
            "mensaje_out": "Hola, ¿cómo te ayudo?",
            "tipo": "salida",
            "autor": "humano",
            "envio": "enviado",
            "timestamp_out": "2024-05-01T10:01:00Z",
        }))
        .unwrap();
        let msg = Message::try_from(row).unwrap();

        assert_eq!(msg.id, "7");
        assert_eq!(msg.direction, Direction::Outbound);
        assert_eq!(msg.author, Some(Author::Operator));
        assert_eq!(msg.text, "Hola, ¿cómo te ayudo?");
    }

    #[test]
    fn test_conversation_row_infers_inbound_and_rejects_missing_timestamp() {
        let row: ConversationRow = serde_json::from_value(json!({
            "id": "m1",
            "lead_id": "L1",
            "mensaje_in": "Quiero info",
            "timestamp_in": "2024-05-01T10:00:00Z",
        }))
        .unwrap();
        let msg = Message::try_from(row).unwrap();
        assert_eq!(msg.direction, Direction::Inbound);
        assert_eq!(msg.author, None);

        let row: ConversationRow = serde_json::from_value(json!({
            "id": "m2",
            "lead_id": "L1",
            "mensaje_in": "sin fecha",
        }))
        .unwrap();
        assert!(matches!(Message::try_from(row), Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_change_filter_matches_numeric_ids() {
        let filter = ChangeFilter::eq("lead_id", "12");
        assert!(filter.matches(&json!({ "lead_id": 12 })));
        assert!(!filter.matches(&json!({ "lead_id": 13 })));
        assert!(!filter.matches(&json!({ "other": 12 })));
    }
}
