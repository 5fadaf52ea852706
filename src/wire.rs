// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire format shared by both replication transports.
//!
//! The info (upsert) stream carries a flat JSON object:
//!
//! ```text
//! { "id": <node-uuid>, "uuid": <identity>, "ip": <address>,
//!   "count": <integer>, "server": <string>,
//!   "created": <epoch-millis>, "updated": <epoch-millis> }
//! ```
//!
//! The delete stream carries a bare string: an identity token or an
//! address literal.

use crate::error::{AltError, Result};
use crate::record::{DeleteKey, PlayerData};
use crate::validation::{is_valid_address, is_valid_identity, parse_identity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An upsert as it travels between nodes.
///
/// Identity fields are kept as strings so validation happens here rather
/// than inside serde, which would accept non-canonical UUID spellings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoMessage {
    /// Publishing node.
    pub id: String,
    pub uuid: String,
    pub ip: String,
    pub count: u64,
    pub server: String,
    pub created: i64,
    pub updated: i64,
}

impl InfoMessage {
    /// Wrap a record for publication by `server_id`.
    pub fn from_record(server_id: Uuid, record: &PlayerData) -> Self {
        Self {
            id: server_id.hyphenated().to_string(),
            uuid: record.uuid.hyphenated().to_string(),
            ip: record.ip.clone(),
            count: record.count,
            server: record.server.clone(),
            created: record.created,
            updated: record.updated,
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AltError::Internal(format!("encode info message: {}", e)))
    }

    /// Parse a JSON payload. Structural problems are `Decode` errors.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| AltError::Decode(e.to_string()))
    }

    /// The publishing node's identifier.
    pub fn origin(&self) -> Result<Uuid> {
        parse_identity(&self.id)
            .ok_or_else(|| AltError::Validation(format!("invalid origin server id: {:?}", self.id)))
    }

    /// Validate and convert to a record.
    pub fn into_record(self) -> Result<PlayerData> {
        if !is_valid_identity(&self.uuid) {
            return Err(AltError::Validation(format!("invalid UUID: {:?}", self.uuid)));
        }
        if !is_valid_address(&self.ip) {
            return Err(AltError::Validation(format!("invalid IP: {:?}", self.ip)));
        }
        PlayerData::from_parts(
            &self.uuid,
            &self.ip,
            self.count,
            self.server,
            self.created,
            self.updated,
        )
    }
}

/// Encode a record for the info stream.
pub fn encode_info(server_id: Uuid, record: &PlayerData) -> Result<Vec<u8>> {
    InfoMessage::from_record(server_id, record).encode()
}

/// Encode a delete request.
pub fn encode_delete(key: &DeleteKey) -> Vec<u8> {
    key.as_payload().into_bytes()
}

/// Decode a delete request.
pub fn decode_delete(payload: &[u8]) -> Result<DeleteKey> {
    let raw = std::str::from_utf8(payload)
        .map_err(|e| AltError::Decode(format!("delete payload is not UTF-8: {}", e)))?;
    DeleteKey::parse(raw)
}
