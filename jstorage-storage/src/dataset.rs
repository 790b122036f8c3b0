//! `DataSet` and the update-token protocol (spec.md §4.5).

use std::collections::HashMap;

use jstorage_core::{Clock, ErrorKind, MutationEvent, MutationKind, Random, Result, UserRef};
use serde::{Deserialize, Serialize};

/// A record: a named bag of JSON sub-objects (`dataTypes`), keyed by a
/// (database, table, identifier) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSet {
    pub database: String,
    pub table: String,
    pub identifier: String,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
    #[serde(rename = "dataTypes")]
    pub data_types: HashMap<String, serde_json::Value>,

    #[serde(skip)]
    pending_tokens: HashMap<String, String>,
}

impl DataSet {
    pub fn new(database: impl Into<String>, table: impl Into<String>, identifier: impl Into<String>, now_millis: i64) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            identifier: identifier.into(),
            created_at: now_millis,
            updated_at: now_millis,
            data_types: HashMap::new(),
            pending_tokens: HashMap::new(),
        }
    }

    /// `get(dataType, requestToken=false)`.
    ///
    /// When `request_token` is true, issues a fresh token, overwriting any
    /// previously pending one for that `dataType`, and returns only the
    /// token, never the value, in the same call (spec.md §4.5).
    pub fn get(&mut self, data_type: &str, request_token: bool, random: &dyn Random) -> serde_json::Value {
        if !self.data_types.contains_key(data_type) {
            return serde_json::json!({});
        }
        if !request_token {
            return serde_json::json!({ data_type: self.data_types[data_type].clone() });
        }
        let token = jstorage_core::new_update_token(random);
        self.pending_tokens.insert(data_type.to_string(), token.clone());
        serde_json::json!({ "utoken": token })
    }

    /// `update(dataType, payload)`. `payload` must carry `utoken` matching
    /// the outstanding token, and the sub-object under `dataType`.
    pub fn update(
        &mut self,
        data_type: &str,
        payload: &serde_json::Value,
        origin: Option<UserRef>,
        clock: &dyn Clock,
    ) -> Result<MutationEvent> {
        if !self.data_types.contains_key(data_type) {
            return Err(ErrorKind::NoToken {
                what: format!("dataType {data_type} is not present on record {}", self.identifier),
            });
        }
        let utoken = payload.get("utoken").and_then(|v| v.as_str()).ok_or_else(|| {
            ErrorKind::NoToken {
                what: format!("update payload for {data_type} carries no utoken"),
            }
        })?;

        match self.pending_tokens.get(data_type) {
            Some(pending) if pending == utoken => {}
            _ => {
                return Err(ErrorKind::StaleToken {
                    what: format!("token for dataType {data_type} on record {} no longer matches", self.identifier),
                })
            }
        }

        let value = payload.get(data_type).cloned().unwrap_or(serde_json::json!({}));
        self.data_types.insert(data_type.to_string(), value);
        self.pending_tokens.remove(data_type);
        self.updated_at = clock.now_millis();

        Ok(MutationEvent {
            origin,
            database: Some(self.database.clone()),
            table: Some(self.table.clone()),
            dataset: Some(self.identifier.clone()),
            data_type: Some(data_type.to_string()),
            kind: MutationKind::Updated,
            timestamp_millis: self.updated_at,
            sequence: 0,
        })
    }

    /// `update` in open mode: no token required, overwrites unconditionally.
    /// Used when the owning database's `secureModifications` flag is unset.
    pub fn update_unchecked(
        &mut self,
        data_type: &str,
        value: serde_json::Value,
        origin: Option<UserRef>,
        clock: &dyn Clock,
    ) -> MutationEvent {
        self.data_types.insert(data_type.to_string(), value);
        self.pending_tokens.remove(data_type);
        self.updated_at = clock.now_millis();
        MutationEvent {
            origin,
            database: Some(self.database.clone()),
            table: Some(self.table.clone()),
            dataset: Some(self.identifier.clone()),
            data_type: Some(data_type.to_string()),
            kind: MutationKind::Updated,
            timestamp_millis: self.updated_at,
            sequence: 0,
        }
    }

    /// `insert(dataType, optionalPayload)`.
    pub fn insert(
        &mut self,
        data_type: &str,
        value: Option<serde_json::Value>,
        origin: Option<UserRef>,
        clock: &dyn Clock,
    ) -> Result<MutationEvent> {
        if self.data_types.contains_key(data_type) {
            return Err(ErrorKind::already_exists(format!(
                "dataType {data_type} already present on record {}",
                self.identifier
            )));
        }
        self.data_types.insert(data_type.to_string(), value.unwrap_or(serde_json::json!({})));
        self.updated_at = clock.now_millis();
        Ok(MutationEvent {
            origin,
            database: Some(self.database.clone()),
            table: Some(self.table.clone()),
            dataset: Some(self.identifier.clone()),
            data_type: Some(data_type.to_string()),
            kind: MutationKind::Created,
            timestamp_millis: self.updated_at,
            sequence: 0,
        })
    }

    /// `delete(dataType)`.
    pub fn delete(&mut self, data_type: &str, origin: Option<UserRef>, clock: &dyn Clock) -> Result<MutationEvent> {
        if self.data_types.remove(data_type).is_none() {
            return Err(ErrorKind::not_found(format!(
                "dataType {data_type} on record {}",
                self.identifier
            )));
        }
        self.pending_tokens.remove(data_type);
        self.updated_at = clock.now_millis();
        Ok(MutationEvent {
            origin,
            database: Some(self.database.clone()),
            table: Some(self.table.clone()),
            dataset: Some(self.identifier.clone()),
            data_type: Some(data_type.to_string()),
            kind: MutationKind::Deleted,
            timestamp_millis: self.updated_at,
            sequence: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jstorage_core::ports::testing::FakeClock;
    use jstorage_core::SecureRandom;

    #[test]
    fn create_read_update_delete_round_trip() {
        let clock = FakeClock::new(1_000);
        let random = SecureRandom::default();
        let mut ds = DataSet::new("blog", "posts", "post1", clock.now_millis());
        ds.insert("meta", Some(serde_json::json!({"title": "x"})), None, &clock).unwrap();

        assert_eq!(ds.get("meta", false, &random)["meta"]["title"], "x");

        let token_response = ds.get("meta", true, &random);
        let token = token_response["utoken"].as_str().unwrap().to_string();

        let event = ds
            .update(
                "meta",
                &serde_json::json!({"utoken": token, "meta": {"title": "y"}}),
                None,
                &clock,
            )
            .unwrap();
        assert!(matches!(event.kind, MutationKind::Updated));
        assert_eq!(ds.get("meta", false, &random)["meta"]["title"], "y");
    }

    #[test]
    fn stale_token_is_rejected() {
        let clock = FakeClock::new(1_000);
        let random = SecureRandom::default();
        let mut ds = DataSet::new("blog", "posts", "post1", clock.now_millis());
        ds.insert("meta", Some(serde_json::json!({"title": "x"})), None, &clock).unwrap();

        let token = ds.get("meta", true, &random)["utoken"].as_str().unwrap().to_string();
        ds.update(
            "meta",
            &serde_json::json!({"utoken": token.clone(), "meta": {"title": "y"}}),
            None,
            &clock,
        )
        .unwrap();

        let err = ds
            .update(
                "meta",
                &serde_json::json!({"utoken": token, "meta": {"title": "z"}}),
                None,
                &clock,
            )
            .unwrap_err();
        assert!(matches!(err, ErrorKind::StaleToken { .. }));
        assert_eq!(ds.get("meta", false, &random)["meta"]["title"], "y");
    }

    #[test]
    fn insert_twice_fails() {
        let clock = FakeClock::new(0);
        let mut ds = DataSet::new("db", "t", "r1", 0);
        ds.insert("meta", None, None, &clock).unwrap();
        let err = ds.insert("meta", None, None, &clock).unwrap_err();
        assert!(matches!(err, ErrorKind::AlreadyExists { .. }));
    }

    #[test]
    fn delete_missing_data_type_fails() {
        let clock = FakeClock::new(0);
        let mut ds = DataSet::new("db", "t", "r1", 0);
        let err = ds.delete("meta", None, &clock).unwrap_err();
        assert!(matches!(err, ErrorKind::NotFound { .. }));
    }

    #[test]
    fn each_successful_update_yields_a_fresh_token() {
        let clock = FakeClock::new(0);
        let random = SecureRandom::default();
        let mut ds = DataSet::new("db", "t", "r1", 0);
        ds.insert("meta", Some(serde_json::json!({})), None, &clock).unwrap();

        let t1 = ds.get("meta", true, &random)["utoken"].as_str().unwrap().to_string();
        ds.update("meta", &serde_json::json!({"utoken": t1.clone(), "meta": {}}), None, &clock)
            .unwrap();
        let t2 = ds.get("meta", true, &random)["utoken"].as_str().unwrap().to_string();
        assert_ne!(t1, t2);
    }
}
