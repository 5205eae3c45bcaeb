//! Minimal message-definition database used to drive the simulator and
//! `decode-live` mode.
//!
//! Full DBC parsing (factor/offset/bit-ordering rules) is an external
//! collaborator per the component design — this module only needs enough of
//! a message-definition model to generate and describe synthetic signals, so
//! it accepts a small JSON document rather than linking a DBC parser.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ReaderError;

/// One CAN signal within a [`MessageDef`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalDef {
    /// Signal name; used to select a synthetic generation profile (temp/rpm/soc/etc).
    pub name: String,
    /// Minimum physical value.
    pub minimum: f64,
    /// Maximum physical value.
    pub maximum: f64,
}

/// One CAN message definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageDef {
    /// Message name, for logging.
    pub name: String,
    /// Arbitration ID this message is sent under.
    pub frame_id: u32,
    /// Data length in bytes (classic CAN: 0..=8).
    pub length: u8,
    /// Signals packed into this message.
    pub signals: Vec<SignalDef>,
}

/// A loaded message-definition database.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Database {
    /// All defined messages.
    pub messages: Vec<MessageDef>,
}

impl Database {
    /// Load a message-definition database from a JSON file.
    pub fn load(path: &Path) -> Result<Database, ReaderError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ReaderError::DbcLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&contents).map_err(|e| ReaderError::DbcLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Total number of signals across all messages, for a startup log line.
    pub fn signal_count(&self) -> usize {
        self.messages.iter().map(|m| m.signals.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_well_formed_database() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"messages":[{{"name":"EngineData","frame_id":256,"length":8,
            "signals":[{{"name":"rpm","minimum":0,"maximum":8000}},
                       {{"name":"coolant_temp","minimum":-40,"maximum":150}}]}}]}}"#
        )
        .unwrap();

        let db = Database::load(file.path()).unwrap();
        assert_eq!(db.messages.len(), 1);
        assert_eq!(db.signal_count(), 2);
    }

    #[test]
    fn missing_file_is_a_dbc_load_error() {
        let err = Database::load(Path::new("/nonexistent/messages.json")).unwrap_err();
        assert!(matches!(err, ReaderError::DbcLoad { .. }));
    }
}
