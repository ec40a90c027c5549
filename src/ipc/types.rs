use std::path::PathBuf;

use crate::db::SubjectRow;
use crate::session::{EditMode, EditSession};
use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A batch session bound to the subject it was opened for.
pub struct ActiveSession {
    pub subject: SubjectRow,
    pub session: EditSession,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub edit_mode: EditMode,
    pub session: Option<ActiveSession>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            edit_mode: EditMode::None,
            session: None,
        }
    }
}
