use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::{Session, Sessions};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub sessions: Sessions,
    /// Session behind the request currently being dispatched. Set by the
    /// router before any handler runs; `None` only for open methods.
    pub current_session: Option<Session>,
}

impl AppState {
    pub fn new() -> AppState {
        AppState {
            workspace: None,
            db: None,
            sessions: Sessions::default(),
            current_session: None,
        }
    }
}
