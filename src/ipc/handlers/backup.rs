use std::path::PathBuf;

use crate::backup;
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_required_text, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_backup_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let workspace = state
            .workspace
            .clone()
            .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
        let out_path = PathBuf::from(get_required_text(&req.params, "outPath")?);

        // Flush the wal so the bundled db file is complete on its own.
        if let Some(conn) = state.db.as_ref() {
            conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(|e| HandlerErr::new("db_checkpoint_failed", e.to_string()))?;
        }

        let summary = backup::export_workspace_bundle(&workspace, &out_path)
            .map_err(|e| HandlerErr::new("export_failed", e.to_string()))?;
        tracing::info!(path = %out_path.display(), "workspace bundle exported");

        Ok(json!({
            "path": out_path.display().to_string(),
            "bundleFormat": summary.bundle_format,
            "entryCount": summary.entry_count,
            "documentCount": summary.document_count,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

fn handle_backup_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = (|| -> Result<serde_json::Value, HandlerErr> {
        let bundle_path = PathBuf::from(get_required_text(&req.params, "bundlePath")?);
        let target = PathBuf::from(get_required_text(&req.params, "targetWorkspace")?);
        if !bundle_path.is_file() {
            return Err(HandlerErr::not_found("bundle file not found"));
        }
        // Never restore over the workspace that is currently open.
        if let Some(ws) = state.workspace.as_ref() {
            if ws == &target {
                return Err(HandlerErr::conflict(
                    "cannot import into the currently selected workspace",
                ));
            }
        }

        let summary = backup::import_workspace_bundle(&bundle_path, &target)
            .map_err(|e| HandlerErr::new("import_failed", e.to_string()))?;
        tracing::info!(path = %target.display(), "workspace bundle imported");

        Ok(json!({
            "targetWorkspace": target.display().to_string(),
            "bundleFormat": summary.bundle_format_detected,
            "documentCount": summary.document_count,
        }))
    })();

    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_backup_export(state, req)),
        "backup.import" => Some(handle_backup_import(state, req)),
        _ => None,
    }
}
