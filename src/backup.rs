use anyhow::{anyhow, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/divecert.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
const DOCUMENTS_PREFIX: &str = "documents/";
pub const BUNDLE_FORMAT_V1: &str = "divecert-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub document_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub document_count: usize,
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(crate::db::DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let db_sha256 = {
        let mut h = Sha256::new();
        h.update(&db_bytes);
        format!("{:x}", h.finalize())
    };

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "dbSha256": db_sha256,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;

    let workspace_meta = json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
    });
    zip.start_file(META_WORKSPACE_ENTRY, opts)
        .context("failed to start workspace meta entry")?;
    zip.write_all(workspace_meta.to_string().as_bytes())
        .context("failed to write workspace meta entry")?;

    let mut entry_count = 3usize;
    let mut document_count = 0usize;
    let documents_dir = workspace_path.join("documents");
    if documents_dir.is_dir() {
        for ent in std::fs::read_dir(&documents_dir).context("failed to read documents dir")? {
            let ent = ent?;
            let p = ent.path();
            if !p.is_file() {
                continue;
            }
            let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            zip.start_file(format!("{}{}", DOCUMENTS_PREFIX, name), opts)
                .with_context(|| format!("failed to start document entry {}", name))?;
            let mut f = File::open(&p)
                .with_context(|| format!("failed to open document {}", p.to_string_lossy()))?;
            std::io::copy(&mut f, &mut zip)
                .with_context(|| format!("failed to write document entry {}", name))?;
            entry_count += 1;
            document_count += 1;
        }
    }

    zip.finish().context("failed to finalize bundle")?;
    tracing::info!(
        out = %out_path.to_string_lossy(),
        documents = document_count,
        "workspace bundle exported"
    );

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count,
        document_count,
    })
}

pub fn import_workspace_bundle(
    bundle_path: &Path,
    target_workspace: &Path,
) -> anyhow::Result<ImportSummary> {
    let file = File::open(bundle_path).with_context(|| {
        format!("failed to open bundle {}", bundle_path.to_string_lossy())
    })?;
    let mut archive = ZipArchive::new(file).context("failed to read bundle archive")?;

    let manifest: serde_json::Value = {
        let mut entry = archive
            .by_name(MANIFEST_ENTRY)
            .context("bundle has no manifest.json")?;
        let mut raw = String::new();
        entry
            .read_to_string(&mut raw)
            .context("failed to read manifest")?;
        serde_json::from_str(&raw).context("manifest is not valid JSON")?
    };
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {:?}", format));
    }

    let db_target = target_workspace.join(crate::db::DB_FILE);
    if db_target.exists() {
        return Err(anyhow!(
            "target workspace already has a database: {}",
            db_target.to_string_lossy()
        ));
    }
    std::fs::create_dir_all(target_workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            target_workspace.to_string_lossy()
        )
    })?;

    {
        let mut entry = archive
            .by_name(DB_ENTRY)
            .context("bundle has no database entry")?;
        let mut out = File::create(&db_target).with_context(|| {
            format!("failed to create database {}", db_target.to_string_lossy())
        })?;
        std::io::copy(&mut entry, &mut out).context("failed to restore database")?;
    }

    let mut document_count = 0usize;
    let doc_names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|e| e.name().to_string()))
        .filter(|n| n.starts_with(DOCUMENTS_PREFIX) && !n.ends_with('/'))
        .collect();
    if !doc_names.is_empty() {
        let documents_dir = target_workspace.join("documents");
        std::fs::create_dir_all(&documents_dir).context("failed to create documents dir")?;
        for name in doc_names {
            let base = name.trim_start_matches(DOCUMENTS_PREFIX);
            // Bundles are self-produced, but never let an entry escape the tree.
            let base = PathBuf::from(base);
            let Some(file_name) = base.file_name() else {
                continue;
            };
            let mut entry = archive
                .by_name(&name)
                .with_context(|| format!("failed to reopen document entry {}", name))?;
            let out_path = documents_dir.join(file_name);
            let mut out = File::create(&out_path).with_context(|| {
                format!("failed to create document {}", out_path.to_string_lossy())
            })?;
            std::io::copy(&mut entry, &mut out)
                .with_context(|| format!("failed to restore document {}", name))?;
            document_count += 1;
        }
    }

    tracing::info!(
        workspace = %target_workspace.to_string_lossy(),
        documents = document_count,
        "workspace bundle imported"
    );

    Ok(ImportSummary {
        bundle_format_detected: format,
        document_count,
    })
}
