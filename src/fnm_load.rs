//! FNM ingestion from disk or HTTP
//!
//! Startup tries the local snapshot directory first (newest file wins) and
//! falls back to the HTTP export endpoint. An HTTP load persists the payload
//! under a timestamped name before ingesting it, so the next restart finds a
//! local snapshot.

use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing::{info, warn};

use crate::config::FnmFormat;
use crate::error::{GoMobileError, GoMobileResult};
use crate::fnm::{FnmRecord, FnmRepository, NexthopRecord, RawFnmRecord};
use crate::policy_load::latest_file_in_dir;

pub struct FnmLoader {
    repo: Arc<FnmRepository>,
}

impl FnmLoader {
    pub fn new(repo: Arc<FnmRepository>) -> Self {
        FnmLoader { repo }
    }

    /// Load the newest FNM snapshot from `dir` and install it
    pub fn load_latest_from_dir(&self, dir: &str, format: FnmFormat) -> GoMobileResult<()> {
        let ext = match format {
            FnmFormat::Json => "json",
            FnmFormat::Csv => "csv",
        };
        let latest = latest_file_in_dir(dir, ext)?;
        let content = std::fs::read_to_string(&latest)
            .map_err(|e| GoMobileError::load_error(latest.display().to_string(), e.to_string()))?;
        let version = latest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match format {
            FnmFormat::Json => {
                let records = parse_fnm_json(&content)
                    .map_err(|e| GoMobileError::load_error(latest.display().to_string(), e))?;
                info!("loaded {} FNM records from {}", records.len(), latest.display());
                self.repo.set_records(records, version);
            }
            FnmFormat::Csv => {
                let rows = parse_fnm_csv(&content);
                info!("loaded {} FNM nexthop rows from {}", rows.len(), latest.display());
                self.repo.set_nexthops(rows, version);
            }
        }
        Ok(())
    }

    /// Fetch the FNM export over HTTP, persist it under a timestamped name
    /// in `dir`, then ingest it. Non-200 responses are load errors.
    pub async fn load_from_api(&self, url: &str, dir: &str) -> GoMobileResult<()> {
        if url.is_empty() {
            return Err(GoMobileError::load_error(url, "data.fnm.api is not configured"));
        }
        info!("loading FNM from API: {}", url);

        let response = reqwest::get(url)
            .await
            .map_err(|e| GoMobileError::load_error(url, e.to_string()))?;
        if !response.status().is_success() {
            return Err(GoMobileError::load_error(
                url,
                format!("unexpected status {}", response.status()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| GoMobileError::load_error(url, e.to_string()))?;

        let records = parse_fnm_json(&body).map_err(|e| GoMobileError::load_error(url, e))?;

        let file_name = format!("{}.json", Local::now().format("%Y%m%d_%H%M%S"));
        let path = Path::new(dir).join(&file_name);
        if let Err(e) = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, &body)) {
            // a failed snapshot write is not fatal; the in-memory load proceeds
            warn!("failed to persist FNM payload to {}: {}", path.display(), e);
        } else {
            info!("persisted FNM payload to {}", path.display());
        }

        info!("loaded {} FNM records from {}", records.len(), url);
        self.repo.set_records(records, file_name);
        Ok(())
    }
}

/// Parse the JSON export body: an array of records whose `tenant` field is a
/// nested JSON string, re-parsed per record after ingestion.
pub fn parse_fnm_json(content: &str) -> Result<Vec<FnmRecord>, String> {
    let raw: Vec<RawFnmRecord> =
        serde_json::from_str(content).map_err(|e| e.to_string())?;
    Ok(raw.into_iter().map(RawFnmRecord::into_record).collect())
}

/// Parse the CSV deployment variant: `id,did,nexthop`
pub fn parse_fnm_csv(content: &str) -> Vec<NexthopRecord> {
    let mut rows = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if i == 0 && line.contains("id,did,nexthop") {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() < 3 {
            warn!("skipping invalid FNM line {}: {}", i + 1, line);
            continue;
        }
        rows.push(NexthopRecord {
            id: fields[0].trim().to_string(),
            did: fields[1].trim().to_string(),
            nexthop: fields[2].trim().to_string(),
        });
    }
    rows
}
