//! Settings query functions
//!
//! Each table holds at most one row (`id = 1`); saves are upserts, so the
//! last write wins and no history is kept.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

use camdvr_capture::{ConnectionConfig, SourceKind};
use camdvr_processing::RecordingConfig;

use crate::error::DatabaseError;

const KIND_LOCAL: &str = "local";
const KIND_NETWORK: &str = "network";

/// Load the camera settings row, if one was ever saved
pub fn get_connection_config(conn: &Connection) -> Result<Option<ConnectionConfig>> {
    let row = conn
        .query_row(
            r#"SELECT source_kind, camera_index, url, username, password, mirror
               FROM camera_settings WHERE id = 1"#,
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((kind, index, url, username, password, mirror)) = row else {
        return Ok(None);
    };

    let source = match kind.as_str() {
        KIND_LOCAL => {
            let index = index.ok_or_else(|| {
                DatabaseError::InvalidData("local camera without index".to_string())
            })?;
            let index = u32::try_from(index)
                .map_err(|_| DatabaseError::InvalidData(format!("bad camera index {}", index)))?;
            SourceKind::Local { index }
        }
        KIND_NETWORK => SourceKind::Network {
            url: url.ok_or_else(|| {
                DatabaseError::InvalidData("network camera without url".to_string())
            })?,
            username,
            password,
        },
        other => {
            return Err(DatabaseError::InvalidData(format!("unknown source kind {:?}", other)).into())
        }
    };

    Ok(Some(ConnectionConfig { source, mirror }))
}

/// Insert or replace the camera settings row
pub fn save_connection_config(conn: &Connection, config: &ConnectionConfig) -> Result<()> {
    let (kind, index, url, username, password) = match &config.source {
        SourceKind::Local { index } => (KIND_LOCAL, Some(i64::from(*index)), None, None, None),
        SourceKind::Network { url, username, password } => (
            KIND_NETWORK,
            None,
            Some(url.as_str()),
            username.as_deref(),
            password.as_deref(),
        ),
    };

    conn.execute(
        r#"INSERT INTO camera_settings
           (id, source_kind, camera_index, url, username, password, mirror, updated_at)
           VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
           ON CONFLICT(id) DO UPDATE SET
               source_kind = excluded.source_kind,
               camera_index = excluded.camera_index,
               url = excluded.url,
               username = excluded.username,
               password = excluded.password,
               mirror = excluded.mirror,
               updated_at = excluded.updated_at"#,
        params![kind, index, url, username, password, config.mirror],
    )?;
    Ok(())
}

/// Load the recording settings row
pub fn get_recording_config(conn: &Connection) -> Result<Option<RecordingConfig>> {
    let config = conn
        .query_row(
            r#"SELECT destination, segment_duration_secs, retention_enabled, retention_age_days,
               enable_record, fps, fourcc, filename_pattern, container
               FROM recording_settings WHERE id = 1"#,
            [],
            row_to_recording_config,
        )
        .optional()?;
    Ok(config)
}

/// Insert or replace the recording settings row
pub fn save_recording_config(conn: &Connection, config: &RecordingConfig) -> Result<()> {
    let destination = config.destination.to_str().ok_or_else(|| {
        DatabaseError::InvalidData(format!("destination is not UTF-8: {:?}", config.destination))
    })?;

    conn.execute(
        r#"INSERT INTO recording_settings
           (id, destination, segment_duration_secs, retention_enabled, retention_age_days,
            enable_record, fps, fourcc, filename_pattern, container, updated_at)
           VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, datetime('now'))
           ON CONFLICT(id) DO UPDATE SET
               destination = excluded.destination,
               segment_duration_secs = excluded.segment_duration_secs,
               retention_enabled = excluded.retention_enabled,
               retention_age_days = excluded.retention_age_days,
               enable_record = excluded.enable_record,
               fps = excluded.fps,
               fourcc = excluded.fourcc,
               filename_pattern = excluded.filename_pattern,
               container = excluded.container,
               updated_at = excluded.updated_at"#,
        params![
            destination,
            config.segment_duration_secs as i64,
            config.retention_enabled,
            config.retention_age_days,
            config.enable_record,
            config.fps,
            config.fourcc,
            config.filename_pattern,
            config.container,
        ],
    )?;
    Ok(())
}

fn row_to_recording_config(row: &Row) -> rusqlite::Result<RecordingConfig> {
    Ok(RecordingConfig {
        destination: PathBuf::from(row.get::<_, String>(0)?),
        segment_duration_secs: row.get::<_, i64>(1)?.max(1) as u64,
        retention_enabled: row.get(2)?,
        retention_age_days: row.get(3)?,
        enable_record: row.get(4)?,
        fps: row.get(5)?,
        fourcc: row.get(6)?,
        filename_pattern: row.get(7)?,
        container: row.get(8)?,
    })
}
