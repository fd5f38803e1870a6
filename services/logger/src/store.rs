//! SQLite persistence for processed frames.

use crate::record::FrameFields;
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur while persisting frames
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database at {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create frames table: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("failed to insert frame {frame_id}: {source}")]
    Insert {
        frame_id: i64,
        #[source]
        source: rusqlite::Error,
    },
}

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS frames (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        frame_id INTEGER,
        loop_iteration INTEGER,
        source_timestamp TEXT,
        processed_timestamp TEXT,
        filename TEXT,
        width INTEGER,
        height INTEGER,
        channels INTEGER,
        encoding TEXT,
        keypoint_count INTEGER,
        descriptor_rows INTEGER,
        descriptor_cols INTEGER,
        descriptor_elem_size INTEGER,
        descriptor_type INTEGER,
        descriptors_bytes INTEGER,
        image_path TEXT,
        metadata_json TEXT,
        descriptors BLOB,
        created_at TEXT
    );
";

const INSERT_SQL: &str = "
    INSERT INTO frames (
        frame_id, loop_iteration, source_timestamp, processed_timestamp, filename,
        width, height, channels, encoding,
        keypoint_count, descriptor_rows, descriptor_cols, descriptor_elem_size,
        descriptor_type, descriptors_bytes, image_path, metadata_json, descriptors, created_at
    ) VALUES (
        ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
    );
";

/// One row to be inserted into the `frames` table.
#[derive(Debug)]
pub struct FrameRecord<'a> {
    pub fields: &'a FrameFields,
    /// Raw descriptor blob; stored as NULL when empty
    pub descriptors: &'a [u8],
    pub image_path: &'a str,
    /// The exact header observed on the bus, possibly augmented with
    /// `annotated_path`
    pub metadata_json: &'a str,
    pub created_at: &'a str,
}

/// Durable store for frame rows, opened once per logger process.
pub struct FrameStore {
    conn: Connection,
}

impl FrameStore {
    /// Open (or create) the database and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!("failed to enable WAL mode: {}", err);
        }
        conn.execute_batch(SCHEMA_SQL).map_err(StoreError::Schema)?;
        Ok(Self { conn })
    }

    /// Insert one frame row. The statement is prepared once and reused via
    /// the connection's statement cache.
    pub fn insert_frame(&self, record: &FrameRecord<'_>) -> Result<(), StoreError> {
        let fields = record.fields;
        let map_err = |source| StoreError::Insert {
            frame_id: fields.frame_id,
            source,
        };

        let descriptors = if record.descriptors.is_empty() {
            None
        } else {
            Some(record.descriptors)
        };

        let mut statement = self.conn.prepare_cached(INSERT_SQL).map_err(map_err)?;
        statement
            .execute(params![
                fields.frame_id,
                fields.loop_iteration,
                fields.source_timestamp,
                fields.processed_timestamp,
                fields.filename,
                fields.width,
                fields.height,
                fields.channels,
                fields.encoding,
                fields.keypoint_count as i64,
                fields.descriptor_rows,
                fields.descriptor_cols,
                fields.descriptor_elem_size,
                fields.descriptor_type,
                record.descriptors.len() as i64,
                record.image_path,
                record.metadata_json,
                descriptors,
                record.created_at,
            ])
            .map_err(map_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(frame_id: i64) -> FrameFields {
        FrameFields::from_header(&json!({
            "source": {
                "frame_id": frame_id,
                "loop_iteration": 1,
                "timestamp": "2026-02-03T04:05:06Z",
                "filename": "input.png",
                "width": 10,
                "height": 10,
                "channels": 3,
            },
            "processed_timestamp": "2026-02-03T04:05:07Z",
            "keypoint_count": 2,
            "descriptor_rows": 2,
            "descriptor_cols": 128,
            "descriptor_elem_size": 4,
            "descriptor_type": 1,
        }))
    }

    fn open_store() -> (tempfile::TempDir, FrameStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameStore::open(&dir.path().join("frames.sqlite")).unwrap();
        (dir, store)
    }

    #[test]
    fn schema_creation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.sqlite");
        drop(FrameStore::open(&path).unwrap());
        drop(FrameStore::open(&path).unwrap());
    }

    #[test]
    fn inserts_and_reads_back_a_row() {
        let (_dir, store) = open_store();
        let fields = fields(5);
        let descriptors = vec![7u8; 2 * 128 * 4];
        store
            .insert_frame(&FrameRecord {
                fields: &fields,
                descriptors: &descriptors,
                image_path: "/tmp/raw/frame_000005.png",
                metadata_json: "{\"keypoint_count\":2}",
                created_at: "2026-02-03T04:05:08Z",
            })
            .unwrap();

        let (frame_id, keypoints, blob_len, image_path): (i64, i64, i64, String) = store
            .conn
            .query_row(
                "SELECT frame_id, keypoint_count, length(descriptors), image_path FROM frames",
                [],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .unwrap();
        assert_eq!(frame_id, 5);
        assert_eq!(keypoints, 2);
        assert_eq!(blob_len, 1024);
        assert_eq!(image_path, "/tmp/raw/frame_000005.png");
    }

    #[test]
    fn empty_descriptors_store_as_null() {
        let (_dir, store) = open_store();
        let fields = fields(6);
        store
            .insert_frame(&FrameRecord {
                fields: &fields,
                descriptors: &[],
                image_path: "/tmp/raw/frame_000006.png",
                metadata_json: "{}",
                created_at: "2026-02-03T04:05:08Z",
            })
            .unwrap();

        let (nulls, bytes): (i64, i64) = store
            .conn
            .query_row(
                "SELECT COUNT(*) FILTER (WHERE descriptors IS NULL), COALESCE(SUM(descriptors_bytes), 0) FROM frames",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(nulls, 1);
        assert_eq!(bytes, 0);
    }

    #[test]
    fn rows_accumulate_in_insert_order() {
        let (_dir, store) = open_store();
        for id in [2i64, 3, 4] {
            let fields = fields(id);
            store
                .insert_frame(&FrameRecord {
                    fields: &fields,
                    descriptors: &[1, 2, 3],
                    image_path: "x",
                    metadata_json: "{}",
                    created_at: "2026-02-03T04:05:08Z",
                })
                .unwrap();
        }

        let mut statement = store
            .conn
            .prepare("SELECT frame_id FROM frames ORDER BY id")
            .unwrap();
        let ids: Vec<i64> = statement
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }
}
