use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use rusqlite::{params, Connection};

use crate::core::{Payload, Sample, Schema, StreamSpec};
use crate::error::{HermesError, Result};

/// Hierarchical session container for tabular streams.
///
/// One SQLite file per session: a metadata table at the root, a stream
/// registry, one dataset table per `(node, stream)`. Video streams keep
/// only their frame index here; the frames themselves go to side-car
/// files.
pub struct SessionContainer {
    path: PathBuf,
    conn: Connection,
}

/// Metadata recorded once per session.
pub struct SessionMetadata {
    pub session_id: String,
    pub started_at_reference_ns: i64,
    pub host_id: String,
    pub broker_id: String,
    pub config_digest: String,
    pub experiment: BTreeMap<String, String>,
}

/// One row of a video frame index: where frame `frame_no` landed in the
/// side-car file and when it was sensed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoIndexRow {
    pub frame_no: u64,
    pub reference_ts_ns: i64,
    pub device_pts_ns: Option<i64>,
    pub byte_offset: u64,
    pub byte_len: u64,
}

impl SessionContainer {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HermesError::Runtime(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS session_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS streams (
                stream_id       TEXT PRIMARY KEY,
                node_id         TEXT NOT NULL,
                device_id       TEXT NOT NULL,
                schema_json     TEXT NOT NULL,
                nominal_rate_hz REAL NOT NULL,
                is_burst        INTEGER NOT NULL,
                is_video        INTEGER NOT NULL,
                channel_names   TEXT NOT NULL
            );",
        )
        .map_err(storage_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_metadata(&self, meta: &SessionMetadata) -> Result<()> {
        let mut rows: Vec<(String, String)> = vec![
            ("session_id".into(), meta.session_id.clone()),
            (
                "started_at_reference_ns".into(),
                meta.started_at_reference_ns.to_string(),
            ),
            ("host_id".into(), meta.host_id.clone()),
            ("broker_id".into(), meta.broker_id.clone()),
            ("config_digest".into(), meta.config_digest.clone()),
        ];
        for (key, value) in &meta.experiment {
            rows.push((format!("experiment.{}", key), value.clone()));
        }
        for (key, value) in rows {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO session_meta (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Registers a stream and creates its dataset table (tabular) or
    /// frame index table (video).
    pub fn register_stream(&self, spec: &StreamSpec) -> Result<()> {
        let schema_json =
            serde_json::to_string(&spec.schema).map_err(|e| HermesError::Runtime(e.to_string()))?;
        let channels_json = serde_json::to_string(&spec.channel_names)
            .map_err(|e| HermesError::Runtime(e.to_string()))?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO streams
                 (stream_id, node_id, device_id, schema_json, nominal_rate_hz, is_burst, is_video, channel_names)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    spec.stream_id,
                    spec.node_id,
                    spec.device_id,
                    schema_json,
                    spec.nominal_rate_hz,
                    spec.is_burst as i64,
                    spec.is_video as i64,
                    channels_json,
                ],
            )
            .map_err(storage_err)?;

        if spec.is_video {
            self.conn
                .execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        frame_no        INTEGER PRIMARY KEY,
                        reference_ts_ns INTEGER NOT NULL,
                        device_pts_ns   INTEGER,
                        byte_offset     INTEGER NOT NULL,
                        byte_len        INTEGER NOT NULL
                    )",
                    video_index_table(spec)
                ))
                .map_err(storage_err)?;
        } else {
            self.conn
                .execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        seq             INTEGER PRIMARY KEY,
                        reference_ts_ns INTEGER NOT NULL,
                        device_ts_ns    INTEGER,
                        row_values      BLOB NOT NULL
                    )",
                    dataset_table(spec)
                ))
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Appends one claimed flush range in a single transaction.
    pub fn append_samples(&mut self, spec: &StreamSpec, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let table = dataset_table(spec);
        let tx = self.conn.transaction().map_err(storage_err)?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT OR REPLACE INTO {} (seq, reference_ts_ns, device_ts_ns, row_values)
                     VALUES (?1, ?2, ?3, ?4)",
                    table
                ))
                .map_err(storage_err)?;
            for sample in samples {
                let blob = match &sample.payload {
                    Payload::Tabular(values) => {
                        let mut bytes = vec![0u8; values.len() * 8];
                        LittleEndian::write_f64_into(values, &mut bytes);
                        bytes
                    }
                    Payload::Frame(bytes) => bytes.clone(),
                };
                stmt.execute(params![
                    sample.seq as i64,
                    sample.reference_ts_ns,
                    sample.device_ts_ns,
                    blob,
                ])
                .map_err(storage_err)?;
            }
        }
        tx.commit().map_err(storage_err)
    }

    pub fn append_video_index(&mut self, spec: &StreamSpec, rows: &[VideoIndexRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = video_index_table(spec);
        let tx = self.conn.transaction().map_err(storage_err)?;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "INSERT OR REPLACE INTO {} (frame_no, reference_ts_ns, device_pts_ns, byte_offset, byte_len)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    table
                ))
                .map_err(storage_err)?;
            for row in rows {
                stmt.execute(params![
                    row.frame_no as i64,
                    row.reference_ts_ns,
                    row.device_pts_ns,
                    row.byte_offset as i64,
                    row.byte_len as i64,
                ])
                .map_err(storage_err)?;
            }
        }
        tx.commit().map_err(storage_err)
    }

    pub fn read_metadata(&self) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM session_meta")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(storage_err)?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (key, value) = row.map_err(storage_err)?;
            out.insert(key, value);
        }
        Ok(out)
    }

    pub fn read_stream_schema(&self, stream_id: &str) -> Result<Schema> {
        let schema_json: String = self
            .conn
            .query_row(
                "SELECT schema_json FROM streams WHERE stream_id = ?1",
                params![stream_id],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        serde_json::from_str(&schema_json).map_err(|e| HermesError::Runtime(e.to_string()))
    }

    /// `(seq, reference_ts_ns)` pairs of a tabular dataset in insertion
    /// order, for post-hoc alignment checks.
    pub fn dataset_rows(&self, spec: &StreamSpec) -> Result<Vec<(u64, i64)>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT seq, reference_ts_ns FROM {} ORDER BY seq",
                dataset_table(spec)
            ))
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)?)))
            .map_err(storage_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(storage_err)?);
        }
        Ok(out)
    }

    pub fn sample_count(&self, spec: &StreamSpec) -> Result<u64> {
        let table = if spec.is_video {
            video_index_table(spec)
        } else {
            dataset_table(spec)
        };
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(count as u64)
    }

}

fn storage_err(err: rusqlite::Error) -> HermesError {
    HermesError::Runtime(format!("container: {}", err))
}

/// Table identifiers come from config-supplied ids; anything outside
/// `[A-Za-z0-9_]` is folded to `_` before it reaches SQL.
fn sanitize_ident(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn dataset_table(spec: &StreamSpec) -> String {
    format!(
        "data_{}_{}",
        sanitize_ident(&spec.node_id),
        sanitize_ident(&spec.stream_id)
    )
}

fn video_index_table(spec: &StreamSpec) -> String {
    format!("video_index_{}", sanitize_ident(&spec.stream_id))
}
