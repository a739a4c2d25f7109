//! Fleet storage: camera and detection records.
//!
//! Identity assignment reuses the smallest free integer id (gap-filling)
//! so removed cameras free their slot. The read-compute-insert sequence is
//! racy across writers, so allocation relies on the primary-key constraint
//! and retries with a fresh read on conflict.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

const MAX_ALLOC_RETRIES: usize = 8;

/// A camera row. Cameras are soft records: status flips, rows stay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraRecord {
    pub id: u32,
    pub name: Option<String>,
    pub ip_address: Option<String>,
    /// Epoch seconds of the camera's last liveness signal.
    pub last_seen_at: Option<u64>,
    /// 0 = offline, 1 = online.
    pub status: u8,
}

/// A detection pending insertion; the store assigns the id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewDetection {
    pub camera_id: u32,
    pub class_id: u32,
    pub class_name: String,
    pub median_probability: f64,
    pub captured_at: u64,
    pub image_path: String,
}

/// A stored detection record.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub id: u32,
    pub camera_id: u32,
    pub class_id: u32,
    pub class_name: String,
    pub median_probability: f64,
    pub captured_at: u64,
    pub image_path: String,
}

/// Storage collaborator consumed by the registry. Every method may fail on
/// connectivity/SQL errors; the registry logs and drops per message.
pub trait FleetStore {
    /// Assign the lowest free camera id and insert a provisional row for it.
    fn allocate_camera_id(&mut self) -> Result<u32>;

    fn update_camera_registration(
        &mut self,
        id: u32,
        uptime: u64,
        name: &str,
        status: u8,
        ip_address: &str,
    ) -> Result<()>;

    fn update_camera_status(&mut self, id: u32, status: u8, last_seen_at: u64) -> Result<()>;

    /// Insert a detection under the lowest free detection id; returns it.
    fn insert_detection(&mut self, detection: &NewDetection) -> Result<u32>;

    fn camera(&self, id: u32) -> Result<Option<CameraRecord>>;

    fn detection(&self, id: u32) -> Result<Option<DetectionRecord>>;
}

/// Lowest non-negative integer absent from `occupied`, which must be sorted
/// ascending.
pub fn next_free_id(occupied: &[u32]) -> u32 {
    let mut next = 0;
    for &id in occupied {
        if next != id {
            break;
        }
        next += 1;
    }
    next
}

pub struct SqliteFleetStore {
    conn: Connection,
}

impl SqliteFleetStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS cameras (
              id INTEGER PRIMARY KEY,
              name TEXT,
              ip TEXT,
              last_seen_at INTEGER,
              status INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY,
              camera_id INTEGER NOT NULL,
              class_id INTEGER NOT NULL,
              class_name TEXT NOT NULL,
              probability REAL NOT NULL,
              captured_at INTEGER NOT NULL,
              image_path TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_camera ON detections(camera_id);
            "#,
        )?;
        Ok(())
    }

    pub fn occupied_camera_ids(&self) -> Result<Vec<u32>> {
        self.occupied_ids("cameras")
    }

    pub fn occupied_detection_ids(&self) -> Result<Vec<u32>> {
        self.occupied_ids("detections")
    }

    fn occupied_ids(&self, table: &str) -> Result<Vec<u32>> {
        // Table names are the two fixed literals above, never user input.
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {} ORDER BY id", table))?;
        let mut rows = stmt.query([])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            ids.push(u32::try_from(id).map_err(|_| anyhow!("negative id in {}", table))?);
        }
        Ok(ids)
    }

    fn is_conflict(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

impl FleetStore for SqliteFleetStore {
    fn allocate_camera_id(&mut self) -> Result<u32> {
        for _ in 0..MAX_ALLOC_RETRIES {
            let occupied = self.occupied_camera_ids()?;
            let id = next_free_id(&occupied);
            let inserted = self.conn.execute(
                "INSERT INTO cameras (id, name, status) VALUES (?1, NULL, 0)",
                params![id],
            );
            match inserted {
                Ok(_) => return Ok(id),
                Err(e) if Self::is_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(anyhow!(
            "camera id allocation kept colliding after {} attempts",
            MAX_ALLOC_RETRIES
        ))
    }

    fn update_camera_registration(
        &mut self,
        id: u32,
        uptime: u64,
        name: &str,
        status: u8,
        ip_address: &str,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE cameras SET last_seen_at = ?1, name = ?2, status = ?3, ip = ?4 WHERE id = ?5",
            params![uptime as i64, name, status, ip_address, id],
        )?;
        Ok(())
    }

    fn update_camera_status(&mut self, id: u32, status: u8, last_seen_at: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE cameras SET status = ?1, last_seen_at = ?2 WHERE id = ?3",
            params![status, last_seen_at as i64, id],
        )?;
        Ok(())
    }

    fn insert_detection(&mut self, detection: &NewDetection) -> Result<u32> {
        for _ in 0..MAX_ALLOC_RETRIES {
            let occupied = self.occupied_detection_ids()?;
            let id = next_free_id(&occupied);
            let inserted = self.conn.execute(
                r#"
                INSERT INTO detections
                  (id, camera_id, class_id, class_name, probability, captured_at, image_path)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    id,
                    detection.camera_id,
                    detection.class_id,
                    detection.class_name,
                    detection.median_probability,
                    detection.captured_at as i64,
                    detection.image_path,
                ],
            );
            match inserted {
                Ok(_) => return Ok(id),
                Err(e) if Self::is_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(anyhow!(
            "detection id allocation kept colliding after {} attempts",
            MAX_ALLOC_RETRIES
        ))
    }

    fn camera(&self, id: u32) -> Result<Option<CameraRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, name, ip, last_seen_at, status FROM cameras WHERE id = ?1",
                params![id],
                |row| {
                    Ok(CameraRecord {
                        id: row.get::<_, i64>(0)? as u32,
                        name: row.get(1)?,
                        ip_address: row.get(2)?,
                        last_seen_at: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                        status: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn detection(&self, id: u32) -> Result<Option<DetectionRecord>> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT id, camera_id, class_id, class_name, probability, captured_at, image_path
                FROM detections WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok(DetectionRecord {
                        id: row.get::<_, i64>(0)? as u32,
                        camera_id: row.get::<_, i64>(1)? as u32,
                        class_id: row.get::<_, i64>(2)? as u32,
                        class_name: row.get(3)?,
                        median_probability: row.get(4)?,
                        captured_at: row.get::<_, i64>(5)? as u64,
                        image_path: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
