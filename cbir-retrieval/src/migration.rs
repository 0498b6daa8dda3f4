//! Database migration utilities
//!
//! Version 1 stored each record as JSON text (the legacy text-encoded
//! feature vector layout). Version 2 stores bincode. Decoding is always
//! structured deserialization; nothing stored is ever evaluated.

use crate::error::{Result, RetrievalError};
use crate::record::EmbeddingRecord;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

/// Database version stored in metadata
pub(crate) const DB_VERSION_KEY: &[u8] = b"_db_version";
pub(crate) const CURRENT_VERSION: u32 = 2;

const RECORD_PREFIX: &[u8] = b"rec\0";

fn read_version(db: &DB) -> Result<Option<u32>> {
    match db.get(DB_VERSION_KEY)? {
        Some(bytes) => {
            let version_bytes: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                RetrievalError::store_unavailable("invalid database version format")
            })?;
            Ok(Some(u32::from_le_bytes(version_bytes)))
        }
        None => Ok(None),
    }
}

/// Write the current version into a freshly created database
pub(crate) fn stamp_version(db: &DB) -> Result<()> {
    if read_version(db)?.is_none() {
        db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
    }
    Ok(())
}

/// Check if database needs migration and perform if needed
pub fn migrate_if_needed(db_path: impl AsRef<Path>) -> Result<()> {
    let path = db_path.as_ref();

    if !path.join("CURRENT").exists() {
        log::debug!(
            "No existing database found at {}, skipping migration",
            path.display()
        );
        return Ok(());
    }

    let mut opts = Options::default();
    opts.create_if_missing(false);
    let db = DB::open(&opts, path)?;

    // Version 1 had no version key
    let current_version = read_version(&db)?.unwrap_or(1);

    log::info!(
        "Database version: {} (current: {})",
        current_version,
        CURRENT_VERSION
    );

    if current_version < CURRENT_VERSION {
        log::warn!(
            "Database needs migration from v{} to v{}",
            current_version,
            CURRENT_VERSION
        );
        perform_migration(&db, current_version)?;

        db.put(DB_VERSION_KEY, CURRENT_VERSION.to_le_bytes())?;
        db.flush()?;

        log::info!("Migration completed successfully");
    } else if current_version > CURRENT_VERSION {
        return Err(RetrievalError::store_unavailable(format!(
            "database version {} is newer than supported version {}",
            current_version, CURRENT_VERSION
        )));
    }

    Ok(())
}

fn perform_migration(db: &DB, from_version: u32) -> Result<()> {
    match from_version {
        1 => migrate_v1_to_v2(db),
        other => Err(RetrievalError::store_unavailable(format!(
            "unknown database version: {}",
            other
        ))),
    }
}

/// Re-encode JSON records as bincode
fn migrate_v1_to_v2(db: &DB) -> Result<()> {
    log::info!("Migrating database from v1 to v2...");

    let mut batch = WriteBatch::default();
    let mut migrated = 0usize;
    let mut skipped = 0usize;

    for item in db.iterator(IteratorMode::From(RECORD_PREFIX, Direction::Forward)) {
        let (key, value) = item?;
        if !key.starts_with(RECORD_PREFIX) {
            break;
        }
        let key_str = String::from_utf8_lossy(&key);

        match serde_json::from_slice::<EmbeddingRecord>(&value) {
            Ok(record) => {
                batch.put(&key, bincode::serialize(&record)?);
                migrated += 1;
            }
            Err(json_err) => match bincode::deserialize::<EmbeddingRecord>(&value) {
                Ok(_) => log::debug!("Record already in bincode format: {}", key_str),
                Err(bincode_err) => {
                    log::error!(
                        "Failed to decode record {}: JSON error: {}, Bincode error: {}. Skipping.",
                        key_str,
                        json_err,
                        bincode_err
                    );
                    skipped += 1;
                }
            },
        }
    }

    db.write(batch)?;
    log::info!(
        "Migrated {} records ({} undecodable records left in place)",
        migrated,
        skipped
    );
    Ok(())
}
