//! Part writer.
//!
//! Lays out a part directory:
//!
//! ```text
//! <table>/<partition>_<start>_<end>_<level>/
//! +-- data.bin      # bincode Vec<Row>, sorted by key
//! +-- primary.idx   # bincode Vec<u64>, first key of each granule
//! +-- meta.json     # PartMeta
//! ```
//!
//! Parts are always written under a `tmp_*` directory first and renamed into
//! place, so a crash never leaves a half-written directory with a part name.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Result;
use crate::merge_tree::types::{
    system_time_to_ms, Part, PartMeta, PartName, PartState, Row, DATA_FILE, INDEX_FILE,
    META_FILE, TMP_PREFIX,
};

/// Writes sorted rows as part directories.
#[derive(Debug, Clone, Copy)]
pub struct PartWriter {
    index_granularity: usize,
}

impl PartWriter {
    pub fn new(index_granularity: usize) -> Self {
        Self {
            index_granularity: index_granularity.max(1),
        }
    }

    /// Write `rows` (already sorted by key) into a fresh directory `dir`.
    pub fn write_dir(&self, dir: &Path, rows: &[Row], created_at: SystemTime) -> Result<PartMeta> {
        debug_assert!(
            rows.windows(2).all(|w| w[0].key <= w[1].key),
            "part rows must be sorted by key"
        );
        fs::create_dir_all(dir)?;

        let data = bincode::serialize(rows)?;
        write_synced(&dir.join(DATA_FILE), &data)?;

        let index: Vec<u64> = rows
            .chunks(self.index_granularity)
            .map(|granule| granule[0].key)
            .collect();
        let index_bytes = bincode::serialize(&index)?;
        write_synced(&dir.join(INDEX_FILE), &index_bytes)?;

        let meta = PartMeta {
            rows: rows.len() as u64,
            marks: index.len() as u64,
            bytes: (data.len() + index_bytes.len()) as u64,
            checksum: blake3::hash(&data).to_hex().to_string(),
            created_at_ms: system_time_to_ms(created_at),
        };
        let json = serde_json::to_vec_pretty(&meta)?;
        write_synced(&dir.join(META_FILE), &json)?;

        Ok(meta)
    }

    /// Write an insert block as part `name` under `table_path`.
    ///
    /// Sorts `rows` by key (stable), writes to `tmp_insert_<name>` and
    /// renames into place. The returned part is not yet in any `PartSet`.
    pub fn write_part(&self, table_path: &Path, name: &PartName, mut rows: Vec<Row>) -> Result<Part> {
        rows.sort_by_key(|r| r.key);

        let tmp = temp_dir_for(table_path, "insert", name);
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        let meta = match self.write_dir(&tmp, &rows, SystemTime::now()) {
            Ok(meta) => meta,
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp, name.dir(table_path)) {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e.into());
        }

        tracing::debug!(part = %name, rows = meta.rows, bytes = meta.bytes, "wrote part");
        Ok(Part::with_state(name.clone(), meta, PartState::Active))
    }
}

/// `<table>/tmp_<purpose>_<name>`
pub fn temp_dir_for(table_path: &Path, purpose: &str, name: &PartName) -> PathBuf {
    table_path.join(format!("{TMP_PREFIX}{purpose}_{name}"))
}

/// Group an insert block by partition. Everything lands in partition 0
/// when the table is not partitioned.
pub fn split_by_partition(rows: Vec<Row>, partitioned: bool) -> BTreeMap<u32, Vec<Row>> {
    let mut blocks: BTreeMap<u32, Vec<Row>> = BTreeMap::new();
    for mut row in rows {
        if !partitioned {
            row.partition = 0;
        }
        blocks.entry(row.partition).or_default().push(row);
    }
    blocks
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────
