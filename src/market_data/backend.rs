// =============================================================================
// Series persistence backends
// =============================================================================
//
// Two tiers per series:
//   - one shard per exchange-local trading day, rewritten on every insert;
//   - a consolidated record (sorted, deduplicated) rebuilt from the shards.
//
// File layout:
//   {data_dir}/{DATATYPE}/{EXCH_TICKER}/{RES}/{YYYY-MM-DD}.json
//   {data_dir}/{DATATYPE}/{EXCH_TICKER}/{RES}/consolidated.json
//
// Every file is written to a uniquely named `.tmp` sibling first and then
// renamed over the target, so readers never observe a half-written file.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Candle, DataType, Resolution, SeriesId};

const CONSOLIDATED_FILE: &str = "consolidated.json";

pub trait SeriesBackend: Send + Sync {
    fn load_consolidated(&self, id: &SeriesId) -> Result<Vec<Candle>>;

    fn write_consolidated(&self, id: &SeriesId, candles: &[Candle]) -> Result<()>;

    fn load_shard(&self, id: &SeriesId, date: NaiveDate) -> Result<Vec<Candle>>;

    /// Merge `candles` into the shard for `date`. Existing rows win.
    fn append_to_shard(&self, id: &SeriesId, date: NaiveDate, candles: &[Candle]) -> Result<()>;

    /// Dates with a shard on record, ascending.
    fn shard_dates(&self, id: &SeriesId) -> Result<Vec<NaiveDate>>;

    fn remove_shard(&self, id: &SeriesId, date: NaiveDate) -> Result<()>;

    /// Every series the backend holds anything for.
    fn series_ids(&self) -> Result<Vec<SeriesId>>;
}

/// First-write-wins merge, output sorted by timestamp.
pub(crate) fn merge_first_wins(
    existing: impl IntoIterator<Item = Candle>,
    incoming: impl IntoIterator<Item = Candle>,
) -> Vec<Candle> {
    let mut by_ts: BTreeMap<DateTime<Utc>, Candle> = BTreeMap::new();
    for c in existing.into_iter().chain(incoming) {
        by_ts.entry(c.timestamp).or_insert(c);
    }
    by_ts.into_values().collect()
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemorySeries {
    consolidated: Vec<Candle>,
    shards: BTreeMap<NaiveDate, Vec<Candle>>,
}

/// Volatile backend used by tests and when no data directory is configured.
#[derive(Default)]
pub struct MemoryBackend {
    series: RwLock<HashMap<SeriesId, MemorySeries>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesBackend for MemoryBackend {
    fn load_consolidated(&self, id: &SeriesId) -> Result<Vec<Candle>> {
        Ok(self
            .series
            .read()
            .get(id)
            .map(|s| s.consolidated.clone())
            .unwrap_or_default())
    }

    fn write_consolidated(&self, id: &SeriesId, candles: &[Candle]) -> Result<()> {
        self.series.write().entry(id.clone()).or_default().consolidated = candles.to_vec();
        Ok(())
    }

    fn load_shard(&self, id: &SeriesId, date: NaiveDate) -> Result<Vec<Candle>> {
        Ok(self
            .series
            .read()
            .get(id)
            .and_then(|s| s.shards.get(&date).cloned())
            .unwrap_or_default())
    }

    fn append_to_shard(&self, id: &SeriesId, date: NaiveDate, candles: &[Candle]) -> Result<()> {
        let mut map = self.series.write();
        let shard = map.entry(id.clone()).or_default().shards.entry(date).or_default();
        let merged = merge_first_wins(std::mem::take(shard), candles.iter().cloned());
        *shard = merged;
        Ok(())
    }

    fn shard_dates(&self, id: &SeriesId) -> Result<Vec<NaiveDate>> {
        Ok(self
            .series
            .read()
            .get(id)
            .map(|s| s.shards.keys().copied().collect())
            .unwrap_or_default())
    }

    fn remove_shard(&self, id: &SeriesId, date: NaiveDate) -> Result<()> {
        if let Some(s) = self.series.write().get_mut(id) {
            s.shards.remove(&date);
        }
        Ok(())
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>> {
        Ok(self.series.read().keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// FileBackend
// ---------------------------------------------------------------------------

/// One persisted row. `open_interest` is only written for futures.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    timestamp: DateTime<Utc>,
    symbol: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    open_interest: Option<f64>,
}

impl StoredRow {
    fn from_candle(id: &SeriesId, c: &Candle) -> Self {
        Self {
            timestamp: c.timestamp,
            symbol: id.symbol.clone(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            open_interest: match id.data_type {
                DataType::Futures => c.open_interest,
                _ => None,
            },
        }
    }

    fn into_candle(self) -> Candle {
        Candle {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            open_interest: self.open_interest,
        }
    }
}

pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create data dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `NSE:NIFTY50-INDEX` → `NSE_NIFTY50-INDEX`. Tickers never contain `_`,
    /// so the mapping is reversible.
    fn dir_name(symbol: &str) -> String {
        symbol.replace(':', "_")
    }

    fn series_dir(&self, id: &SeriesId) -> PathBuf {
        self.root
            .join(id.data_type.to_string())
            .join(Self::dir_name(&id.symbol))
            .join(id.resolution.to_string())
    }

    fn shard_path(&self, id: &SeriesId, date: NaiveDate) -> PathBuf {
        self.series_dir(id).join(format!("{}.json", date.format("%Y-%m-%d")))
    }

    fn read_rows(path: &Path) -> Result<Vec<Candle>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let rows: Vec<StoredRow> = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(rows.into_iter().map(StoredRow::into_candle).collect())
    }

    fn write_rows(id: &SeriesId, path: &Path, candles: &[Candle]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let rows: Vec<StoredRow> = candles.iter().map(|c| StoredRow::from_candle(id, c)).collect();
        let content = serde_json::to_string(&rows).context("failed to serialise candle rows")?;

        let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename onto {}", path.display()))?;

        debug!(path = %path.display(), rows = rows.len(), "series file written");
        Ok(())
    }

    fn subdirs(dir: &Path) -> Vec<(String, PathBuf)> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| Some((e.file_name().to_str()?.to_string(), e.path())))
            .collect()
    }
}

impl SeriesBackend for FileBackend {
    fn load_consolidated(&self, id: &SeriesId) -> Result<Vec<Candle>> {
        Self::read_rows(&self.series_dir(id).join(CONSOLIDATED_FILE))
    }

    fn write_consolidated(&self, id: &SeriesId, candles: &[Candle]) -> Result<()> {
        Self::write_rows(id, &self.series_dir(id).join(CONSOLIDATED_FILE), candles)
    }

    fn load_shard(&self, id: &SeriesId, date: NaiveDate) -> Result<Vec<Candle>> {
        Self::read_rows(&self.shard_path(id, date))
    }

    fn append_to_shard(&self, id: &SeriesId, date: NaiveDate, candles: &[Candle]) -> Result<()> {
        let path = self.shard_path(id, date);
        let existing = Self::read_rows(&path)?;
        let merged = merge_first_wins(existing, candles.iter().cloned());
        Self::write_rows(id, &path, &merged)
    }

    fn shard_dates(&self, id: &SeriesId) -> Result<Vec<NaiveDate>> {
        let dir = self.series_dir(id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut dates: Vec<NaiveDate> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let stem = name.to_str()?.strip_suffix(".json")?;
                NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
            })
            .collect();
        dates.sort();
        Ok(dates)
    }

    fn remove_shard(&self, id: &SeriesId, date: NaiveDate) -> Result<()> {
        let path = self.shard_path(id, date);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    fn series_ids(&self) -> Result<Vec<SeriesId>> {
        let mut ids = Vec::new();
        for (type_name, type_dir) in Self::subdirs(&self.root) {
            let data_type = match type_name.as_str() {
                "INDEX" => DataType::Index,
                "FUTURES" => DataType::Futures,
                "OPTION" => DataType::Option,
                other => {
                    warn!(dir = other, "ignoring unknown data type directory");
                    continue;
                }
            };
            for (sym_dir_name, sym_dir) in Self::subdirs(&type_dir) {
                let symbol = sym_dir_name.replacen('_', ":", 1);
                for (res_name, _) in Self::subdirs(&sym_dir) {
                    if let Some(resolution) = Resolution::parse(&res_name) {
                        ids.push(SeriesId {
                            symbol: symbol.clone(),
                            data_type,
                            resolution,
                        });
                    }
                }
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("hma-backend-{}", uuid::Uuid::new_v4()))
    }

    fn candle(min: u32, close: f64) -> Candle {
        Candle::new(
            Utc.with_ymd_and_hms(2025, 1, 15, 4, min, 0).unwrap(),
            close,
            close,
            close,
            close,
            1.0,
        )
    }

    fn fut_id() -> SeriesId {
        SeriesId::parse("NSE:NIFTY25JANFUT", Resolution::OneMinute).unwrap()
    }

    #[test]
    fn merge_keeps_first_and_sorts() {
        let merged = merge_first_wins(vec![candle(2, 1.0)], vec![candle(1, 5.0), candle(2, 9.0)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].close, 5.0);
        assert_eq!(merged[1].close, 1.0);
    }

    #[test]
    fn memory_shard_roundtrip() {
        let backend = MemoryBackend::new();
        let id = fut_id();
        let day = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        backend.append_to_shard(&id, day, &[candle(1, 1.0)]).unwrap();
        backend.append_to_shard(&id, day, &[candle(1, 7.0), candle(3, 3.0)]).unwrap();
        let shard = backend.load_shard(&id, day).unwrap();
        assert_eq!(shard.len(), 2);
        assert_eq!(shard[0].close, 1.0);
        assert_eq!(backend.shard_dates(&id).unwrap(), vec![day]);
        backend.remove_shard(&id, day).unwrap();
        assert!(backend.shard_dates(&id).unwrap().is_empty());
    }

    #[test]
    fn file_backend_layout_and_listing() {
        let root = temp_root();
        let backend = FileBackend::new(&root).unwrap();
        let id = fut_id();
        let day = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();

        let mut c = candle(1, 10.0);
        c.open_interest = Some(1234.0);
        backend.append_to_shard(&id, day, &[c, candle(2, 11.0)]).unwrap();
        backend.write_consolidated(&id, &[candle(1, 10.0)]).unwrap();

        let shard_file = root.join("FUTURES/NSE_NIFTY25JANFUT/1m/2025-01-15.json");
        assert!(shard_file.exists());
        assert!(root.join("FUTURES/NSE_NIFTY25JANFUT/1m/consolidated.json").exists());

        let raw = std::fs::read_to_string(&shard_file).unwrap();
        assert!(raw.contains("\"symbol\":\"NSE:NIFTY25JANFUT\""));
        assert!(raw.contains("\"open_interest\":1234.0"));

        let loaded = backend.load_shard(&id, day).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].open_interest, Some(1234.0));
        assert_eq!(backend.shard_dates(&id).unwrap(), vec![day]);
        assert_eq!(backend.series_ids().unwrap(), vec![id.clone()]);

        // No tmp files left behind.
        let leftovers = std::fs::read_dir(shard_file.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn index_rows_omit_open_interest() {
        let root = temp_root();
        let backend = FileBackend::new(&root).unwrap();
        let id = SeriesId::parse("NSE:NIFTY50-INDEX", Resolution::FiveMinute).unwrap();
        let mut c = candle(5, 1.0);
        c.open_interest = Some(99.0);
        backend.write_consolidated(&id, &[c]).unwrap();
        let loaded = backend.load_consolidated(&id).unwrap();
        assert_eq!(loaded[0].open_interest, None);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_files_load_empty() {
        let root = temp_root();
        let backend = FileBackend::new(&root).unwrap();
        let id = fut_id();
        assert!(backend.load_consolidated(&id).unwrap().is_empty());
        assert!(backend.shard_dates(&id).unwrap().is_empty());
        let _ = std::fs::remove_dir_all(&root);
    }
}
