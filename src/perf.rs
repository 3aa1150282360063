use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{Map, Value, json};

pub const PERF_LOG_ENV: &str = "TILEMARK_PERF_LOG";

/// Opt-in JSONL timing log. One record per line; a `<stem>_summary.log`
/// with per-span totals is written when the last handle is dropped.
#[derive(Clone)]
pub struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    span_totals: HashMap<String, (f64, u64)>,
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                span_totals: HashMap::new(),
            })),
        })
    }

    /// Logger from `TILEMARK_PERF_LOG`, if set and creatable.
    pub fn from_env() -> Option<Self> {
        let path = std::env::var_os(PERF_LOG_ENV)?;
        match Self::new(&path) {
            Ok(logger) => Some(logger),
            Err(err) => {
                tracing::warn!(path = ?path, error = %err, "perf log unavailable");
                None
            }
        }
    }

    pub fn span(&self, name: &'static str, epoch: Option<u64>) -> PerfSpan<'_> {
        PerfSpan {
            logger: self,
            name,
            epoch,
            started: Instant::now(),
        }
    }

    pub fn log_span_ms(&self, name: &str, epoch: Option<u64>, ms: f64) {
        let record = json!({
            "type": "perf.span",
            "name": name,
            "epoch": epoch,
            "unit": "ms",
            "ms": (ms * 1000.0).round() / 1000.0,
        });
        if let Ok(mut state) = self.inner.lock() {
            let entry = state.span_totals.entry(name.to_string()).or_insert((0.0, 0));
            entry.0 += ms;
            entry.1 = entry.1.saturating_add(1);
            let _ = writeln!(state.writer, "{record}");
        }
    }

    pub fn log_counts(&self, name: &str, epoch: Option<u64>, counts: &[(&str, u64)]) {
        let mut fields = Map::new();
        for (key, value) in counts {
            fields.insert((*key).to_string(), Value::from(*value));
        }
        let record = json!({
            "type": "perf.counts",
            "name": name,
            "epoch": epoch,
            "counts": fields,
        });
        if let Ok(mut state) = self.inner.lock() {
            let _ = writeln!(state.writer, "{record}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

/// Logs its elapsed time on drop.
pub struct PerfSpan<'a> {
    logger: &'a PerfLogger,
    name: &'static str,
    epoch: Option<u64>,
    started: Instant,
}

impl Drop for PerfSpan<'_> {
    fn drop(&mut self) {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.logger.log_span_ms(self.name, self.epoch, ms);
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let Ok(file) = File::create(summary_path_for(&self.path)) else {
            return;
        };
        let mut writer = BufWriter::new(file);
        let mut spans: Vec<(&String, &(f64, u64))> = self.span_totals.iter().collect();
        spans.sort_by(|a, b| b.1.0.partial_cmp(&a.1.0).unwrap_or(std::cmp::Ordering::Equal));
        for (rank, (name, (total, count))) in spans.into_iter().enumerate() {
            let avg = if *count == 0 {
                0.0
            } else {
                total / *count as f64
            };
            let record = json!({
                "type": "perf.summary",
                "rank": rank + 1,
                "name": name,
                "total_ms": total,
                "count": count,
                "avg_ms": avg,
            });
            let _ = writeln!(writer, "{record}");
        }
    }
}

fn summary_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tilemark_perf.log");
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_summary.log"))
}
