use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const HOT_LIMIT: usize = 100;

/// Opt-in JSONL timing log. A `<stem>_hot.log` ranking of the slowest
/// stages is written next to it when the last handle is dropped.
#[derive(Clone)]
pub(crate) struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

#[derive(Default)]
struct SpanTotal {
    ms: f64,
    count: u64,
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    spans: HashMap<String, SpanTotal>,
    counts: HashMap<String, u64>,
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                spans: HashMap::new(),
                counts: HashMap::new(),
            })),
        })
    }

    pub fn log_span_ms(&self, name: &str, export: &str, ms: f64) {
        let line = json!({
            "type": "perf.span",
            "name": name,
            "export": export,
            "ms": round3(ms),
        });
        if let Ok(mut state) = self.inner.lock() {
            let total = state.spans.entry(name.to_string()).or_default();
            total.ms += ms;
            total.count += 1;
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn log_counts(&self, name: &str, export: &str, counts: &[(&str, u64)]) {
        let values: Map<String, Value> = counts
            .iter()
            .map(|(key, value)| ((*key).to_string(), json!(value)))
            .collect();
        let line = json!({
            "type": "perf.counts",
            "name": name,
            "export": export,
            "counts": values,
        });
        if let Ok(mut state) = self.inner.lock() {
            for (key, value) in counts {
                let total = state.counts.entry(format!("{name}.{key}")).or_insert(0);
                *total = total.saturating_add(*value);
            }
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

/// Times a pipeline stage; a no-op when no perf log is configured.
pub(crate) fn timed<T>(
    perf: Option<&PerfLogger>,
    name: &str,
    export: &str,
    stage: impl FnOnce() -> T,
) -> T {
    let Some(perf) = perf else {
        return stage();
    };
    let started = Instant::now();
    let out = stage();
    perf.log_span_ms(name, export, started.elapsed().as_secs_f64() * 1000.0);
    out
}

impl PerfState {
    fn write_hot_summary(&self) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(hot_path_for(&self.path))?);

        let mut spans: Vec<(&String, &SpanTotal)> = self.spans.iter().collect();
        spans.sort_by(|a, b| b.1.ms.total_cmp(&a.1.ms));
        for (rank, (name, total)) in spans.into_iter().take(HOT_LIMIT).enumerate() {
            let line = json!({
                "type": "perf.hot.span",
                "rank": rank + 1,
                "name": name,
                "ms": round3(total.ms),
                "count": total.count,
                "avg_ms": round3(total.ms / total.count.max(1) as f64),
            });
            writeln!(writer, "{line}")?;
        }

        let mut counts: Vec<(&String, &u64)> = self.counts.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1));
        for (rank, (name, value)) in counts.into_iter().take(HOT_LIMIT).enumerate() {
            let line = json!({
                "type": "perf.hot.count",
                "rank": rank + 1,
                "name": name,
                "value": value,
            });
            writeln!(writer, "{line}")?;
        }
        writer.flush()
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        if let Err(err) = self.write_hot_summary() {
            tracing::warn!(path = %self.path.display(), error = %err, "perf hot summary not written");
        }
    }
}

fn round3(ms: f64) -> f64 {
    (ms * 1000.0).round() / 1000.0
}

fn hot_path_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("formpress_perf");
    path.with_file_name(format!("{stem}_hot.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_summary_is_written_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.log");
        {
            let perf = PerfLogger::new(&path).unwrap();
            let value = timed(Some(&perf), "export.snapshot", "relatorio", || 7);
            assert_eq!(value, 7);
            perf.log_span_ms("export.pdf", "relatorio", 2.0);
            perf.log_counts("export", "relatorio", &[("pages", 3)]);
        }
        let spans = std::fs::read_to_string(&path).unwrap();
        assert_eq!(spans.lines().count(), 3);
        let hot = std::fs::read_to_string(dir.path().join("perf_hot.log")).unwrap();
        let hot: Vec<Value> = hot
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(hot[0]["name"], "export.pdf");
        assert!(hot.iter().any(|line| line["name"] == "export.snapshot"));
        assert!(hot.iter().any(|line| line["name"] == "export.pages" && line["value"] == 3));
    }

    #[test]
    fn timed_without_logger_just_runs() {
        assert_eq!(timed(None, "x", "y", || "ok"), "ok");
    }
}
