//! Search execution: runs parsed plans against index snapshots and serves
//! paged results, streaming results, histograms, time aggregations and
//! exports. Streaming endpoints produce events into a channel consumed by
//! the SSE writer; dropping the client context cancels the producing task
//! and releases the segment snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::fields::{FieldCatalog, FieldRegistry};
use crate::index::{IndexSnapshot, IndexStore};
use crate::query::plan::{AggFunc, CompiledMatch, EvalExpr, Plan, SortDir, Stage};
use crate::query::{self, ParseError};

/// Records processed between cooperative yields / cancellation checks in
/// streaming evaluation.
const STREAM_CHUNK: usize = 1024;

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub default_range_days: i64,
    /// Server-side cap on one streaming evaluation; exceeding it ends the
    /// stream with a truncated marker.
    pub max_stream_secs: u64,
    /// Cadence of intermediate histogram snapshots.
    pub snapshot_interval_ms: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_range_days: 30,
            max_stream_secs: 60,
            snapshot_interval_ms: 500,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub items: Vec<serde_json::Value>,
    pub total: u64,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistBucket {
    pub start: i64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotBucket {
    pub start: i64,
    pub end: i64,
    pub count: u64,
}

/// Events produced by streaming searches, rendered as SSE by the handlers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Page { items: Vec<serde_json::Value> },
    Init { buckets: Vec<HistBucket> },
    Hist { buckets: Vec<HistBucket> },
    Done { total: u64, truncated: bool },
    Error { message: String },
}

#[derive(Clone)]
pub struct SearchExecutor {
    index: Arc<IndexStore>,
    fields: Arc<FieldRegistry>,
    settings: SearchSettings,
}

impl SearchExecutor {
    pub fn new(
        index: Arc<IndexStore>,
        fields: Arc<FieldRegistry>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            index,
            fields,
            settings,
        }
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    /// Parse a request's query text into a plan, honoring `isRegex`.
    pub fn parse_plan(&self, query: &str, is_regex: bool) -> Result<Plan, ParseError> {
        if is_regex {
            Plan::from_regex(query)
        } else if query.trim().is_empty() {
            Ok(Plan::match_all())
        } else {
            query::parse(query)
        }
    }

    /// `[from, to]` from request params; explicit epoch-ms bounds win over
    /// the symbolic range, absence means the last `default_range_days`.
    pub fn resolve_range(
        &self,
        time_range: Option<&str>,
        start_time: Option<i64>,
        end_time: Option<i64>,
    ) -> (i64, i64) {
        let now = chrono::Utc::now().timestamp_millis();
        if let (Some(from), Some(to)) = (start_time, end_time) {
            return (from.min(to), from.max(to));
        }
        let window_ms = match time_range {
            Some("1h") => 3_600_000,
            Some("3h") => 3 * 3_600_000,
            Some("12h") => 12 * 3_600_000,
            Some("24h") => 24 * 3_600_000,
            Some("7d") => 7 * 86_400_000,
            Some("30d") => 30 * 86_400_000,
            _ => self.settings.default_range_days * 86_400_000,
        };
        (now - window_ms, now)
    }

    /// Paged search: total count plus one page slice.
    pub fn search(
        &self,
        plan: &Plan,
        range: (i64, i64),
        page: usize,
        page_size: usize,
    ) -> Result<SearchPage, ParseError> {
        let catalog = self.fields.snapshot();
        let compiled = CompiledMatch::compile(&plan.matcher, &catalog)?;
        let snapshot = self.snapshot_for(plan, range);
        let (from, to) = range;

        if plan.stages.is_empty() {
            // No pipeline: count everything, materialize only the page.
            let offset = page * page_size;
            let mut total = 0u64;
            let mut items = Vec::new();
            for record in snapshot.search(from, to, compiled.token_clauses(), |r| {
                compiled.matches(r, &catalog)
            }) {
                if (total as usize) >= offset && items.len() < page_size {
                    items.push(serde_json::Value::Object(record.to_row()));
                }
                total += 1;
            }
            return Ok(SearchPage {
                items,
                total,
                page,
                page_size,
            });
        }

        let rows = self.evaluate_pipeline(plan, &compiled, &snapshot, range, &catalog)?;
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page * page_size)
            .take(page_size)
            .map(serde_json::Value::Object)
            .collect();
        Ok(SearchPage {
            items,
            total,
            page,
            page_size,
        })
    }

    /// Match count over a range; alarms and `/logs/count` use this.
    pub fn count(&self, plan: &Plan, range: (i64, i64)) -> Result<u64, ParseError> {
        let catalog = self.fields.snapshot();
        let compiled = CompiledMatch::compile(&plan.matcher, &catalog)?;
        let snapshot = self.snapshot_for(plan, range);
        let (from, to) = range;
        if plan.stages.is_empty() {
            Ok(snapshot
                .search(from, to, compiled.token_clauses(), |r| {
                    compiled.matches(r, &catalog)
                })
                .count() as u64)
        } else {
            Ok(self
                .evaluate_pipeline(plan, &compiled, &snapshot, range, &catalog)?
                .len() as u64)
        }
    }

    /// Streaming search: the first page as soon as it is complete, then the
    /// final total.
    pub fn search_stream(
        &self,
        plan: Plan,
        range: (i64, i64),
        page_size: usize,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(16);
        let executor = self.clone();
        tokio::spawn(async move {
            let catalog = executor.fields.snapshot();
            let compiled = match CompiledMatch::compile(&plan.matcher, &catalog) {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                    return;
                }
            };
            let snapshot = executor.snapshot_for(&plan, range);
            let (from, to) = range;
            let deadline = Instant::now() + Duration::from_secs(executor.settings.max_stream_secs);

            if !plan.stages.is_empty() {
                // Pipelines need the full result set before the first row is
                // final; evaluate, then page.
                match executor.evaluate_pipeline(&plan, &compiled, &snapshot, range, &catalog) {
                    Ok(rows) => {
                        let total = rows.len() as u64;
                        let items: Vec<serde_json::Value> = rows
                            .into_iter()
                            .take(page_size)
                            .map(serde_json::Value::Object)
                            .collect();
                        let _ = tx.send(StreamEvent::Page { items }).await;
                        let _ = tx
                            .send(StreamEvent::Done { total, truncated: false })
                            .await;
                    }
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                    }
                }
                return;
            }

            let mut iter = snapshot.search(from, to, compiled.token_clauses(), |r| {
                compiled.matches(r, &catalog)
            });
            let mut page = Vec::with_capacity(page_size);
            let mut page_sent = false;
            let mut total = 0u64;
            let mut truncated = false;
            'outer: loop {
                for _ in 0..STREAM_CHUNK {
                    match iter.next() {
                        Some(record) => {
                            total += 1;
                            if !page_sent {
                                page.push(serde_json::Value::Object(record.to_row()));
                                if page.len() >= page_size {
                                    if tx
                                        .send(StreamEvent::Page { items: std::mem::take(&mut page) })
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                    page_sent = true;
                                }
                            }
                        }
                        None => break 'outer,
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
                if Instant::now() >= deadline {
                    truncated = true;
                    break;
                }
                tokio::task::yield_now().await;
            }
            if !page_sent {
                let _ = tx
                    .send(StreamEvent::Page { items: std::mem::take(&mut page) })
                    .await;
            }
            let _ = tx.send(StreamEvent::Done { total, truncated }).await;
        });
        rx
    }

    /// One-shot histogram with epoch-aligned buckets.
    pub fn histogram(
        &self,
        plan: &Plan,
        range: (i64, i64),
        bucket_ms: i64,
    ) -> Result<Vec<HistBucket>, ParseError> {
        let catalog = self.fields.snapshot();
        let compiled = CompiledMatch::compile(&plan.matcher, &catalog)?;
        let snapshot = self.snapshot_for(plan, range);
        let (from, to) = range;
        let buckets = snapshot.histogram(from, to, bucket_ms, compiled.token_clauses(), |r| {
            compiled.matches(r, &catalog)
        });
        Ok(buckets
            .into_iter()
            .map(|(start, count)| HistBucket { start, count })
            .collect())
    }

    /// Streaming histogram: skeleton first, monotone snapshots while the
    /// index is scanned, then a terminal total.
    pub fn histogram_stream(
        &self,
        plan: Plan,
        range: (i64, i64),
        bucket_ms: i64,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(16);
        let executor = self.clone();
        tokio::spawn(async move {
            let catalog = executor.fields.snapshot();
            let compiled = match CompiledMatch::compile(&plan.matcher, &catalog) {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                    return;
                }
            };
            let (from, to) = range;
            let mut buckets = crate::index::histogram_skeleton(from, to, bucket_ms);
            let skeleton: Vec<HistBucket> = buckets
                .iter()
                .map(|(start, count)| HistBucket { start: *start, count: *count })
                .collect();
            if tx.send(StreamEvent::Init { buckets: skeleton }).await.is_err() {
                return;
            }
            let first_bucket = buckets.first().map(|(s, _)| *s).unwrap_or(0);

            let snapshot = executor.snapshot_for(&plan, range);
            let mut iter = snapshot.search(from, to, compiled.token_clauses(), |r| {
                compiled.matches(r, &catalog)
            });
            let deadline = Instant::now() + Duration::from_secs(executor.settings.max_stream_secs);
            let snapshot_every = Duration::from_millis(executor.settings.snapshot_interval_ms.max(50));
            let mut last_snapshot = Instant::now();
            let mut total = 0u64;
            let mut truncated = false;
            'outer: loop {
                for _ in 0..STREAM_CHUNK {
                    match iter.next() {
                        Some(record) => {
                            let idx = (record.timestamp - first_bucket).div_euclid(bucket_ms) as usize;
                            if let Some(bucket) = buckets.get_mut(idx) {
                                bucket.1 += 1;
                            }
                            total += 1;
                        }
                        None => break 'outer,
                    }
                }
                if cancel.is_cancelled() {
                    return;
                }
                if Instant::now() >= deadline {
                    truncated = true;
                    break;
                }
                if last_snapshot.elapsed() >= snapshot_every {
                    last_snapshot = Instant::now();
                    let snapshot_buckets: Vec<HistBucket> = buckets
                        .iter()
                        .map(|(start, count)| HistBucket { start: *start, count: *count })
                        .collect();
                    if tx
                        .send(StreamEvent::Hist { buckets: snapshot_buckets })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                tokio::task::yield_now().await;
            }
            let final_buckets: Vec<HistBucket> = buckets
                .iter()
                .map(|(start, count)| HistBucket { start: *start, count: *count })
                .collect();
            let _ = tx.send(StreamEvent::Hist { buckets: final_buckets }).await;
            let _ = tx.send(StreamEvent::Done { total, truncated }).await;
        });
        rx
    }

    /// Equal-width slots across the range (not epoch-aligned).
    pub fn time_aggregation(
        &self,
        plan: &Plan,
        range: (i64, i64),
        slots: usize,
    ) -> Result<Vec<SlotBucket>, ParseError> {
        let catalog = self.fields.snapshot();
        let compiled = CompiledMatch::compile(&plan.matcher, &catalog)?;
        let snapshot = self.snapshot_for(plan, range);
        let (from, to) = range;
        let slots = slots.max(1);
        let width = ((to - from).max(1) as f64 / slots as f64).ceil() as i64;
        let width = width.max(1);

        let mut out: Vec<SlotBucket> = (0..slots)
            .map(|i| SlotBucket {
                start: from + i as i64 * width,
                end: (from + (i as i64 + 1) * width).min(to),
                count: 0,
            })
            .collect();
        for record in snapshot.search(from, to, compiled.token_clauses(), |r| {
            compiled.matches(r, &catalog)
        }) {
            let idx = ((record.timestamp - from) / width) as usize;
            if let Some(slot) = out.get_mut(idx.min(slots - 1)) {
                slot.count += 1;
            }
        }
        Ok(out)
    }

    /// Streaming export. Produces chunked CSV or a JSON array of rows.
    pub fn export(
        &self,
        plan: Plan,
        range: (i64, i64),
        format: ExportFormat,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<String, String>> {
        let (tx, rx) = mpsc::channel::<Result<String, String>>(16);
        let executor = self.clone();
        tokio::spawn(async move {
            let catalog = executor.fields.snapshot();
            let compiled = match CompiledMatch::compile(&plan.matcher, &catalog) {
                Ok(c) => c,
                Err(e) => {
                    let _ = tx.send(Err(e.to_string())).await;
                    return;
                }
            };
            let snapshot = executor.snapshot_for(&plan, range);
            let (from, to) = range;
            let mut columns: std::collections::BTreeSet<String> =
                executor.index.fields().into_iter().collect();
            columns.insert("id".to_string());
            let columns: Vec<String> = columns.into_iter().collect();

            match format {
                ExportFormat::Csv => {
                    let header = columns
                        .iter()
                        .map(|c| csv_escape(c))
                        .collect::<Vec<_>>()
                        .join(",");
                    if tx.send(Ok(format!("{header}\n"))).await.is_err() {
                        return;
                    }
                }
                ExportFormat::Json => {
                    if tx.send(Ok("[".to_string())).await.is_err() {
                        return;
                    }
                }
            }

            let mut iter = snapshot.search(from, to, compiled.token_clauses(), |r| {
                compiled.matches(r, &catalog)
            });
            let mut first = true;
            let mut chunk = String::new();
            loop {
                let mut ended = false;
                for _ in 0..STREAM_CHUNK {
                    match iter.next() {
                        Some(record) => match format {
                            ExportFormat::Csv => {
                                let line = columns
                                    .iter()
                                    .map(|c| csv_escape(&record.field_value(c).unwrap_or_default()))
                                    .collect::<Vec<_>>()
                                    .join(",");
                                chunk.push_str(&line);
                                chunk.push('\n');
                            }
                            ExportFormat::Json => {
                                if !first {
                                    chunk.push(',');
                                }
                                first = false;
                                chunk.push_str(
                                    &serde_json::Value::Object(record.to_row()).to_string(),
                                );
                            }
                        },
                        None => {
                            ended = true;
                            break;
                        }
                    }
                }
                if !chunk.is_empty() && tx.send(Ok(std::mem::take(&mut chunk))).await.is_err() {
                    return;
                }
                if ended {
                    break;
                }
                if cancel.is_cancelled() {
                    return;
                }
                tokio::task::yield_now().await;
            }
            if matches!(format, ExportFormat::Json) {
                let _ = tx.send(Ok("]".to_string())).await;
            }
        });
        rx
    }

    fn snapshot_for(&self, plan: &Plan, range: (i64, i64)) -> IndexSnapshot {
        let groups = self
            .index
            .router()
            .groups_for_query(Some(range), plan.exact_source());
        self.index.snapshot(Some(&groups))
    }

    /// Materialize matching records as rows and run the plan's stages.
    fn evaluate_pipeline(
        &self,
        plan: &Plan,
        compiled: &CompiledMatch,
        snapshot: &IndexSnapshot,
        range: (i64, i64),
        catalog: &FieldCatalog,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, ParseError> {
        let (from, to) = range;
        let mut rows: Vec<serde_json::Map<String, serde_json::Value>> = snapshot
            .search(from, to, compiled.token_clauses(), |r| {
                compiled.matches(r, catalog)
            })
            .map(|r| r.to_row())
            .collect();

        for stage in &plan.stages {
            rows = apply_stage(rows, stage, catalog)?;
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

/// Default histogram interval for a range the client did not qualify.
pub fn default_interval_ms(range_ms: i64) -> i64 {
    const HOUR: i64 = 3_600_000;
    match range_ms {
        r if r <= HOUR => 60_000,
        r if r <= 3 * HOUR => 5 * 60_000,
        r if r <= 12 * HOUR => 15 * 60_000,
        r if r <= 24 * HOUR => 30 * 60_000,
        _ => 86_400_000,
    }
}

/// `1m|5m|15m|30m|1h|1d` as milliseconds.
pub fn interval_to_ms(interval: &str) -> Option<i64> {
    match interval {
        "1m" => Some(60_000),
        "5m" => Some(5 * 60_000),
        "15m" => Some(15 * 60_000),
        "30m" => Some(30 * 60_000),
        "1h" => Some(3_600_000),
        "1d" => Some(86_400_000),
        _ => None,
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn apply_stage(
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    stage: &Stage,
    catalog: &FieldCatalog,
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, ParseError> {
    match stage {
        Stage::Where(expr) => {
            let compiled = CompiledMatch::compile(expr, catalog)?;
            Ok(rows.into_iter().filter(|r| compiled.matches_row(r)).collect())
        }
        Stage::Head(n) => Ok(rows.into_iter().take(*n).collect()),
        Stage::Tail(n) => {
            let skip = rows.len().saturating_sub(*n);
            Ok(rows.into_iter().skip(skip).collect())
        }
        Stage::Sort { field, dir } => {
            let mut rows = rows;
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(field), b.get(field));
                match dir {
                    SortDir::Asc => ordering,
                    SortDir::Desc => ordering.reverse(),
                }
            });
            Ok(rows)
        }
        Stage::Eval { field, expr } => Ok(rows
            .into_iter()
            .map(|mut row| {
                let value = eval_value(expr, &row).unwrap_or(serde_json::Value::Null);
                row.insert(field.clone(), value);
                row
            })
            .collect()),
        Stage::Stats { func, field, by } => Ok(aggregate(rows, *func, field.as_deref(), by.as_deref())),
    }
}

fn compare_values(
    a: Option<&serde_json::Value>,
    b: Option<&serde_json::Value>,
) -> std::cmp::Ordering {
    match (value_as_f64(a), value_as_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
        _ => value_as_string(a).cmp(&value_as_string(b)),
    }
}

fn value_as_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

fn eval_value(
    expr: &EvalExpr,
    row: &serde_json::Map<String, serde_json::Value>,
) -> Option<serde_json::Value> {
    match expr {
        EvalExpr::Field(name) => row.get(name).cloned(),
        EvalExpr::Number(n) => serde_json::Number::from_f64(*n).map(serde_json::Value::Number),
        EvalExpr::Str(s) => Some(serde_json::Value::String(s.clone())),
        EvalExpr::Binary { op, lhs, rhs } => {
            let left = eval_value(lhs, row)?;
            let right = eval_value(rhs, row)?;
            let lnum = value_as_f64(Some(&left));
            let rnum = value_as_f64(Some(&right));
            match (op, lnum, rnum) {
                ('+', Some(a), Some(b)) => number(a + b),
                ('-', Some(a), Some(b)) => number(a - b),
                ('*', Some(a), Some(b)) => number(a * b),
                ('/', Some(a), Some(b)) if b != 0.0 => number(a / b),
                ('/', _, _) => None,
                ('+', _, _) => Some(serde_json::Value::String(format!(
                    "{}{}",
                    value_as_string(Some(&left)),
                    value_as_string(Some(&right))
                ))),
                _ => None,
            }
        }
    }
}

fn number(v: f64) -> Option<serde_json::Value> {
    serde_json::Number::from_f64(v).map(serde_json::Value::Number)
}

fn aggregate(
    rows: Vec<serde_json::Map<String, serde_json::Value>>,
    func: AggFunc,
    field: Option<&str>,
    by: Option<&str>,
) -> Vec<serde_json::Map<String, serde_json::Value>> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Acc {
        count: u64,
        sum: f64,
        min: Option<f64>,
        max: Option<f64>,
    }

    let mut groups: BTreeMap<String, Acc> = BTreeMap::new();
    for row in &rows {
        let key = by
            .map(|b| value_as_string(row.get(b)))
            .unwrap_or_default();
        let acc = groups.entry(key).or_default();
        match func {
            AggFunc::Count => {
                // count(field) counts rows where the field is present.
                if field.is_none_or(|f| row.contains_key(f)) {
                    acc.count += 1;
                }
            }
            _ => {
                if let Some(v) = field.and_then(|f| value_as_f64(row.get(f))) {
                    acc.count += 1;
                    acc.sum += v;
                    acc.min = Some(acc.min.map_or(v, |m| m.min(v)));
                    acc.max = Some(acc.max.map_or(v, |m| m.max(v)));
                }
            }
        }
    }

    let label = func.label(field);
    groups
        .into_iter()
        .map(|(key, acc)| {
            let mut row = serde_json::Map::new();
            if let Some(by) = by {
                row.insert(by.to_string(), serde_json::Value::String(key));
            }
            let value = match func {
                AggFunc::Count => Some(serde_json::Value::Number(acc.count.into())),
                AggFunc::Sum => number(acc.sum),
                AggFunc::Avg if acc.count > 0 => number(acc.sum / acc.count as f64),
                AggFunc::Min => acc.min.and_then(number),
                AggFunc::Max => acc.max.and_then(number),
                _ => None,
            };
            row.insert(label.clone(), value.unwrap_or(serde_json::Value::Null));
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexSettings;
    use crate::models::log::{LogLevel, LogRecord};
    use crate::models::shard::ShardConfiguration;
    use std::collections::BTreeMap;

    fn record(id: &str, ts: i64, level: LogLevel, source: &str, message: &str) -> LogRecord {
        LogRecord {
            id: id.into(),
            timestamp: ts,
            level,
            source: source.into(),
            message: message.into(),
            raw: None,
            fields: BTreeMap::new(),
            host: None,
        }
    }

    fn executor(dir: &std::path::Path) -> SearchExecutor {
        let fields = Arc::new(FieldRegistry::new(&[]));
        let index = Arc::new(
            IndexStore::open(
                dir,
                &ShardConfiguration::default(),
                IndexSettings::default(),
                fields.clone(),
            )
            .unwrap(),
        );
        SearchExecutor::new(index, fields, SearchSettings::default())
    }

    fn seed(executor: &SearchExecutor) {
        executor
            .index
            .add_batch(vec![
                record("a", 1000, LogLevel::Info, "app.log", "hello world"),
                record("b", 2000, LogLevel::Error, "app.log", "boom today"),
                record("c", 3000, LogLevel::Error, "db.log", "boom tomorrow"),
                record("d", 4000, LogLevel::Info, "db.log", "quiet"),
            ])
            .unwrap();
    }

    #[test]
    fn paged_search_counts_and_slices() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("boom", false).unwrap();
        let page = executor.search(&plan, (0, 10_000), 0, 1).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        // Newest first.
        assert_eq!(page.items[0]["id"], "c");
        let page2 = executor.search(&plan, (0, 10_000), 1, 1).unwrap();
        assert_eq!(page2.items[0]["id"], "b");
    }

    #[test]
    fn level_filter_and_range() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("level=ERROR", false).unwrap();
        assert_eq!(executor.count(&plan, (0, 10_000)).unwrap(), 2);
        assert_eq!(executor.count(&plan, (0, 2500)).unwrap(), 1);
    }

    #[test]
    fn regex_plan_matches_message() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan(r"^boom t.*", true).unwrap();
        assert_eq!(executor.count(&plan, (0, 10_000)).unwrap(), 2);
    }

    #[test]
    fn stats_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("* | stats count by level", false).unwrap();
        let page = executor.search(&plan, (0, 10_000), 0, 10).unwrap();
        assert_eq!(page.total, 2);
        let by_level: BTreeMap<String, u64> = page
            .items
            .iter()
            .map(|row| {
                (
                    row["level"].as_str().unwrap().to_string(),
                    row["count"].as_u64().unwrap(),
                )
            })
            .collect();
        assert_eq!(by_level["ERROR"], 2);
        assert_eq!(by_level["INFO"], 2);
    }

    #[test]
    fn sort_head_eval_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor
            .parse_plan("* | eval ts_s=timestamp/1000 | sort timestamp asc | head 2", false)
            .unwrap();
        let page = executor.search(&plan, (0, 10_000), 0, 10).unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0]["id"], "a");
        assert_eq!(page.items[0]["ts_s"], 1.0);
    }

    #[test]
    fn histogram_conservation() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("*", false).unwrap();
        let buckets = executor.histogram(&plan, (0, 4999), 1000).unwrap();
        let total: u64 = buckets.iter().map(|b| b.count).sum();
        assert_eq!(total, executor.count(&plan, (0, 4999)).unwrap());
        assert_eq!(buckets.len(), 5);
    }

    #[test]
    fn time_aggregation_slots() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("*", false).unwrap();
        let slots = executor.time_aggregation(&plan, (1000, 5000), 4).unwrap();
        assert_eq!(slots.len(), 4);
        let total: u64 = slots.iter().map(|s| s.count).sum();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn search_stream_emits_page_then_done() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("boom", false).unwrap();
        let mut rx = executor.search_stream(plan, (0, 10_000), 1, CancellationToken::new());
        match rx.recv().await.unwrap() {
            StreamEvent::Page { items } => assert_eq!(items.len(), 1),
            other => panic!("expected page, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            StreamEvent::Done { total, truncated } => {
                assert_eq!(total, 2);
                assert!(!truncated);
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn histogram_stream_init_and_conservation() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("*", false).unwrap();
        let mut rx =
            executor.histogram_stream(plan, (0, 3_599_999), 300_000, CancellationToken::new());
        let mut last_hist: Option<Vec<HistBucket>> = None;
        let mut done_total = None;
        let mut init_len = None;
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Init { buckets } => {
                    assert!(buckets.iter().all(|b| b.count == 0));
                    init_len = Some(buckets.len());
                }
                StreamEvent::Hist { buckets } => last_hist = Some(buckets),
                StreamEvent::Done { total, .. } => done_total = Some(total),
                StreamEvent::Error { message } => panic!("stream error: {message}"),
                StreamEvent::Page { .. } => panic!("unexpected page event"),
            }
        }
        assert_eq!(init_len, Some(12));
        let hist_total: u64 = last_hist.unwrap().iter().map(|b| b.count).sum();
        assert_eq!(Some(hist_total), done_total);
    }

    #[tokio::test]
    async fn csv_export_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        executor
            .index
            .add_batch(vec![record(
                "a",
                1000,
                LogLevel::Info,
                "app.log",
                r#"said "hi", left"#,
            )])
            .unwrap();

        let plan = executor.parse_plan("*", false).unwrap();
        let mut rx = executor.export(plan, (0, 10_000), ExportFormat::Csv, CancellationToken::new());
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(&chunk.unwrap());
        }
        assert!(out.starts_with("host,id,level,message"));
        assert!(out.contains(r#""said ""hi"", left""#));
    }

    #[tokio::test]
    async fn json_export_is_array() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(dir.path());
        seed(&executor);

        let plan = executor.parse_plan("boom", false).unwrap();
        let mut rx =
            executor.export(plan, (0, 10_000), ExportFormat::Json, CancellationToken::new());
        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(&chunk.unwrap());
        }
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn interval_defaults() {
        assert_eq!(default_interval_ms(3_600_000), 60_000);
        assert_eq!(default_interval_ms(2 * 3_600_000), 5 * 60_000);
        assert_eq!(default_interval_ms(10 * 3_600_000), 15 * 60_000);
        assert_eq!(default_interval_ms(20 * 3_600_000), 30 * 60_000);
        assert_eq!(default_interval_ms(48 * 3_600_000), 86_400_000);
    }
}
