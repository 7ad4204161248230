//! Streaming job sources (JSONL and CSV) and the sink for rows that cannot
//! become jobs.
//!
//! Rows are read one at a time so arbitrarily large inputs never sit in
//! memory. A row without an `id` gets `row-<n>`, where `n` is its line in the
//! file, which stays stable across runs of the same file and therefore
//! survives a resume. A bad row is reported to the [`RejectionSink`] and
//! never ends the stream; only an I/O failure does.

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use csv_async::{AsyncReaderBuilder, ByteRecord, ByteRecordsIntoStream, Trim};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::BatchError;
use crate::state_machine::{GenerationPayload, JobRecord};

/// File name of the rejected-rows log inside the output directory.
pub const REJECTED_FILE_NAME: &str = "_rejected_rows.jsonl";

const MAX_PROMPT_CHARS: usize = 2000;

/// Layout of an input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Csv,
    Jsonl,
}

impl InputFormat {
    /// Format implied by the file extension, if any.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(InputFormat::Csv),
            "jsonl" | "ndjson" | "json" => Some(InputFormat::Jsonl),
            _ => None,
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputFormat::Csv => write!(f, "csv"),
            InputFormat::Jsonl => write!(f, "jsonl"),
        }
    }
}

/// An input row that never became a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRow {
    pub row_number: usize,
    pub error_type: String,
    pub error_message: String,
    pub raw_data: Value,
}

impl RejectedRow {
    fn new(row_number: usize, error_type: &str, error_message: String, raw_data: Value) -> Self {
        Self {
            row_number,
            error_type: error_type.to_string(),
            error_message,
            raw_data,
        }
    }
}

/// Receives rows refused by the input layer or by the orchestrator.
pub trait RejectionSink: Send + Sync {
    fn reject<'a>(&'a self, row: &'a RejectedRow) -> BoxFuture<'a, Result<(), BatchError>>;
}

/// Drops rejected rows.
pub struct NullRejectionSink;

impl RejectionSink for NullRejectionSink {
    fn reject<'a>(&'a self, _row: &'a RejectedRow) -> BoxFuture<'a, Result<(), BatchError>> {
        futures::future::ready(Ok(())).boxed()
    }
}

/// Appends rejected rows as JSON lines. The file is created on first use.
pub struct JsonlRejectionSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlRejectionSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RejectionSink for JsonlRejectionSink {
    fn reject<'a>(&'a self, row: &'a RejectedRow) -> BoxFuture<'a, Result<(), BatchError>> {
        async move {
            let mut line = serde_json::to_vec(row)?;
            line.push(b'\n');

            let mut guard = self.file.lock().await;
            let file = match guard.take() {
                Some(file) => file,
                None => File::create(&self.path).await?,
            };
            let file = guard.insert(file);
            file.write_all(&line).await?;
            file.flush().await?;
            Ok(())
        }
        .boxed()
    }
}

/// Picks the format of `path` from its extension, falling back to the first
/// non-blank line: `{` means JSONL, a comma means CSV.
pub async fn detect_format(path: &Path) -> Result<InputFormat, BatchError> {
    if let Some(format) = InputFormat::from_extension(path) {
        return Ok(format);
    }

    let mut reader = BufReader::new(open_input(path).await?);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| BatchError::Input(format!("read failed: {e}")))?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{') {
            return Ok(InputFormat::Jsonl);
        }
        if line.contains(',') {
            return Ok(InputFormat::Csv);
        }
        break;
    }
    Err(BatchError::Input(format!(
        "cannot determine format of {}; pass --format csv or --format jsonl",
        path.display()
    )))
}

/// Opens `path` as `format` (detected when `None`) and streams its jobs.
pub async fn open_jobs(
    path: &Path,
    format: Option<InputFormat>,
    sink: Arc<dyn RejectionSink>,
) -> Result<BoxStream<'static, Result<JobRecord, BatchError>>, BatchError> {
    let format = match format {
        Some(format) => format,
        None => detect_format(path).await?,
    };
    debug!(path = %path.display(), %format, "Opening job input");
    Ok(match format {
        InputFormat::Csv => csv_jobs(path, sink).await?.boxed(),
        InputFormat::Jsonl => jsonl_jobs(path, sink).await?.boxed(),
    })
}

async fn open_input(path: &Path) -> Result<File, BatchError> {
    File::open(path)
        .await
        .map_err(|e| BatchError::Input(format!("cannot open {}: {e}", path.display())))
}

async fn route(sink: &dyn RejectionSink, rejected: &RejectedRow) -> Result<(), BatchError> {
    warn!(
        row = rejected.row_number,
        error_type = %rejected.error_type,
        error = %rejected.error_message,
        "Rejected input row"
    );
    sink.reject(rejected).await
}

/// One row of either input format, after field names are normalized.
#[derive(Debug, Deserialize)]
struct InputRow {
    #[serde(default, alias = "request_id")]
    id: Option<String>,
    #[serde(default, alias = "output_filename", alias = "filename")]
    output_name: Option<String>,
    #[serde(flatten)]
    payload: GenerationPayload,
}

struct JsonlState {
    reader: BufReader<File>,
    buf: Vec<u8>,
    row_number: usize,
    sink: Arc<dyn RejectionSink>,
}

/// Opens `path` and streams its valid JSON lines as [`JobRecord`]s.
///
/// Lines that are not UTF-8, not JSON or fail validation go to `sink`. An
/// I/O failure while reading ends the stream with an error.
pub async fn jsonl_jobs(
    path: &Path,
    sink: Arc<dyn RejectionSink>,
) -> Result<impl Stream<Item = Result<JobRecord, BatchError>> + Send + use<>, BatchError> {
    let state = JsonlState {
        reader: BufReader::new(open_input(path).await?),
        buf: Vec::new(),
        row_number: 0,
        sink,
    };

    Ok(stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            state.buf.clear();
            match state.reader.read_until(b'\n', &mut state.buf).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    let err = BatchError::Input(format!("read failed: {e}"));
                    return Some((Err(err), None));
                }
            }
            state.row_number += 1;

            let parsed = match std::str::from_utf8(&state.buf) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => parse_json_line(line, state.row_number),
                Err(e) => Err(RejectedRow::new(
                    state.row_number,
                    "encoding_error",
                    format!("row is not valid UTF-8: {e}"),
                    Value::String(String::from_utf8_lossy(&state.buf).trim_end().to_string()),
                )),
            };
            match parsed {
                Ok(record) => return Some((Ok(record), Some(state))),
                Err(rejected) => {
                    if let Err(e) = route(state.sink.as_ref(), &rejected).await {
                        return Some((Err(e), None));
                    }
                }
            }
        }
    }))
}

struct CsvState {
    records: Pin<Box<ByteRecordsIntoStream<'static, File>>>,
    headers: Vec<String>,
    row_number: usize,
    sink: Arc<dyn RejectionSink>,
}

/// Opens `path` and streams its valid CSV rows as [`JobRecord`]s.
///
/// The header row names the fields; `text`, `filename`, `random_seed` and
/// `negative` are accepted for `prompt`, `output_name`, `seed` and
/// `negative_prompt`. Blank cells are treated as absent.
pub async fn csv_jobs(
    path: &Path,
    sink: Arc<dyn RejectionSink>,
) -> Result<impl Stream<Item = Result<JobRecord, BatchError>> + Send + use<>, BatchError> {
    let mut reader = AsyncReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .create_reader(open_input(path).await?);
    let headers: Vec<String> = reader
        .byte_headers()
        .await
        .map_err(|e| {
            BatchError::Input(format!("cannot read CSV header of {}: {e}", path.display()))
        })?
        .iter()
        .map(|name| canonical_field(&String::from_utf8_lossy(name)))
        .collect();
    if !headers.iter().any(|name| name == "prompt") {
        return Err(BatchError::Input(format!(
            "CSV header of {} has no prompt column",
            path.display()
        )));
    }

    let state = CsvState {
        records: Box::pin(reader.into_byte_records()),
        headers,
        row_number: 1,
        sink,
    };

    Ok(stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            let next = state.records.next().await?;
            state.row_number += 1;
            let parsed = match next {
                Ok(record) => {
                    if let Some(position) = record.position() {
                        state.row_number = position.line() as usize;
                    }
                    parse_csv_record(&state.headers, &record, state.row_number)
                }
                Err(e) if matches!(e.kind(), csv_async::ErrorKind::Io(_)) => {
                    let err = BatchError::Input(format!("read failed: {e}"));
                    return Some((Err(err), None));
                }
                Err(e) => Err(RejectedRow::new(
                    state.row_number,
                    "parse_error",
                    e.to_string(),
                    Value::Null,
                )),
            };
            match parsed {
                Ok(record) => return Some((Ok(record), Some(state))),
                Err(rejected) => {
                    if let Err(e) = route(state.sink.as_ref(), &rejected).await {
                        return Some((Err(e), None));
                    }
                }
            }
        }
    }))
}

fn canonical_field(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "text" => "prompt".to_string(),
        "filename" | "output_filename" => "output_name".to_string(),
        "random_seed" => "seed".to_string(),
        "negative" => "negative_prompt".to_string(),
        _ => name,
    }
}

fn parse_json_line(line: &str, row_number: usize) -> Result<JobRecord, RejectedRow> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        RejectedRow::new(
            row_number,
            "parse_error",
            e.to_string(),
            Value::String(line.trim_end().to_string()),
        )
    })?;
    record_from_value(value.clone(), value, row_number)
}

fn parse_csv_record(
    headers: &[String],
    record: &ByteRecord,
    row_number: usize,
) -> Result<JobRecord, RejectedRow> {
    let mut cells = Vec::with_capacity(headers.len());
    for cell in record.iter() {
        match std::str::from_utf8(cell) {
            Ok(cell) => cells.push(cell.to_string()),
            Err(e) => {
                let lossy: Vec<String> = record
                    .iter()
                    .map(|c| String::from_utf8_lossy(c).into_owned())
                    .collect();
                return Err(RejectedRow::new(
                    row_number,
                    "encoding_error",
                    format!("row is not valid UTF-8: {e}"),
                    Value::String(lossy.join(",")),
                ));
            }
        }
    }

    let raw: Map<String, Value> = headers
        .iter()
        .zip(&cells)
        .map(|(name, cell)| (name.clone(), Value::String(cell.clone())))
        .collect();
    let raw = Value::Object(raw);

    let mut fields = Map::new();
    for (name, cell) in headers.iter().zip(cells) {
        if name.is_empty() || (cell.trim().is_empty() && name != "prompt") {
            continue;
        }
        let value = if name == "seed" {
            match cell.trim().parse::<u32>() {
                Ok(seed) => Value::from(seed),
                Err(_) => {
                    return Err(RejectedRow::new(
                        row_number,
                        "validation_error",
                        format!("Invalid seed value: {cell}"),
                        raw,
                    ));
                }
            }
        } else {
            Value::String(cell)
        };
        fields.insert(name.clone(), value);
    }
    record_from_value(Value::Object(fields), raw, row_number)
}

fn record_from_value(
    value: Value,
    raw: Value,
    row_number: usize,
) -> Result<JobRecord, RejectedRow> {
    let row: InputRow = match serde_json::from_value(value) {
        Ok(row) => row,
        Err(e) => return Err(RejectedRow::new(row_number, "validation_error", e.to_string(), raw)),
    };

    let prompt = row.payload.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(RejectedRow::new(
            row_number,
            "validation_error",
            "prompt cannot be empty".into(),
            raw,
        ));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(RejectedRow::new(
            row_number,
            "validation_error",
            format!("prompt exceeds {MAX_PROMPT_CHARS} characters"),
            raw,
        ));
    }

    let request_id = match row.id.map(|id| id.trim().to_string()) {
        Some(id) if !id.is_empty() => id,
        _ => format!("row-{row_number}"),
    };
    let mut payload = row.payload;
    payload.prompt = prompt;

    Ok(JobRecord {
        request_id,
        payload,
        output_name: row.output_name.filter(|n| !n.trim().is_empty()),
        row_number: Some(row_number),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingSink(std::sync::Mutex<Vec<RejectedRow>>);

    impl RejectionSink for CollectingSink {
        fn reject<'a>(&'a self, row: &'a RejectedRow) -> BoxFuture<'a, Result<(), BatchError>> {
            self.0.lock().unwrap().push(row.clone());
            futures::future::ready(Ok(())).boxed()
        }
    }

    async fn read_file(
        name: &str,
        content: &[u8],
        format: Option<InputFormat>,
    ) -> (Vec<JobRecord>, Vec<RejectedRow>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();

        let sink = Arc::new(CollectingSink::default());
        let jobs: Vec<JobRecord> = open_jobs(&path, format, sink.clone())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        let rejected = sink.0.lock().unwrap().clone();
        (jobs, rejected)
    }

    async fn read_all(content: &str) -> (Vec<JobRecord>, Vec<RejectedRow>) {
        read_file("jobs.jsonl", content.as_bytes(), None).await
    }

    #[tokio::test]
    async fn valid_rows_become_jobs() {
        let (jobs, rejected) = read_all(concat!(
            r#"{"id": "req1", "prompt": "A beautiful sunset", "output_name": "sunset"}"#,
            "\n",
            r#"{"prompt": "  A forest scene ", "media_type": "video", "seed": 42}"#,
            "\n",
        ))
        .await;

        assert!(rejected.is_empty());
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].request_id, "req1");
        assert_eq!(jobs[0].output_name.as_deref(), Some("sunset"));
        assert_eq!(jobs[0].row_number, Some(1));
        assert_eq!(jobs[1].request_id, "row-2");
        assert_eq!(jobs[1].payload.prompt, "A forest scene");
        assert_eq!(jobs[1].payload.seed, Some(42));
    }

    #[tokio::test]
    async fn invalid_rows_go_to_the_sink() {
        let (jobs, rejected) = read_all(concat!(
            "not json\n",
            "\n",
            r#"{"prompt": ""}"#,
            "\n",
            r#"{"prompt": "ok", "seed": -3}"#,
            "\n",
            r#"{"id": "good", "prompt": "a cat"}"#,
            "\n",
        ))
        .await;

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].request_id, "good");
        assert_eq!(rejected.len(), 3);
        assert_eq!(rejected[0].row_number, 1);
        assert_eq!(rejected[0].error_type, "parse_error");
        assert_eq!(rejected[1].row_number, 3);
        assert_eq!(rejected[1].error_message, "prompt cannot be empty");
        assert_eq!(rejected[2].error_type, "validation_error");
        assert_eq!(rejected[2].raw_data["seed"], -3);
    }

    #[tokio::test]
    async fn non_utf8_row_is_rejected_and_reading_continues() {
        let mut content = Vec::new();
        content.extend_from_slice(b"{\"id\": \"a\", \"prompt\": \"first\"}\n");
        content.extend_from_slice(b"{\"id\": \"b\", \"prompt\": \"caf\xe9\"}\n");
        content.extend_from_slice(b"{\"id\": \"c\", \"prompt\": \"third\"}\n");

        let (jobs, rejected) = read_file("jobs.jsonl", &content, None).await;

        let ids: Vec<_> = jobs.iter().map(|j| j.request_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].row_number, 2);
        assert_eq!(rejected[0].error_type, "encoding_error");
        assert!(rejected[0].raw_data.as_str().unwrap().contains("caf"));
    }

    #[tokio::test]
    async fn missing_input_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = jsonl_jobs(&dir.path().join("nope.jsonl"), Arc::new(NullRejectionSink)).await;
        assert!(matches!(result, Err(BatchError::Input(_))));
    }

    #[tokio::test]
    async fn stream_does_not_borrow_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let stream = {
            let path = dir.path().join("jobs.jsonl");
            std::fs::write(&path, "{\"prompt\": \"a cat\"}\n").unwrap();
            jsonl_jobs(&path, Arc::new(NullRejectionSink)).await.unwrap()
        };
        let jobs: Vec<_> = stream.collect().await;
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn csv_rows_become_jobs() {
        let (jobs, rejected) = read_file(
            "jobs.csv",
            concat!(
                "prompt,output_name,seed\n",
                "\"A beautiful sunset\",\"sunset\",42\n",
                "\"A mountain, at dawn\",mountain,123\n",
            )
            .as_bytes(),
            None,
        )
        .await;

        assert!(rejected.is_empty());
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].request_id, "row-2");
        assert_eq!(jobs[0].payload.prompt, "A beautiful sunset");
        assert_eq!(jobs[0].output_name.as_deref(), Some("sunset"));
        assert_eq!(jobs[0].payload.seed, Some(42));
        assert_eq!(jobs[1].payload.prompt, "A mountain, at dawn");
        assert_eq!(jobs[1].payload.seed, Some(123));
    }

    #[tokio::test]
    async fn csv_aliases_and_blank_cells() {
        let (jobs, rejected) = read_file(
            "jobs.csv",
            concat!(
                "id,text,filename,random_seed,negative,quality\n",
                "cat-1,Test prompt,test_file,7,no cars,   \n",
            )
            .as_bytes(),
            None,
        )
        .await;

        assert!(rejected.is_empty());
        assert_eq!(jobs[0].request_id, "cat-1");
        assert_eq!(jobs[0].payload.prompt, "Test prompt");
        assert_eq!(jobs[0].output_name.as_deref(), Some("test_file"));
        assert_eq!(jobs[0].payload.seed, Some(7));
        assert_eq!(jobs[0].payload.negative_prompt.as_deref(), Some("no cars"));
        assert!(jobs[0].payload.quality.is_none());
    }

    #[tokio::test]
    async fn csv_invalid_rows_go_to_the_sink() {
        let (jobs, rejected) = read_file(
            "jobs.csv",
            concat!(
                "prompt,output_name,seed\n",
                "\"Valid prompt\",valid_output,42\n",
                "\"\",invalid_empty_prompt,123\n",
                "\"Another valid prompt\",valid_output2,not_a_number\n",
                "\"Third valid prompt\",valid_output3,456\n",
            )
            .as_bytes(),
            None,
        )
        .await;

        let prompts: Vec<_> = jobs.iter().map(|j| j.payload.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["Valid prompt", "Third valid prompt"]);
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].error_message, "prompt cannot be empty");
        assert_eq!(rejected[0].row_number, 3);
        assert_eq!(rejected[1].error_message, "Invalid seed value: not_a_number");
        assert_eq!(rejected[1].row_number, 4);
        assert_eq!(rejected[1].raw_data["seed"], "not_a_number");
    }

    #[tokio::test]
    async fn csv_without_prompt_column_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.csv");
        std::fs::write(&path, "name,seed\ncat,1\n").unwrap();
        let result = csv_jobs(&path, Arc::new(NullRejectionSink)).await;
        assert!(matches!(result, Err(BatchError::Input(_))));
    }

    #[tokio::test]
    async fn explicit_format_overrides_extension() {
        let (jobs, _) = read_file(
            "jobs.txt",
            b"prompt\n\"a red bicycle\"\n",
            Some(InputFormat::Csv),
        )
        .await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload.prompt, "a red bicycle");
    }

    #[tokio::test]
    async fn format_detection() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, content: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        };

        let cases = [
            (write("a.csv", ""), InputFormat::Csv),
            (write("a.jsonl", ""), InputFormat::Jsonl),
            (write("a.json", ""), InputFormat::Jsonl),
            (write("b.txt", "\n{\"prompt\": \"test\"}\n"), InputFormat::Jsonl),
            (write("c.txt", "prompt,output_name\n\"test\",\"out\"\n"), InputFormat::Csv),
        ];
        for (path, expected) in cases {
            assert_eq!(detect_format(&path).await.unwrap(), expected, "{}", path.display());
        }

        let unknown = write("d.unknown", "unknown content format\n");
        assert!(matches!(detect_format(&unknown).await, Err(BatchError::Input(_))));
    }

    #[tokio::test]
    async fn jsonl_sink_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlRejectionSink::new(dir.path().join(REJECTED_FILE_NAME));
        assert!(!sink.path().exists());

        for n in 1..=2 {
            let raw = serde_json::json!({"n": n});
            let row = RejectedRow::new(n, "validation_error", "bad".into(), raw);
            sink.reject(&row).await.unwrap();
        }

        let content = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
