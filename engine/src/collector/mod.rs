//! Turns what a script produced into structured output, or explains why it
//! could not.

mod document;
mod markup;
mod table;

use sandbox::Artifact;
use serde::Serialize;

use crate::job::{OutputFormat, PartialReason};

pub use markup::{MarkupDocument, MarkupField, MarkupRecord};
pub use table::Table;

/// Cap on raw text kept for diagnostics.
pub const RAW_TEXT_LIMIT: usize = 64 * 1024;

/// Parsed output. One variant per supported format.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StructuredOutput {
    Document(serde_json::Value),
    Table(Table),
    Markup(MarkupDocument),
}

impl StructuredOutput {
    pub fn format(&self) -> OutputFormat {
        match self {
            Self::Document(_) => OutputFormat::Json,
            Self::Table(_) => OutputFormat::Csv,
            Self::Markup(_) => OutputFormat::Xml,
        }
    }

    /// Serialize back into the declared format.
    pub fn render(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Document(value) => document::render(value),
            Self::Table(table) => table.render(),
            Self::Markup(doc) => doc.render(),
        }
    }

    /// Rows, records, or array elements; a scalar or object document counts as one.
    pub fn record_count(&self) -> usize {
        match self {
            Self::Document(serde_json::Value::Array(items)) => items.len(),
            Self::Document(_) => 1,
            Self::Table(table) => table.rows.len(),
            Self::Markup(doc) => doc.records.len(),
        }
    }
}

/// Where the collected output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    /// The file the script wrote to `$OUTPUT_FILE`.
    Artifact,
    Stdout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedOutput {
    pub output: StructuredOutput,
    pub source: OutputSource,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollectionError {
    #[error("script produced no output")]
    Empty,

    #[error("output could not be parsed: {detail}")]
    Unparseable { detail: String },

    #[error("output exceeded the size limit")]
    Truncated,
}

impl CollectionError {
    pub(crate) fn unparseable(detail: impl ToString) -> Self {
        Self::Unparseable {
            detail: detail.to_string(),
        }
    }

    pub fn reason(&self) -> PartialReason {
        match self {
            Self::Empty => PartialReason::Empty,
            Self::Unparseable { detail } => PartialReason::Unparseable(detail.clone()),
            Self::Truncated => PartialReason::Truncated,
        }
    }
}

/// Everything a finished script left behind.
#[derive(Debug, Clone, Copy)]
pub struct RawOutput<'a> {
    pub stdout: &'a [u8],
    pub stdout_truncated: bool,
    pub artifact: Option<&'a Artifact>,
}

impl<'a> RawOutput<'a> {
    /// The output file wins when the script wrote anything to it.
    fn select(&self) -> (&'a [u8], bool, OutputSource) {
        match self.artifact {
            Some(artifact) if !is_blank(&artifact.bytes) => {
                (&artifact.bytes, artifact.truncated, OutputSource::Artifact)
            }
            _ => (self.stdout, self.stdout_truncated, OutputSource::Stdout),
        }
    }

    /// Raw text of the selected source, lossily decoded and capped.
    pub fn diagnostic_text(&self) -> String {
        raw_text(self.select().0)
    }
}

/// Parse the script's output as `format`.
///
/// Input beyond `max_bytes` is never parsed; it yields `Truncated`.
pub fn collect(
    raw: &RawOutput<'_>,
    format: OutputFormat,
    max_bytes: u64,
) -> Result<CollectedOutput, CollectionError> {
    let (bytes, truncated, source) = raw.select();
    if truncated || bytes.len() as u64 > max_bytes {
        return Err(CollectionError::Truncated);
    }
    if is_blank(bytes) {
        return Err(CollectionError::Empty);
    }

    let output = parse(bytes, format)?;
    Ok(CollectedOutput { output, source })
}

/// Strict parse of a complete payload.
pub fn parse(bytes: &[u8], format: OutputFormat) -> Result<StructuredOutput, CollectionError> {
    match format {
        OutputFormat::Json => document::parse(bytes).map(StructuredOutput::Document),
        OutputFormat::Csv => Table::parse(bytes).map(StructuredOutput::Table),
        OutputFormat::Xml => MarkupDocument::parse(bytes).map(StructuredOutput::Markup),
    }
}

/// Lossy UTF-8 decoding capped at `RAW_TEXT_LIMIT` bytes.
pub fn raw_text(bytes: &[u8]) -> String {
    let capped = bytes.get(..RAW_TEXT_LIMIT).unwrap_or(bytes);
    String::from_utf8_lossy(capped).into_owned()
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}
