//! CSV input and output.
//!
//! Three formats: fact batches (input), the checkpoint log (read back and
//! rewritten between runs), and the balance report (output).

use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, Result};
use crate::fact::{Fact, FactRecord};
use csv::{ReaderBuilder, Trim};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Reads a batch of facts.
///
/// Unlike a best-effort import, any malformed row fails the whole batch so
/// that a partial file never reaches the ledger.
pub fn read_facts<R: Read>(reader: R) -> Result<Vec<Fact>> {
    let mut csv_reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut facts = Vec::new();
    for (row_idx, result) in csv_reader.deserialize::<FactRecord>().enumerate() {
        let row = row_idx + 2; // 1-indexed, accounting for header row
        let record = result.map_err(|e| EngineError::InvalidRecord {
            row,
            message: e.to_string(),
        })?;
        facts.push(record.parse(row)?);
    }
    Ok(facts)
}

/// Reads a persisted checkpoint log.
pub fn read_checkpoints<R: Read>(reader: R) -> Result<Vec<Checkpoint>> {
    let mut csv_reader = ReaderBuilder::new().trim(Trim::All).from_reader(reader);

    csv_reader
        .deserialize::<Checkpoint>()
        .enumerate()
        .map(|(row_idx, result)| {
            result.map_err(|e| EngineError::InvalidRecord {
                row: row_idx + 2,
                message: e.to_string(),
            })
        })
        .collect()
}

/// Writes the full checkpoint log, in the order given.
pub fn write_checkpoints<'a, W, I>(writer: W, checkpoints: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a Checkpoint>,
{
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);

    // Written by hand so that an empty log still carries its header.
    csv_writer.write_record([
        "id",
        "organization_id",
        "timestamp",
        "prompt_token_sum",
        "completion_token_sum",
        "balance",
    ])?;
    for checkpoint in checkpoints {
        csv_writer.serialize(checkpoint)?;
    }

    csv_writer.flush()?;
    Ok(())
}

/// Replaces the file at `path` with what `write` produces.
///
/// The content goes to a temporary file in the same directory and is renamed
/// over `path` only after `write` succeeded and the data reached the disk.
/// On any error the previous file is left as it was.
pub fn replace_file<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Rewrites the checkpoint log at `path` through [`replace_file`].
pub fn save_checkpoints(path: &Path, checkpoints: &[Checkpoint]) -> Result<()> {
    replace_file(path, |writer| write_checkpoints(writer, checkpoints))
}

/// Writes one balance line per checkpoint, sorted by organization.
pub fn write_balances<'a, W, I>(writer: W, checkpoints: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a Checkpoint>,
{
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer.write_record([
        "organization",
        "timestamp",
        "prompt_tokens",
        "completion_tokens",
        "balance",
    ])?;

    let mut rows: Vec<_> = checkpoints.into_iter().collect();
    rows.sort_by_key(|cp| cp.organization_id);

    for cp in rows {
        csv_writer.write_record([
            cp.organization_id.to_string(),
            cp.timestamp.to_rfc3339(),
            cp.prompt_token_sum.to_string(),
            cp.completion_token_sum.to_string(),
            cp.balance.to_string(),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}
