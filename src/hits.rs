use anyhow::{anyhow, Result};
use csv::{ReaderBuilder, WriterBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf};

/// Column layout requested from the aligner and used for every hit table.
pub const HIT_COLUMNS: [&str; 15] = [
    "qseqid", "sseqid", "pident", "qlen", "slen", "length", "mismatch",
    "gapopen", "qstart", "qend", "sstart", "send", "evalue", "bitscore",
    "score",
];

/// Column layout of the blast score ratio table.
pub const BSR_COLUMNS: [&str; 8] = [
    "qseqid", "sseqid_db", "score_db", "pident_db", "sseqid_og", "score_og",
    "pident_og", "bsr",
];

/// One row of the tabular report requested from the aligner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRecord {
    pub qseqid: String,
    pub sseqid: String,
    pub pident: f64,
    pub qlen: u64,
    pub slen: u64,
    pub length: u64,
    pub mismatch: u64,
    pub gapopen: u64,
    pub qstart: u64,
    pub qend: u64,
    pub sstart: u64,
    pub send: u64,
    pub evalue: f64,
    pub bitscore: f64,
    pub score: f64,
}

/// One read scored against both databases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BsrRecord {
    pub qseqid: String,
    pub sseqid_db: String,
    pub score_db: f64,
    pub pident_db: f64,
    pub sseqid_og: String,
    pub score_og: f64,
    pub pident_og: f64,
    pub bsr: f64,
}

// --------------------------------------------------
/// Read a headerless raw hit table as written by the aligner.
pub fn read_raw_hits(filename: &PathBuf) -> Result<Vec<HitRecord>> {
    read_hits(filename, false)
}

// --------------------------------------------------
/// Read a deduplicated hit table, which carries a header row.
pub fn read_hit_table(filename: &PathBuf) -> Result<Vec<HitRecord>> {
    read_hits(filename, true)
}

// --------------------------------------------------
fn read_hits(filename: &PathBuf, has_headers: bool) -> Result<Vec<HitRecord>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(has_headers)
        .from_path(filename)
        .map_err(|e| anyhow!("Cannot read {}: {e}", filename.display()))?;

    let mut hits = vec![];
    for res in reader.deserialize() {
        let rec: HitRecord = res.map_err(|e| {
            anyhow!("Invalid hit record in {}: {e}", filename.display())
        })?;
        hits.push(rec);
    }

    Ok(hits)
}

// --------------------------------------------------
pub fn read_bsr_table(filename: &PathBuf) -> Result<Vec<BsrRecord>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(filename)
        .map_err(|e| anyhow!("Cannot read {}: {e}", filename.display()))?;

    let mut records = vec![];
    for res in reader.deserialize() {
        let rec: BsrRecord = res.map_err(|e| {
            anyhow!("Invalid BSR record in {}: {e}", filename.display())
        })?;
        records.push(rec);
    }

    Ok(records)
}

// --------------------------------------------------
/// Write a hit table with a header row, even when there are no hits.
pub fn write_hit_table(hits: &[HitRecord], filename: &PathBuf) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_path(filename)
        .map_err(|e| anyhow!("Cannot write {}: {e}", filename.display()))?;

    if hits.is_empty() {
        wtr.write_record(HIT_COLUMNS)?;
    }
    for hit in hits {
        wtr.serialize(hit)?;
    }
    wtr.flush()?;

    Ok(())
}

// --------------------------------------------------
/// Write the blast score ratio table with a header row.
pub fn write_bsr_table(
    records: &[BsrRecord],
    filename: &PathBuf,
) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .delimiter(b'\t')
        .from_path(filename)
        .map_err(|e| anyhow!("Cannot write {}: {e}", filename.display()))?;

    if records.is_empty() {
        wtr.write_record(BSR_COLUMNS)?;
    }
    for rec in records {
        wtr.serialize(rec)?;
    }
    wtr.flush()?;

    Ok(())
}

// --------------------------------------------------
/// Reduce a hit table to the single best-scoring hit per query.
///
/// Aligners cap the number of reported targets per query, and the cap is
/// applied before any global ranking, so a raw table may hold many hits
/// per read in no particular order. Sorting by raw score and keeping the
/// first record seen per query yields the top hit regardless of how the
/// aligner ordered its report. Ties keep whichever record came first.
pub fn deduplicate(hits: &[HitRecord]) -> Vec<HitRecord> {
    hits.iter()
        .cloned()
        .sorted_by(|a, b| b.score.total_cmp(&a.score))
        .unique_by(|hit| hit.qseqid.clone())
        .collect()
}

// --------------------------------------------------
/// Join two deduplicated hit tables on query id and compute the blast
/// score ratio, gene score over outgroup score, for every read present
/// in both. Reads found in only one table are dropped. Output order
/// follows `db_hits`.
///
/// An outgroup score of zero yields a ratio of infinity, also when the
/// gene score is zero, so a joined read never gets a NaN.
pub fn compute_bsr(
    db_hits: &[HitRecord],
    og_hits: &[HitRecord],
) -> Vec<BsrRecord> {
    let og_by_query: HashMap<&str, &HitRecord> =
        og_hits.iter().map(|hit| (hit.qseqid.as_str(), hit)).collect();

    db_hits
        .iter()
        .filter_map(|db| {
            og_by_query.get(db.qseqid.as_str()).map(|og| BsrRecord {
                qseqid: db.qseqid.clone(),
                sseqid_db: db.sseqid.clone(),
                score_db: db.score,
                pident_db: db.pident,
                sseqid_og: og.sseqid.clone(),
                score_og: og.score,
                pident_og: og.pident,
                bsr: if og.score == 0. {
                    f64::INFINITY
                } else {
                    db.score / og.score
                },
            })
        })
        .collect()
}
