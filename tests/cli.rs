use anyhow::Result;
use assert_cmd::Command;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use read_trawler::hits::{
    read_bsr_table, read_hit_table, BSR_COLUMNS, HIT_COLUMNS,
};
use std::{fs, path::PathBuf, process::Output};
use tempfile::{tempdir, TempDir};

const PRG: &str = "read_trawler";

// --------------------------------------------------
#[test]
fn usage() -> Result<()> {
    for flag in &["-h", "--help"] {
        Command::cargo_bin(PRG)?
            .arg(flag)
            .assert()
            .stdout(predicate::str::contains("Usage"));
    }
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_on_missing_inputs() -> Result<()> {
    Command::cargo_bin(PRG)?
        .args([
            "-q",
            "nope.fastq",
            "-f",
            "tests/inputs/genes.fasta",
            "-d",
            "nope.dmnd",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Cannot find input files: nope.fastq, nope.dmnd",
        ));
    Ok(())
}

// --------------------------------------------------
#[test]
fn dies_on_missing_aligner() -> Result<()> {
    Command::cargo_bin(PRG)?
        .args([
            "-q",
            "tests/inputs/reads.fastq",
            "-f",
            "tests/inputs/genes.fasta",
            "-d",
            "tests/inputs/outgroup.dmnd",
            "--diamond",
            "no-such-diamond",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            r#"Cannot find executable "no-such-diamond""#,
        ));
    Ok(())
}

// --------------------------------------------------
#[test]
fn runs_two_stage_search() -> Result<()> {
    let (_tmp, outdir, output) = run_pipeline(
        "tests/inputs/genes.fasta",
        "reads__genes__read_search",
        None,
    )?;

    assert!(
        String::from_utf8_lossy(&output.stdout).contains("Scored 2 reads")
    );

    // Raw hit tables are removed after deduplication
    assert!(!outdir.join("reads__genes__result").exists());
    assert!(!outdir.join("reads__outgroup__result").exists());

    // The gene table keeps the best hit per read, highest score first
    let gene_hits =
        read_hit_table(&outdir.join("reads__genes__result_clean"))?;
    assert_eq!(
        gene_hits
            .iter()
            .map(|hit| (hit.qseqid.as_str(), hit.score))
            .collect::<Vec<_>>(),
        [("r3", 407.), ("r1", 310.), ("r2", 140.)]
    );
    assert_eq!(gene_hits[1].sseqid, "geneA");

    // The aligner was asked for the full table layout and scoring flags
    let cmd = fs::read_to_string(outdir.join("reads__genes__result.cmd"))?;
    assert!(cmd.contains("-k 500"));
    assert!(cmd.contains("--outfmt 6 qseqid sseqid pident"));
    assert!(cmd.contains("--matrix blosum45"));
    assert!(cmd.contains("-b 12 -c 1"));

    // Reads with gene hits were extracted and searched again
    assert!(outdir.join("reads__genes__result_clean.faa").exists());
    let og_hits =
        read_hit_table(&outdir.join("reads__outgroup__result_clean"))?;
    assert_eq!(og_hits.len(), 3);

    // The BSR table keeps only reads scored by both searches,
    // in gene-table order
    let bsr = read_bsr_table(&outdir.join("reads__genes__result_bsr"))?;
    assert_eq!(bsr.len(), 2);
    assert_eq!(bsr[0].qseqid, "r3");
    assert_eq!(bsr[0].sseqid_db, "geneC");
    assert_eq!(bsr[0].sseqid_og, "og2");
    assert_eq!(bsr[0].bsr, 407. / 120.);
    assert_eq!(bsr[1].qseqid, "r1");
    assert_eq!(bsr[1].score_db, 310.);
    assert_eq!(bsr[1].score_og, 155.);
    assert_eq!(bsr[1].bsr, 2.);

    Ok(())
}

// --------------------------------------------------
#[test]
fn writes_header_only_bsr_without_gene_hits() -> Result<()> {
    let (_tmp, outdir, output) = run_pipeline(
        "tests/inputs/empty.fasta",
        "reads__empty__read_search",
        None,
    )?;

    assert!(
        String::from_utf8_lossy(&output.stdout).contains("Scored 0 reads")
    );

    // The search stops after the first stage
    assert!(!outdir.join("reads__empty__result_clean.faa").exists());
    assert!(!outdir.join("reads__outgroup__result_clean").exists());

    let clean =
        fs::read_to_string(outdir.join("reads__empty__result_clean"))?;
    assert_eq!(clean, HIT_COLUMNS.join("\t") + "\n");

    let bsr_path = outdir.join("reads__empty__result_bsr");
    let text = fs::read_to_string(&bsr_path)?;
    assert_eq!(text, BSR_COLUMNS.join("\t") + "\n");
    assert!(read_bsr_table(&bsr_path)?.is_empty());

    Ok(())
}

// --------------------------------------------------
#[test]
fn applies_config_overrides() -> Result<()> {
    let (_tmp, outdir, _output) = run_pipeline(
        "tests/inputs/genes.fasta",
        "reads__genes__read_search",
        Some("tests/inputs/scoring.toml"),
    )?;

    let cmd = fs::read_to_string(outdir.join("reads__genes__result.cmd"))?;
    assert!(cmd.contains("--gapopen 11"));
    assert!(cmd.contains("--matrix blosum45"));

    Ok(())
}

// --------------------------------------------------
#[test]
fn surfaces_aligner_failure() -> Result<()> {
    let tmp = tempdir()?;
    let query = abs("tests/inputs/reads.fastq")?;
    let gene_db = abs("tests/inputs/genes.fasta")?;
    let outgroup_db = abs("tests/inputs/outgroup.dmnd")?;
    let diamond = abs("tests/inputs/bin/false_diamond")?;
    let read_lookup = abs("tests/inputs/bin/read_lookup")?;

    Command::cargo_bin(PRG)?
        .current_dir(&tmp)
        .args([
            "-q",
            query.as_str(),
            "-f",
            gene_db.as_str(),
            "-d",
            outgroup_db.as_str(),
            "--diamond",
            diamond.as_str(),
            "--read-lookup",
            read_lookup.as_str(),
        ])
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("failed")
                .and(predicate::str::contains("database file not found")),
        );

    Ok(())
}

// --------------------------------------------------
fn run_pipeline(
    gene_db: &str,
    outdir_name: &str,
    config: Option<&str>,
) -> Result<(TempDir, PathBuf, Output)> {
    let tmp = tempdir()?;
    let query = abs("tests/inputs/reads.fastq")?;
    let gene_db = abs(gene_db)?;
    let outgroup_db = abs("tests/inputs/outgroup.dmnd")?;
    let diamond = abs("tests/inputs/bin/diamond")?;
    let read_lookup = abs("tests/inputs/bin/read_lookup")?;

    let mut cmd = Command::cargo_bin(PRG)?;
    cmd.current_dir(&tmp).args([
        "-q",
        query.as_str(),
        "-f",
        gene_db.as_str(),
        "-d",
        outgroup_db.as_str(),
        "--diamond",
        diamond.as_str(),
        "--read-lookup",
        read_lookup.as_str(),
    ]);
    if let Some(config) = config {
        let config = abs(config)?;
        cmd.args(["-c", config.as_str()]);
    }

    let output = cmd.output()?;
    dbg!(&output);
    assert!(output.status.success());

    let outdir = tmp.path().join(outdir_name);
    assert!(outdir.is_dir());

    Ok((tmp, outdir, output))
}

// --------------------------------------------------
fn abs(path: &str) -> Result<String> {
    Ok(PathBuf::from(path)
        .canonicalize()?
        .to_string_lossy()
        .to_string())
}
