use crate::hits::{
    compute_bsr, deduplicate, read_raw_hits, write_bsr_table,
    write_hit_table, HIT_COLUMNS,
};
use anyhow::{anyhow, bail, Result};
use clap::{builder::PossibleValue, Parser, ValueEnum};
use itertools::Itertools;
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Instant,
};
use which::which;

pub mod hits;

/// Two-stage homology read search with blast score ratios
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Input reads (FASTA/FASTQ, possibly gzipped)
    #[arg(short, long, value_name = "QUERY")]
    pub query: PathBuf,

    /// FASTA file of gene-of-interest protein sequences
    #[arg(short = 'f', long, value_name = "GENE_DB")]
    pub gene_db: PathBuf,

    /// Preformatted DIAMOND database of outgroup proteins
    #[arg(short = 'd', long, value_name = "OUTGROUP_DB")]
    pub outgroup_db: PathBuf,

    /// Maximum number of target sequences per query
    #[arg(short = 'k', long, value_name = "MAX", default_value = "500")]
    pub max_target_seqs: u32,

    /// Number of aligner threads, 0 for all available
    #[arg(short, long, value_name = "THREADS", default_value = "1")]
    pub threads: usize,

    /// Output directory [default: QUERY__GENE_DB__read_search]
    #[arg(short, long, value_name = "OUTDIR")]
    pub outdir: Option<PathBuf>,

    /// Path to DIAMOND executable
    #[arg(long, value_name = "DIAMOND", default_value = "diamond")]
    pub diamond: String,

    /// Path to the read extraction script
    #[arg(
        long,
        value_name = "READ_LOOKUP",
        default_value = "blast_based_read_lookup_new.pl"
    )]
    pub read_lookup: String,

    /// TOML file of aligner scoring/performance overrides
    #[arg(short, long, value_name = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long)]
    pub log: Option<LogLevel>,
}

#[derive(Debug, Clone)]
pub enum LogLevel {
    Info,
    Debug,
}

impl ValueEnum for LogLevel {
    fn value_variants<'a>() -> &'a [Self] {
        &[LogLevel::Info, LogLevel::Debug]
    }

    fn to_possible_value<'a>(&self) -> Option<PossibleValue> {
        Some(match self {
            LogLevel::Info => PossibleValue::new("info"),
            LogLevel::Debug => PossibleValue::new("debug"),
        })
    }
}

/// Aligner parameters, overridable from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub scoring: Scoring,
    pub performance: Performance,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Scoring {
    pub matrix: String,
    pub gap_open: u32,
    pub gap_extend: u32,
    pub masking: u8,
    pub min_score: u32,
    pub comp_based_stats: u8,
}

impl Default for Scoring {
    fn default() -> Self {
        Scoring {
            matrix: "blosum45".to_string(),
            gap_open: 14,
            gap_extend: 2,
            masking: 0,
            min_score: 10,
            comp_based_stats: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Performance {
    pub block_size: f64,
    pub index_chunks: u32,
}

impl Default for Performance {
    fn default() -> Self {
        Performance {
            block_size: 12.,
            index_chunks: 1,
        }
    }
}

impl Config {
    // --------------------------------------------------
    pub fn load(filename: Option<&PathBuf>) -> Result<Self> {
        match filename {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    anyhow!("Cannot read {}: {e}", path.display())
                })?;
                toml::from_str(&text).map_err(|e| {
                    anyhow!("Invalid config {}: {e}", path.display())
                })
            }
            _ => Ok(Config::default()),
        }
    }

    // --------------------------------------------------
    pub fn to_blastx_args(&self) -> Vec<String> {
        vec![
            "--matrix".to_string(),
            self.scoring.matrix.clone(),
            "--gapopen".to_string(),
            self.scoring.gap_open.to_string(),
            "--gapextend".to_string(),
            self.scoring.gap_extend.to_string(),
            "--masking".to_string(),
            self.scoring.masking.to_string(),
            "--min-score".to_string(),
            self.scoring.min_score.to_string(),
            "--comp-based-stats".to_string(),
            self.scoring.comp_based_stats.to_string(),
            "-b".to_string(),
            self.performance.block_size.to_string(),
            "-c".to_string(),
            self.performance.index_chunks.to_string(),
        ]
    }
}

/// Every artifact the pipeline reads or writes under the run directory.
#[derive(Debug)]
pub struct RunPaths {
    pub outdir: PathBuf,
    pub diamond_db: PathBuf,
    pub raw_gene_hits: PathBuf,
    pub clean_gene_hits: PathBuf,
    pub extracted_reads: PathBuf,
    pub raw_outgroup_hits: PathBuf,
    pub clean_outgroup_hits: PathBuf,
    pub bsr: PathBuf,
}

impl RunPaths {
    // --------------------------------------------------
    /// Derive the run directory and artifact names from the inputs.
    /// The query base strips every extension ("reads.fastq.gz" becomes
    /// "reads") while the database stems keep all but the last.
    pub fn new(
        query: &PathBuf,
        gene_db: &PathBuf,
        outgroup_db: &PathBuf,
        outdir: Option<&PathBuf>,
    ) -> Result<Self> {
        let query_base = file_base(query)?;
        let gene_stem = file_stem(gene_db)?;
        let og_stem = file_stem(outgroup_db)?;

        if gene_stem == og_stem {
            bail!(
                "Gene and outgroup databases share the stem \
                 \"{gene_stem}\": their hit tables would overwrite \
                 each other"
            );
        }

        let outdir = match outdir {
            Some(dir) => dir.clone(),
            _ => PathBuf::from(format!(
                "{query_base}__{gene_stem}__read_search"
            )),
        };

        Ok(RunPaths {
            diamond_db: outdir.join(format!("{gene_stem}_dmnd")),
            raw_gene_hits: outdir
                .join(format!("{query_base}__{gene_stem}__result")),
            clean_gene_hits: outdir
                .join(format!("{query_base}__{gene_stem}__result_clean")),
            extracted_reads: outdir.join(format!(
                "{query_base}__{gene_stem}__result_clean.faa"
            )),
            raw_outgroup_hits: outdir
                .join(format!("{query_base}__{og_stem}__result")),
            clean_outgroup_hits: outdir
                .join(format!("{query_base}__{og_stem}__result_clean")),
            bsr: outdir.join(format!("{query_base}__{gene_stem}__result_bsr")),
            outdir,
        })
    }
}

// --------------------------------------------------
pub fn run(args: Args) -> Result<()> {
    let start = Instant::now();
    debug!("args = {args:#?}");

    check_inputs(&args)?;
    let diamond = resolve_tool(&args.diamond)?;
    let read_lookup = resolve_tool(&args.read_lookup)?;
    let config = Config::load(args.config.as_ref())?;
    debug!("config = {config:#?}");

    let threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };

    let paths = RunPaths::new(
        &args.query,
        &args.gene_db,
        &args.outgroup_db,
        args.outdir.as_ref(),
    )?;
    if !paths.outdir.is_dir() {
        fs::create_dir_all(&paths.outdir)?;
    }

    make_diamond_db(&diamond, &args.gene_db, &paths.diamond_db, threads)?;

    info!(
        "Searching {} against {}",
        args.query.display(),
        args.gene_db.display()
    );
    run_blastx(
        &diamond,
        &args.query,
        &paths.diamond_db,
        &paths.raw_gene_hits,
        threads,
        args.max_target_seqs,
        &config,
    )?;

    let gene_hits = deduplicate(&read_raw_hits(&paths.raw_gene_hits)?);
    write_hit_table(&gene_hits, &paths.clean_gene_hits)?;
    fs::remove_file(&paths.raw_gene_hits)?;
    debug!("{} reads hit the gene database", gene_hits.len());

    if gene_hits.is_empty() {
        warn!("No hits against {}", args.gene_db.display());
        write_bsr_table(&[], &paths.bsr)?;
        println!(
            r#"Scored 0 reads in {} seconds, see BSR table "{}""#,
            start.elapsed().as_secs(),
            paths.bsr.display()
        );
        return Ok(());
    }

    extract_reads(
        &read_lookup,
        &paths.clean_gene_hits,
        &args.query,
        &paths.extracted_reads,
    )?;

    info!(
        "Searching {} against {}",
        paths.extracted_reads.display(),
        args.outgroup_db.display()
    );
    run_blastx(
        &diamond,
        &paths.extracted_reads,
        &args.outgroup_db,
        &paths.raw_outgroup_hits,
        threads,
        args.max_target_seqs,
        &config,
    )?;

    let outgroup_hits =
        deduplicate(&read_raw_hits(&paths.raw_outgroup_hits)?);
    write_hit_table(&outgroup_hits, &paths.clean_outgroup_hits)?;
    fs::remove_file(&paths.raw_outgroup_hits)?;
    debug!("{} reads hit the outgroup database", outgroup_hits.len());

    let bsr = compute_bsr(&gene_hits, &outgroup_hits);
    write_bsr_table(&bsr, &paths.bsr)?;

    println!(
        r#"Scored {} reads in {} seconds, see BSR table "{}""#,
        bsr.len(),
        start.elapsed().as_secs(),
        paths.bsr.display()
    );

    Ok(())
}

// --------------------------------------------------
fn check_inputs(args: &Args) -> Result<()> {
    let mut files = vec![&args.query, &args.gene_db, &args.outgroup_db];
    if let Some(config) = &args.config {
        files.push(config);
    }

    let missing: Vec<_> = files
        .into_iter()
        .filter(|path| !path.is_file())
        .map(|path| path.to_string_lossy().to_string())
        .collect();

    if missing.len() > 0 {
        bail!("Cannot find input files: {}", missing.iter().join(", "));
    }

    Ok(())
}

// --------------------------------------------------
fn extract_reads(
    read_lookup: &Path,
    hit_table: &PathBuf,
    query: &PathBuf,
    outpath: &PathBuf,
) -> Result<()> {
    let lookup_args = vec![
        hit_table.to_string_lossy().to_string(),
        query.to_string_lossy().to_string(),
        outpath.to_string_lossy().to_string(),
    ];
    run_tool(read_lookup, &lookup_args)?;

    if !outpath.exists() {
        bail!(
            "Failed to find expected extracted reads {}",
            outpath.display()
        );
    }

    Ok(())
}

// --------------------------------------------------
fn file_base(path: &PathBuf) -> Result<String> {
    match path.file_name() {
        Some(name) => {
            let name = name.to_string_lossy();
            Ok(name.split('.').next().unwrap_or(&name).to_string())
        }
        _ => bail!("Cannot get filename from {}", path.display()),
    }
}

// --------------------------------------------------
fn file_stem(path: &PathBuf) -> Result<String> {
    match path.file_stem() {
        Some(stem) => Ok(stem.to_string_lossy().to_string()),
        _ => bail!("Cannot get filename from {}", path.display()),
    }
}

// --------------------------------------------------
fn make_diamond_db(
    diamond: &Path,
    gene_db: &PathBuf,
    outpath: &PathBuf,
    threads: usize,
) -> Result<()> {
    let db_args = vec![
        "makedb".to_string(),
        "--in".to_string(),
        gene_db.to_string_lossy().to_string(),
        "-d".to_string(),
        outpath.to_string_lossy().to_string(),
        "-p".to_string(),
        threads.to_string(),
    ];

    run_tool(diamond, &db_args)
}

// --------------------------------------------------
fn resolve_tool(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| anyhow!(r#"Cannot find executable "{name}""#))
}

// --------------------------------------------------
fn run_blastx(
    diamond: &Path,
    query: &PathBuf,
    db: &PathBuf,
    outpath: &PathBuf,
    threads: usize,
    max_target_seqs: u32,
    config: &Config,
) -> Result<()> {
    let mut blastx_args = vec![
        "blastx".to_string(),
        "-q".to_string(),
        query.to_string_lossy().to_string(),
        "-d".to_string(),
        db.to_string_lossy().to_string(),
        "-o".to_string(),
        outpath.to_string_lossy().to_string(),
        "-p".to_string(),
        threads.to_string(),
        "-k".to_string(),
        max_target_seqs.to_string(),
        "--outfmt".to_string(),
        "6".to_string(),
    ];
    blastx_args.extend(HIT_COLUMNS.iter().map(|col| col.to_string()));
    blastx_args.extend(config.to_blastx_args());

    run_tool(diamond, &blastx_args)
}

// --------------------------------------------------
fn run_tool(tool: &Path, tool_args: &[String]) -> Result<()> {
    info!(r#"Running "{} {}""#, tool.display(), tool_args.join(" "));

    let res = Command::new(tool).args(tool_args).output()?;
    if !res.status.success() {
        bail!(
            "{} failed ({}): {}",
            tool.display(),
            res.status,
            String::from_utf8_lossy(&res.stderr).trim()
        );
    }

    debug!("{}", String::from_utf8_lossy(&res.stdout));
    Ok(())
}
