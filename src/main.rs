use clap::{Parser, Subcommand};
use ffindex::apply::{apply_to_archive, ApplyOptions, CommandTransform, FailurePolicy, Framing};
use ffindex::logging::{self, Verbosity};
use ffindex::signal::{self, CancelToken};
use ffindex::tools::{build, get, reindex, rename};
use ffindex::{ArchiveWriter, DataFile, Error, Index, RecordSource, Result};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ffindex", version, about = "Flat-file record archives (ffdata + ffindex)")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Errors only; silences the per-record log
    #[arg(short, long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    no_color: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an archive from a FASTA (or other marker-delimited) file
    Build {
        data_out:  PathBuf,
        index_out: PathBuf,
        /// Input file, `-` for stdin
        input:     PathBuf,
        /// First character of every record header
        #[arg(long, default_value = ">")]
        marker:    char,
    },
    /// Extract entries by name or position
    Get {
        data:  PathBuf,
        index: PathBuf,
        /// Entry names (positions with -n)
        entries: Vec<String>,
        /// Read requested entries from a file, one per line
        #[arg(long)]
        entries_file: Option<PathBuf>,
        /// Entries are 0-based positions instead of names
        #[arg(short = 'n')]
        by_position: bool,
        /// Write a new data file instead of printing to stdout (needs -i)
        #[arg(short = 'd', requires = "index_out")]
        data_out: Option<PathBuf>,
        /// Index for the new data file (needs -d)
        #[arg(short = 'i', requires = "data_out")]
        index_out: Option<PathBuf>,
    },
    /// Rebuild an index by scanning a data file for null delimiters
    Reindex {
        data:      PathBuf,
        index_out: PathBuf,
        /// Name entries by the first word of each record
        #[arg(short = 'p')]
        parse_names: bool,
        /// Append `^` to repeated names instead of failing
        #[arg(short = 'r')]
        rename_duplicates: bool,
    },
    /// Rename entries by the first word of each record
    Rename {
        data:  PathBuf,
        index: PathBuf,
        /// Output index (stdout when omitted)
        #[arg(short = 'i')]
        index_out: Option<PathBuf>,
    },
    /// Run a program on every record in parallel
    Apply {
        data:  PathBuf,
        index: PathBuf,
        #[arg(short = 'd', long = "data-out")]
        data_out: PathBuf,
        #[arg(short = 'i', long = "index-out")]
        index_out: PathBuf,
        /// Number of parallel jobs
        #[arg(short = 'j', long, default_value_t = 1)]
        jobs: usize,
        /// Records queued beyond one per job
        #[arg(long, default_value_t = ffindex::apply::DEFAULT_LOOKAHEAD)]
        lookahead: usize,
        /// What a failed record does to the run: abort or skip
        #[arg(long, default_value = "abort")]
        policy: FailurePolicy,
        /// Per-record time limit in seconds
        #[arg(long)]
        timeout: Option<f64>,
        /// Seconds running records get after an interrupt
        #[arg(long, default_value_t = 5.0)]
        grace: f64,
        /// Record framing: null (strip/append the trailing \0) or raw
        #[arg(long, default_value = "null")]
        framing: Framing,
        /// Process and write records sorted by name
        #[arg(long)]
        sort: bool,
        /// Write the failure report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true,
              value_name = "PROGRAM [ARGS]")]
        command: Vec<OsString>,
    },
}

/// How a successful command ended.
enum Outcome {
    Clean,
    /// Some records were skipped.
    Partial,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.verbose, cli.quiet), cli.no_color);

    match run(cli.command) {
        Ok(Outcome::Clean)   => ExitCode::SUCCESS,
        Ok(Outcome::Partial) => ExitCode::from(2),
        Err(e) => {
            eprintln!("ffindex: {e}");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<Outcome> {
    match command {

        // ── Build ────────────────────────────────────────────────────────────
        Commands::Build { data_out, index_out, input, marker } => {
            let marker = u8::try_from(marker)
                .map_err(|_| Error::Config(format!("marker '{marker}' is not a single-byte character")))?;
            let input = (input.as_os_str() != "-").then_some(input.as_path());
            let index = build::build_archive(input, &data_out, &index_out, &build::BuildOptions { marker })?;
            info!("built {} record(s) into {}", index.len(), data_out.display());
        }

        // ── Get ──────────────────────────────────────────────────────────────
        Commands::Get { data, index, entries, entries_file, by_position, data_out, index_out } => {
            let requested = match (entries_file, entries.is_empty()) {
                (Some(file), true) => std::fs::read_to_string(&file)
                    .map_err(|e| Error::io(&file, e))?
                    .lines()
                    .map(str::to_owned)
                    .collect(),
                (None, false) => entries,
                _ => return Err(Error::Config(
                    "give either entries on the command line or --entries-file".into())),
            };
            let selectors = get::parse_selectors(&requested, by_position)?;
            let (data_file, idx) = open_pair(&data, &index)?;
            let source = RecordSource::new(&data_file, &idx).map_err(|e| Error::format(&index, e))?;
            match (data_out, index_out) {
                (Some(d), Some(i)) => {
                    let writer = ArchiveWriter::create_protected(&d, &i, &[data.as_path(), index.as_path()])?;
                    let out = get::extract_archive(&source, &selectors, writer)?;
                    info!("extracted {} record(s) into {}", out.len(), d.display());
                }
                _ => get::extract_to(&source, &selectors, io::stdout().lock())?,
            }
        }

        // ── Reindex ──────────────────────────────────────────────────────────
        Commands::Reindex { data, index_out, parse_names, rename_duplicates } => {
            let opts = reindex::ReindexOptions { parse_names, rename_duplicates };
            reindex::reindex_file(&data, &index_out, &opts)?;
        }

        // ── Rename ───────────────────────────────────────────────────────────
        Commands::Rename { data, index, index_out } => {
            let (data_file, idx) = open_pair(&data, &index)?;
            let source = RecordSource::new(&data_file, &idx).map_err(|e| Error::format(&index, e))?;
            let renamed = rename::rename_from_content(&source).map_err(|e| Error::format(&data, e))?;
            match index_out {
                Some(path) => ffindex::writer::write_index_atomic(&path, &renamed, &[data.as_path(), index.as_path()])?,
                None => {
                    let mut out = io::stdout().lock();
                    renamed.write(&mut out)
                        .and_then(|()| out.flush())
                        .map_err(|e| Error::io("<stdout>", e))?;
                }
            }
        }

        // ── Apply ────────────────────────────────────────────────────────────
        Commands::Apply {
            data, index, data_out, index_out, jobs, lookahead, policy,
            timeout, grace, framing, sort, report, command,
        } => {
            let transform = CommandTransform::from_argv(command)
                .ok_or_else(|| Error::Config("no program given".into()))?;
            let (data_file, mut idx) = open_pair(&data, &index)?;
            if sort {
                idx.sort_by_name();
            }
            let source = RecordSource::new(&data_file, &idx).map_err(|e| Error::format(&index, e))?;

            let cancel = CancelToken::new();
            let _signals = signal::install_handlers(&cancel).map_err(|e| Error::io("<signal handlers>", e))?;
            let opts = ApplyOptions {
                workers: jobs,
                lookahead,
                policy,
                timeout: timeout.map(seconds).transpose()?,
                grace: seconds(grace)?,
                framing,
                cancel,
            };

            let writer = ArchiveWriter::create_protected(&data_out, &index_out, &[data.as_path(), index.as_path()])?;
            let (_, failures) = apply_to_archive(&source, &transform, &opts, writer)?;

            if let Some(path) = report {
                let json = failures.to_json()
                    .map_err(|e| Error::io(&path, io::Error::new(io::ErrorKind::InvalidData, e)))?;
                std::fs::write(&path, json).map_err(|e| Error::io(&path, e))?;
            }
            if !failures.is_clean() {
                for f in &failures.failures {
                    warn!(position = f.position, name = %f.name, exit_code = f.exit_code, "{}", f.message);
                }
                eprintln!("{}", failures.summary());
                return Ok(Outcome::Partial);
            }
            info!("{}", failures.summary());
        }
    }

    Ok(Outcome::Clean)
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_pair(data: &Path, index: &Path) -> Result<(DataFile, Index)> {
    let data_file = DataFile::open(data)?;
    let idx = Index::read(index)?;
    idx.validate(data_file.len()).map_err(|e| Error::format(index, e))?;
    Ok((data_file, idx))
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::Config(format!("'{secs}' is not a valid number of seconds")))
}
