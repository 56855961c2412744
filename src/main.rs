use std::process::ExitCode;

use clap::Parser;

use agricoll_sync::channel::SftpConnector;
use agricoll_sync::config::{self, Cli, Command, ConfigError, SyncConfig};
use agricoll_sync::crypto::NativeCrypto;
use agricoll_sync::importer::{ContactImporter, ContactUpsertResult};
use agricoll_sync::logging;
use agricoll_sync::pipeline::{
    Classify, FailureKind, Pipeline, PipelineError, PipelineSettings, RunReport, RunState,
};
use agricoll_sync::storage::ContactStore;

/// A failure at the command boundary: what to print and how to exit.
struct Failure {
    stage: Option<RunState>,
    kind: FailureKind,
    message: String,
}

impl Failure {
    fn new(kind: FailureKind, message: impl ToString) -> Self {
        Self {
            stage: None,
            kind,
            message: message.to_string(),
        }
    }
}

impl From<PipelineError> for Failure {
    fn from(e: PipelineError) -> Self {
        Self {
            stage: Some(e.stage),
            kind: e.kind,
            message: e.message,
        }
    }
}

impl From<ConfigError> for Failure {
    fn from(e: ConfigError) -> Self {
        Failure::new(FailureKind::Configuration, e)
    }
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        None => sync(&cli),
        Some(Command::Import { csv }) => import(&cli, csv),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            match failure.stage {
                Some(stage) => eprintln!("error: [{stage}] {}: {}", failure.kind, failure.message),
                None => eprintln!("error: {}: {}", failure.kind, failure.message),
            }
            ExitCode::from(failure.kind.exit_code() as u8)
        }
    }
}

fn sync(cli: &Cli) -> Result<(), Failure> {
    let config = SyncConfig::from_cli_and_env(cli)?;
    let mut store = open_store(&config.db_path)?;

    let connector = SftpConnector::new(config.sftp.clone());
    let pipeline = Pipeline::new(&connector, &NativeCrypto, PipelineSettings::from(&config));
    let report = pipeline.run(&mut store)?;

    if cli.json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(())
}

fn import(cli: &Cli, csv: &std::path::Path) -> Result<(), Failure> {
    let db_path = config::resolve_db_path(cli, &config::process_env)?;
    let mut store = open_store(&db_path)?;
    let result = ContactImporter::new(&mut store)
        .import(csv)
        .map_err(|e| Failure::new(FailureKind::Import, e))?;

    if cli.json {
        print_json(&result)?;
    } else {
        print_counts(&result);
    }
    Ok(())
}

fn open_store(path: &std::path::Path) -> Result<ContactStore, Failure> {
    ContactStore::open(path).map_err(|e| Failure::new(e.kind(), e))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Failure> {
    let text = serde_json::to_string_pretty(value).map_err(|e| Failure::new(FailureKind::Io, e))?;
    println!("{text}");
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("data file:  {}", report.data_file);
    println!("key file:   {}", report.key_file);
    if let Ok(age) = report.fetched_at.elapsed() {
        println!("fetched:    {:.0?} ago", age);
    }
    print_counts(&report.import);
    println!("elapsed:    {:.2?}", report.elapsed);
    for failure in &report.cleanup_failures {
        println!("warning: cleanup of {} failed: {}", failure.artifact, failure.message);
    }
}

fn print_counts(result: &ContactUpsertResult) {
    println!(
        "imported:   {} ({} new, {} updated)",
        result.imported, result.created, result.updated
    );
    println!("skipped:    {}", result.skipped);
}
