use std::collections::BTreeMap;

use anyhow::Result;

use crate::cli::{CoverageOpts, GlobalOpts};
use crate::config::Config;
use crate::coverage::{
    ArtifactStore, Convert, CoverageData, HttpTransport, Summary, ToolConverter, Transport,
    to_lcov, upload_all, write_reports,
};
use crate::exec::SystemExecutor;
use crate::logging::Log;

/// Merge pending artifacts into the combined data file, converting the
/// measuring tool's databases with `converter`.
///
/// Corrupt artifacts are set aside with a warning; databases that cannot be
/// converted are left for a later combine.
///
/// # Errors
///
/// Returns an error if the artifact directory cannot be read or written.
pub fn combine(config: &Config, converter: &dyn Convert, log: &dyn Log) -> Result<CoverageData> {
    log.stage("Combining coverage");
    let store = ArtifactStore::new(config.coverage_dir());
    let result = store.combine_with(Some(converter))?;
    for path in &result.corrupt {
        log.warn(&format!("corrupt coverage data set aside: {}", path.display()));
    }
    for path in &result.pending {
        log.warn(&format!("coverage database left for later: {}", path.display()));
    }
    log.info(&format!(
        "combined {} artifact(s) into {}",
        result.consumed.len(),
        store.combined_path().display()
    ));
    Ok(result.data)
}

/// Run the coverage command.
///
/// # Errors
///
/// Returns an error if combination or report writing fails, or if a
/// required upload destination fails.
pub fn run(global: &GlobalOpts, opts: &CoverageOpts, log: &dyn Log) -> Result<i32> {
    let setup = super::CommandSetup::init(global, log)?;
    let transport = HttpTransport::default();
    let converter = ToolConverter::new(&setup.config, &SystemExecutor);
    let vars: BTreeMap<String, String> = std::env::vars().collect();
    report(&setup.config, opts, global.dry_run, &transport, &converter, &vars, log)?;
    Ok(0)
}

/// Combine, summarise, export and upload.
///
/// # Errors
///
/// See [`run`].
pub fn report(
    config: &Config,
    opts: &CoverageOpts,
    dry_run: bool,
    transport: &dyn Transport,
    converter: &dyn Convert,
    vars: &BTreeMap<String, String>,
    log: &dyn Log,
) -> Result<()> {
    let data = if dry_run {
        log.dry_run("would combine pending coverage artifacts");
        ArtifactStore::new(config.coverage_dir()).load_combined()?
    } else {
        combine(config, converter, log)?
    };

    if data.is_empty() {
        log.warn("no coverage data recorded");
        return Ok(());
    }

    log.stage("Coverage summary");
    let summary = Summary::new(&data, opts.skip_covered || config.coverage.skip_covered);
    for line in summary.lines() {
        log.info(&line);
    }

    if dry_run {
        log.dry_run("would write coverage reports");
    } else {
        let output = opts.output.clone().unwrap_or_else(|| config.coverage_dir());
        for path in write_reports(&output, &data)? {
            log.info(&format!("wrote {}", path.display()));
        }
    }

    if opts.no_upload || config.coverage.upload.is_empty() {
        return Ok(());
    }
    if dry_run {
        for target in &config.coverage.upload {
            log.dry_run(&format!("would upload to {} ({})", target.name, target.url));
        }
        return Ok(());
    }
    let uploaded = upload_all(&config.coverage.upload, &to_lcov(&data), transport, vars, log)?;
    log.debug(&format!(
        "{} delivered, {} skipped",
        uploaded.delivered.len(),
        uploaded.skipped.len()
    ));
    Ok(())
}
