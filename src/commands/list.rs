use anyhow::Result;

use crate::cli::GlobalOpts;
use crate::config::{Config, FactorDef};
use crate::environment::resolve;
use crate::logging::Log;

/// Run the list command.
///
/// # Errors
///
/// Returns an error if configuration fails to load.
pub fn run(global: &GlobalOpts, log: &dyn Log) -> Result<i32> {
    let setup = super::CommandSetup::init(global, log)?;
    log.stage("Factors");
    for line in factor_lines(&setup.config) {
        log.info(&line);
    }
    log.stage("Default environments");
    for line in envlist_lines(&setup.config) {
        log.info(&line);
    }
    Ok(0)
}

fn factor_summary(def: &FactorDef) -> String {
    let mut parts = Vec::new();
    if !def.extras.is_empty() {
        let extras: Vec<&str> = def.extras.iter().map(String::as_str).collect();
        parts.push(format!("extras [{}]", extras.join(", ")));
    }
    if !def.deps.is_empty() {
        parts.push(format!("{} dep(s)", def.deps.len()));
    }
    if let Some(platforms) = &def.platforms {
        let names: Vec<String> = platforms.iter().map(ToString::to_string).collect();
        parts.push(format!("only on {}", names.join("/")));
    }
    if def.skip_install {
        parts.push("skip install".to_string());
    }
    if def.serial {
        parts.push("serial".to_string());
    }
    if def.coverage {
        parts.push("coverage".to_string());
    }
    if let Some(action) = &def.action {
        parts.push(format!("action {}", action.name));
    }
    if let Some(wrap) = &def.wrap {
        parts.push(format!("wraps action ({})", wrap.name));
    }
    if parts.is_empty() {
        "(marker)".to_string()
    } else {
        parts.join("; ")
    }
}

/// One line per factor, in name order.
#[must_use]
pub fn factor_lines(config: &Config) -> Vec<String> {
    let width = config.registry.iter().map(|f| f.name.len()).max().unwrap_or(0);
    config
        .registry
        .iter()
        .map(|def| format!("{:<width$}  {}", def.name, factor_summary(def)))
        .collect()
}

/// One line per `envlist` entry, flagging names that do not resolve.
#[must_use]
pub fn envlist_lines(config: &Config) -> Vec<String> {
    config
        .envlist
        .iter()
        .map(|name| match resolve(name, &config.base, &config.registry) {
            Ok(env) => format!("{name}  ({} steps)", crate::pipeline::build(&env).steps.len()),
            Err(e) => format!("{name}  (invalid: {e})"),
        })
        .collect()
}
