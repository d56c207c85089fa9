use anyhow::Result;

use crate::cli::{GlobalOpts, ShowOpts};
use crate::environment::{ResolvedEnvironment, resolve};
use crate::logging::Log;
use crate::pipeline::{self, Pipeline, StepPolicy};
use crate::platform::Platform;

/// Run the show command.
///
/// # Errors
///
/// Returns an error if configuration fails to load or the environment does
/// not resolve.
pub fn run(global: &GlobalOpts, opts: &ShowOpts, log: &dyn Log) -> Result<i32> {
    if opts.json {
        // Keep stdout machine-readable: no setup logging.
        let setup = super::CommandSetup::load(global)?;
        let env = resolve(&opts.env, &setup.config.base, &setup.config.registry)?;
        let pipeline = pipeline::build(&env);
        let doc = serde_json::json!({ "environment": env, "pipeline": pipeline });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(0);
    }

    let setup = super::CommandSetup::init(global, log)?;
    let env = resolve(&opts.env, &setup.config.base, &setup.config.registry)?;
    let pipeline = pipeline::build(&env);
    log.stage(&env.name);
    for line in describe(&env, &pipeline, &setup.platform) {
        log.info(&line);
    }
    Ok(0)
}

fn joined<'a>(items: impl IntoIterator<Item = &'a String>) -> String {
    let list: Vec<&str> = items.into_iter().map(String::as_str).collect();
    if list.is_empty() {
        "(none)".to_string()
    } else {
        list.join(", ")
    }
}

/// Human-readable description of a resolved environment and its pipeline.
#[must_use]
pub fn describe(env: &ResolvedEnvironment, pipeline: &Pipeline, platform: &Platform) -> Vec<String> {
    let mut flags = Vec::new();
    if env.skip_install {
        flags.push("skip-install");
    }
    if env.serial {
        flags.push("serial");
    }
    if env.coverage {
        flags.push("coverage");
    }

    let mut lines = vec![
        format!("factors:  {}", joined(&env.factors)),
        format!("extras:   {}", joined(&env.extras)),
        format!("deps:     {}", joined(&env.deps)),
        format!("passenv:  {}", joined(&env.passenv)),
        format!(
            "flags:    {}",
            if flags.is_empty() {
                "(none)".to_string()
            } else {
                flags.join(", ")
            }
        ),
    ];
    if !env.setenv.is_empty() {
        lines.push("setenv:".to_string());
        lines.extend(env.setenv.iter().map(|(k, v)| format!("  {k}={v}")));
    }
    lines.push("steps:".to_string());
    for (i, step) in pipeline.steps.iter().enumerate() {
        let policy = match step.policy {
            StepPolicy::Fatal => "",
            StepPolicy::Informational => " (informational)",
        };
        let gate = if step.applies_to(platform) {
            ""
        } else {
            " [skipped on this platform]"
        };
        lines.push(format!(
            "  {}. {}{policy}{gate}: {}",
            i + 1,
            step.name,
            step.argv.join(" ")
        ));
    }
    lines
}
