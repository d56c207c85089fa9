use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::config::{ActionSpec, BaseConfig, CommandSpec, EnvValue, FactorDef, FactorRegistry, Stage, WrapSpec};
use crate::error::ConfigError;
use crate::pipeline::StepPolicy;
use crate::platform::Os;

use super::{EnvName, ResolvedCommand, ResolvedEnvironment};

/// Resolve an environment name against the base settings and registry.
///
/// Every factor is looked up before any contribution is applied, so an
/// unknown factor never yields a partially resolved environment.
///
/// # Errors
///
/// Returns [`ConfigError::MalformedEnvName`] or [`ConfigError::UnknownFactor`].
pub fn resolve(
    name: &str,
    base: &BaseConfig,
    registry: &FactorRegistry,
) -> Result<ResolvedEnvironment, ConfigError> {
    let env_name = EnvName::parse(name)?;
    let defs = env_name
        .factors()
        .iter()
        .map(|factor| registry.lookup(factor, name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut acc = Accumulator::from_base(base);
    for def in defs {
        acc.apply(def);
    }
    Ok(acc.finish(env_name))
}

/// Resolve several names, failing on the first invalid one.
///
/// # Errors
///
/// Returns the first resolution error.
pub fn resolve_all(
    names: &[String],
    base: &BaseConfig,
    registry: &FactorRegistry,
) -> Result<Vec<ResolvedEnvironment>, ConfigError> {
    names
        .iter()
        .map(|name| resolve(name, base, registry))
        .collect()
}

/// Running state of the fold over factor contributions.
struct Accumulator {
    extras: BTreeSet<String>,
    deps: Vec<String>,
    setenv: BTreeMap<String, String>,
    passenv: Vec<String>,
    install: Vec<String>,
    skip_install: bool,
    serial: bool,
    coverage: bool,
    commands: Vec<ResolvedCommand>,
    action: Option<(ActionSpec, String, Option<Vec<Os>>)>,
    wraps: Vec<WrapSpec>,
}

impl Accumulator {
    fn from_base(base: &BaseConfig) -> Self {
        let mut acc = Self {
            extras: base.extras.clone(),
            deps: Vec::new(),
            setenv: BTreeMap::new(),
            passenv: base.passenv.clone(),
            install: base.install.clone(),
            skip_install: false,
            serial: false,
            coverage: false,
            commands: Vec::new(),
            action: base
                .action
                .clone()
                .map(|a| (a, "base".to_string(), None)),
            wraps: Vec::new(),
        };
        acc.add_deps(&base.deps);
        acc.add_setenv(&base.setenv);
        for spec in &base.introspect {
            acc.commands
                .push(command(spec, Some(Stage::Introspect), "base", None));
        }
        for spec in &base.commands {
            acc.commands.push(command(spec, None, "base", None));
        }
        acc
    }

    fn apply(&mut self, def: &FactorDef) {
        self.extras.extend(def.extras.iter().cloned());
        self.add_deps(&def.deps);
        self.add_setenv(&def.setenv);
        self.skip_install |= def.skip_install;
        self.serial |= def.serial;
        self.coverage |= def.coverage;
        for spec in &def.commands {
            self.commands
                .push(command(spec, None, &def.name, def.platforms.as_deref()));
        }
        if let Some(action) = &def.action {
            self.action = Some((action.clone(), def.name.clone(), def.platforms.clone()));
        }
        if let Some(wrap) = &def.wrap {
            self.wraps.push(wrap.clone());
        }
    }

    fn add_deps(&mut self, deps: &[String]) {
        for dep in deps {
            if !self.deps.contains(dep) {
                self.deps.push(dep.clone());
            }
        }
    }

    fn add_setenv(&mut self, setenv: &BTreeMap<String, EnvValue>) {
        for (key, value) in setenv {
            if value.is_append()
                && let Some(existing) = self.setenv.get_mut(key)
            {
                existing.push_str(value.value());
            } else {
                self.setenv.insert(key.clone(), value.value().to_string());
            }
        }
    }

    fn finish(mut self, env_name: EnvName) -> ResolvedEnvironment {
        // Stable: declaration order is kept within a stage.
        self.commands.sort_by_key(|c| c.stage);

        if let Some((action, origin, platforms)) = self.action {
            let (name, argv) = self
                .wraps
                .iter()
                .fold((action.name, action.argv), |(name, argv), wrap| {
                    let mut wrapped = wrap.prefix.clone();
                    wrapped.extend(argv.into_iter().skip(wrap.strip));
                    (format!("{}-wrapped-{name}", wrap.name), wrapped)
                });
            self.commands.push(ResolvedCommand {
                name,
                stage: Stage::Action,
                policy: StepPolicy::Fatal,
                argv,
                platforms,
                origin,
            });
        }

        ResolvedEnvironment {
            name: env_name.as_str().to_string(),
            factors: env_name.factors().to_vec(),
            extras: self.extras,
            deps: self.deps,
            setenv: self.setenv,
            passenv: self.passenv,
            install: self.install,
            skip_install: self.skip_install,
            serial: self.serial,
            coverage: self.coverage,
            commands: self.commands,
        }
    }
}

fn command(
    spec: &CommandSpec,
    stage: Option<Stage>,
    origin: &str,
    platforms: Option<&[Os]>,
) -> ResolvedCommand {
    let stage = stage.unwrap_or(spec.stage);
    let policy = if stage == Stage::Introspect || spec.informational {
        StepPolicy::Informational
    } else {
        StepPolicy::Fatal
    };
    let name = spec.name.clone().unwrap_or_else(|| {
        let program = spec
            .argv
            .first()
            .and_then(|p| Path::new(p).file_stem())
            .map_or_else(|| "command".to_string(), |s| s.to_string_lossy().into_owned());
        format!("{origin}-{program}")
    });
    ResolvedCommand {
        name,
        stage,
        policy,
        argv: spec.argv.clone(),
        platforms: platforms.map(<[Os]>::to_vec),
        origin: origin.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config(toml_src: &str) -> Config {
        Config::from_toml(Path::new("/repo"), toml_src).unwrap()
    }

    fn builtin() -> Config {
        Config::builtin(Path::new("/repo")).unwrap()
    }

    // -----------------------------------------------------------------------
    // Determinism
    // -----------------------------------------------------------------------

    #[test]
    fn resolving_twice_is_byte_identical() {
        let cfg = builtin();
        let a = resolve("alldeps-withcov-posix", &cfg.base, &cfg.registry).unwrap();
        let b = resolve("alldeps-withcov-posix", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    // -----------------------------------------------------------------------
    // Unknown factors
    // -----------------------------------------------------------------------

    #[test]
    fn unknown_factor_fails_whole_resolution() {
        let cfg = builtin();
        let err = resolve("alldeps-withcoverage-posix", &cfg.base, &cfg.registry).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownFactor { ref factor, ref env }
                if factor == "withcoverage" && env == "alldeps-withcoverage-posix"
        ));
    }

    #[test]
    fn malformed_name_is_config_error() {
        let cfg = builtin();
        assert!(matches!(
            resolve("alldeps--posix", &cfg.base, &cfg.registry),
            Err(ConfigError::MalformedEnvName { .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Merge precedence
    // -----------------------------------------------------------------------

    #[test]
    fn later_factor_wins_for_plain_keys() {
        let cfg = config("[factors.a.setenv]\nK = \"from-a\"\n[factors.b.setenv]\nK = \"from-b\"\n");
        let ab = resolve("a-b", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(ab.setenv["K"], "from-b");
        let ba = resolve("b-a", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(ba.setenv["K"], "from-a");
    }

    #[test]
    fn append_keys_concatenate_in_declaration_order() {
        let cfg = config(
            "[factors.a.setenv]\nK = { value = \"x\", append = true }\n\
             [factors.b.setenv]\nK = { value = \"y\", append = true }\n",
        );
        let ab = resolve("a-b", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(ab.setenv["K"], "xy");
        let ba = resolve("b-a", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(ba.setenv["K"], "yx");
    }

    #[test]
    fn append_extends_base_value() {
        let cfg = config(
            "[base.setenv]\nFLAGS = \"-W\"\n[factors.a.setenv]\nFLAGS = { value = \" -X\", append = true }\n",
        );
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(env.setenv["FLAGS"], "-W -X");
    }

    #[test]
    fn plain_assignment_after_append_replaces() {
        let cfg = config(
            "[factors.a.setenv]\nK = { value = \"x\", append = true }\n[factors.b.setenv]\nK = \"z\"\n",
        );
        let env = resolve("a-b", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(env.setenv["K"], "z");
    }

    #[test]
    fn extras_are_a_set_union() {
        let cfg = config("[factors.a]\nextras = [\"x\", \"y\"]\n[factors.b]\nextras = [\"y\", \"z\"]\n");
        let env = resolve("a-b", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(
            env.extras.iter().map(String::as_str).collect::<Vec<_>>(),
            ["x", "y", "z"]
        );
    }

    // -----------------------------------------------------------------------
    // skip_install
    // -----------------------------------------------------------------------

    #[test]
    fn skip_install_with_zero_factors_setting_it() {
        let cfg = config("[factors.a]\n[factors.b]\n");
        assert!(!resolve("a-b", &cfg.base, &cfg.registry).unwrap().skip_install);
    }

    #[test]
    fn skip_install_with_one_factor_setting_it() {
        let cfg = config("[factors.a]\nskip_install = true\n[factors.b]\n");
        assert!(resolve("a-b", &cfg.base, &cfg.registry).unwrap().skip_install);
        assert!(resolve("b-a", &cfg.base, &cfg.registry).unwrap().skip_install);
    }

    #[test]
    fn skip_install_with_many_factors_setting_it() {
        let cfg = config("[factors.a]\nskip_install = true\n[factors.b]\nskip_install = true\n");
        assert!(resolve("a-b", &cfg.base, &cfg.registry).unwrap().skip_install);
    }

    // -----------------------------------------------------------------------
    // Command ordering
    // -----------------------------------------------------------------------

    #[test]
    fn alldeps_withcov_posix_end_to_end() {
        let cfg = builtin();
        let env = resolve("alldeps-withcov-posix", &cfg.base, &cfg.registry).unwrap();
        assert!(env.extras.contains("all_non_platform"));
        assert!(env.extras.contains("coverage"));
        assert!(!env.skip_install);
        assert!(env.coverage);
        assert_eq!(
            env.command_names(),
            [
                "introspection",
                "posix-notice",
                "coverage-erase",
                "coverage-wrapped-test-run"
            ]
        );
        assert_eq!(env.commands[0].policy, StepPolicy::Informational);
        assert_eq!(env.commands[3].policy, StepPolicy::Fatal);
    }

    #[test]
    fn token_order_does_not_reorder_stages() {
        let cfg = builtin();
        let env = resolve("posix-withcov-alldeps", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(
            env.command_names(),
            [
                "introspection",
                "posix-notice",
                "coverage-erase",
                "coverage-wrapped-test-run"
            ]
        );
    }

    #[test]
    fn coverage_wrap_replaces_interpreter_prefix() {
        let cfg = builtin();
        let env = resolve("alldeps-withcov-posix", &cfg.base, &cfg.registry).unwrap();
        let action = env.commands.last().unwrap();
        assert_eq!(&action.argv[..3], ["coverage", "run", "-p"]);
        assert!(action.argv.contains(&"twisted.trial".to_string()));
        assert!(!action.argv.contains(&"python".to_string()));
    }

    #[test]
    fn later_action_factor_wins() {
        let cfg = config(
            "[base]\naction = { name = \"test\", argv = [\"t\"] }\n\
             [factors.a]\naction = { name = \"first\", argv = [\"a\"] }\n\
             [factors.b]\naction = { name = \"second\", argv = [\"b\"] }\n",
        );
        let env = resolve("a-b", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(env.command_names(), ["second"]);
        assert_eq!(env.commands[0].origin, "b");
    }

    #[test]
    fn platform_factor_gates_its_commands() {
        let cfg = builtin();
        let env = resolve("alldeps-nocov-posix", &cfg.base, &cfg.registry).unwrap();
        let notice = env.commands.iter().find(|c| c.name == "posix-notice").unwrap();
        assert_eq!(notice.platforms, Some(vec![Os::Linux, Os::Macos]));
        let intro = &env.commands[0];
        assert_eq!(intro.platforms, None);
    }

    #[test]
    fn serial_and_windows_force_serial() {
        let cfg = builtin();
        assert!(!resolve("alldeps-nocov-posix", &cfg.base, &cfg.registry).unwrap().serial);
        let serial = resolve("alldeps-nocov-serial", &cfg.base, &cfg.registry).unwrap();
        assert!(serial.serial);
        assert_eq!(serial.setenv["TRIAL_JOBS"], "1");
        assert!(resolve("alldeps-nocov-windows", &cfg.base, &cfg.registry).unwrap().serial);
    }

    #[test]
    fn unnamed_command_gets_origin_prefixed_name() {
        let cfg = config("[factors.a]\ncommands = [{ argv = [\"/usr/bin/make\", \"check\"] }]\n");
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(env.command_names(), ["a-make"]);
    }

    #[test]
    fn deps_are_deduplicated_in_first_seen_order() {
        let cfg = config("[base]\ndeps = [\"x\"]\n[factors.a]\ndeps = [\"y\", \"x\"]\n");
        let env = resolve("a", &cfg.base, &cfg.registry).unwrap();
        assert_eq!(env.deps, ["x", "y"]);
    }

    #[test]
    fn resolve_all_stops_at_first_error() {
        let cfg = builtin();
        let names = vec!["lint".to_string(), "bogus".to_string()];
        assert!(resolve_all(&names, &cfg.base, &cfg.registry).is_err());
    }
}
