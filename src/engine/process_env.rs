use std::collections::BTreeMap;

use crate::environment::ResolvedEnvironment;
use crate::template::{self, Vars};

/// Variables every hermetic run still receives so that programs can be
/// located and temporary files created.
const ALWAYS_PASSED: &[&str] = &[
    "PATH", "HOME", "LANG", "LC_ALL", "LC_CTYPE", "TMPDIR", "TEMP", "TMP", "USER",
    "USERPROFILE", "SYSTEMROOT", "COMSPEC", "PATHEXT",
];

/// Whether `name` matches a `passenv` pattern: `*`, a `PREFIX*` glob, or
/// an exact name.
pub(super) fn matches_pattern(name: &str, pattern: &str) -> bool {
    pattern
        .strip_suffix('*')
        .map_or_else(|| name == pattern, |prefix| name.starts_with(prefix))
}

/// Build the complete environment for one run.
///
/// Layers, later wins: forwarded caller variables, `extra` (matrix job
/// variables), the resolved `setenv` (expanded against the layers below
/// it), the `serial` overrides when the environment runs serially, then
/// `injected`.
pub(super) fn build(
    env: &ResolvedEnvironment,
    hermetic: bool,
    system: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
    named: &Vars<'_>,
    serial: Option<&BTreeMap<String, String>>,
    injected: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut vars: BTreeMap<String, String> = system
        .iter()
        .filter(|(key, _)| {
            !hermetic
                || ALWAYS_PASSED.contains(&key.as_str())
                || env.passenv.iter().any(|p| p != "*" && matches_pattern(key, p))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    vars.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));

    let below = vars.clone();
    let lookup = Vars {
        named: named.named.clone(),
        env: Some(&below),
        posargs: named.posargs,
    };
    for (key, value) in &env.setenv {
        vars.insert(key.clone(), template::expand(value, &lookup));
    }
    if let Some(serial) = serial {
        vars.extend(serial.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    vars.extend(injected);
    vars
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::environment::resolve;
    use std::path::Path;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn env_with(toml_src: &str, name: &str) -> ResolvedEnvironment {
        let cfg = Config::from_toml(Path::new("/repo"), toml_src).unwrap();
        resolve(name, &cfg.base, &cfg.registry).unwrap()
    }

    #[test]
    fn pattern_matching() {
        assert!(matches_pattern("ANYTHING", "*"));
        assert!(matches_pattern("LC_NUMERIC", "LC_*"));
        assert!(matches_pattern("CI", "CI"));
        assert!(!matches_pattern("CIRCLE", "CI"));
    }

    #[test]
    fn default_passes_everything() {
        let env = env_with("[factors.a]\n", "a");
        let system = map(&[("SECRET", "1"), ("PATH", "/bin")]);
        let out = build(&env, false, &system, &BTreeMap::new(), &Vars::new(), None, BTreeMap::new());
        assert_eq!(out["SECRET"], "1");
    }

    #[test]
    fn hermetic_mode_keeps_only_allow_list() {
        let env = env_with("[base]\npassenv = []\n[factors.a]\n", "a");
        let system = map(&[("SECRET", "1"), ("PATH", "/bin"), ("CI", "true")]);
        let out = build(&env, true, &system, &BTreeMap::new(), &Vars::new(), None, BTreeMap::new());
        assert!(!out.contains_key("SECRET"));
        assert!(!out.contains_key("CI"));
        assert_eq!(out["PATH"], "/bin");
    }

    #[test]
    fn explicit_passenv_list_is_honoured() {
        let env = env_with("[base]\npassenv = [\"CI\", \"GITHUB_*\"]\n[factors.a]\n", "a");
        let system = map(&[("SECRET", "1"), ("CI", "true"), ("GITHUB_SHA", "abc")]);
        let out = build(&env, true, &system, &BTreeMap::new(), &Vars::new(), None, BTreeMap::new());
        assert_eq!(out.len(), 2);
        assert_eq!(out["GITHUB_SHA"], "abc");
    }

    #[test]
    fn layers_apply_in_order() {
        let env = env_with(
            "[base.setenv]\nA = \"setenv\"\nB = \"{env:B:none}-x\"\n[factors.a]\n",
            "a",
        );
        let system = map(&[("A", "system"), ("B", "system"), ("C", "system")]);
        let extra = map(&[("B", "job"), ("C", "job")]);
        let injected = map(&[("A", "injected")]);
        let out = build(&env, false, &system, &extra, &Vars::new(), None, injected);
        assert_eq!(out["A"], "injected");
        assert_eq!(out["B"], "job-x");
        assert_eq!(out["C"], "job");
    }

    #[test]
    fn serial_overrides_beat_setenv_but_not_injected() {
        let env = env_with("[base.setenv]\nTRIAL_JOBS = \"8\"\n[factors.a]\n", "a");
        let serial = map(&[("TRIAL_JOBS", "1"), ("ENVMATRIX_RUN_ID", "serial")]);
        let injected = map(&[("ENVMATRIX_RUN_ID", "abc")]);
        let out = build(
            &env,
            false,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &Vars::new(),
            Some(&serial),
            injected,
        );
        assert_eq!(out["TRIAL_JOBS"], "1");
        assert_eq!(out["ENVMATRIX_RUN_ID"], "abc");
    }

    #[test]
    fn setenv_expands_named_variables() {
        let env = env_with("[base.setenv]\nDIR = \"{root}/x\"\n[factors.a]\n", "a");
        let named = Vars::new().with("root", "/repo");
        let out = build(&env, false, &BTreeMap::new(), &BTreeMap::new(), &named, None, BTreeMap::new());
        assert_eq!(out["DIR"], "/repo/x");
    }
}
