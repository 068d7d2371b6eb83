//! Plan data model, canonical hashing, and test command policy.
//!
//! A [`Plan`] is pure data derived once from static inspection of a
//! repository. Field order is fixed and the env map is sorted, so the
//! serialized form (and therefore the plan hash) is reproducible.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Default wall-clock budget for a single plan command.
pub const DEFAULT_TIMEOUT_SECS: u64 = 900;

/// Build/test system family detected for a repository.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PlanKind {
    Node,
    CAutotools,
    Python,
    Unknown,
}

/// External binaries a plan relies on.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsDeps {
    pub bins_required: Vec<String>,
    pub bins_optional: Vec<String>,
}

/// Autotools-specific bootstrap knobs derived from configure sources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutotoolsPlan {
    pub needs_autoreconf: bool,
    pub needs_libtoolize: bool,
    pub configure_flags: Vec<String>,
}

/// Structured description of how to prepare and test a repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub kind: PlanKind,
    pub os_deps: OsDeps,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autotools: Option<AutotoolsPlan>,
    pub prepare: Vec<Vec<String>>,
    pub test: Vec<Vec<String>>,
    pub notes: Vec<String>,
}

/// Short content hash of the plan's canonical JSON form.
///
/// Any change to any field yields a different hash, which invalidates every
/// recorded ledger step derived from it.
pub fn plan_hash(plan: &Plan) -> Result<String> {
    let bytes = serde_json::to_vec(plan).context("serialize plan for hashing")?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest)[..16].to_string())
}

/// Check a declared test command against the kind-scoped allow-list.
///
/// Only recognized runner/verb combinations may be spawned; anything else is
/// rejected before any process is created. A path-qualified executable must
/// live inside `repo_root` (a venv python, a repo-local script); absolute
/// paths outside it are refused.
pub fn check_test_command(kind: PlanKind, argv: &[String], repo_root: &Path) -> Result<()> {
    if argv.is_empty() {
        return Err(anyhow!("bad-test-command: empty command"));
    }
    let program_path = Path::new(&argv[0]);
    if program_path.is_absolute() && !program_path.starts_with(repo_root) {
        return Err(anyhow!(
            "disallowed-test-command: {:?} runs an executable outside {}",
            argv,
            repo_root.display()
        ));
    }
    let program = binary_name(&argv[0]);
    let verb = argv.get(1).map(String::as_str).unwrap_or("");
    let allowed = match kind {
        PlanKind::Node => is_pm_script(program, verb, argv) || is_cm_js_script(program, argv),
        PlanKind::CAutotools => is_make_suite(program, verb) || program == "ctest",
        PlanKind::Python => {
            matches!(program, "python" | "python3")
                && verb == "-m"
                && matches!(argv.get(2).map(String::as_str), Some("unittest" | "pytest"))
        }
        // No detected build system: permit only the common suite runners.
        PlanKind::Unknown => is_make_suite(program, verb) || is_pm_script(program, verb, argv),
    };
    if allowed {
        return Ok(());
    }
    Err(anyhow!(
        "disallowed-test-command: {:?} is not a recognized {} test invocation",
        argv,
        kind_name(kind)
    ))
}

fn is_pm_script(program: &str, verb: &str, argv: &[String]) -> bool {
    matches!(program, "npm" | "pnpm" | "yarn")
        && matches!(verb, "test" | "run")
        && (verb != "run" || argv.len() >= 3)
}

fn is_make_suite(program: &str, verb: &str) -> bool {
    program == "make" && matches!(verb, "check" | "test")
}

/// CodeMirror-style repos drive everything through `node bin/cm.js <script>`.
fn is_cm_js_script(program: &str, argv: &[String]) -> bool {
    program == "node"
        && argv.get(1).map(String::as_str) == Some("bin/cm.js")
        && matches!(
            argv.get(2).map(String::as_str),
            Some("test" | "build" | "lint")
        )
}

fn kind_name(kind: PlanKind) -> &'static str {
    match kind {
        PlanKind::Node => "node",
        PlanKind::CAutotools => "c-autotools",
        PlanKind::Python => "python",
        PlanKind::Unknown => "unknown",
    }
}

/// Strip any path prefix so `env-stager/bin/python` matches as `python`.
fn binary_name(program: &str) -> &str {
    program.rsplit(['/', '\\']).next().unwrap_or(program)
}

// make: "No rule to make target 'check'"
static MISSING_MAKE_TARGET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)no rule to make target").unwrap());
// npm/pnpm/yarn: "Missing script: \"test-node\""
static MISSING_SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)missing script").unwrap());

/// True when the failing command's output indicates its target simply does
/// not exist, making it safe to fall back to the next candidate command.
///
/// The pattern is scoped to the runner that produces it; other runners never
/// fall back, whatever their output says.
pub fn is_benign_miss(argv: &[String], combined_output: &str) -> bool {
    let Some(program) = argv.first() else {
        return false;
    };
    match binary_name(program) {
        "make" => MISSING_MAKE_TARGET_RE.is_match(combined_output),
        "npm" | "pnpm" | "yarn" => MISSING_SCRIPT_RE.is_match(combined_output),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn empty_plan(kind: PlanKind) -> Plan {
        Plan {
            kind,
            os_deps: OsDeps::default(),
            env: BTreeMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            autotools: None,
            prepare: Vec::new(),
            test: Vec::new(),
            notes: Vec::new(),
        }
    }

    #[test]
    fn hash_is_stable_for_equal_plans() {
        let a = empty_plan(PlanKind::Node);
        let b = empty_plan(PlanKind::Node);
        assert_eq!(plan_hash(&a).expect("hash"), plan_hash(&b).expect("hash"));
    }

    #[test]
    fn any_field_change_changes_hash() {
        let base = empty_plan(PlanKind::Python);
        let base_hash = plan_hash(&base).expect("hash");

        let mut kind_changed = base.clone();
        kind_changed.kind = PlanKind::Node;
        assert_ne!(plan_hash(&kind_changed).expect("hash"), base_hash);

        let mut timeout_changed = base.clone();
        timeout_changed.timeout_secs += 1;
        assert_ne!(plan_hash(&timeout_changed).expect("hash"), base_hash);

        let mut env_changed = base.clone();
        env_changed.env.insert("CI".to_string(), "1".to_string());
        assert_ne!(plan_hash(&env_changed).expect("hash"), base_hash);

        let mut note_changed = base;
        note_changed.notes.push("note".to_string());
        assert_ne!(plan_hash(&note_changed).expect("hash"), base_hash);
    }

    const ROOT: &str = "/work/repo";

    fn check(kind: PlanKind, parts: &[&str]) -> Result<()> {
        check_test_command(kind, &argv(parts), Path::new(ROOT))
    }

    #[test]
    fn destructive_command_is_disallowed() {
        let err = check(PlanKind::Python, &["rm", "-rf", "/"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
    }

    #[test]
    fn recognized_runners_pass_per_kind() {
        check(PlanKind::Node, &["npm", "test"]).expect("npm test");
        check(PlanKind::Node, &["pnpm", "run", "test-node"]).expect("pnpm run");
        check(PlanKind::CAutotools, &["make", "check"]).expect("make check");
        check(PlanKind::CAutotools, &["ctest", "--output-on-failure"]).expect("ctest");
        check(
            PlanKind::Python,
            &["env-stager/bin/python", "-m", "unittest", "discover"],
        )
        .expect("unittest");
    }

    #[test]
    fn cm_js_scripts_pass_for_node_only() {
        check(PlanKind::Node, &["node", "bin/cm.js", "test"]).expect("cm.js test");
        check(PlanKind::Node, &["node", "bin/cm.js", "build"]).expect("cm.js build");
        check(PlanKind::Node, &["node", "bin/cm.js", "lint"]).expect("cm.js lint");
        let err = check(PlanKind::Node, &["node", "bin/cm.js", "release"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
        let err = check(PlanKind::Node, &["node", "evil.js", "test"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
        let err = check(PlanKind::Python, &["node", "bin/cm.js", "test"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
    }

    #[test]
    fn unknown_kind_permits_only_common_suite_runners() {
        check(PlanKind::Unknown, &["make", "check"]).expect("make check");
        check(PlanKind::Unknown, &["npm", "test"]).expect("npm test");
        check(PlanKind::Unknown, &["yarn", "run", "test"]).expect("yarn run");
        let err = check(PlanKind::Unknown, &["python3", "-m", "pytest"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
        let err = check(PlanKind::Unknown, &["ctest"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
    }

    #[test]
    fn absolute_executables_must_live_inside_the_repo() {
        let err = check(
            PlanKind::Python,
            &["/usr/bin/python", "-m", "unittest", "discover"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("outside"));
        check(
            PlanKind::Python,
            &["/work/repo/env-stager/bin/python", "-m", "pytest"],
        )
        .expect("venv python under the repo root");
    }

    #[test]
    fn run_without_script_name_is_rejected() {
        let err = check(PlanKind::Node, &["npm", "run"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
    }

    #[test]
    fn kind_scopes_the_allow_list() {
        let err = check(PlanKind::Python, &["make", "check"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
        let err = check(PlanKind::Node, &["ctest"]).unwrap_err();
        assert!(err.to_string().contains("disallowed-test-command"));
    }

    #[test]
    fn benign_miss_is_scoped_to_the_runner() {
        let make_miss = "make: *** No rule to make target 'check'.  Stop.";
        assert!(is_benign_miss(&argv(&["make", "check"]), make_miss));
        assert!(is_benign_miss(
            &argv(&["npm", "run", "test-node"]),
            "npm error Missing script: \"test-node\""
        ));
        // The pattern only counts when its own runner produced it.
        assert!(!is_benign_miss(&argv(&["npm", "test"]), make_miss));
        assert!(!is_benign_miss(
            &argv(&["env-stager/bin/python", "-m", "pytest"]),
            make_miss
        ));
        assert!(!is_benign_miss(
            &argv(&["make", "check"]),
            "tests failed: 3 of 17"
        ));
    }
}
