//! Plan detection and idempotent repository preparation.
//!
//! `detect_plan` derives a [`Plan`] from static inspection of a repository
//! root; `prepare_repo` persists it as `.stager/plan.json` and executes its
//! preparation commands through the progress ledger so each step runs at
//! most once per `(plan, name, payload)` identity. `run_tests` executes the
//! declared test commands with allow-list checks and benign-miss fallback.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::plan::{
    AutotoolsPlan, DEFAULT_TIMEOUT_SECS, OsDeps, Plan, PlanKind, check_test_command,
    is_benign_miss, plan_hash,
};
use crate::io::ledger::{Ledger, PLAN_DIR, PLAN_FILE, run_recorded_cmd, run_recorded_step};
use crate::io::process::{CommandOutput, ensure_success, run_argv};

const VENV_DIR: &str = "env-stager";

/// Inspect `root` and derive a plan, in priority order: package-manifest
/// (node), autotools, project-file (python), else unknown.
pub fn detect_plan(root: &Path) -> Result<Plan> {
    if root.join("package.json").exists() {
        return plan_node(root);
    }
    if root.join("configure.ac").exists()
        || root.join("configure.in").exists()
        || root.join("autogen.sh").exists()
        || root.join("configure").exists()
    {
        return Ok(plan_c_autotools(root));
    }
    if root.join("pyproject.toml").exists() || root.join("setup.py").exists() {
        return Ok(plan_python(root));
    }
    Ok(Plan {
        kind: PlanKind::Unknown,
        os_deps: OsDeps::default(),
        env: ci_env(),
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        autotools: None,
        prepare: Vec::new(),
        test: Vec::new(),
        notes: vec!["No supported build/test system detected.".to_string()],
    })
}

/// Detect, persist, and execute the plan for `root`.
///
/// Progress lives in `.stager/progress.ndjson`; a step whose latest record
/// is `ok` is skipped without spawning anything, and a record interrupted at
/// `begin` is re-attempted on the next call. Deleting the ledger forces a
/// full re-run.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn prepare_repo(root: &Path) -> Result<Plan> {
    info!("preparing repository");
    let plan = detect_plan(root)?;
    let plan_path = write_plan(root, &plan)?;
    info!(plan = %plan_path.display(), "wrote plan");
    execute_plan(root, &plan)?;
    info!("repository preparation complete");
    Ok(plan)
}

/// Execute a plan's preparation commands through the ledger.
pub fn execute_plan(root: &Path, plan: &Plan) -> Result<()> {
    let plan_h = plan_hash(plan)?;
    let mut ledger = Ledger::load(root)?;
    let timeout = Duration::from_secs(plan.timeout_secs);

    // OS-level deps check, recorded so it never re-runs once satisfied.
    run_recorded_step(
        &mut ledger,
        &plan_h,
        "os_deps.check",
        json!({
            "bins_required": &plan.os_deps.bins_required,
            "bins_optional": &plan.os_deps.bins_optional,
        }),
        false,
        || check_os_deps(&plan.os_deps),
    )?;

    if plan.kind == PlanKind::CAutotools {
        let auto = plan
            .autotools
            .clone()
            .ok_or_else(|| anyhow!("invalid-plan: c-autotools plan without autotools section"))?;
        autotools_bootstrap(root, &mut ledger, &plan_h, &auto, &plan.env, timeout)?;
        return Ok(());
    }

    for (i, argv) in plan.prepare.iter().enumerate() {
        // pip self-upgrade failures stay non-fatal, but get marked ok so
        // they are not retried on every run.
        let nonfatal = plan.kind == PlanKind::Python
            && argv.len() >= 3
            && argv[argv.len() - 3..] == ["install", "--upgrade", "pip"];
        run_recorded_cmd(
            &mut ledger,
            &plan_h,
            &format!("prepare.{i}"),
            argv,
            root,
            &plan.env,
            timeout,
            nonfatal,
        )?;
    }
    Ok(())
}

/// Run the plan's declared test commands.
///
/// Every candidate is validated against the kind-scoped allow-list before
/// any process is spawned. A failing candidate falls through to the next
/// only when its output is a benign "runner/target missing" miss; any other
/// failure is returned verbatim.
#[instrument(skip_all, fields(kind = ?plan.kind))]
pub fn run_tests(root: &Path, plan: &Plan) -> Result<CommandOutput> {
    if plan.test.is_empty() {
        return Err(anyhow!(
            "no-test-commands: plan for {} declares no test commands",
            root.display()
        ));
    }
    for argv in &plan.test {
        check_test_command(plan.kind, argv, root)?;
    }

    let timeout = Duration::from_secs(plan.timeout_secs);
    let last = plan.test.len() - 1;
    for (i, argv) in plan.test.iter().enumerate() {
        info!(cmd = ?argv, "running test command");
        let output = run_argv(argv, root, &plan.env, timeout, false)?;
        if !output.timed_out && output.status.success() {
            return Ok(output);
        }
        if !output.timed_out && i < last && is_benign_miss(argv, &output.combined_lossy()) {
            warn!(cmd = ?argv, "test runner/target missing, trying next candidate");
            continue;
        }
        ensure_success(argv, root, &output)?;
    }
    Err(anyhow!("no-test-commands: all candidates exhausted"))
}

/// Persist the plan artifact with stable key order and a trailing newline.
fn write_plan(root: &Path, plan: &Plan) -> Result<std::path::PathBuf> {
    let plan_dir = root.join(PLAN_DIR);
    fs::create_dir_all(&plan_dir)
        .with_context(|| format!("create plan dir {}", plan_dir.display()))?;
    let path = plan_dir.join(PLAN_FILE);
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write plan {}", path.display()))?;
    Ok(path)
}

fn check_os_deps(os_deps: &OsDeps) -> Result<()> {
    let missing_required = missing_bins(&os_deps.bins_required);
    if !missing_required.is_empty() {
        return Err(anyhow!(
            "missing-os-deps: required binaries not found on PATH: {missing_required:?}"
        ));
    }
    let missing_optional = missing_bins(&os_deps.bins_optional);
    if !missing_optional.is_empty() {
        warn!(
            missing = ?missing_optional,
            "optional binaries not found (may reduce success rate)"
        );
    }
    Ok(())
}

fn missing_bins(bins: &[String]) -> Vec<String> {
    bins.iter()
        .filter(|bin| which::which(bin).is_err())
        .cloned()
        .collect()
}

fn ci_env() -> BTreeMap<String, String> {
    BTreeMap::from([("CI".to_string(), "1".to_string())])
}

// --------------------------- node -----------------------------------

fn plan_node(root: &Path) -> Result<Plan> {
    let manifest_path = root.join("package.json");
    let manifest: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(&manifest_path)
            .with_context(|| format!("read {}", manifest_path.display()))?,
    )
    .with_context(|| format!("parse {}", manifest_path.display()))?;
    let scripts = manifest.get("scripts").and_then(|v| v.as_object());

    let (pm, install_cmd) = if root.join("pnpm-lock.yaml").exists() {
        ("pnpm", argv(&["pnpm", "install", "--frozen-lockfile"]))
    } else if root.join("yarn.lock").exists() {
        ("yarn", argv(&["yarn", "install", "--frozen-lockfile"]))
    } else if root.join("package-lock.json").exists() {
        ("npm", argv(&["npm", "ci"]))
    } else {
        ("npm", argv(&["npm", "install"]))
    };

    let mut prepare = Vec::new();
    let mut notes = Vec::new();

    if root.join("bin/cm.js").exists() {
        prepare.push(argv(&["node", "bin/cm.js", "install"]));
        notes.push(
            "Detected bin/cm.js; using CodeMirror-style bootstrap: node bin/cm.js install"
                .to_string(),
        );
    } else {
        prepare.push(install_cmd);
    }

    let mut test = Vec::new();
    if scripts.is_some_and(|s| s.contains_key("test-node")) {
        test.push(argv(&[pm, "run", "test-node"]));
    } else if scripts.is_some_and(|s| s.contains_key("test")) {
        test.push(argv(&[pm, "test"]));
    } else {
        notes.push(
            "No test or test-node script found in package.json; test command list is empty."
                .to_string(),
        );
    }

    // Corepack-aware required bin set.
    let mut bins_required = vec!["node".to_string()];
    let mut bins_optional = Vec::new();
    if pm == "npm" {
        bins_required.push("npm".to_string());
    } else if which::which(pm).is_ok() {
        bins_required.push(pm.to_string());
    } else if which::which("corepack").is_ok() {
        prepare.insert(0, argv(&["corepack", "enable"]));
        bins_required.push("corepack".to_string());
        bins_optional.push(pm.to_string());
        notes.push(format!("{pm} not found; using corepack enable before running {pm}."));
    } else {
        bins_required.push(pm.to_string());
    }

    Ok(Plan {
        kind: PlanKind::Node,
        os_deps: OsDeps {
            bins_required,
            bins_optional,
        },
        env: ci_env(),
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        autotools: None,
        prepare,
        test,
        notes,
    })
}

// --------------------------- python ---------------------------------

fn plan_python(root: &Path) -> Plan {
    let python = format!("{VENV_DIR}/bin/python");

    let mut prepare = Vec::new();
    if !root.join(VENV_DIR).exists() {
        prepare.push(argv(&["python3", "-m", "venv", VENV_DIR]));
    }
    prepare.push(argv(&[&python, "-m", "pip", "install", "--upgrade", "pip"]));
    if root.join("requirements.txt").exists() {
        prepare.push(argv(&[&python, "-m", "pip", "install", "-r", "requirements.txt"]));
    }
    prepare.push(argv(&[&python, "-m", "pip", "install", "."]));
    prepare.push(argv(&[&python, "-m", "pip", "install", "hypothesis"]));

    Plan {
        kind: PlanKind::Python,
        os_deps: OsDeps {
            bins_required: Vec::new(),
            bins_optional: vec!["python3".to_string()],
        },
        env: ci_env(),
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        autotools: None,
        prepare,
        test: vec![argv(&[&python, "-m", "unittest", "discover", "-s", "tests"])],
        notes: Vec::new(),
    }
}

// --------------------------- autotools -------------------------------

fn plan_c_autotools(root: &Path) -> Plan {
    let configure = root.join("configure");
    let configure_ac = root.join("configure.ac");
    let configure_in = root.join("configure.in");
    let autogen = root.join("autogen.sh");

    let needs_autoreconf = !configure.exists()
        && (configure_ac.exists() || configure_in.exists() || autogen.exists());

    let ac_text = format!("{}\n{}", slurpish(&configure_ac), slurpish(&configure_in));
    let makefile_am = format!(
        "{}\n{}",
        slurpish(&root.join("src/Makefile.am")),
        slurpish(&root.join("Makefile.am"))
    );
    let needs_libtoolize = ac_text.contains("LT_INIT")
        || ac_text.contains("AC_PROG_LIBTOOL")
        || makefile_am.contains("LTLIBRARIES");

    let mut configure_flags = Vec::new();
    if format!("{}{}", slurpish(&configure), slurpish(&configure_ac)).contains("oniguruma") {
        configure_flags.push("--with-oniguruma=builtin".to_string());
    }

    let mut bins_required = vec!["make".to_string()];
    if root.join(".git").exists() {
        bins_required.push("git".to_string());
    }
    if needs_libtoolize {
        bins_required.push("libtool".to_string());
        bins_required.push(pick_libtoolize_bin().unwrap_or("libtoolize").to_string());
    }
    if needs_autoreconf {
        bins_required.extend(
            ["autoreconf", "autoconf", "automake", "aclocal"]
                .iter()
                .map(|s| s.to_string()),
        );
    }

    let mut prepare = Vec::new();
    if root.join(".git").exists() {
        prepare.push(argv(&["git", "submodule", "update", "--init", "--recursive"]));
    }
    if needs_libtoolize {
        prepare.push(argv(&[
            pick_libtoolize_bin().unwrap_or("libtoolize"),
            "--force",
            "--copy",
        ]));
    }
    if needs_autoreconf {
        prepare.push(argv(&["autoreconf", "-fi", "-I", "m4"]));
    }
    let mut configure_cmd = vec!["./configure".to_string()];
    configure_cmd.extend(configure_flags.clone());
    prepare.push(configure_cmd);
    prepare.push(argv(&["make"]));

    let mut env = ci_env();
    env.insert("LANG".to_string(), "C".to_string());
    env.insert("LC_ALL".to_string(), "C".to_string());

    Plan {
        kind: PlanKind::CAutotools,
        os_deps: OsDeps {
            bins_required,
            bins_optional: ["pkg-config", "gcc", "cc", "clang", "m4"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        },
        env,
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        autotools: Some(AutotoolsPlan {
            needs_autoreconf,
            needs_libtoolize,
            configure_flags,
        }),
        prepare,
        test: vec![argv(&["make", "check"]), argv(&["make", "test"])],
        notes: Vec::new(),
    }
}

static LIBTOOL_UNDEFINED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Libtool library used but 'LIBTOOL' is undefined").unwrap()
});

/// Autotools bootstrap: submodules, libtoolize, reconfigure (with a fallback
/// on the recognized libtool macro-resolution failure), configure, make.
fn autotools_bootstrap(
    root: &Path,
    ledger: &mut Ledger,
    plan_h: &str,
    auto: &AutotoolsPlan,
    base_env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<()> {
    if root.join(".git").exists() && which::which("git").is_ok() {
        run_recorded_cmd(
            ledger,
            plan_h,
            "git.submodule.update",
            &argv(&["git", "submodule", "update", "--init", "--recursive"]),
            root,
            base_env,
            timeout,
            false,
        )?;
    }

    let m4_dir = root.join("m4");
    if auto.needs_libtoolize {
        // Harmless even if repeated / already present.
        fs::create_dir_all(&m4_dir).context("create m4 dir")?;
        let Some(libtoolize_bin) = pick_libtoolize_bin() else {
            return Err(anyhow!(
                "missing-os-deps: repo appears to use libtool but libtoolize/glibtoolize not found"
            ));
        };
        let env = autotools_env(base_env, &guix_profile_aclocal_dirs());
        run_recorded_cmd(
            ledger,
            plan_h,
            "autotools.libtoolize",
            &argv(&[libtoolize_bin, "--force", "--copy"]),
            root,
            &env,
            timeout,
            false,
        )?;
    }

    if auto.needs_autoreconf {
        let env = autotools_env(base_env, &guix_profile_aclocal_dirs());
        let mut cmd = argv(&["autoreconf", "-fi"]);
        if m4_dir.is_dir() {
            cmd.extend(argv(&["-I", "m4"]));
        }

        // The whole "autoreconf with fallback" is a single skip-able step.
        let payload = json!({
            "cmd": &cmd,
            "cwd": root.to_string_lossy(),
            "env": &env,
            "timeout_secs": timeout.as_secs(),
        });
        run_recorded_step(
            ledger,
            plan_h,
            "autotools.autoreconf_or_fallback",
            payload,
            false,
            || match run_argv(&cmd, root, &env, timeout, true) {
                Ok(_) => Ok(()),
                Err(err) if LIBTOOL_UNDEFINED_RE.is_match(&format!("{err:#}")) => {
                    warn!(
                        "autoreconf hit LIBTOOL undefined; retrying with explicit \
                         aclocal/autoconf/automake sequence"
                    );
                    autotools_fallback_sequence(root, &env, timeout)
                }
                Err(err) => Err(err),
            },
        )?;
    }

    let mut configure_cmd = vec!["./configure".to_string()];
    configure_cmd.extend(auto.configure_flags.clone());
    run_recorded_cmd(
        ledger,
        plan_h,
        "autotools.configure",
        &configure_cmd,
        root,
        base_env,
        timeout,
        false,
    )?;

    let jobs = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(2);
    run_recorded_cmd(
        ledger,
        plan_h,
        "autotools.make",
        &argv(&["make", &format!("-j{jobs}")]),
        root,
        base_env,
        timeout,
        false,
    )?;
    Ok(())
}

/// Explicit macro/script regeneration used when autoreconf cannot resolve
/// the libtool macros on its own.
fn autotools_fallback_sequence(
    root: &Path,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<()> {
    fs::create_dir_all(root.join("m4")).context("create m4 dir")?;
    for cmd in [
        argv(&["aclocal", "-I", "m4"]),
        argv(&["autoconf"]),
        argv(&["automake", "--add-missing", "--copy"]),
        argv(&["autoconf"]),
    ] {
        run_argv(&cmd, root, env, timeout, true)?;
    }
    Ok(())
}

fn autotools_env(
    base: &BTreeMap<String, String>,
    add_aclocal_dirs: &[String],
) -> BTreeMap<String, String> {
    let mut env = base.clone();
    env.entry("CI".to_string()).or_insert("1".to_string());
    env.entry("LANG".to_string()).or_insert("C".to_string());
    env.entry("LC_ALL".to_string()).or_insert("C".to_string());

    // Respect base env first, then fall back to process env.
    let existing = env
        .get("ACLOCAL_PATH")
        .cloned()
        .or_else(|| std::env::var("ACLOCAL_PATH").ok())
        .unwrap_or_default();
    let mut parts: Vec<String> = add_aclocal_dirs.to_vec();
    parts.extend(existing.split(':').map(str::to_string));
    let mut seen = std::collections::BTreeSet::new();
    let unique: Vec<String> = parts
        .into_iter()
        .filter(|p| !p.is_empty() && seen.insert(p.clone()))
        .collect();
    if !unique.is_empty() {
        env.insert("ACLOCAL_PATH".to_string(), unique.join(":"));
    }
    env
}

fn guix_profile_aclocal_dirs() -> Vec<String> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let share = home.join(".guix-profile/share");
    let mut out = Vec::new();
    let plain = share.join("aclocal");
    if plain.is_dir() {
        out.push(plain.to_string_lossy().to_string());
    }
    if let Ok(entries) = fs::read_dir(&share) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("aclocal-") && entry.path().is_dir() {
                out.push(entry.path().to_string_lossy().to_string());
            }
        }
    }
    out
}

fn pick_libtoolize_bin() -> Option<&'static str> {
    if which::which("libtoolize").is_ok() {
        return Some("libtoolize");
    }
    if which::which("glibtoolize").is_ok() {
        return Some("glibtoolize");
    }
    None
}

fn slurpish(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
