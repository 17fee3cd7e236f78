//! Scrutiny command-line surface.
//!
//! Thin wrapper over the engine handle: every verb that touches a project
//! requires an explicit path (nothing defaults to the current directory),
//! JSON is the canonical machine output, and exit codes follow the
//! contract: 0 clean, 1 findings, 2 usage error, 3 I/O or permission
//! error, 4 safety-gate refusal, 5 internal error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use scrutiny_engine::config::EngineConfig;
use scrutiny_engine::error::EngineError;
use scrutiny_engine::gate::{DeferringApprover, StaticApprover};
use scrutiny_engine::orchestrator::CancelToken;
use scrutiny_engine::pruning::PruneStrategy;
use scrutiny_engine::reporter;
use scrutiny_engine::sandbox::SandboxValidator;
use scrutiny_engine::types::ApprovalDecision;
use scrutiny_engine::Engine;

#[derive(Parser)]
#[command(
    name = "scrutiny",
    version,
    about = "Static analysis with persistent semantic memory and gated fixes"
)]
struct Cli {
    /// Emit canonical JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    verb: Verb,
}

#[derive(Subcommand)]
enum Verb {
    /// Scan a project and report issues.
    Analyze {
        /// Project root (required; never defaults to the current directory).
        path: PathBuf,
    },
    /// Scan a project and apply gated fixes.
    Fix {
        /// Project root.
        path: PathBuf,
        /// Approve every proposal that reaches the approval surface.
        #[arg(long)]
        assume_yes: bool,
    },
    /// Seed the training namespace from a JSON file of entries.
    Train {
        /// JSON file: an array of {"content": "...", "metadata": {...}}.
        file: PathBuf,
    },
    /// Report memory health and per-namespace counts.
    Stats,
    /// Run a pruning strategy over memory.
    Prune {
        /// Strategy: age, redundancy, quality, or hybrid.
        #[arg(long, default_value = "hybrid")]
        strategy: String,
        /// Restrict pruning to one namespace.
        #[arg(long)]
        namespace: Option<String>,
    },
    /// Scan a project and close the improvement cycle against the previous scan.
    Cycle {
        /// Project root.
        path: PathBuf,
    },
    /// Self-check the sandbox against a trivial proposal.
    Test {
        /// Project root.
        path: PathBuf,
    },
    /// Validate the state directory and report engine health.
    Validate,
    /// Walk the pipeline on a project without applying anything.
    Demo {
        /// Project root.
        path: PathBuf,
    },
    /// Consolidate memory: redundancy pruning across namespaces.
    Consolidate,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("SCRUTINY_LOG", "warn"))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<u8, EngineError> {
    // Project verbs resolve config from the project root so per-project
    // scrutiny.toml applies; state-only verbs use the defaults + env.
    let project_path = match &cli.verb {
        Verb::Analyze { path }
        | Verb::Fix { path, .. }
        | Verb::Cycle { path }
        | Verb::Test { path }
        | Verb::Demo { path } => Some(path.clone()),
        _ => None,
    };
    let config = match &project_path {
        Some(path) => {
            if !path.is_dir() {
                return Err(EngineError::Input(format!(
                    "project path '{}' is not a directory",
                    path.display()
                )));
            }
            EngineConfig::load_from_project(path)
                .map_err(|e| EngineError::Input(e.to_string()))?
        }
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides();
            config
        }
    };

    let engine = Engine::init(config)?;
    let cancel = CancelToken::new();

    let code = match cli.verb {
        Verb::Analyze { path } => {
            let (result, suppressed) = engine.analyze(&path, &cancel)?;
            if cli.json {
                println!("{}", reporter::scan_to_json(&result).map_err(EngineError::Fatal)?);
            } else {
                print!("{}", reporter::scan_to_text(&result));
                if !suppressed.is_empty() {
                    println!("{} issue(s) suppressed as likely false positives", suppressed.len());
                }
            }
            u8::from(!result.is_clean())
        }
        Verb::Fix { path, assume_yes } => {
            let report = if assume_yes {
                let approver = StaticApprover {
                    decision: ApprovalDecision::Approve,
                    user_confidence: 0.75,
                };
                engine.fix(&path, &approver, &cancel)?
            } else {
                engine.fix(&path, &DeferringApprover, &cancel)?
            };
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .map_err(|e| EngineError::Fatal(e.to_string()))?
                );
            } else {
                println!(
                    "applied {} fix(es), {} deferred, {} refused",
                    report.applied.len(),
                    report.deferred,
                    report.refused
                );
            }
            if report.compromised {
                4
            } else {
                0
            }
        }
        Verb::Train { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let entries: Vec<TrainEntry> = serde_json::from_str(&raw)
                .map_err(|e| EngineError::Input(format!("bad training file: {e}")))?;
            let stored = engine.train(
                entries
                    .into_iter()
                    .map(|e| (e.content, e.metadata.unwrap_or_else(|| serde_json::json!({}))))
                    .collect(),
            )?;
            println!("stored {stored} training memories");
            0
        }
        Verb::Stats => {
            let stats = engine.stats()?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&stats)
                        .map_err(|e| EngineError::Fatal(e.to_string()))?
                );
            } else {
                println!(
                    "db: {:?}, index: {:?}, memories: {}",
                    stats.health.db, stats.health.index, stats.health.memory_count
                );
                for (ns, count) in &stats.namespaces {
                    println!("  {ns}: {count}");
                }
            }
            0
        }
        Verb::Prune { strategy, namespace } => {
            let strategy = PruneStrategy::parse(&strategy)
                .ok_or_else(|| EngineError::Input(format!("unknown strategy '{strategy}'")))?;
            let report = engine.prune(strategy, namespace.as_deref())?;
            println!(
                "{} pruning: examined {}, removed {}, merged {}",
                report.strategy, report.examined, report.removed, report.merged
            );
            0
        }
        Verb::Cycle { path } => {
            let (result, _) = engine.analyze(&path, &cancel)?;
            match engine.close_cycle(&result)? {
                Some(record) => {
                    if cli.json {
                        println!(
                            "{}",
                            serde_json::to_string_pretty(&record)
                                .map_err(|e| EngineError::Fatal(e.to_string()))?
                        );
                    } else {
                        println!(
                            "cycle closed: {} resolved ({} manual, {} automated), {} new",
                            record.resolved.len(),
                            record.manual_fixes.len(),
                            record.automated_fixes.len(),
                            record.new_issues.len()
                        );
                    }
                }
                None => println!("no previous scan for this project"),
            }
            0
        }
        Verb::Test { path } => {
            let validator = SandboxValidator::new(&engine.config.sandbox);
            let run = scrutiny_engine::sandbox::self_check(&validator, &path)?;
            println!(
                "sandbox self-check: {} (build {}, {} ms)",
                run.outcome, run.build_status, run.wall_ms
            );
            u8::from(run.outcome != scrutiny_engine::types::SandboxOutcome::Ok)
        }
        Verb::Validate => {
            let stats = engine.stats()?;
            println!(
                "state ok: db {:?}, index {:?}, {} memories",
                stats.health.db, stats.health.index, stats.health.memory_count
            );
            0
        }
        Verb::Demo { path } => {
            println!("[1/3] scanning {}", path.display());
            let (result, suppressed) = engine.analyze(&path, &cancel)?;
            print!("{}", reporter::scan_to_text(&result));
            println!("[2/3] {} issue(s) suppressed by the false-positive detector", suppressed.len());
            println!("[3/3] fix proposals (not applied):");
            let proposer = scrutiny_engine::fixer::FixProposer::new();
            for issue in &result.issues {
                let target = path.join(&issue.file);
                if let Ok(content) = std::fs::read_to_string(&target) {
                    if let Some(proposal) = proposer.propose(&content, issue) {
                        print!("{}", reporter::proposal_to_text(&proposal));
                    }
                }
            }
            u8::from(!result.is_clean())
        }
        Verb::Consolidate => {
            let report = engine.prune(PruneStrategy::Redundancy, None)?;
            println!(
                "consolidated: examined {}, removed {}, merged {}",
                report.examined, report.removed, report.merged
            );
            0
        }
    };

    engine.shutdown();
    Ok(code)
}

#[derive(serde::Deserialize)]
struct TrainEntry {
    content: String,
    metadata: Option<serde_json::Value>,
}
