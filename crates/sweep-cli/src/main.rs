use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_runner::{
    CaseState, DownloadOptions, GenerateOptions, Mode, RemoteTarget, SshSession, StatusReport,
    Study, StudyManager, SubmittedJob, UploadOptions,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "sweep", version = "0.3.0", about = "Parametric study generator and batch runner")]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the sweep a study would generate.
    Describe {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Expand the sweep into case directories.
    Generate {
        study: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },
    /// Upload a study, or a single case with --case.
    Upload {
        path: PathBuf,
        #[arg(long)]
        remote: PathBuf,
        #[arg(long)]
        case: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        keep_archive: bool,
        #[arg(long)]
        json: bool,
    },
    /// Submit every registered case of a study, or a single case with --case.
    Submit {
        path: PathBuf,
        #[arg(long)]
        remote: PathBuf,
        #[arg(long)]
        case: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the scheduler's queue listing and the state of the study's
    /// recorded jobs.
    Status {
        /// Study root holding `jobs.txt`; defaults to the current directory.
        study: Option<PathBuf>,
        #[arg(long)]
        remote: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Fetch the declared download paths of a study.
    Download {
        study: PathBuf,
        #[arg(long)]
        remote: PathBuf,
        #[arg(long)]
        no_extract: bool,
        #[arg(long)]
        json: bool,
    },
    /// Check that the remote host answers.
    RemoteCheck {
        #[arg(long)]
        remote: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if payload_failed(&payload) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let (code, details) = match err.downcast_ref::<sweep_runner::Error>() {
                    Some(e) => (e.code(), json!({ "status": e.command_status() })),
                    None => ("command_failed", json!({})),
                };
                emit_json(&json_error(code, err.to_string(), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Describe { study, json } => {
            let study = Study::open(&study)?;
            let plan = study.plan()?;
            let names = study.case_names()?;
            if json {
                let parameters: Vec<Value> = study
                    .config()
                    .parameters
                    .iter()
                    .map(|p| {
                        json!({
                            "name": p.name,
                            "mode": mode_str(p.mode),
                            "values": p.values.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                            "file": p.target_file,
                            "section": p.target_section.key(),
                        })
                    })
                    .collect();
                let downloads: Vec<Value> = study
                    .config()
                    .downloads
                    .iter()
                    .map(|d| json!({ "path": d.path, "filter": format!("{:?}", d.filter) }))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "study": study.name(),
                    "root": study.root().display().to_string(),
                    "linear_length": plan.linear_len(),
                    "instance_count": plan.instance_count(),
                    "parameters": parameters,
                    "downloads": downloads,
                    "cases": names,
                })));
            }
            println!("study: {}", study.name());
            println!("root: {}", study.root().display());
            for p in &study.config().parameters {
                let values: Vec<String> = p.values.iter().map(|v| v.to_string()).collect();
                println!(
                    "param: {} ({}) in {}/{} = [{}]",
                    p.name,
                    mode_str(p.mode),
                    p.target_section.dir_name(),
                    p.target_file,
                    values.join(", ")
                );
            }
            for d in &study.config().downloads {
                println!("download: {} {:?}", d.path, d.filter);
            }
            println!("instances: {}", plan.instance_count());
            for name in names {
                println!("  {}", name);
            }
        }
        Commands::Generate { study, force, json } => {
            let study = Study::open(&study)?;
            let report = study.generate(GenerateOptions { force })?;
            let failed: Vec<Value> = report
                .failed
                .iter()
                .map(|(case, e)| json!({ "case": case, "code": e.code(), "message": e.to_string() }))
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": report.is_complete(),
                    "command": "generate",
                    "study": study.name(),
                    "created": report.created,
                    "failed": failed,
                })));
            }
            for case in &report.created {
                println!("created: {}", case);
            }
            for (case, e) in &report.failed {
                eprintln!("failed: {}: {}", case, e);
            }
            if !report.is_complete() {
                bail!(
                    "{} of {} cases failed to generate",
                    report.failed.len(),
                    report.failed.len() + report.created.len()
                );
            }
        }
        Commands::Upload {
            path,
            remote,
            case,
            force,
            keep_archive,
            json,
        } => {
            let mut mgr = manager(&remote, &path, case)?;
            let options = UploadOptions {
                force,
                keep_archive,
            };
            let uploaded = match mgr.case_name().map(str::to_string) {
                Some(name) => {
                    mgr.upload_case(&name, options)?;
                    mgr.remote_case_dir(&name)
                }
                None => {
                    mgr.upload_study(options)?;
                    mgr.remote_study_dir()
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "upload",
                    "study": mgr.study_name(),
                    "case": mgr.case_name(),
                    "remote_dir": uploaded,
                })));
            }
            println!("uploaded: {}", uploaded);
        }
        Commands::Submit {
            path,
            remote,
            case,
            json,
        } => {
            let mut mgr = manager(&remote, &path, case)?;
            let jobs = match mgr.case_name().map(str::to_string) {
                Some(name) => vec![mgr.submit_case(&name)?],
                None => mgr.submit_study()?,
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "submit",
                    "study": mgr.study_name(),
                    "jobs": jobs.iter().map(job_to_json).collect::<Vec<_>>(),
                })));
            }
            for job in &jobs {
                println!(
                    "submitted: {} {}",
                    job.case,
                    job.job_id.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Status {
            study,
            remote,
            json,
        } => {
            let study = match study {
                Some(path) => path,
                None => std::env::current_dir()?,
            };
            let mut mgr = manager(&remote, &study, false)?;
            let report = mgr.status()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "remote": mgr.session().target().name,
                    "status": status_to_json(&report),
                })));
            }
            for line in &report.lines {
                println!("{}", line);
            }
            for (case, state) in &report.cases {
                println!("case: {} {}", case, state_str(*state));
            }
        }
        Commands::Download {
            study,
            remote,
            no_extract,
            json,
        } => {
            let mut mgr = manager(&remote, &study, false)?;
            let local = mgr.download(DownloadOptions {
                extract: !no_extract,
            })?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "download",
                    "study": mgr.study_name(),
                    "archive": local.display().to_string(),
                    "extracted": !no_extract,
                })));
            }
            println!("downloaded: {}", local.display());
        }
        Commands::RemoteCheck { remote, json } => {
            let target = RemoteTarget::load(&remote)?;
            let reachable = SshSession::probe(&target, CONNECT_TIMEOUT)?;
            if json {
                return Ok(Some(json!({
                    "ok": reachable,
                    "command": "remote-check",
                    "remote": target.name,
                    "address": target.address,
                    "port": target.port,
                    "reachable": reachable,
                })));
            }
            if !reachable {
                bail!(
                    "remote '{}' at {}:{} is not reachable",
                    target.name,
                    target.address,
                    target.port
                );
            }
            println!("reachable: {} ({}:{})", target.name, target.address, target.port);
        }
    }
    Ok(None)
}

fn manager(remote: &Path, path: &Path, case: bool) -> Result<StudyManager<SshSession>> {
    let target = RemoteTarget::load(remote)?;
    info!(remote = %target.name, address = %target.address, port = target.port, "opening session");
    let session = SshSession::connect(&target, target.credentials(), Some(CONNECT_TIMEOUT))?;
    Ok(if case {
        StudyManager::for_case(session, target, path)
    } else {
        StudyManager::for_study(session, target, path)
    })
}

fn mode_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Linear => "linear",
        Mode::Combinatoric => "combinatoric",
    }
}

fn state_str(state: CaseState) -> &'static str {
    match state {
        CaseState::Local => "local",
        CaseState::Uploaded => "uploaded",
        CaseState::Submitted => "submitted",
        CaseState::Queued => "queued",
        CaseState::Running => "running",
        CaseState::Completed => "completed",
        CaseState::Downloaded => "downloaded",
    }
}

fn job_to_json(job: &SubmittedJob) -> Value {
    json!({
        "case": job.case,
        "job_id": job.job_id,
    })
}

fn status_to_json(report: &StatusReport) -> Value {
    json!({
        "lines": report.lines,
        "cases": report
            .cases
            .iter()
            .map(|(case, state)| json!({ "case": case, "state": state_str(*state) }))
            .collect::<Vec<_>>(),
    })
}

/// A payload reporting `"ok": false` still exits nonzero.
fn payload_failed(payload: &Value) -> bool {
    payload.get("ok") == Some(&Value::Bool(false))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Describe { json, .. }
        | Commands::Generate { json, .. }
        | Commands::Upload { json, .. }
        | Commands::Submit { json, .. }
        | Commands::Status { json, .. }
        | Commands::Download { json, .. }
        | Commands::RemoteCheck { json, .. } => *json,
    }
}
