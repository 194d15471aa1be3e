use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

pub const SUMMARY_FILE: &str = "batch_summary.json";
pub const RESOLVED_FILE: &str = "resolved_batch.json";

const STATES_SUFFIX: &str = "_SO_StatesReporter_states.sto";
const SO_ACTIVATION_SUFFIX: &str = "_SO_StaticOptimization_activation.sto";
const MEASURED_ACTIVATION_SUFFIX: &str = "_measured_activation.sto";

#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

#[derive(Debug, Error)]
pub enum JobError {
    #[error("missing input file: {path}")]
    MissingInput { path: PathBuf },
    #[error("malformed storage file {path}: {detail}")]
    MalformedStorage { path: PathBuf, detail: String },
    #[error("external tool exited with {status}: {detail}")]
    ExternalTool { status: String, detail: String },
    #[error("i/o failure: {detail}")]
    Io { detail: String },
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::MissingInput { .. } => "missing_input",
            JobError::MalformedStorage { .. } => "malformed_storage",
            JobError::ExternalTool { .. } => "external_tool",
            JobError::Io { .. } => "io",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationMode {
    Measured,
    StaticOptimization,
}

impl ActivationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationMode::Measured => "measured",
            ActivationMode::StaticOptimization => "static_optimization",
        }
    }

    fn file_tag(&self) -> &'static str {
        match self {
            ActivationMode::Measured => "meas",
            ActivationMode::StaticOptimization => "so",
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchConfigFile {
    version: String,
    batch: BatchSection,
    setup: SetupSection,
    #[serde(default)]
    subjects: SubjectLists,
}

#[derive(Debug, Deserialize)]
struct BatchSection {
    id: String,
    root_dir: PathBuf,
    output_root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SetupSection {
    template: PathBuf,
    #[serde(default = "default_opensim_command")]
    opensim_command: Vec<String>,
}

fn default_opensim_command() -> Vec<String> {
    vec!["opensim-cmd".to_string(), "run-tool".to_string()]
}

#[derive(Debug, Default, Deserialize)]
struct SubjectLists {
    #[serde(default)]
    measured: Vec<SubjectEntry>,
    #[serde(default)]
    static_optimization: Vec<SubjectEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectEntry {
    pub id: String,
    #[serde(default)]
    pub trials: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl SubjectEntry {
    fn model_file_name(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| format!("{}.osim", self.id))
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedBatch {
    pub batch_id: String,
    pub root_dir: PathBuf,
    pub output_root: PathBuf,
    pub setup_template: PathBuf,
    pub opensim_command: Vec<String>,
    pub measured: Vec<SubjectEntry>,
    pub static_optimization: Vec<SubjectEntry>,
}

#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub subject_id: String,
    pub trial_id: String,
    pub mode: ActivationMode,
    pub model_file: PathBuf,
    pub states_file: PathBuf,
    pub activation_file: PathBuf,
    pub results_dir: PathBuf,
}

impl AnalysisJob {
    /// Tool name used for the setup file and every output the external
    /// tool writes. Includes the activation mode tag so the measured and
    /// static-optimization pipelines never collide on a (subject, trial).
    pub fn tool_name(&self) -> String {
        format!("{}_JRA_{}", self.trial_id, self.mode.file_tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "success",
            JobStatus::Failed => "failure",
        }
    }
}

#[derive(Debug)]
pub struct JobRecord {
    pub subject_id: String,
    pub trial_id: String,
    pub mode: ActivationMode,
    pub status: JobStatus,
    pub error: Option<JobError>,
    pub results_dir: PathBuf,
    pub setup_digest: Option<String>,
}

#[derive(Debug)]
pub struct BatchReport {
    pub batch_id: String,
    pub output_root: PathBuf,
    pub started_at: String,
    pub finished_at: String,
    pub records: Vec<JobRecord>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == JobStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.records.len() - self.succeeded()
    }

    pub fn failed_records(&self) -> impl Iterator<Item = &JobRecord> {
        self.records
            .iter()
            .filter(|r| r.status == JobStatus::Failed)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.output_root.join(SUMMARY_FILE)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOverview {
    pub batch_id: String,
    pub root_dir: PathBuf,
    pub output_root: PathBuf,
    pub setup_template: PathBuf,
    pub opensim_command: Vec<String>,
    pub measured_subjects: usize,
    pub static_optimization_subjects: usize,
    pub total_jobs: usize,
}

pub fn load_batch_config(path: &Path) -> Result<ResolvedBatch, ConfigurationError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ConfigurationError(format!("cannot read {}: {}", path.display(), e)))?;
    let parsed: BatchConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| ConfigurationError(format!("cannot parse {}: {}", path.display(), e)))?;
    let config_dir = config_dir_for(path)?;
    resolve_batch_config(parsed, &config_dir)
}

/// Directory that relative config paths resolve against, made absolute:
/// the external tool runs with the job results dir as its cwd, so every
/// path handed to it or rendered into the setup file must not depend on
/// the cwd the batch was launched from.
fn config_dir_for(path: &Path) -> Result<PathBuf, ConfigurationError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if parent.is_absolute() {
        return Ok(parent);
    }
    let cwd = std::env::current_dir()
        .map_err(|e| ConfigurationError(format!("cannot resolve current directory: {}", e)))?;
    if parent == Path::new(".") {
        Ok(cwd)
    } else {
        Ok(cwd.join(parent))
    }
}

fn resolve_batch_config(
    parsed: BatchConfigFile,
    config_dir: &Path,
) -> Result<ResolvedBatch, ConfigurationError> {
    let mut problems = Vec::new();

    if parsed.version != "0.1" {
        problems.push(format!(
            "unsupported version '{}' (expected '0.1')",
            parsed.version
        ));
    }
    if parsed.batch.id.trim().is_empty() {
        problems.push("batch.id must not be empty".to_string());
    }
    if parsed.setup.opensim_command.is_empty() {
        problems.push("setup.opensim_command must not be empty".to_string());
    }
    if parsed.subjects.measured.is_empty() && parsed.subjects.static_optimization.is_empty() {
        problems.push("at least one subject is required".to_string());
    }
    check_subject_list(&parsed.subjects.measured, "subjects.measured", &mut problems);
    check_subject_list(
        &parsed.subjects.static_optimization,
        "subjects.static_optimization",
        &mut problems,
    );

    let root_dir = resolve_path(config_dir, &parsed.batch.root_dir);
    if !root_dir.is_dir() {
        problems.push(format!("batch.root_dir not found: {}", root_dir.display()));
    }
    let setup_template = resolve_path(config_dir, &parsed.setup.template);
    if !setup_template.is_file() {
        problems.push(format!(
            "setup.template not found: {}",
            setup_template.display()
        ));
    }
    let output_root = resolve_path(config_dir, &parsed.batch.output_root);

    if !problems.is_empty() {
        return Err(ConfigurationError(format!(
            "batch config invalid:\n{}",
            problems
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )));
    }

    Ok(ResolvedBatch {
        batch_id: parsed.batch.id,
        root_dir,
        output_root,
        setup_template,
        opensim_command: parsed.setup.opensim_command,
        measured: parsed.subjects.measured,
        static_optimization: parsed.subjects.static_optimization,
    })
}

fn check_subject_list(list: &[SubjectEntry], label: &str, problems: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    for subject in list {
        if subject.id.trim().is_empty() {
            problems.push(format!("{}: subject id must not be empty", label));
            continue;
        }
        if !seen.insert(subject.id.clone()) {
            problems.push(format!("{}: duplicate subject id '{}'", label, subject.id));
        }
        let mut trial_seen = BTreeSet::new();
        for trial in &subject.trials {
            if trial.trim().is_empty() {
                problems.push(format!(
                    "{}: subject '{}' has an empty trial id",
                    label, subject.id
                ));
            } else if !trial_seen.insert(trial.clone()) {
                problems.push(format!(
                    "{}: subject '{}' lists trial '{}' twice",
                    label, subject.id, trial
                ));
            }
        }
    }
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Produce one AnalysisJob per (subject, trial, activation-mode) work item:
/// the measured list first, then the static-optimization list, in config
/// order. Input files are only resolved here; their existence is checked
/// per job by the driver so one bad trial never aborts enumeration.
pub fn enumerate_jobs(batch: &ResolvedBatch) -> Result<Vec<AnalysisJob>, ConfigurationError> {
    let mut jobs = Vec::new();
    for subject in &batch.measured {
        jobs.extend(jobs_for_subject(batch, subject, ActivationMode::Measured)?);
    }
    for subject in &batch.static_optimization {
        jobs.extend(jobs_for_subject(
            batch,
            subject,
            ActivationMode::StaticOptimization,
        )?);
    }
    Ok(jobs)
}

fn jobs_for_subject(
    batch: &ResolvedBatch,
    subject: &SubjectEntry,
    mode: ActivationMode,
) -> Result<Vec<AnalysisJob>, ConfigurationError> {
    let subject_dir = batch.root_dir.join(&subject.id);
    let so_dir = subject_dir.join("SO_Results");
    let trials = if subject.trials.is_empty() {
        let discovered = discover_trials(&so_dir)?;
        if discovered.is_empty() {
            warn!(
                subject = %subject.id,
                so_dir = %so_dir.display(),
                "no trials listed and none discovered; skipping subject"
            );
        }
        discovered
    } else {
        subject.trials.clone()
    };

    let model_file = subject_dir.join(subject.model_file_name());
    let mut jobs = Vec::new();
    for trial in trials {
        let states_file = so_dir.join(format!("{}{}", trial, STATES_SUFFIX));
        let activation_file = match mode {
            ActivationMode::StaticOptimization => {
                so_dir.join(format!("{}{}", trial, SO_ACTIVATION_SUFFIX))
            }
            ActivationMode::Measured => subject_dir
                .join("EMG_Results")
                .join(format!("{}{}", trial, MEASURED_ACTIVATION_SUFFIX)),
        };
        let results_dir = batch.output_root.join(&subject.id).join(&trial);
        jobs.push(AnalysisJob {
            subject_id: subject.id.clone(),
            trial_id: trial,
            mode,
            model_file: model_file.clone(),
            states_file,
            activation_file,
            results_dir,
        });
    }
    Ok(jobs)
}

fn discover_trials(so_dir: &Path) -> Result<Vec<String>, ConfigurationError> {
    if !so_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut trials = Vec::new();
    for entry in WalkDir::new(so_dir).min_depth(1).max_depth(1) {
        let entry = entry
            .map_err(|e| ConfigurationError(format!("cannot scan {}: {}", so_dir.display(), e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Some(trial) = name.strip_suffix(STATES_SUFFIX) {
                trials.push(trial.to_string());
            }
        }
    }
    // directory iteration order is platform-dependent; sort for
    // reproducible batch logs
    trials.sort();
    Ok(trials)
}

pub fn run_batch(config_path: &Path) -> Result<BatchReport> {
    let batch = load_batch_config(config_path)?;
    run_resolved_batch(&batch)
}

pub fn run_resolved_batch(batch: &ResolvedBatch) -> Result<BatchReport> {
    let jobs = enumerate_jobs(batch)?;
    run_jobs(batch, &jobs)
}

/// Runs an already-enumerated job list, so callers that inspect the jobs
/// first do not enumerate (and log discovery warnings) twice.
pub fn run_jobs(batch: &ResolvedBatch, jobs: &[AnalysisJob]) -> Result<BatchReport> {
    ensure_dir(&batch.output_root)?;
    write_resolved_batch(batch)?;
    let template = fs::read_to_string(&batch.setup_template).with_context(|| {
        format!(
            "cannot read setup template {}",
            batch.setup_template.display()
        )
    })?;

    let started_at = Utc::now().to_rfc3339();
    let mut records = Vec::new();
    for job in jobs {
        info!(
            subject = %job.subject_id,
            trial = %job.trial_id,
            mode = job.mode.as_str(),
            "joint reactions analysis in progress"
        );
        match run_job(batch, job, &template) {
            Ok(setup_digest) => {
                info!(subject = %job.subject_id, trial = %job.trial_id, "complete");
                records.push(JobRecord {
                    subject_id: job.subject_id.clone(),
                    trial_id: job.trial_id.clone(),
                    mode: job.mode,
                    status: JobStatus::Success,
                    error: None,
                    results_dir: job.results_dir.clone(),
                    setup_digest: Some(setup_digest),
                });
            }
            Err(err) => {
                warn!(
                    subject = %job.subject_id,
                    trial = %job.trial_id,
                    kind = err.kind(),
                    "job failed: {}",
                    err
                );
                records.push(JobRecord {
                    subject_id: job.subject_id.clone(),
                    trial_id: job.trial_id.clone(),
                    mode: job.mode,
                    status: JobStatus::Failed,
                    error: Some(err),
                    results_dir: job.results_dir.clone(),
                    setup_digest: None,
                });
            }
        }
    }

    let report = BatchReport {
        batch_id: batch.batch_id.clone(),
        output_root: batch.output_root.clone(),
        started_at,
        finished_at: Utc::now().to_rfc3339(),
        records,
    };
    write_batch_summary(&report)?;
    info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        "batch complete"
    );
    Ok(report)
}

pub fn describe_batch(config_path: &Path) -> Result<BatchOverview> {
    let batch = load_batch_config(config_path)?;
    let jobs = enumerate_jobs(&batch)?;
    Ok(batch_overview(&batch, &jobs))
}

pub fn batch_overview(batch: &ResolvedBatch, jobs: &[AnalysisJob]) -> BatchOverview {
    BatchOverview {
        batch_id: batch.batch_id.clone(),
        root_dir: batch.root_dir.clone(),
        output_root: batch.output_root.clone(),
        setup_template: batch.setup_template.clone(),
        opensim_command: batch.opensim_command.clone(),
        measured_subjects: batch.measured.len(),
        static_optimization_subjects: batch.static_optimization.len(),
        total_jobs: jobs.len(),
    }
}

fn run_job(batch: &ResolvedBatch, job: &AnalysisJob, template: &str) -> Result<String, JobError> {
    verify_job_inputs(job)?;
    ensure_dir(&job.results_dir).map_err(|e| JobError::Io {
        detail: e.to_string(),
    })?;

    let (initial_time, final_time) = read_time_range(&job.states_file)?;
    let tool_name = job.tool_name();
    let rendered = render_setup(template, job, &tool_name, initial_time, final_time);
    let setup_path = job.results_dir.join(format!("{}_Setup.xml", tool_name));
    atomic_write_bytes(&setup_path, rendered.as_bytes()).map_err(|e| JobError::Io {
        detail: e.to_string(),
    })?;
    let setup_digest = sha256_bytes(rendered.as_bytes());

    invoke_opensim(
        &batch.opensim_command,
        &setup_path,
        &job.results_dir,
        &tool_name,
    )?;
    Ok(setup_digest)
}

fn verify_job_inputs(job: &AnalysisJob) -> Result<(), JobError> {
    for path in [&job.model_file, &job.states_file, &job.activation_file] {
        if !path.is_file() {
            return Err(JobError::MissingInput { path: path.clone() });
        }
    }
    Ok(())
}

/// First and last values of the time column of an OpenSim storage (.sto)
/// file. The header runs up to an `endheader` line, followed by one column
/// label row and then the data rows.
fn read_time_range(states_file: &Path) -> Result<(f64, f64), JobError> {
    let text = fs::read_to_string(states_file).map_err(|e| JobError::Io {
        detail: format!("{}: {}", states_file.display(), e),
    })?;

    let mut saw_endheader = false;
    let mut saw_columns = false;
    let mut first = None;
    let mut last = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if !saw_endheader {
            if trimmed.eq_ignore_ascii_case("endheader") {
                saw_endheader = true;
            }
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if !saw_columns {
            saw_columns = true;
            continue;
        }
        let token = match trimmed.split_whitespace().next() {
            Some(t) => t,
            None => continue,
        };
        let t: f64 = token.parse().map_err(|_| JobError::MalformedStorage {
            path: states_file.to_path_buf(),
            detail: format!("time value '{}' is not numeric", token),
        })?;
        if first.is_none() {
            first = Some(t);
        }
        last = Some(t);
    }

    if !saw_endheader {
        return Err(JobError::MalformedStorage {
            path: states_file.to_path_buf(),
            detail: "missing endheader line".to_string(),
        });
    }
    match (first, last) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(JobError::MalformedStorage {
            path: states_file.to_path_buf(),
            detail: "no data rows after endheader".to_string(),
        }),
    }
}

fn render_setup(
    template: &str,
    job: &AnalysisJob,
    tool_name: &str,
    initial_time: f64,
    final_time: f64,
) -> String {
    template
        .replace("MODEL_FILE", &job.model_file.display().to_string())
        .replace("STATES_FILE", &job.states_file.display().to_string())
        .replace(
            "ACTIVATION_FILE",
            &job.activation_file.display().to_string(),
        )
        .replace("RESULTS_DIRECTORY", &job.results_dir.display().to_string())
        .replace("INITIAL_TIME", &initial_time.to_string())
        .replace("FINAL_TIME", &final_time.to_string())
        .replace("TRIAL_NAME", tool_name)
}

fn invoke_opensim(
    command: &[String],
    setup_path: &Path,
    results_dir: &Path,
    tool_name: &str,
) -> Result<(), JobError> {
    let program = command.first().ok_or_else(|| JobError::Io {
        detail: "empty opensim command".to_string(),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(&command[1..]);
    cmd.arg(setup_path);
    cmd.current_dir(results_dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().map_err(|e| JobError::ExternalTool {
        status: "spawn_failed".to_string(),
        detail: format!("{}: {}", program, e),
    })?;

    let mut log = Vec::new();
    log.extend_from_slice(&output.stdout);
    log.extend_from_slice(&output.stderr);
    atomic_write_bytes(&results_dir.join(format!("{}.log", tool_name)), &log).map_err(|e| {
        JobError::Io {
            detail: e.to_string(),
        }
    })?;

    if output.status.success() {
        Ok(())
    } else {
        let status = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = last_nonempty_line(&output.stderr)
            .unwrap_or_else(|| "external tool exited without diagnostics".to_string());
        Err(JobError::ExternalTool { status, detail })
    }
}

fn last_nonempty_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
}

fn write_resolved_batch(batch: &ResolvedBatch) -> Result<()> {
    let payload = resolved_batch_json(batch);
    atomic_write_json_pretty(&batch.output_root.join(RESOLVED_FILE), &payload)?;
    let digest = sha256_bytes(&serde_json::to_vec(&payload)?);
    atomic_write_bytes(
        &batch.output_root.join("resolved_batch.digest"),
        digest.as_bytes(),
    )?;
    Ok(())
}

fn resolved_batch_json(batch: &ResolvedBatch) -> Value {
    let subject_json = |list: &[SubjectEntry]| -> Vec<Value> {
        list.iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "trials": s.trials,
                    "model": s.model_file_name(),
                })
            })
            .collect()
    };
    json!({
        "schema_version": "jra_batch_v1",
        "batch_id": batch.batch_id,
        "root_dir": batch.root_dir.display().to_string(),
        "output_root": batch.output_root.display().to_string(),
        "setup_template": batch.setup_template.display().to_string(),
        "opensim_command": batch.opensim_command,
        "subjects": {
            "measured": subject_json(&batch.measured),
            "static_optimization": subject_json(&batch.static_optimization),
        },
    })
}

fn write_batch_summary(report: &BatchReport) -> Result<()> {
    let jobs: Vec<Value> = report.records.iter().map(job_record_json).collect();
    let payload = json!({
        "schema_version": "jra_batch_summary_v1",
        "batch_id": report.batch_id,
        "started_at": report.started_at,
        "finished_at": report.finished_at,
        "succeeded": report.succeeded(),
        "failed": report.failed(),
        "jobs": jobs,
    });
    atomic_write_json_pretty(&report.summary_path(), &payload)
}

fn job_record_json(record: &JobRecord) -> Value {
    json!({
        "subject_id": record.subject_id,
        "trial_id": record.trial_id,
        "activation_mode": record.mode.as_str(),
        "status": record.status.as_str(),
        "error_kind": record.error.as_ref().map(|e| e.kind()),
        "error": record.error.as_ref().map(|e| e.to_string()),
        "results_dir": record.results_dir.display().to_string(),
        "setup_digest": record.setup_digest,
    })
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("cannot create {}", path.display()))
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
