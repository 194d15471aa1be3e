use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "jra",
    version = "0.1.0",
    about = "OpenSim Joint Reactions Analysis batch runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole batch; per-job failures are logged and summarized,
    /// only configuration errors abort.
    Run {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Resolve the configuration and report what would run.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a batch.yaml and JRA_Setup.xml template into the current
    /// directory.
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { config, json } => {
            let batch = jra_runner::load_batch_config(&config)?;
            let jobs = jra_runner::enumerate_jobs(&batch)?;
            let overview = jra_runner::batch_overview(&batch, &jobs);
            let report = jra_runner::run_jobs(&batch, &jobs)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "overview": overview_to_json(&overview),
                    "report": report_to_json(&report),
                })));
            }
            print_overview(&overview);
            for record in report.failed_records() {
                let kind = record
                    .error
                    .as_ref()
                    .map(|e| e.kind())
                    .unwrap_or("unknown");
                let message = record
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                println!(
                    "failed: {}/{} [{}] {}",
                    record.subject_id, record.trial_id, kind, message
                );
            }
            println!("succeeded: {}", report.succeeded());
            println!("failed: {}", report.failed());
            println!("summary: {}", report.summary_path().display());
        }
        Commands::Describe { config, json } => {
            let overview = jra_runner::describe_batch(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "overview": overview_to_json(&overview),
                })));
            }
            print_overview(&overview);
        }
        Commands::Init { force } => {
            let cwd = std::env::current_dir()?;
            write_init_file(&cwd.join("batch.yaml"), BATCH_YAML_TEMPLATE, force)?;
            write_init_file(&cwd.join("JRA_Setup.xml"), SETUP_XML_TEMPLATE, force)?;
            println!("wrote: batch.yaml");
            println!("wrote: JRA_Setup.xml");
            println!("next: edit batch.yaml \u{2014} fill in the subject lists");
            println!("next: jra describe batch.yaml");
        }
    }
    Ok(None)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Describe { json, .. } => *json,
        Commands::Init { .. } => false,
    }
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

fn overview_to_json(overview: &jra_runner::BatchOverview) -> Value {
    json!({
        "batch_id": overview.batch_id,
        "root_dir": overview.root_dir.display().to_string(),
        "output_root": overview.output_root.display().to_string(),
        "setup_template": overview.setup_template.display().to_string(),
        "opensim_command": overview.opensim_command,
        "measured_subjects": overview.measured_subjects,
        "static_optimization_subjects": overview.static_optimization_subjects,
        "total_jobs": overview.total_jobs,
    })
}

fn report_to_json(report: &jra_runner::BatchReport) -> Value {
    let jobs: Vec<Value> = report
        .records
        .iter()
        .map(|record| {
            json!({
                "subject_id": record.subject_id,
                "trial_id": record.trial_id,
                "activation_mode": record.mode.as_str(),
                "status": record.status.as_str(),
                "error_kind": record.error.as_ref().map(|e| e.kind()),
                "error": record.error.as_ref().map(|e| e.to_string()),
                "results_dir": record.results_dir.display().to_string(),
            })
        })
        .collect();
    json!({
        "batch_id": report.batch_id,
        "started_at": report.started_at,
        "finished_at": report.finished_at,
        "succeeded": report.succeeded(),
        "failed": report.failed(),
        "summary": report.summary_path().display().to_string(),
        "jobs": jobs,
    })
}

fn print_overview(overview: &jra_runner::BatchOverview) {
    println!("batch: {}", overview.batch_id);
    println!("root_dir: {}", overview.root_dir.display());
    println!("output_root: {}", overview.output_root.display());
    println!("setup_template: {}", overview.setup_template.display());
    println!("opensim_command: {:?}", overview.opensim_command);
    println!("measured_subjects: {}", overview.measured_subjects);
    println!(
        "static_optimization_subjects: {}",
        overview.static_optimization_subjects
    );
    println!("total_jobs: {}", overview.total_jobs);
}

fn write_init_file(path: &std::path::Path, content: &str, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Err(anyhow::anyhow!(format!(
            "init file already exists (use --force): {}",
            path.display()
        )));
    }
    std::fs::write(path, content)?;
    Ok(())
}

const BATCH_YAML_TEMPLATE: &str = "\
version: '0.1'
batch:
  id: ''                              # REQUIRED
  root_dir: ''                        # REQUIRED: subject data root
  output_root: results
setup:
  template: JRA_Setup.xml
  opensim_command: [opensim-cmd, run-tool]
subjects:
  # Subjects driven by measured (EMG-derived) muscle activations.
  # Expected layout per subject under root_dir:
  #   <id>/<id>.osim (override with 'model:')
  #   <id>/SO_Results/<trial>_SO_StatesReporter_states.sto
  #   <id>/EMG_Results/<trial>_measured_activation.sto
  measured: []
  # Subjects driven by Static Optimization activations. Requires a prior
  # Static Optimization run that left these files under root_dir:
  #   <id>/SO_Results/<trial>_SO_StatesReporter_states.sto
  #   <id>/SO_Results/<trial>_SO_StaticOptimization_activation.sto
  # Omit 'trials' to process every trial found in SO_Results.
  static_optimization: []
";

const SETUP_XML_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<OpenSimDocument Version="40000">
  <AnalyzeTool name="TRIAL_NAME">
    <model_file>MODEL_FILE</model_file>
    <results_directory>RESULTS_DIRECTORY</results_directory>
    <output_precision>8</output_precision>
    <initial_time>INITIAL_TIME</initial_time>
    <final_time>FINAL_TIME</final_time>
    <solve_for_equilibrium_for_auxiliary_states>false</solve_for_equilibrium_for_auxiliary_states>
    <AnalysisSet name="Analyses">
      <objects>
        <JointReaction name="JointReaction">
          <on>true</on>
          <start_time>INITIAL_TIME</start_time>
          <end_time>FINAL_TIME</end_time>
          <step_interval>1</step_interval>
          <in_degrees>true</in_degrees>
          <forces_file>ACTIVATION_FILE</forces_file>
          <joint_names>ALL</joint_names>
          <apply_on_bodies>child</apply_on_bodies>
          <express_in_frame>child</express_in_frame>
        </JointReaction>
      </objects>
      <groups />
    </AnalysisSet>
    <ControllerSet name="Controllers">
      <objects />
      <groups />
    </ControllerSet>
    <external_loads_file />
    <states_file>STATES_FILE</states_file>
    <coordinates_file />
    <speeds_file />
    <lowpass_cutoff_frequency_for_coordinates>-1</lowpass_cutoff_frequency_for_coordinates>
  </AnalyzeTool>
</OpenSimDocument>
"#;
