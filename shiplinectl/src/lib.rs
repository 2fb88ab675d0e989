use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use shipline_core::pipeline::{ExecutionRequest, RollbackRequest, StoreError};
use shipline_core::{
    load_pipeline_config, load_settings, source_from_settings, validate, CancelToken,
    CommandDeployer, DeployerError, ExecutionStatus, ExecutionStore, HealthCheckResult,
    HealthChecker, HealthStatus, MonitorError, MonitorRegistry, MonitorSnapshot, MonitorSpec,
    NotificationRouter, OrchestratorSettings, PipelineConfig, PipelineError, PipelineExecution,
    PipelineOrchestrator, RollbackRecord, RollbackStatus, SqliteExecutionStore, TriggerType,
    UpdateType,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] shipline_core::ConfigError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("deployer error: {0}")]
    Deployer(#[from] DeployerError),
    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("execution {execution_id} finished as {status}")]
    Unsuccessful {
        execution_id: String,
        status: ExecutionStatus,
    },
    #[error("{0}")]
    Unhealthy(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Shipline deployment pipeline control", long_about = None)]
pub struct Cli {
    /// Path to the orchestrator settings file
    #[arg(long, default_value = "configs/shipline.toml")]
    pub settings: PathBuf,
    /// Overrides store.path from the settings file
    #[arg(long)]
    pub store: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a pipeline file without running it
    Validate(PipelineArgs),
    /// Run a pipeline for a version
    Run(RunArgs),
    /// Approve the stage an execution is waiting on and continue
    Resume(ApprovalArgs),
    /// Decline the stage an execution is waiting on
    Reject(RejectArgs),
    /// Cancel an execution paused for approval
    Cancel(ExecutionArgs),
    /// Fail every execution whose approval window has passed
    ExpireApprovals,
    /// Revert a deployment made by an execution
    Rollback(RollbackArgs),
    /// Show one execution with its manual rollbacks
    Show(ExecutionArgs),
    /// List recent executions
    List(ListArgs),
    /// Run an environment's health checks once
    Check(EnvironmentArgs),
    /// Poll an environment's health checks for a few rounds
    Monitor(MonitorArgs),
    /// Copy the execution store to another file
    Backup(BackupArgs),
    /// Print shell completions
    Completions(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct PipelineArgs {
    /// Pipeline definition (TOML)
    pub pipeline: PathBuf,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Pipeline definition (TOML)
    pub pipeline: PathBuf,
    /// Version to deploy
    pub version: String,
    #[arg(long, value_enum, default_value_t = TriggerArg::Manual)]
    pub trigger: TriggerArg,
    #[arg(long, default_value = "shiplinectl")]
    pub triggered_by: String,
    /// Skips inference from the last successful version
    #[arg(long, value_enum)]
    pub update_type: Option<UpdateTypeArg>,
    #[arg(long)]
    pub execution_id: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TriggerArg {
    Manual,
    Automatic,
    Scheduled,
}

impl From<TriggerArg> for TriggerType {
    fn from(value: TriggerArg) -> Self {
        match value {
            TriggerArg::Manual => TriggerType::Manual,
            TriggerArg::Automatic => TriggerType::Automatic,
            TriggerArg::Scheduled => TriggerType::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UpdateTypeArg {
    Patch,
    Minor,
    Major,
}

impl From<UpdateTypeArg> for UpdateType {
    fn from(value: UpdateTypeArg) -> Self {
        match value {
            UpdateTypeArg::Patch => UpdateType::Patch,
            UpdateTypeArg::Minor => UpdateType::Minor,
            UpdateTypeArg::Major => UpdateType::Major,
        }
    }
}

#[derive(Args, Debug)]
pub struct ExecutionArgs {
    pub execution_id: String,
}

#[derive(Args, Debug)]
pub struct ApprovalArgs {
    pub execution_id: String,
    #[arg(long)]
    pub approver: String,
}

#[derive(Args, Debug)]
pub struct RejectArgs {
    pub execution_id: String,
    #[arg(long)]
    pub approver: String,
    #[arg(long)]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct RollbackArgs {
    pub execution_id: String,
    /// Deployment id recorded on the stage to revert
    #[arg(long)]
    pub deployment: String,
    #[arg(long)]
    pub reason: String,
    #[arg(long, default_value = "shiplinectl")]
    pub requested_by: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long)]
    pub pipeline: Option<String>,
    /// Filter by status (running, pending_approval, succeeded, failed, cancelled)
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct EnvironmentArgs {
    /// Pipeline definition (TOML)
    pub pipeline: PathBuf,
    pub environment: String,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Pipeline definition (TOML)
    pub pipeline: PathBuf,
    pub environment: String,
    #[arg(long, default_value_t = 30)]
    pub interval_seconds: u64,
    #[arg(long, default_value_t = 3)]
    pub rounds: u32,
}

#[derive(Args, Debug)]
pub struct BackupArgs {
    pub destination: PathBuf,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "shiplinectl", &mut io::stdout());
        return Ok(());
    }
    if let Commands::Validate(args) = &cli.command {
        let report = validate_pipeline(&args.pipeline)?;
        render(&report, cli.format)?;
        if !report.valid {
            return Err(AppError::InvalidArgument(format!(
                "{} is not a valid pipeline",
                args.pipeline.display()
            )));
        }
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let execution = context.run_pipeline(args).await?;
            render(&execution, cli.format)?;
            ensure_not_failed(&execution)?;
        }
        Commands::Resume(args) => {
            let execution = context
                .orchestrator()?
                .resume(&args.execution_id, &args.approver)
                .await?;
            render(&execution, cli.format)?;
            ensure_not_failed(&execution)?;
        }
        Commands::Reject(args) => {
            let execution = context
                .orchestrator()?
                .reject(&args.execution_id, &args.approver, &args.reason)
                .await?;
            render(&execution, cli.format)?;
        }
        Commands::Cancel(args) => {
            let orchestrator = context.orchestrator()?;
            orchestrator.cancel(&args.execution_id).await?;
            render(&orchestrator.get(&args.execution_id)?, cli.format)?;
        }
        Commands::ExpireApprovals => {
            let expired = context.orchestrator()?.expire_stale_approvals().await?;
            render(&ExpiredApprovals { expired }, cli.format)?;
        }
        Commands::Rollback(args) => {
            let record = context.rollback(args).await?;
            render(&record, cli.format)?;
            if record.status == RollbackStatus::Failed {
                return Err(AppError::Unhealthy(format!(
                    "rollback of {} failed after {} attempt(s)",
                    record.target_deployment_id, record.attempts
                )));
            }
        }
        Commands::Show(args) => {
            let detail = context.show(&args.execution_id)?;
            render(&detail, cli.format)?;
        }
        Commands::List(args) => {
            let list = context.list(args)?;
            render(&list, cli.format)?;
        }
        Commands::Check(args) => {
            let report = context.check(args).await?;
            render(&report, cli.format)?;
            report.ensure_healthy()?;
        }
        Commands::Monitor(args) => {
            let snapshot = context.monitor(args).await?;
            render(&snapshot, cli.format)?;
        }
        Commands::Backup(args) => {
            let result = context.backup(&args.destination)?;
            render(&result, cli.format)?;
        }
        Commands::Validate(_) | Commands::Completions(_) => {}
    }

    Ok(())
}

fn ensure_not_failed(execution: &PipelineExecution) -> Result<()> {
    match execution.status {
        ExecutionStatus::Failed | ExecutionStatus::Cancelled => Err(AppError::Unsuccessful {
            execution_id: execution.execution_id.clone(),
            status: execution.status,
        }),
        _ => Ok(()),
    }
}

fn validate_pipeline(path: &Path) -> Result<ValidationReport> {
    let config = load_pipeline_config(path)?;
    let (valid, issues) = match validate(&config) {
        Ok(()) => (true, Vec::new()),
        Err(err) => (
            false,
            err.issues.iter().map(|issue| issue.to_string()).collect(),
        ),
    };
    let environments = config
        .ordered_environments()
        .iter()
        .map(|env| env.name.clone())
        .collect();
    Ok(ValidationReport {
        pipeline: config.name,
        revision: config.revision,
        environments,
        valid,
        issues,
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    settings: OrchestratorSettings,
    store: Arc<SqliteExecutionStore>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let settings = load_settings(&cli.settings)?;
        let store_path = cli
            .store
            .clone()
            .unwrap_or_else(|| settings.store.path.clone());
        if let Some(parent) = store_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = SqliteExecutionStore::new(&store_path)?;
        store.initialize()?;
        Ok(Self {
            settings,
            store: Arc::new(store),
        })
    }

    fn orchestrator(&self) -> Result<PipelineOrchestrator> {
        let deployer = CommandDeployer::from_settings(&self.settings.deployer)?;
        let metrics = source_from_settings(&self.settings.metrics)?;
        let notifier = NotificationRouter::from_settings(&self.settings.notifications)?;
        let orchestrator = PipelineOrchestrator::builder()
            .store(self.store.clone())
            .deployer(Arc::new(deployer))
            .metrics(metrics)
            .notifier(Arc::new(notifier))
            .with_settings(&self.settings)
            .build()?;
        Ok(orchestrator)
    }

    async fn run_pipeline(&self, args: &RunArgs) -> Result<PipelineExecution> {
        let config = load_pipeline_config(&args.pipeline)?;
        let mut request =
            ExecutionRequest::new(&args.version, args.trigger.into(), &args.triggered_by);
        if let Some(update_type) = args.update_type {
            request = request.with_update_type(update_type.into());
        }
        if let Some(execution_id) = &args.execution_id {
            request = request.with_execution_id(execution_id);
        }
        Ok(self.orchestrator()?.execute(&config, request).await?)
    }

    async fn rollback(&self, args: &RollbackArgs) -> Result<RollbackRecord> {
        let record = self
            .orchestrator()?
            .request_rollback(RollbackRequest {
                execution_id: args.execution_id.clone(),
                target_deployment_id: args.deployment.clone(),
                reason: args.reason.clone(),
                requested_by: args.requested_by.clone(),
            })
            .await?;
        Ok(record)
    }

    fn show(&self, execution_id: &str) -> Result<ExecutionDetail> {
        let execution = self
            .store
            .load(execution_id)?
            .ok_or_else(|| PipelineError::NotFound {
                execution_id: execution_id.to_string(),
            })?;
        let rollbacks = self.store.rollbacks(execution_id)?;
        Ok(ExecutionDetail {
            execution,
            rollbacks,
        })
    }

    fn list(&self, args: &ListArgs) -> Result<ExecutionList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<ExecutionStatus>)
            .transpose()
            .map_err(AppError::InvalidArgument)?;
        let rows = self
            .store
            .list(args.pipeline.as_deref(), status, args.limit)?;
        Ok(ExecutionList { rows })
    }

    async fn check(&self, args: &EnvironmentArgs) -> Result<HealthReport> {
        let config = load_pipeline_config(&args.pipeline)?;
        let environment = find_environment(&config, &args.environment)?;
        let results = HealthChecker::default()
            .run_all(&environment.health_checks, None, &CancelToken::new())
            .await;
        Ok(HealthReport {
            environment: environment.name.clone(),
            results,
        })
    }

    async fn monitor(&self, args: &MonitorArgs) -> Result<MonitorSnapshot> {
        if args.rounds == 0 {
            return Err(AppError::InvalidArgument(
                "rounds must be at least 1".into(),
            ));
        }
        let config = load_pipeline_config(&args.pipeline)?;
        let environment = find_environment(&config, &args.environment)?;
        let tenant = format!("{}/{}", config.name, environment.name);
        let interval = Duration::from_secs(args.interval_seconds);
        let registry = MonitorRegistry::new(HealthChecker::default());
        registry.start(
            &tenant,
            MonitorSpec {
                checks: environment.health_checks.clone(),
                interval,
            },
        )?;

        // the first round fires immediately; give the last one a moment to finish
        tokio::time::sleep(interval * (args.rounds - 1) + Duration::from_millis(500)).await;
        let snapshot = registry.latest(&tenant);
        registry.stop(&tenant)?;
        snapshot.ok_or_else(|| {
            AppError::Unhealthy(format!("no monitoring round completed for {tenant}"))
        })
    }

    fn backup(&self, destination: &Path) -> Result<BackupResult> {
        self.store.backup_to(destination)?;
        Ok(BackupResult {
            source: self.store.path().to_path_buf(),
            destination: destination.to_path_buf(),
        })
    }
}

fn find_environment<'a>(
    config: &'a PipelineConfig,
    name: &str,
) -> Result<&'a shipline_core::EnvironmentSpec> {
    config.environment(name).ok_or_else(|| {
        AppError::InvalidArgument(format!(
            "environment {name} is not part of pipeline {}",
            config.name
        ))
    })
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub pipeline: String,
    pub revision: u32,
    pub environments: Vec<String>,
    pub valid: bool,
    pub issues: Vec<String>,
}

impl DisplayFallback for ValidationReport {
    fn display(&self) -> String {
        if self.valid {
            return format!(
                "{} r{} is valid: {}",
                self.pipeline,
                self.revision,
                self.environments.join(" -> ")
            );
        }
        let mut lines = vec![format!("{} r{} is invalid:", self.pipeline, self.revision)];
        for issue in &self.issues {
            lines.push(format!("  - {issue}"));
        }
        lines.join("\n")
    }
}

impl DisplayFallback for PipelineExecution {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "{} {} {} ({}) status={}",
            self.execution_id, self.config_ref, self.version, self.update_type, self.status
        )];
        if self.status == ExecutionStatus::PendingApproval {
            lines.push(format!(
                "  waiting for approval of {}",
                self.current_stage.as_deref().unwrap_or("-")
            ));
        }
        for stage in &self.stages {
            let mut line = format!(
                "  [{}] {} attempt={} deployment={}",
                stage.status,
                stage.environment,
                stage.attempt,
                stage.deployment_id().unwrap_or("-")
            );
            if let Some(reason) = stage.failure_reason {
                line.push_str(&format!(" reason={reason}"));
            }
            if let Some(rollback) = &stage.rollback_deployment_id {
                line.push_str(&format!(" rollback={rollback}"));
            }
            if let Some(approver) = &stage.approved_by {
                line.push_str(&format!(" approved_by={approver}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    pub execution: PipelineExecution,
    pub rollbacks: Vec<RollbackRecord>,
}

impl DisplayFallback for ExecutionDetail {
    fn display(&self) -> String {
        let mut text = self.execution.display();
        for record in &self.rollbacks {
            text.push('\n');
            text.push_str(&record.display());
        }
        text
    }
}

impl DisplayFallback for RollbackRecord {
    fn display(&self) -> String {
        format!(
            "rollback {} of {} in {}: {} after {} attempt(s) ({})",
            self.rollback_id,
            self.target_deployment_id,
            self.environment,
            self.status.as_str(),
            self.attempts,
            self.rollback_deployment_id
                .as_deref()
                .or(self.error.as_deref())
                .unwrap_or("-")
        )
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionList {
    pub rows: Vec<PipelineExecution>,
}

impl DisplayFallback for ExecutionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no executions found".to_string();
        }
        self.rows
            .iter()
            .map(|execution| {
                format!(
                    "{} | {} | {} | status={} | stage={} | started={}",
                    execution.execution_id,
                    execution.config_ref,
                    execution.version,
                    execution.status,
                    execution.current_stage.as_deref().unwrap_or("-"),
                    execution.start_time.to_rfc3339()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub environment: String,
    pub results: Vec<HealthCheckResult>,
}

impl HealthReport {
    fn ensure_healthy(&self) -> Result<()> {
        let failing = self
            .results
            .iter()
            .filter(|result| result.status != HealthStatus::Pass)
            .count();
        if failing > 0 {
            return Err(AppError::Unhealthy(format!(
                "{failing} health check(s) did not pass in {}",
                self.environment
            )));
        }
        Ok(())
    }
}

fn result_line(result: &HealthCheckResult) -> String {
    format!(
        "[{}] {} {}ms: {}",
        result.status, result.check_name, result.response_time_ms, result.message
    )
}

impl DisplayFallback for HealthReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("health of {}", self.environment)];
        lines.extend(self.results.iter().map(result_line));
        lines.join("\n")
    }
}

impl DisplayFallback for MonitorSnapshot {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "round {} at {} healthy={}",
            self.round,
            self.at.to_rfc3339(),
            self.healthy()
        )];
        lines.extend(self.results.iter().map(result_line));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ExpiredApprovals {
    pub expired: Vec<String>,
}

impl DisplayFallback for ExpiredApprovals {
    fn display(&self) -> String {
        if self.expired.is_empty() {
            "no stale approvals".to_string()
        } else {
            format!("expired: {}", self.expired.join(", "))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BackupResult {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl DisplayFallback for BackupResult {
    fn display(&self) -> String {
        format!(
            "copied {} to {}",
            self.source.display(),
            self.destination.display()
        )
    }
}
