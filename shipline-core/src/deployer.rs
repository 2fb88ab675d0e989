use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;
use uuid::Uuid;

use crate::command::{describe, CommandExecutor, SystemCommandExecutor};
use crate::config::DeployerSettings;
use crate::pipeline::EnvironmentSpec;

#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deployment rejected: {0}")]
    Rejected(String),
    #[error("deployer not configured: {0}")]
    NotConfigured(&'static str),
}

/// Mutates real infrastructure. The orchestrator never touches infrastructure directly.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Rolls `version` out to `environment` and returns the deployment id.
    async fn deploy(
        &self,
        environment: &EnvironmentSpec,
        version: &str,
    ) -> Result<String, DeployerError>;

    /// Reverts the deployment identified by `deployment_id`, returning the id of the
    /// rollback deployment.
    async fn rollback(
        &self,
        environment: &EnvironmentSpec,
        deployment_id: &str,
    ) -> Result<String, DeployerError>;
}

/// Runs operator-provided scripts: `deploy_script <environment> <version>` and
/// `rollback_script <environment> <deployment_id>`. The last non-empty line of stdout is
/// taken as the resulting deployment id.
#[derive(Clone)]
pub struct CommandDeployer {
    deploy_script: PathBuf,
    rollback_script: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for CommandDeployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDeployer")
            .field("deploy_script", &self.deploy_script)
            .field("rollback_script", &self.rollback_script)
            .finish()
    }
}

impl CommandDeployer {
    pub fn new(
        deploy_script: PathBuf,
        rollback_script: PathBuf,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            deploy_script,
            rollback_script,
            executor,
        }
    }

    pub fn from_settings(settings: &DeployerSettings) -> Result<Self, DeployerError> {
        let deploy = settings
            .deploy_script
            .clone()
            .ok_or(DeployerError::NotConfigured("deployer.deploy_script"))?;
        let rollback = settings
            .rollback_script
            .clone()
            .ok_or(DeployerError::NotConfigured("deployer.rollback_script"))?;
        Ok(Self::new(deploy, rollback, None))
    }

    async fn run_script(
        &self,
        script: &Path,
        environment: &EnvironmentSpec,
        argument: &str,
    ) -> Result<String, DeployerError> {
        let mut command = Command::new(script);
        command
            .arg(&environment.name)
            .arg(argument)
            .env("SHIPLINE_ENVIRONMENT", &environment.name)
            .env("SHIPLINE_ORDER", environment.order.to_string());
        let output = self.executor.run(&mut command).await?;
        if !output.status.success() {
            return Err(DeployerError::CommandFailure {
                command: describe(&command),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let id = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-{}", environment.name, Uuid::new_v4().simple()));
        Ok(id)
    }
}

#[async_trait]
impl Deployer for CommandDeployer {
    async fn deploy(
        &self,
        environment: &EnvironmentSpec,
        version: &str,
    ) -> Result<String, DeployerError> {
        let id = self
            .run_script(&self.deploy_script, environment, version)
            .await?;
        info!(
            target: "pipeline.deployer",
            environment = %environment.name,
            version,
            deployment_id = %id,
            "deploy script completed"
        );
        Ok(id)
    }

    async fn rollback(
        &self,
        environment: &EnvironmentSpec,
        deployment_id: &str,
    ) -> Result<String, DeployerError> {
        let id = self
            .run_script(&self.rollback_script, environment, deployment_id)
            .await?;
        info!(
            target: "pipeline.deployer",
            environment = %environment.name,
            reverted = deployment_id,
            rollback_deployment_id = %id,
            "rollback script completed"
        );
        Ok(id)
    }
}
