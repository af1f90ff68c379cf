//! Installing the collector as an OS service.
//!
//! Uses the platform's native service manager (systemd on the stations) via
//! the service-manager crate. The installed unit runs `fieldlog run`, with an
//! explicit `--config` when one was given at install time.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use service_manager::{
    RestartPolicy, ServiceInstallCtx, ServiceLabel, ServiceLevel, ServiceManager, ServiceStartCtx,
    ServiceStatusCtx, ServiceStopCtx, ServiceUninstallCtx,
};
use thiserror::Error;

/// Service label for the collector.
const SERVICE_LABEL: &str = "io.fieldlog.station";

/// Seconds the service manager waits before restarting a crashed collector.
const RESTART_DELAY_SECS: u32 = 10;

/// Errors that can occur during service management.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No service manager available on this platform")]
    NoServiceManager,

    #[error("Service manager error: {0}")]
    Manager(String),

    #[error("Could not find the fieldlog executable")]
    ExecutableNotFound,

    #[error("User-level services not supported on this platform")]
    UserLevelNotSupported,

    #[error("Invalid service label '{0}'")]
    InvalidLabel(String),
}

/// Service management level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Level {
    /// System-level service (requires root)
    #[default]
    System,
    /// User-level service
    User,
}

impl Level {
    /// Level from the `--user` flag.
    pub fn from_user_flag(user: bool) -> Self {
        if user { Self::User } else { Self::System }
    }
}

/// Service status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    NotInstalled,
    Running,
    Stopped(Option<String>),
}

fn get_manager(level: Level) -> Result<Box<dyn ServiceManager>, ServiceError> {
    let mut manager = <dyn ServiceManager>::native().map_err(|_| ServiceError::NoServiceManager)?;

    let service_level = match level {
        Level::System => ServiceLevel::System,
        Level::User => ServiceLevel::User,
    };

    manager
        .set_level(service_level)
        .map_err(|_| ServiceError::UserLevelNotSupported)?;

    Ok(manager)
}

fn get_executable_path() -> Result<PathBuf, ServiceError> {
    env::current_exe().map_err(|_| ServiceError::ExecutableNotFound)
}

fn get_label() -> Result<ServiceLabel, ServiceError> {
    SERVICE_LABEL
        .parse()
        .map_err(|_| ServiceError::InvalidLabel(SERVICE_LABEL.to_string()))
}

/// Arguments the installed service is started with.
pub fn run_args(config: Option<&Path>) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(path) = config {
        args.push(OsString::from("--config"));
        args.push(path.as_os_str().to_os_string());
    }
    args.push(OsString::from("run"));
    args
}

/// Install the collector as a service.
pub fn install(level: Level, config: Option<&Path>) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    let program = get_executable_path()?;

    manager
        .install(ServiceInstallCtx {
            label: get_label()?,
            program,
            args: run_args(config),
            contents: None,
            username: None,
            working_directory: None,
            environment: None,
            autostart: true,
            restart_policy: RestartPolicy::OnFailure {
                delay_secs: Some(RESTART_DELAY_SECS),
            },
        })
        .map_err(|e| ServiceError::Manager(e.to_string()))
}

/// Uninstall the collector service.
pub fn uninstall(level: Level) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    manager
        .uninstall(ServiceUninstallCtx { label: get_label()? })
        .map_err(|e| ServiceError::Manager(e.to_string()))
}

/// Start the collector service.
pub fn start(level: Level) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    manager
        .start(ServiceStartCtx { label: get_label()? })
        .map_err(|e| ServiceError::Manager(e.to_string()))
}

/// Stop the collector service.
pub fn stop(level: Level) -> Result<(), ServiceError> {
    let manager = get_manager(level)?;
    manager
        .stop(ServiceStopCtx { label: get_label()? })
        .map_err(|e| ServiceError::Manager(e.to_string()))
}

/// Query the collector service status.
pub fn status(level: Level) -> Result<ServiceStatus, ServiceError> {
    let manager = get_manager(level)?;
    let status = manager
        .status(ServiceStatusCtx { label: get_label()? })
        .map_err(|e| ServiceError::Manager(e.to_string()))?;

    Ok(match status {
        service_manager::ServiceStatus::NotInstalled => ServiceStatus::NotInstalled,
        service_manager::ServiceStatus::Running => ServiceStatus::Running,
        service_manager::ServiceStatus::Stopped(reason) => ServiceStatus::Stopped(reason),
    })
}
