use std::path::PathBuf;
use std::thread;

use clap::{Parser, Subcommand};
use log::info;

use crate::config::Config;
use crate::control::ControlStatus;
use crate::db::Database;
use crate::error::XferoError;
use crate::logging;
use crate::registry::StepRegistry;
use crate::supervisor::Supervisor;

#[derive(Parser)]
#[command(
    name = "xfero",
    version,
    about = "XFERO: managed file-transfer orchestrator"
)]
pub struct Cli {
    /// Configuration file (overrides XFERO_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the supervisor (default if no command specified)
    Run,
    /// Ask a running supervisor to drain and stop
    Stop {
        /// Wait until the supervisor reports STOPPED
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Show the control status
    Status,
    /// Print the effective configuration as TOML
    ShowConfig,
    /// Drop and recreate the configuration schema
    InitDb {
        /// Confirm that all existing configuration will be destroyed
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), XferoError> {
        let args = Cli::parse();
        let config = Config::load(args.config.as_deref())?;
        let _logger = logging::init(&config.logging)?;

        // Default to Run if no command specified
        match args.command.unwrap_or(Command::Run) {
            Command::Run => Self::run(config),
            Command::Stop { wait } => Self::stop(&config, wait),
            Command::Status => Self::status(&config),
            Command::ShowConfig => Self::show_config(&config),
            Command::InitDb { yes } => Self::init_db(&config, yes),
        }
    }

    fn run(config: Config) -> Result<(), XferoError> {
        let supervisor = Supervisor::boot(config, StepRegistry::with_defaults())?;

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| XferoError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(supervisor.run())
    }

    fn stop(config: &Config, wait: bool) -> Result<(), XferoError> {
        let db = Database::open(&config.database.db_location)?;
        db.request_stop()?;
        println!("Stop requested");

        if wait {
            while db.control_status()? != ControlStatus::Stopped {
                thread::sleep(config.engine.control_poll());
            }
            println!("Supervisor stopped");
        }
        Ok(())
    }

    fn status(config: &Config) -> Result<(), XferoError> {
        let db = Database::open(&config.database.db_location)?;
        let control = db.control()?;
        let pid = std::fs::read_to_string(&config.process.pid_file)
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|_| "-".to_owned());

        println!("status:      {}", control.status);
        println!("num_threads: {}", control.num_threads);
        println!("pid:         {}", pid);
        println!("updated_at:  {}", Self::format_updated(control.updated_at));
        Ok(())
    }

    fn show_config(config: &Config) -> Result<(), XferoError> {
        let text = toml::to_string_pretty(config)
            .map_err(|e| XferoError::Error(format!("unable to render configuration: {}", e)))?;
        print!("{}", text);
        Ok(())
    }

    fn format_updated(ts: i64) -> String {
        chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.with_timezone(&chrono::Local).to_rfc3339())
            .unwrap_or_else(|| ts.to_string())
    }

    fn init_db(config: &Config, yes: bool) -> Result<(), XferoError> {
        if !yes {
            return Err(XferoError::Error(
                "init-db destroys all configuration; pass --yes to continue".into(),
            ));
        }
        let db = Database::open_for_bootstrap(&config.database.db_location)?;
        db.bootstrap_schema()?;
        info!("Schema created at {}", db.path().display());
        println!("Schema created at {}", db.path().display());
        Ok(())
    }
}
