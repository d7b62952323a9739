mod cli;
mod config;
mod control;
mod cron;
mod db;
mod error;
mod executor;
mod fs_lock;
mod logging;
mod partners;
mod patterns;
mod priorities;
mod registry;
mod route_engine;
mod routes;
mod scheduled_tasks;
mod steps;
mod supervisor;
mod task_scheduler;
mod tasks;
mod utils;
mod worker_pool;
mod workflow_items;
mod xfers;

use cli::Cli;
use log::error;

fn main() {
    if let Err(e) = Cli::handle_command_line() {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    }
}
