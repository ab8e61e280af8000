use std::env::consts::{
    ARCH, DLL_EXTENSION, DLL_PREFIX, DLL_SUFFIX, EXE_EXTENSION, EXE_SUFFIX, FAMILY, OS,
};

use anyhow::Error;
use tracing::trace;

use crate::pexels::{Logger, init_config};
use crate::program::Program;

mod pexels;
mod program;

/// Directory holding `config.toml`.
const CONFIG_DIR: &str = "./config";

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config_manager = init_config(CONFIG_DIR)?;
    let config = config_manager.get_app_config()?;

    // Held until exit so buffered log lines are flushed.
    let logger = Logger::init(&config)?;
    log_system_information();
    if let Some(log_dir) = logger.log_dir() {
        trace!("Log Directory: {}", log_dir.display());
    }

    let program = Program::new(config_manager);
    program.run().await
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("DLL_EXTENSION:  \"{}\"", DLL_EXTENSION);
    trace!("DLL_PREFIX:     \"{}\"", DLL_PREFIX);
    trace!("DLL_SUFFIX:     \"{}\"", DLL_SUFFIX);
    trace!("EXE_EXTENSION:  \"{}\"", EXE_EXTENSION);
    trace!("EXE_SUFFIX:     \"{}\"", EXE_SUFFIX);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
