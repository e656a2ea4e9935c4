use std::path::Path;
use std::process::exit;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use fibpack::config::build_config::FibCliConfiguration;
use fibpack::config::cmd::CmdArgs;
use fibpack::init;

fn main() {
    if let Err(err) = run() {
        eprintln!("{} {}", "Error:".red().bold(), err);
        for cause in err.chain().skip(1) {
            eprintln!("  {} {}", "Caused by:".red(), cause);
        }
        exit(1);
    }
}

fn run() -> Result<()> {
    let (common, target) = CmdArgs::parse().into_parts();
    init::init()?;

    let config = FibCliConfiguration::read(&common.config_file)?;
    let base_directory = common.config_file.parent().unwrap_or_else(|| Path::new("."));
    let builder = config.to_builder(base_directory)?;
    let containerizer = config.to_containerizer(target, &common.tool_name, init::event_handlers())?;

    let container = builder.containerize(&containerizer)?;
    println!("{} {}", "ImageDigest:".green(), container.image_digest);
    println!("{} {}", "ImageId:".green(), container.image_id);
    Ok(())
}
