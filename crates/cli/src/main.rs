mod cli;
mod process;
mod state;

use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, Hash, Init, Publish, Version};

command_enum! {
    (Hash, Hash),
    (Init, Init),
    (Publish, Publish),
    (Version, Version),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // dropping the guards flushes buffered log lines
    let _guards = process::init_logging(args.log_level);

    let ctx = cli::op::OpContext::new(args.config_path);

    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            std::process::exit(0);
        }
        Err(e) => {
            tracing::debug!("command failed: {:?}", e);
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
