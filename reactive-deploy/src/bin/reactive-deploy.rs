//! reactive-deploy CLI
//!
//! Commands:
//!   reactive-deploy deploy <config>   build, load and connect every module
//!   reactive-deploy call              invoke one entry point of a module

use clap::{Parser, Subcommand};
use reactive_deploy::{Config, Context, DeployOrder, Deployer, EndpointRef, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "reactive-deploy")]
#[command(about = "Deploy reactive TEE applications onto Sancus, SGX and TrustZone nodes")]
struct Args {
    /// Log every command sent to a node
    #[arg(long, global = true)]
    verbose: bool,

    /// Log subprocess command lines and print full errors
    #[arg(long, global = true)]
    debug: bool,

    /// JSON file overriding tool names and runtime settings
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy every module, then establish connections and periodic events
    Deploy {
        /// Deployment description
        config: PathBuf,

        /// Write the completed description here
        #[arg(long)]
        result: Option<PathBuf>,

        /// Deploy modules one at a time, in declaration order
        #[arg(long)]
        deploy_in_order: bool,
    },
    /// Call an entry point of a deployed module
    Call {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        module: String,

        /// Entry point name or numeric id
        #[arg(long)]
        entry: String,

        /// Argument bytes, hex encoded
        #[arg(long)]
        arg: Option<String>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if args.debug {
                eprintln!("error: {:?}", e);
            } else {
                eprintln!("error: {}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> reactive_deploy::Result<()> {
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let ctx = Arc::new(Context::system(settings)?);

    match &args.command {
        Command::Deploy {
            config,
            result,
            deploy_in_order,
        } => {
            let config = Config::load(config, ctx)?;
            let order = if *deploy_in_order {
                DeployOrder::Ordered
            } else {
                DeployOrder::Concurrent
            };
            Deployer::new(&config).install(order).await?;
            if let Some(result) = result {
                config.dump(result).await?;
            }
            Ok(())
        }
        Command::Call {
            config,
            module,
            entry,
            arg,
        } => {
            let config = Config::load(config, ctx)?;
            let arg = arg.as_deref().map(hex::decode).transpose()?;
            Deployer::new(&config)
                .call(module, &EndpointRef::parse(entry), arg.as_deref())
                .await
        }
    }
}
