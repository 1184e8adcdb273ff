use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acido_core::cloud::{ArmClient, CloudProvider};
use acido_core::config::Config;
use acido_core::fleet::{FleetController, FleetInput, FleetRequest, FleetResult};
use acido_core::network::NetworkStackManager;
use clap::{Parser, Subcommand, command};
use eyre::{Result, eyre};
use log::warn;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "acido")]
#[command(about = "Distributes a scanning workload across throwaway cloud containers", long_about = None)]
struct Cli {
    /// Suppress the aggregate report on stdout
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactively write ~/.acido/config.json
    Configure,
    /// Build and push a task image via the external builder tool
    Create {
        /// Base image reference (OCI name or git+https://...[@ref])
        image_ref: String,
        /// Extra packages to install into the image
        #[arg(long)]
        install: Vec<String>,
        #[arg(long)]
        entrypoint: Option<String>,
        #[arg(long)]
        cmd: Option<String>,
        /// Build the image to run as root
        #[arg(long)]
        root: bool,
    },
    /// Split an input file across N containers and collect their logs
    Fleet {
        name: String,
        #[arg(short = 'n', long, default_value_t = 1)]
        num_instances: usize,
        #[arg(long, alias = "im")]
        image: String,
        #[arg(short = 't', long)]
        task: String,
        #[arg(short = 'i', long)]
        input_file: PathBuf,
        /// Per-instance wait budget in seconds; unset waits forever
        #[arg(short = 'w', long)]
        wait: Option<u64>,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        rm_when_done: bool,
        #[arg(long = "region")]
        regions: Vec<String>,
    },
    /// Run a single ephemeral container
    Run {
        name: String,
        #[arg(long, alias = "im")]
        image: String,
        #[arg(short = 't', long)]
        task: String,
        #[arg(short = 'w', long, default_value_t = 900)]
        wait: u64,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        rm_when_done: bool,
        #[arg(long = "region")]
        regions: Vec<String>,
    },
    /// List container groups in the resource group
    Ls,
    /// Remove every group matching a glob pattern
    Rm { pattern: String },
    /// Manage shared-egress network stacks
    Ip {
        #[command(subcommand)]
        command: IpCommands,
    },
    /// Remember a group-name pattern and show what it matches
    Select { pattern: String },
}

#[derive(Debug, Subcommand)]
enum IpCommands {
    /// Create a network stack and print its egress IP
    Create {
        name: String,
        #[arg(long)]
        region: Option<String>,
    },
    /// List public IPs
    Ls,
    /// Destroy a network stack
    Rm { name: String },
    /// Attach future fleets to the named stack
    Select { name: String },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    _ = dotenvy::dotenv();

    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            _ = e.print();
            std::process::exit(code);
        }
    };

    let code = match dispatch(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:?}");
            1
        }
    };
    std::process::exit(code);
}

fn interrupt_token() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let copy = cancel.clone();
    ctrlc::set_handler(move || {
        copy.cancel();
    })?;
    Ok(cancel)
}

fn controller(config: &Config) -> Result<(Arc<dyn CloudProvider>, FleetController)> {
    let cloud: Arc<dyn CloudProvider> = Arc::new(ArmClient::new(config.clone())?);
    let controller = FleetController::new(cloud.clone(), config.clone());
    Ok((cloud, controller))
}

fn finish_fleet(
    result: acido_core::Result<FleetResult>,
    quiet: bool,
) -> Result<i32> {
    let result = match result {
        Ok(r) => r,
        // nothing was provisioned; the shards never landed
        Err(e @ acido_core::Error::ShardUpload(_)) => {
            eprintln!("error: {e}");
            return Ok(2);
        }
        Err(e) => return Err(e.into()),
    };
    if !quiet {
        print!("{}", result.report);
    }
    for instance in &result.instances {
        eprintln!(
            "{}: {}",
            instance.name,
            status_label(instance.status, instance.error.as_deref())
        );
    }
    for e in &result.teardown_errors {
        eprintln!("teardown: {e}");
    }
    Ok(result.exit_code())
}

fn status_label(
    status: acido_core::aggregate::InstanceStatus,
    error: Option<&str>,
) -> String {
    use acido_core::aggregate::InstanceStatus::*;
    let base = match status {
        Succeeded => "succeeded",
        Failed => "failed",
        TimedOut => "timed_out",
        Unprovisioned => "unprovisioned",
    };
    match error {
        Some(class) => format!("{base} ({class})"),
        None => base.to_owned(),
    }
}

async fn dispatch(args: Cli) -> Result<i32> {
    match args.command {
        Commands::Configure => {
            let mut rl = DefaultEditor::new()?;
            let mut cfg = Config::load().unwrap_or_default();

            cfg.subscription_id = prompt(&mut rl, "Subscription id", &cfg.subscription_id)?;
            cfg.resource_group = prompt(&mut rl, "Resource group", &cfg.resource_group)?;
            cfg.tenant_id = prompt_opt(&mut rl, "Tenant id", cfg.tenant_id.take())?;
            cfg.client_id = prompt_opt(&mut rl, "Client id", cfg.client_id.take())?;
            cfg.client_secret = prompt_opt(&mut rl, "Client secret", cfg.client_secret.take())?;
            cfg.managed_identity =
                prompt_opt(&mut rl, "Managed identity id", cfg.managed_identity.take())?;
            cfg.storage_account = prompt(&mut rl, "Storage account", &cfg.storage_account)?;
            cfg.storage_sas = prompt(&mut rl, "Storage SAS token", &cfg.storage_sas)?;

            let server = prompt_opt(
                &mut rl,
                "Registry server",
                cfg.registry.as_ref().map(|r| r.server.clone()),
            )?;
            cfg.registry = match server {
                Some(server) => Some(acido_core::config::RegistryConfig {
                    server,
                    username: prompt(
                        &mut rl,
                        "Registry username",
                        cfg.registry.as_ref().map(|r| r.username.as_str()).unwrap_or(""),
                    )?,
                    password: prompt(
                        &mut rl,
                        "Registry password",
                        cfg.registry.as_ref().map(|r| r.password.as_str()).unwrap_or(""),
                    )?,
                }),
                None => None,
            };
            cfg.default_region = prompt_opt(
                &mut rl,
                "Default region",
                cfg.default_region.take(),
            )?;

            cfg.save()?;
            println!("Wrote {}", Config::path().display());
            Ok(0)
        }

        Commands::Create {
            image_ref,
            install,
            entrypoint,
            cmd,
            root,
        } => {
            let cfg = Config::load()?;
            let builder = cfg.builder.clone().unwrap_or_else(|| "acido-build".to_owned());

            // the builder is an opaque tool; pass everything as argv, never
            // through a shell
            let mut command = tokio::process::Command::new(&builder);
            command.arg(&image_ref);
            for pkg in &install {
                command.arg("--install").arg(pkg);
            }
            if let Some(ep) = &entrypoint {
                command.arg("--entrypoint").arg(ep);
            }
            if let Some(c) = &cmd {
                command.arg("--cmd").arg(c);
            }
            if root {
                command.arg("--root");
            }
            let status = command
                .status()
                .await
                .map_err(|e| eyre!("could not spawn {builder}: {e}"))?;
            Ok(if status.success() { 0 } else { 2 })
        }

        Commands::Fleet {
            name,
            num_instances,
            image,
            task,
            input_file,
            wait,
            output,
            rm_when_done,
            regions,
        } => {
            let cfg = Config::load()?;
            let (_, controller) = controller(&cfg)?;
            let cancel = interrupt_token()?;

            let result = controller
                .fleet(
                    FleetRequest {
                        name,
                        instances: num_instances,
                        image,
                        task,
                        input: FleetInput::File(input_file),
                        regions,
                        wait: wait.map(Duration::from_secs),
                        remove_when_done: rm_when_done,
                        output,
                    },
                    cancel,
                )
                .await;
            finish_fleet(result, args.quiet)
        }

        Commands::Run {
            name,
            image,
            task,
            wait,
            rm_when_done,
            regions,
        } => {
            let cfg = Config::load()?;
            let (_, controller) = controller(&cfg)?;
            let cancel = interrupt_token()?;

            let result = controller
                .run(
                    &name,
                    &image,
                    &task,
                    Duration::from_secs(wait),
                    rm_when_done,
                    regions,
                    cancel,
                )
                .await;
            finish_fleet(result, args.quiet)
        }

        Commands::Ls => {
            let cfg = Config::load()?;
            let (_, controller) = controller(&cfg)?;
            for group in controller.list().await? {
                println!(
                    "{}\t{}\t{}\t{} instance(s)",
                    group.name,
                    group.region,
                    group.state,
                    group.instances.len()
                );
                for instance in &group.instances {
                    println!("  {instance}");
                }
            }
            Ok(0)
        }

        Commands::Rm { pattern } => {
            let cfg = Config::load()?;
            let (_, controller) = controller(&cfg)?;
            let removed = controller.remove(&pattern).await?;
            for name in &removed {
                println!("removed {name}");
            }
            if removed.is_empty() {
                warn!("nothing matched {pattern}");
            }
            Ok(0)
        }

        Commands::Ip { command } => ip_command(command).await,

        Commands::Select { pattern } => {
            let mut cfg = Config::load()?;
            let (_, controller) = controller(&cfg)?;
            let pat = glob::Pattern::new(&pattern).map_err(|e| eyre!("bad pattern: {e}"))?;
            for group in controller.list().await? {
                if pat.matches(&group.name) {
                    println!("{}", group.name);
                }
            }
            cfg.selected_pattern = Some(pattern);
            cfg.save()?;
            Ok(0)
        }
    }
}

async fn ip_command(command: IpCommands) -> Result<i32> {
    let mut cfg = Config::load()?;
    let cloud: Arc<dyn CloudProvider> = Arc::new(ArmClient::new(cfg.clone())?);
    let stacks = NetworkStackManager::new(cloud.clone());

    match command {
        IpCommands::Create { name, region } => {
            let region = match region {
                Some(r) => cfg.resolve_regions(&[r])?.remove(0),
                None => cfg.resolve_regions(&[])?.remove(0),
            };
            let ip = stacks.create(&name, &region).await?;
            println!(
                "{} -> {}",
                name,
                ip.address.as_deref().unwrap_or("(pending)")
            );
            Ok(0)
        }
        IpCommands::Ls => {
            for ip in cloud.list_public_ips().await? {
                println!(
                    "{}\t{}\t{}",
                    ip.name,
                    ip.region,
                    ip.address.as_deref().unwrap_or("-")
                );
            }
            Ok(0)
        }
        IpCommands::Rm { name } => {
            stacks.destroy(&name).await?;
            println!("destroyed {name}");
            Ok(0)
        }
        IpCommands::Select { name } => {
            if stacks.get_ip(&name).await?.is_none() {
                return Err(eyre!("no network stack named {name}"));
            }
            cfg.selected_stack = Some(name.clone());
            cfg.save()?;
            println!("fleets will attach to {name}");
            Ok(0)
        }
    }
}

fn prompt(rl: &mut DefaultEditor, label: &str, current: &str) -> Result<String> {
    let line = rl.readline(&format!("{label} [{current}]: "))?;
    let line = line.trim();
    Ok(if line.is_empty() {
        current.to_owned()
    } else {
        line.to_owned()
    })
}

fn prompt_opt(
    rl: &mut DefaultEditor,
    label: &str,
    current: Option<String>,
) -> Result<Option<String>> {
    let shown = current.as_deref().unwrap_or("");
    let line = rl.readline(&format!("{label} [{shown}]: "))?;
    let line = line.trim();
    Ok(if line.is_empty() {
        current
    } else if line == "-" {
        None
    } else {
        Some(line.to_owned())
    })
}
