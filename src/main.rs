use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use fleetctl::api::{Device, DeviceUpdate, GroupUpdate, NewDevice, NewGroup};
use fleetctl::cli::{self, session};
use fleetctl::config::{self, AppConfig};
use fleetctl::context::AppContext;
use fleetctl::core::Directory;
use fleetctl::logging::{self, LogConfig};

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Batch control for a fleet of Android devices", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

/// Options that override the configuration file and environment.
#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Use the in-memory demo fleet instead of the API
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(short, long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    page_size: Option<u32>,

    #[serde(skip_serializing_if = "ApiArgs::is_empty")]
    #[command(flatten)]
    api: ApiArgs,
}

#[derive(Args, Serialize)]
struct ApiArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
}

impl ApiArgs {
    fn is_empty(&self) -> bool {
        self.base_url.is_none() && self.token.is_none() && self.timeout_secs.is_none()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Browse and edit devices
    #[command(subcommand)]
    Devices(DeviceCommand),
    /// Browse and edit groups
    #[command(subcommand)]
    Groups(GroupCommand),
    /// Screen mirroring
    #[command(subcommand)]
    Mirror(MirrorCommand),
    /// Run one shell command on many devices
    Shell {
        command: String,
        #[command(flatten)]
        targets: Targets,
    },
    /// Install, remove and list packages
    #[command(subcommand)]
    Packages(PackageCommand),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum DeviceCommand {
    List {
        #[arg(short, long)]
        keyword: Option<String>,
        #[arg(short, long)]
        group: Option<String>,
        #[arg(short, long, default_value_t = 1)]
        page: u32,
    },
    Show {
        id: String,
    },
    Create {
        name: String,
        #[arg(long)]
        serial: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        remark: Option<String>,
    },
    Update {
        /// Device ids; more than one updates them all
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        remark: Option<String>,
    },
    /// Move devices into a group
    Assign {
        group: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum GroupCommand {
    List,
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum MirrorCommand {
    /// Start mirroring and control the batch from stdin
    Session {
        #[command(flatten)]
        targets: Targets,
    },
}

#[derive(Subcommand)]
enum PackageCommand {
    List {
        device: String,
    },
    Install {
        url: String,
        #[command(flatten)]
        targets: Targets,
    },
    Uninstall {
        package: String,
        #[command(flatten)]
        targets: Targets,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a default configuration file
    Init,
    /// Print the effective configuration
    Show,
}

/// Which devices a batch command applies to.
#[derive(Args)]
struct Targets {
    #[arg(short, long = "device", num_args = 1..)]
    devices: Vec<String>,
    #[arg(short, long)]
    group: Option<String>,
    #[arg(long, conflicts_with_all = ["devices", "group"])]
    all: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(Some(&cli.global))?;
    logging::init(LogConfig::from(&config));

    match cli.command {
        Commands::Config(command) => run_config(&command, &config)?,
        Commands::Devices(command) => run_devices(&connect(config)?, command)
            .await
            .context("Device command failed")?,
        Commands::Groups(command) => run_groups(&connect(config)?, command)
            .await
            .context("Group command failed")?,
        Commands::Mirror(MirrorCommand::Session { targets }) => {
            let ctx = connect(config)?;
            let devices = resolve_targets(&ctx, &targets).await?;
            session::run(ctx.mirror(), devices)
                .await
                .context("Mirroring session failed")?
        }
        Commands::Shell { command, targets } => {
            let ctx = connect(config)?;
            let devices = resolve_targets(&ctx, &targets).await?;
            let shell = ctx.shell();
            let summary = shell.execute(&devices, &command).await?;
            cli::print_records(&shell.records().await, &summary);
        }
        Commands::Packages(command) => run_packages(&connect(config)?, command)
            .await
            .context("Package command failed")?,
    }

    Ok(())
}

/// Build the API client. `config` subcommands run without one.
fn connect(config: AppConfig) -> Result<AppContext> {
    AppContext::new(config).context("Failed to create device-control client")
}

fn run_config(command: &ConfigCommand, config: &AppConfig) -> Result<()> {
    match command {
        ConfigCommand::Init => {
            let path = config::config_path();
            AppConfig::default().write_new(&path)?;
            println!("wrote {}", path.display());
        }
        ConfigCommand::Show => print!("{}", config.to_toml()?),
    }
    Ok(())
}

async fn run_devices(ctx: &AppContext, command: DeviceCommand) -> Result<()> {
    let mut directory = ctx.directory();

    match command {
        DeviceCommand::List {
            keyword,
            group,
            page,
        } => {
            directory.set_keyword(keyword.as_deref()).await?;
            directory.set_group_filter(group.as_deref()).await?;
            if page > 1 {
                directory.set_page(page).await?;
            }
            cli::print_device_page(directory.page());
        }
        DeviceCommand::Show { id } => {
            let device = find_device(&directory, &id).await?;
            cli::print_device(&device)?;
        }
        DeviceCommand::Create {
            name,
            serial,
            group,
            ip,
            model,
            remark,
        } => {
            directory
                .create_device(&NewDevice {
                    name,
                    serial,
                    group_id: group,
                    ip,
                    model,
                    remark,
                })
                .await?;
            println!("created; {} devices in total", directory.page().total);
        }
        DeviceCommand::Update {
            ids,
            name,
            ip,
            model,
            remark,
        } => {
            let update = DeviceUpdate {
                name,
                group_id: None,
                ip,
                model,
                remark,
            };
            if let [id] = ids.as_slice() {
                directory.update_device(id, &update).await?;
            } else {
                directory.batch_update(&ids, &update).await?;
            }
            println!("updated {} device(s)", ids.len());
        }
        DeviceCommand::Assign { group, ids } => {
            directory.batch_assign_group(&ids, &group).await?;
            println!("moved {} device(s) to {group}", ids.len());
        }
        DeviceCommand::Delete { id } => {
            directory.delete_device(&id).await?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

async fn run_groups(ctx: &AppContext, command: GroupCommand) -> Result<()> {
    let mut directory = ctx.directory();

    match command {
        GroupCommand::List => {
            directory.refresh().await?;
            cli::print_groups(directory.groups());
        }
        GroupCommand::Create { name, description } => {
            directory
                .create_group(&NewGroup { name, description })
                .await?;
            cli::print_groups(directory.groups());
        }
        GroupCommand::Update {
            id,
            name,
            description,
        } => {
            directory
                .update_group(&id, &GroupUpdate { name, description })
                .await?;
            cli::print_groups(directory.groups());
        }
        GroupCommand::Delete { id } => {
            directory.delete_group(&id).await?;
            println!("deleted group {id}");
        }
    }
    Ok(())
}

async fn run_packages(ctx: &AppContext, command: PackageCommand) -> Result<()> {
    let packages = ctx.packages();

    let summary = match command {
        PackageCommand::List { device } => {
            cli::print_packages(&packages.list_packages(&device).await?);
            return Ok(());
        }
        PackageCommand::Install { url, targets } => {
            let devices = resolve_targets(ctx, &targets).await?;
            packages.install(&devices, &url).await?
        }
        PackageCommand::Uninstall { package, targets } => {
            let devices = resolve_targets(ctx, &targets).await?;
            packages.uninstall(&devices, &package).await?
        }
    };
    cli::print_records(&packages.records().await, &summary);
    Ok(())
}

/// Turn `--device`, `--group` or `--all` into device records, keeping the
/// order ids were given in. Unknown ids are passed through bare.
async fn resolve_targets(ctx: &AppContext, targets: &Targets) -> Result<Vec<Device>> {
    if targets.devices.is_empty() && targets.group.is_none() && !targets.all {
        bail!("select devices with --device, --group or --all");
    }

    let mut directory = ctx.directory();
    if let Some(group) = &targets.group {
        directory.set_group_filter(Some(group.as_str())).await?;
    }
    let known = directory
        .load_all()
        .await
        .context("Failed to load the device list")?;

    if targets.devices.is_empty() {
        return Ok(known);
    }

    Ok(targets
        .devices
        .iter()
        .map(|id| {
            known
                .iter()
                .find(|d| &d.id == id)
                .cloned()
                .unwrap_or_else(|| Device {
                    id: id.clone(),
                    ..Default::default()
                })
        })
        .collect())
}

async fn find_device(directory: &Directory, id: &str) -> Result<Device> {
    directory
        .load_all()
        .await?
        .into_iter()
        .find(|d| d.id == id)
        .with_context(|| format!("device {id} not found"))
}
