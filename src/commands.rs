//! Command line front end
//!
//! Subcommands map one-to-one onto `Console` calls. Mutations can wait for
//! the refresh they schedule and print the re-fetched list.

use crate::config::{Config, Settings};
use crate::console::Console;
use crate::openstack::auth::{authenticate, KeystoneAuthParams, ProjectScope};
use crate::openstack::client::HttpClient;
use crate::openstack::dispatch::{select_backend, BackendMode};
use crate::openstack::error::ApiError;
use crate::openstack::mock::mock_session;
use crate::openstack::ops::{
    ConsoleType, CreateUserRequest, CreateVolumeParams, LaunchInstanceParams,
    NewSecurityGroupRule, PortQuery, PowerAction, RebootType, UserUpdate,
};
use crate::openstack::orchestrator::{CreateAttachRequest, RefreshEvent};
use crate::openstack::session::AuthSession;
use crate::render::{describe, print_list, print_one};
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

/// Longest `--wait` blocks for a refresh.
const WAIT_LIMIT: Duration = Duration::from_secs(30);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Authenticate against Keystone and store the session
    Login(LoginArgs),
    /// Forget the stored session
    Logout,
    /// Export or import the stored session
    #[command(subcommand)]
    Session(SessionCommand),
    /// Compute instances
    #[command(subcommand)]
    Instances(InstanceCommand),
    /// Block storage volumes
    #[command(subcommand)]
    Volumes(VolumeCommand),
    /// List networks
    Networks,
    /// List subnets
    Subnets {
        /// Only subnets of this network
        #[arg(long)]
        network: Option<String>,
    },
    /// List routers
    Routers,
    /// List ports
    Ports {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        network: Option<String>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Floating IP addresses
    #[command(subcommand)]
    FloatingIps(FloatingIpCommand),
    /// List images
    Images,
    /// List flavors
    Flavors,
    /// List key pairs
    Keypairs,
    /// Security groups and rules
    #[command(subcommand)]
    SecurityGroups(SecurityGroupCommand),
    /// Project quotas across compute, volume and network
    Quotas,
    /// Keystone users
    #[command(subcommand)]
    Users(UserCommand),
    /// List Keystone domains
    Domains,
}

#[derive(ClapArgs, Debug)]
pub struct LoginArgs {
    /// Keystone v3 URL (OS_AUTH_URL)
    #[arg(long)]
    auth_url: Option<String>,
    /// OS_USERNAME
    #[arg(short, long)]
    username: Option<String>,
    /// OS_USER_DOMAIN_NAME
    #[arg(long)]
    user_domain: Option<String>,
    /// Project name to scope to (OS_PROJECT_NAME)
    #[arg(long, conflicts_with = "project_id")]
    project: Option<String>,
    /// Project id to scope to (OS_PROJECT_ID)
    #[arg(long)]
    project_id: Option<String>,
    /// OS_PROJECT_DOMAIN_NAME
    #[arg(long)]
    project_domain: Option<String>,
    /// Read the password from the first line of stdin instead of OS_PASSWORD
    #[arg(long)]
    password_stdin: bool,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Write the session JSON to a file, or stdout
    Export { file: Option<PathBuf> },
    /// Validate and store a session JSON file
    Import { file: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum InstanceCommand {
    List,
    Show { id: String },
    Launch {
        name: String,
        #[arg(long)]
        image: String,
        #[arg(long)]
        flavor: String,
        #[arg(long)]
        key_pair: Option<String>,
        /// Security group name, repeatable
        #[arg(long = "security-group")]
        security_groups: Vec<String>,
        /// Network id, repeatable. Omit for automatic allocation.
        #[arg(long = "network")]
        networks: Vec<String>,
    },
    Delete { id: String },
    Start { id: String },
    Stop { id: String },
    Reboot {
        id: String,
        #[arg(long)]
        hard: bool,
    },
    Shelve { id: String },
    Unshelve { id: String },
    /// Remote console URL
    Console {
        id: String,
        /// novnc, spice-html5 or serial
        #[arg(long = "type", default_value = "novnc")]
        console_type: ConsoleType,
    },
    /// Action log
    Actions { id: String },
}

#[derive(ClapArgs, Debug)]
pub struct NewVolumeArgs {
    name: String,
    /// Size in GB
    #[arg(long)]
    size: u64,
    #[arg(long = "type")]
    volume_type: Option<String>,
    #[arg(long)]
    availability_zone: Option<String>,
}

impl NewVolumeArgs {
    fn params(&self) -> CreateVolumeParams {
        CreateVolumeParams {
            name: self.name.clone(),
            size: self.size,
            volume_type: self.volume_type.clone(),
            availability_zone: self.availability_zone.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum VolumeCommand {
    List,
    Create(NewVolumeArgs),
    Delete { id: String },
    Attach {
        volume: String,
        #[arg(long)]
        instance: String,
    },
    Detach {
        volume: String,
        #[arg(long)]
        instance: String,
    },
    /// Create a volume, wait until it is available, then attach it
    CreateAttach {
        #[command(flatten)]
        volume: NewVolumeArgs,
        #[arg(long)]
        instance: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum FloatingIpCommand {
    List,
    Allocate {
        /// External network to allocate from
        #[arg(long)]
        pool: String,
    },
    Release { id: String },
    Associate {
        id: String,
        #[arg(long)]
        port: String,
    },
    Disassociate { id: String },
}

#[derive(Subcommand, Debug)]
pub enum SecurityGroupCommand {
    List,
    /// Show the rules of one group
    Rules { id: String },
    Create {
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Delete { id: String },
    AddRule {
        group: String,
        #[arg(long, default_value = "ingress")]
        direction: String,
        #[arg(long, default_value = "IPv4")]
        ethertype: String,
        #[arg(long)]
        protocol: Option<String>,
        #[arg(long)]
        port_min: Option<u32>,
        #[arg(long)]
        port_max: Option<u32>,
        #[arg(long)]
        remote_ip: Option<String>,
        #[arg(long)]
        remote_group: Option<String>,
    },
    DeleteRule { id: String },
}

#[derive(Subcommand, Debug)]
pub enum UserCommand {
    List,
    Create {
        name: String,
        #[arg(long, default_value = "default")]
        domain: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Read the new user's password from stdin
        #[arg(long)]
        password_stdin: bool,
        #[arg(long)]
        disabled: bool,
    },
    Delete { id: String },
    Enable { id: String },
    Disable { id: String },
}

/// Options shared by every command.
#[derive(Debug, Clone, Copy)]
pub struct Globals {
    pub mock: bool,
    pub json: bool,
    pub wait: bool,
}

fn read_password_line() -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading password from stdin")?;
    Ok(Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn session_path() -> Result<PathBuf> {
    AuthSession::default_path().ok_or_else(|| anyhow::anyhow!("No config directory"))
}

fn load_session(mock: bool) -> Result<AuthSession> {
    if mock {
        return Ok(mock_session());
    }
    let path = session_path()?;
    AuthSession::load_from(&path)
        .with_context(|| format!("loading session from {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("Not logged in. Run `nimbus login` first."))
}

/// Run one command to completion.
pub async fn run(command: Command, globals: Globals, mut config: Config) -> Result<()> {
    let settings = config.settings();
    let mock = globals.mock || settings.mock;

    match command {
        Command::Login(args) => return login(args, &settings, &mut config, mock).await,
        Command::Logout => {
            let path = session_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing {}", path.display()))?;
            }
            println!("Logged out.");
            return Ok(());
        }
        Command::Session(cmd) => return session(cmd, mock),
        _ => {}
    }

    let session = Arc::new(load_session(mock)?);
    let mode = BackendMode::from_flag(mock, settings.mock_timings);
    let backend = select_backend(mode)?;
    let (console, events) = Console::new(backend, session, settings.selector.clone());
    tracing::debug!("Running {:?} against {}", command, console.backend_name());

    let mut runner = Runner {
        console,
        events,
        globals,
    };
    let result = runner.dispatch(command).await;
    if let Err(err) = &result {
        if session_rejected(err, mode) {
            forget_stale_session();
        }
    }
    result
}

/// A 401 from the real cloud means the stored token is dead.
fn session_rejected(err: &anyhow::Error, mode: BackendMode) -> bool {
    !mode.is_mock()
        && err
            .downcast_ref::<ApiError>()
            .is_some_and(ApiError::is_session_expired)
}

fn forget_stale_session() {
    let Ok(path) = session_path() else {
        return;
    };
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!("Removed rejected session {}", path.display());
            eprintln!("The stored session was rejected and has been removed.");
        }
        Err(e) => tracing::warn!("Could not remove {}: {}", path.display(), e),
    }
}

fn login_summary(session: &AuthSession) -> String {
    let user = session.user.as_ref().map(|u| u.name.as_str()).unwrap_or("-");
    let project = session
        .project
        .as_ref()
        .map(|p| p.name.as_str())
        .unwrap_or("-");
    let role = if session.is_admin() { ", admin" } else { "" };
    format!(
        "Logged in as {} (project {}{}), {} services in catalog.",
        user,
        project,
        role,
        session.catalog.len()
    )
}

async fn login(args: LoginArgs, settings: &Settings, config: &mut Config, mock: bool) -> Result<()> {
    let session = if mock {
        tracing::info!("Mock mode, bypassing Keystone");
        mock_session()
    } else {
        let auth_url = args
            .auth_url
            .or_else(|| settings.auth_url.clone())
            .ok_or_else(|| anyhow::anyhow!("No auth URL. Pass --auth-url or set OS_AUTH_URL."))?;
        let username = args
            .username
            .or_else(|| settings.username.clone())
            .ok_or_else(|| anyhow::anyhow!("No username. Pass --username or set OS_USERNAME."))?;
        let password = if args.password_stdin {
            read_password_line()?
        } else {
            settings.password.clone().ok_or_else(|| {
                anyhow::anyhow!("No password. Set OS_PASSWORD or use --password-stdin.")
            })?
        };

        let project = match (args.project_id, args.project) {
            (Some(id), _) => Some(ProjectScope::Id(id)),
            (None, Some(name)) => Some(ProjectScope::Name {
                name,
                domain: args.project_domain,
            }),
            (None, None) => settings.project.clone(),
        };

        let params = KeystoneAuthParams {
            auth_url: auth_url.clone(),
            username: username.clone(),
            password,
            user_domain: args
                .user_domain
                .unwrap_or_else(|| settings.user_domain.clone()),
            project,
        };
        let http = HttpClient::new()?;
        let session = authenticate(&http, &params).await?;

        if let Err(e) = config.remember_login(&auth_url, &username) {
            tracing::warn!("Could not save config: {:#}", e);
        }
        session
    };

    let path = session_path()?;
    session
        .save_to(&path)
        .with_context(|| format!("saving session to {}", path.display()))?;

    println!("{}", login_summary(&session));
    Ok(())
}

fn session(cmd: SessionCommand, mock: bool) -> Result<()> {
    match cmd {
        SessionCommand::Export { file } => {
            let json = load_session(mock)?.to_json()?;
            match file {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Session exported to {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        SessionCommand::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let session = AuthSession::import_json(&text)?;
            let path = session_path()?;
            session.save_to(&path)?;
            println!(
                "Session imported, {} services in catalog.",
                session.catalog.len()
            );
        }
    }
    Ok(())
}

struct Runner {
    console: Console,
    events: mpsc::Receiver<RefreshEvent>,
    globals: Globals,
}

impl Runner {
    fn done(&self, message: &str) {
        if !self.globals.json {
            println!("{}", message);
        }
    }

    /// With `--wait`, print the next `count` refreshed lists.
    async fn settle(&mut self, count: usize) -> Result<()> {
        if !self.globals.wait {
            return Ok(());
        }
        for _ in 0..count {
            let event = tokio::time::timeout(WAIT_LIMIT, self.events.recv())
                .await
                .context("timed out waiting for refresh")?;
            let json = self.globals.json;
            match event {
                Some(RefreshEvent::Instances(items)) => print_list(&items, json)?,
                Some(RefreshEvent::Volumes(items)) => print_list(&items, json)?,
                Some(RefreshEvent::FloatingIps(items)) => print_list(&items, json)?,
                Some(RefreshEvent::SecurityGroups(items)) => print_list(&items, json)?,
                Some(RefreshEvent::Users(items)) => print_list(&items, json)?,
                Some(RefreshEvent::Failed { target, message }) => {
                    eprintln!("Refreshing {} failed: {}", target, message)
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, command: Command) -> Result<()> {
        let json = self.globals.json;
        match command {
            Command::Instances(cmd) => self.instances(cmd).await,
            Command::Volumes(cmd) => self.volumes(cmd).await,
            Command::Networks => print_list(&self.console.list_networks().await?, json),
            Command::Subnets { network } => {
                print_list(&self.console.list_subnets(network.as_deref()).await?, json)
            }
            Command::Routers => print_list(&self.console.list_routers().await?, json),
            Command::Ports {
                device,
                network,
                owner,
            } => {
                let query = PortQuery {
                    device_id: device,
                    network_id: network,
                    device_owner: owner,
                };
                print_list(&self.console.list_ports(&query).await?, json)
            }
            Command::FloatingIps(cmd) => self.floating_ips(cmd).await,
            Command::Images => print_list(&self.console.list_images().await?, json),
            Command::Flavors => print_list(&self.console.list_flavors().await?, json),
            Command::Keypairs => print_list(&self.console.list_key_pairs().await?, json),
            Command::SecurityGroups(cmd) => self.security_groups(cmd).await,
            Command::Quotas => print_list(&self.console.quotas().await?, json),
            Command::Users(cmd) => self.users(cmd).await,
            Command::Domains => print_list(&self.console.list_domains().await?, json),
            Command::Login(_) | Command::Logout | Command::Session(_) => Ok(()),
        }
    }

    async fn instances(&mut self, cmd: InstanceCommand) -> Result<()> {
        let json = self.globals.json;
        let power = |action: PowerAction, id: &str| format!("Requested {} of {}.", action, id);

        match cmd {
            InstanceCommand::List => print_list(&self.console.list_instances().await?, json),
            InstanceCommand::Show { id } => {
                let detail = self.console.instance_detail(&id).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&detail)?);
                    return Ok(());
                }
                println!("{}", describe(&detail.instance));
                if let Some(flavor) = &detail.flavor {
                    println!(
                        "\nFlavor: {} ({} vCPU, {} MB RAM, {} GB disk)",
                        flavor.name, flavor.vcpus, flavor.ram, flavor.disk
                    );
                }
                if !detail.volumes.is_empty() {
                    println!("\nVolumes:");
                    print_list(&detail.volumes, false)?;
                }
                if !detail.attachable_volumes.is_empty() {
                    println!("\nAttachable volumes:");
                    print_list(&detail.attachable_volumes, false)?;
                }
                if !detail.security_groups.is_empty() {
                    println!("\nSecurity groups:");
                    print_list(&detail.security_groups, false)?;
                }
                Ok(())
            }
            InstanceCommand::Launch {
                name,
                image,
                flavor,
                key_pair,
                security_groups,
                networks,
            } => {
                let params = LaunchInstanceParams {
                    name,
                    image_id: image,
                    flavor_id: flavor,
                    key_pair,
                    security_groups,
                    network_ids: networks,
                };
                let instance = self.console.launch_instance(&params).await?;
                print_one(&instance, json)?;
                self.settle(1).await
            }
            InstanceCommand::Delete { id } => {
                self.console.terminate_instance(&id).await?;
                self.done(&format!("Deletion of {} requested.", id));
                self.settle(1).await
            }
            InstanceCommand::Start { id } => {
                self.console.control_instance_power(&id, PowerAction::Start).await?;
                self.done(&power(PowerAction::Start, &id));
                self.settle(1).await
            }
            InstanceCommand::Stop { id } => {
                self.console.control_instance_power(&id, PowerAction::Stop).await?;
                self.done(&power(PowerAction::Stop, &id));
                self.settle(1).await
            }
            InstanceCommand::Reboot { id, hard } => {
                let action = PowerAction::Reboot(if hard {
                    RebootType::Hard
                } else {
                    RebootType::Soft
                });
                self.console.control_instance_power(&id, action).await?;
                self.done(&power(action, &id));
                self.settle(1).await
            }
            InstanceCommand::Shelve { id } => {
                self.console.shelve_instance(&id).await?;
                self.done(&format!("Shelving {}.", id));
                self.settle(1).await
            }
            InstanceCommand::Unshelve { id } => {
                self.console.unshelve_instance(&id).await?;
                self.done(&format!("Unshelving {}.", id));
                self.settle(1).await
            }
            InstanceCommand::Console { id, console_type } => {
                let info = self.console.console_url(&id, console_type).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!("{}", info.url);
                }
                Ok(())
            }
            InstanceCommand::Actions { id } => {
                print_list(&self.console.instance_actions(&id).await?, json)
            }
        }
    }

    async fn volumes(&mut self, cmd: VolumeCommand) -> Result<()> {
        let json = self.globals.json;
        match cmd {
            VolumeCommand::List => print_list(&self.console.list_volumes().await?, json),
            VolumeCommand::Create(args) => {
                let volume = self.console.create_volume(&args.params()).await?;
                print_one(&volume, json)?;
                self.settle(1).await
            }
            VolumeCommand::Delete { id } => {
                self.console.delete_volume(&id).await?;
                self.done(&format!("Deletion of volume {} requested.", id));
                self.settle(1).await
            }
            VolumeCommand::Attach { volume, instance } => {
                self.console.attach_volume(&instance, &volume).await?;
                self.done(&format!("Attached {} to {}.", volume, instance));
                self.settle(2).await
            }
            VolumeCommand::Detach { volume, instance } => {
                self.console.detach_volume(&instance, &volume).await?;
                self.done(&format!("Detached {} from {}.", volume, instance));
                self.settle(2).await
            }
            VolumeCommand::CreateAttach { volume, instance } => {
                self.done(&format!(
                    "Creating {} and waiting for it to become available...",
                    volume.name
                ));
                let request = CreateAttachRequest {
                    volume: volume.params(),
                    instance_id: instance.clone(),
                };
                let attached = self.console.create_and_attach_volume(&request).await?;
                self.done(&format!("Attached {} to {}.", attached.id, instance));
                if json {
                    print_one(&attached, json)?;
                }
                self.settle(2).await
            }
        }
    }

    async fn floating_ips(&mut self, cmd: FloatingIpCommand) -> Result<()> {
        let json = self.globals.json;
        match cmd {
            FloatingIpCommand::List => print_list(&self.console.list_floating_ips().await?, json),
            FloatingIpCommand::Allocate { pool } => {
                let fip = self.console.allocate_floating_ip(&pool).await?;
                print_one(&fip, json)?;
                self.settle(1).await
            }
            FloatingIpCommand::Release { id } => {
                self.console.release_floating_ip(&id).await?;
                self.done(&format!("Released {}.", id));
                self.settle(1).await
            }
            FloatingIpCommand::Associate { id, port } => {
                let fip = self.console.associate_floating_ip(&id, &port).await?;
                print_one(&fip, json)?;
                self.settle(1).await
            }
            FloatingIpCommand::Disassociate { id } => {
                let fip = self.console.disassociate_floating_ip(&id).await?;
                print_one(&fip, json)?;
                self.settle(1).await
            }
        }
    }

    async fn security_groups(&mut self, cmd: SecurityGroupCommand) -> Result<()> {
        let json = self.globals.json;
        match cmd {
            SecurityGroupCommand::List => {
                print_list(&self.console.list_security_groups().await?, json)
            }
            SecurityGroupCommand::Rules { id } => {
                let groups = self.console.list_security_groups().await?;
                let group = groups
                    .into_iter()
                    .find(|g| g.id == id || g.name == id)
                    .ok_or_else(|| anyhow::anyhow!("Security group {} not found", id))?;
                print_list(&group.rules, json)
            }
            SecurityGroupCommand::Create { name, description } => {
                let group = self.console.create_security_group(&name, &description).await?;
                print_one(&group, json)?;
                self.settle(1).await
            }
            SecurityGroupCommand::Delete { id } => {
                self.console.delete_security_group(&id).await?;
                self.done(&format!("Deleted security group {}.", id));
                self.settle(1).await
            }
            SecurityGroupCommand::AddRule {
                group,
                direction,
                ethertype,
                protocol,
                port_min,
                port_max,
                remote_ip,
                remote_group,
            } => {
                let rule = NewSecurityGroupRule {
                    security_group_id: group,
                    direction,
                    ethertype,
                    protocol,
                    port_range_min: port_min,
                    port_range_max: port_max.or(port_min),
                    remote_ip_prefix: remote_ip,
                    remote_group_id: remote_group,
                };
                let created = self.console.add_security_group_rule(&rule).await?;
                print_one(&created, json)?;
                self.settle(1).await
            }
            SecurityGroupCommand::DeleteRule { id } => {
                self.console.delete_security_group_rule(&id).await?;
                self.done(&format!("Deleted rule {}.", id));
                self.settle(1).await
            }
        }
    }

    async fn users(&mut self, cmd: UserCommand) -> Result<()> {
        let json = self.globals.json;
        match cmd {
            UserCommand::List => print_list(&self.console.list_users().await?, json),
            UserCommand::Create {
                name,
                domain,
                email,
                description,
                password_stdin,
                disabled,
            } => {
                let password = if password_stdin {
                    Some(read_password_line()?)
                } else {
                    None
                };
                let request = CreateUserRequest {
                    name,
                    domain_id: domain,
                    password,
                    enabled: !disabled,
                    description,
                    email,
                };
                let user = self.console.create_user(&request).await?;
                print_one(&user, json)?;
                self.settle(1).await
            }
            UserCommand::Delete { id } => {
                self.console.delete_user(&id).await?;
                self.done(&format!("Deleted user {}.", id));
                self.settle(1).await
            }
            UserCommand::Enable { id } => self.set_enabled(&id, true).await,
            UserCommand::Disable { id } => self.set_enabled(&id, false).await,
        }
    }

    async fn set_enabled(&mut self, user_id: &str, enabled: bool) -> Result<()> {
        let update = UserUpdate {
            enabled: Some(enabled),
            name: None,
        };
        let user = self.console.update_user(user_id, &update).await?;
        print_one(&user, self.globals.json)?;
        self.settle(1).await
    }
}
