//! threatlink - command-line client for the threat-intelligence platform

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use threatlink::config::Config;
use threatlink::dashboard::{DashboardSnapshot, DashboardView};
use threatlink::guard::Route;
use threatlink::notifications::Notification;
use threatlink::protocol::ServerEvent;
use threatlink::{Mount, MountedView, SyncClient, ViewEvent};

/// Password source for non-interactive use
const PASSWORD_ENV: &str = "THREATLINK_PASSWORD";

#[derive(Parser)]
#[command(name = "threatlink")]
#[command(about = "Realtime client for the threat-intelligence platform")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and persist the session
    Login {
        email: String,

        /// Read from THREATLINK_PASSWORD or stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Create an account and log in
    Register {
        email: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        password: Option<String>,
    },
    /// End the current session
    Logout,
    /// Validate the stored session and show who is logged in
    Whoami,
    /// Show a dashboard
    Dashboard {
        /// user, global or admin
        #[arg(default_value = "user")]
        view: DashboardView,

        /// Keep the view mounted and print realtime events and refreshes
        #[arg(short, long)]
        follow: bool,
    },
    /// Stream realtime events until interrupted
    Watch,
    /// List notifications
    Notifications {
        /// Mark a notification read
        #[arg(long, value_name = "ID")]
        read: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!("API at {}, realtime at {}", config.endpoints.api_url, config.endpoints.ws_url);

    let client = SyncClient::new(config)?;

    match cli.command {
        Commands::Login { email, password } => {
            let password = read_password(password)?;
            let session = client.login(&email, &password).await?;
            println!(
                "Logged in as {} ({})",
                display_name(session.user()),
                session.role()
            );
        }
        Commands::Register {
            email,
            name,
            password,
        } => {
            let password = read_password(password)?;
            let session = client.register(&email, &password, &name).await?;
            println!("Registered and logged in as {}", display_name(session.user()));
        }
        Commands::Logout => {
            client.logout();
            println!("Logged out");
        }
        Commands::Whoami => match client.restore().await? {
            Some(user) => println!("{} [{}] id={}", display_name(&user), user.role, user.id),
            None => println!("Not logged in"),
        },
        Commands::Dashboard { view, follow } => {
            let mounted = mount(&client, view).await?;
            print_snapshot(view, mounted.snapshot());
            print_notifications(&mounted.notifications());
            if follow {
                follow_view(mounted).await;
            }
        }
        Commands::Watch => {
            let mounted = mount(&client, DashboardView::User).await?;
            println!("Watching realtime events (Ctrl-C to stop)");
            follow_view(mounted).await;
        }
        Commands::Notifications { read } => {
            ensure_logged_in(&client)?;
            client
                .refresh_notifications()
                .await
                .context("Failed to fetch notifications")?;
            if let Some(id) = read {
                if client.mark_read(&id).await? {
                    println!("Marked {} read", id);
                } else {
                    println!("{} was already read", id);
                }
            }
            print_notifications(&client.notifications());
        }
    }

    Ok(())
}

fn ensure_logged_in(client: &SyncClient) -> Result<()> {
    if client.navigate(Route::Dashboard).redirect_target().is_some() {
        bail!("Not logged in; run `threatlink login <email>` first");
    }
    Ok(())
}

async fn mount(client: &SyncClient, view: DashboardView) -> Result<MountedView> {
    match client.mount(view).await? {
        Mount::Mounted(mounted) => Ok(mounted),
        Mount::Redirect(Route::Login) => {
            bail!("Not logged in; run `threatlink login <email>` first")
        }
        Mount::Redirect(route) => bail!(
            "The {} dashboard is not available to this account (redirected to {})",
            view.name(),
            route
        ),
    }
}

async fn follow_view(mut mounted: MountedView) {
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = mounted.next_event() => event,
        };
        match event {
            Some(ViewEvent::Realtime(event)) => print_event(&event),
            Some(ViewEvent::Refreshed(snapshot)) => print_snapshot(mounted.view(), &snapshot),
            None => {
                println!("Session ended");
                break;
            }
        }
    }
}

fn print_event(event: &ServerEvent) {
    match event {
        ServerEvent::Notification(n) => {
            println!("[notification] {} {}", title_of(n), n.message)
        }
        ServerEvent::ThreatAlert(alert) => println!(
            "[threat] {} severity={} type={}",
            alert.title, alert.severity, alert.threat_type
        ),
        ServerEvent::ThreatUpdate(update) => {
            println!("[threat] {} is now {}", update.threat_id, update.status)
        }
        ServerEvent::SystemMessage(msg) => println!("[{}] {}", msg.level, msg.message),
        ServerEvent::Subscribed { channel } => println!("[subscribed] {}", channel),
        ServerEvent::Error { message } => println!("[server error] {}", message),
        ServerEvent::Pong => tracing::debug!("pong"),
        ServerEvent::Other(message) => println!("[{}] {}", message.kind, message.payload),
    }
}

fn print_snapshot(view: DashboardView, snapshot: &DashboardSnapshot) {
    println!(
        "== {} dashboard ({}) ==",
        view.name(),
        snapshot.fetched_at().format("%Y-%m-%d %H:%M:%S UTC")
    );
    for (key, entry) in snapshot.entries() {
        match (&entry.value, &entry.error) {
            (Some(value), _) => {
                let rendered =
                    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
                println!("{}:\n{}", key, rendered);
            }
            (None, error) => println!(
                "{}: unavailable ({})",
                key,
                error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

fn print_notifications(notifications: &[Notification]) {
    let unread = notifications.iter().filter(|n| !n.read).count();
    println!("== notifications ({} unread) ==", unread);
    for n in notifications {
        println!(
            "{} {} {} {}",
            if n.read { " " } else { "*" },
            n.timestamp.format("%Y-%m-%d %H:%M"),
            n.id,
            title_of(n)
        );
    }
}

fn title_of(n: &Notification) -> &str {
    if n.title.is_empty() {
        &n.message
    } else {
        &n.title
    }
}

fn display_name(user: &threatlink::session::User) -> &str {
    if user.display_name.is_empty() {
        &user.id
    } else {
        &user.display_name
    }
}

fn read_password(flag: Option<String>) -> Result<String> {
    if let Some(password) = flag.or_else(|| std::env::var(PASSWORD_ENV).ok()) {
        return Ok(password);
    }
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}
