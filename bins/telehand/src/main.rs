//! telehand — remote assistance over a supervised EasyTier overlay.
//!
//! `serve` hosts the assisted side, `connect` pairs from the operator
//! side and prints the commands to run remotely, `gen-config` just emits
//! a pairing code.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use telehand_core::{
    build_config_from_inputs, build_encoded_config_with_defaults, decode_config_with_validation,
    mask_secret, InstallCommand, OverlayBundle, Role, EXIT_CODE_OK, EXIT_CODE_PARAM,
};

mod platform_util;
mod session;

use session::{run_session, SessionOptions};

/// telehand - cross-host remote assistance bootstrapper
#[derive(Parser)]
#[command(name = "telehand")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host the assisted side (default when no subcommand is given)
    Serve {
        /// Pairing code
        code: Option<String>,

        /// Pairing code via flag (same as the positional)
        #[arg(long)]
        config: Option<String>,

        /// Do not auto-open the browser
        #[arg(long)]
        no_browser: bool,

        /// Network name when no pairing code is provided
        #[arg(long, default_value = "")]
        network_name: String,

        /// Network secret when no pairing code is provided
        #[arg(long, default_value = "")]
        network_secret: String,

        /// Comma-separated peer pool when no pairing code is provided
        #[arg(long, default_value = "")]
        peers: String,
    },

    /// Pair from the operator side and print the remote one-liners
    Connect {
        /// Pairing code
        code: Option<String>,

        /// Network name when no pairing code is provided
        #[arg(long, default_value = "")]
        network_name: String,

        /// Network secret when no pairing code is provided
        #[arg(long, default_value = "")]
        network_secret: String,

        /// Comma-separated peer pool when no pairing code is provided
        #[arg(long, default_value = "")]
        peers: String,

        /// Do not auto-open the browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Print a pairing code for the given network identity
    GenConfig {
        /// EasyTier network name
        #[arg(long)]
        network_name: String,

        /// EasyTier network secret
        #[arg(long)]
        network_secret: String,

        /// Comma-separated peer addresses (e.g. tcp://1.2.3.4:11010)
        #[arg(long)]
        peers: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let code = runtime.block_on(dispatch(cli.command));
    std::process::exit(code);
}

fn init_tracing(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn dispatch(command: Option<Commands>) -> i32 {
    match command {
        None => {
            cmd_serve(None, None, false, String::new(), String::new(), String::new()).await
        }
        Some(Commands::Serve {
            code,
            config,
            no_browser,
            network_name,
            network_secret,
            peers,
        }) => cmd_serve(code, config, no_browser, network_name, network_secret, peers).await,
        Some(Commands::Connect {
            code,
            network_name,
            network_secret,
            peers,
            no_browser,
        }) => cmd_connect(code, network_name, network_secret, peers, no_browser).await,
        Some(Commands::GenConfig {
            network_name,
            network_secret,
            peers,
        }) => cmd_gen_config(&network_name, &network_secret, &peers),
    }
}

async fn cmd_serve(
    code: Option<String>,
    config: Option<String>,
    no_browser: bool,
    network_name: String,
    network_secret: String,
    peers: String,
) -> i32 {
    let encoded = code
        .or(config)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    let encoded = if encoded.is_empty()
        && (!network_name.trim().is_empty()
            || !network_secret.trim().is_empty()
            || !peers.trim().is_empty())
    {
        match build_encoded_config_with_defaults(&network_name, &network_secret, &peers) {
            Ok((encoded, _cfg)) => encoded,
            Err(e) => {
                eprintln!("Invalid serve params: {e}");
                return EXIT_CODE_PARAM;
            }
        }
    } else {
        encoded
    };

    if !encoded.is_empty() {
        if let Err(e) = decode_config_with_validation(&encoded) {
            eprintln!("Invalid pairing code: {e}");
            return EXIT_CODE_PARAM;
        }
    }

    run_session(
        SessionOptions {
            role: Role::Server,
            no_browser,
            encoded_config: encoded,
            commands: Vec::new(),
            clipboard_command: String::new(),
        },
        load_overlay_bundle(),
    )
    .await
}

async fn cmd_connect(
    code: Option<String>,
    network_name: String,
    network_secret: String,
    peers: String,
    no_browser: bool,
) -> i32 {
    let pairing_code = code.map(|c| c.trim().to_string()).unwrap_or_default();

    let (pairing_code, cfg) = if !pairing_code.is_empty() {
        if !network_name.trim().is_empty()
            || !network_secret.trim().is_empty()
            || !peers.trim().is_empty()
        {
            println!("Pairing code provided; --network-name/--network-secret/--peers are ignored.");
        }
        match decode_config_with_validation(&pairing_code) {
            Ok(cfg) => (pairing_code, cfg),
            Err(e) => {
                eprintln!("Invalid pairing code: {e}");
                return EXIT_CODE_PARAM;
            }
        }
    } else {
        match build_encoded_config_with_defaults(&network_name, &network_secret, &peers) {
            Ok((encoded, cfg)) => (encoded, cfg),
            Err(e) => {
                eprintln!("Invalid connect params: {e}");
                return EXIT_CODE_PARAM;
            }
        }
    };

    println!(
        "Connect network: name={} secret={} peers={}",
        cfg.network_name,
        mask_secret(&cfg.network_secret),
        cfg.peers.join(",")
    );
    println!("Peer strategy: latency-first ordering + fallback (details in debug logs).");

    let commands = build_remote_install_commands(&pairing_code);
    println!("Run one of the following commands on the remote machine:");
    for c in &commands {
        println!("  [{}] {}", c.platform, c.command);
    }

    let clipboard = commands
        .first()
        .map(|c| c.command.clone())
        .unwrap_or_default();
    if !clipboard.is_empty() {
        match platform_util::copy_to_clipboard(&clipboard) {
            Ok(()) => println!("Remote command copied to clipboard."),
            Err(e) => eprintln!("Copy command to clipboard failed: {e}"),
        }
    }

    run_session(
        SessionOptions {
            role: Role::Client,
            no_browser,
            encoded_config: pairing_code,
            commands,
            clipboard_command: clipboard,
        },
        load_overlay_bundle(),
    )
    .await
}

fn cmd_gen_config(network_name: &str, network_secret: &str, peers: &str) -> i32 {
    match build_config_from_inputs(network_name, network_secret, peers) {
        Ok(cfg) => match cfg.encode() {
            Ok(encoded) => {
                println!("{encoded}");
                EXIT_CODE_OK
            }
            Err(e) => {
                eprintln!("Error: {e}");
                EXIT_CODE_PARAM
            }
        },
        Err(e) => {
            eprintln!(
                "Usage: telehand gen-config --network-name NAME --network-secret SECRET --peers PEERS"
            );
            eprintln!("Error: {e}");
            EXIT_CODE_PARAM
        }
    }
}

fn build_remote_install_commands(pairing_code: &str) -> Vec<InstallCommand> {
    let code = pairing_code.trim();
    vec![
        InstallCommand {
            platform: "Windows (PowerShell, download and run)".into(),
            command: format!(
                "iwr -useb https://raw.githubusercontent.com/sfpprxy/telehand/main/install.ps1 | iex; .\\telehand.exe serve '{code}'"
            ),
        },
        InstallCommand {
            platform: "macOS / Linux (download and run)".into(),
            command: format!(
                "curl -fsSL https://raw.githubusercontent.com/sfpprxy/telehand/main/install.sh | bash && sudo ./telehand serve '{code}'"
            ),
        },
        InstallCommand {
            platform: "Windows (PowerShell, run only)".into(),
            command: format!(".\\telehand.exe serve '{code}'"),
        },
        InstallCommand {
            platform: "macOS / Linux (run only)".into(),
            command: format!("sudo ./telehand serve '{code}'"),
        },
    ]
}

/// Locate the overlay binaries: `$TELEHAND_EASYTIER_DIR`, then
/// `easytier-bin/` next to the executable, then the working directory.
/// A missing bundle is not fatal here; the connect round reports it.
fn load_overlay_bundle() -> OverlayBundle {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Ok(dir) = std::env::var("TELEHAND_EASYTIER_DIR") {
        if !dir.trim().is_empty() {
            candidates.push(PathBuf::from(dir));
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("easytier-bin"));
        }
    }
    candidates.push(PathBuf::from("easytier-bin"));

    for dir in &candidates {
        match OverlayBundle::from_dir(dir) {
            Ok(bundle) => return bundle,
            Err(_) => continue,
        }
    }
    warn!(
        "overlay binaries not found (searched {} locations); connect will fail until TELEHAND_EASYTIER_DIR points at easytier-core/easytier-cli",
        candidates.len()
    );
    OverlayBundle::default()
}
