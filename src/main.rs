//! CLI entry point for the OMEMO engine.
//!
//! This binary provides a command-line interface for the engine library,
//! supporting configuration management, key and bundle generation, and an
//! in-memory demonstration of a multi-device conversation.

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{info, warn};
use omemo_engine::{
    crypto::RECOMMENDED_PREKEY_COUNT,
    decrypt_payload,
    utils::{EngineConfig, DEFAULT_CONFIG_FILE},
    Bundle, ChannelDelegate, Collaborators, DeviceId, EngineSettings, IdentityKeyPair, Jid,
    LocalDevice, MemoryNetwork, MemoryStorage, OmemoEngine, OmemoEvent, StaticSessionBackend,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// OMEMO engine - multi-device end-to-end encryption toolkit
#[derive(Parser)]
#[command(name = "omemo")]
#[command(about = "Device lists, bundles and encrypted envelopes for OMEMO")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Generate device identities
    Device {
        #[command(subcommand)]
        action: DeviceCommands,
    },
    /// Generate and inspect bundles
    Bundle {
        #[command(subcommand)]
        action: BundleCommands,
    },
    /// Run two accounts with three devices over an in-memory network
    Demo {
        /// Message Alice sends to Bob
        #[arg(short, long, default_value = "Hello, Bob!")]
        message: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// Generate a device id and identity key
    New {
        /// Output format (hex, base64, json)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
}

#[derive(Subcommand)]
enum BundleCommands {
    /// Generate a fresh bundle
    Generate {
        /// Device id; random when omitted
        #[arg(short, long)]
        device_id: Option<u32>,
        /// Number of one-time prekeys to generate
        #[arg(short = 'n', long, default_value_t = RECOMMENDED_PREKEY_COUNT)]
        count: usize,
        /// Output format (json, summary)
        #[arg(short, long, default_value = "summary")]
        format: String,
        /// Write the bundle as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a bundle JSON file
    Inspect {
        /// Bundle file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = EngineConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;

    match cli.command {
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Device { action } => handle_device_commands(action),
        Commands::Bundle { action } => handle_bundle_commands(action, &config),
        Commands::Demo { message } => handle_demo_command(message, &config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &EngineConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = EngineConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                EngineConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

fn handle_device_commands(action: DeviceCommands) -> Result<()> {
    match action {
        DeviceCommands::New { format } => {
            let device_id = DeviceId::random();
            let identity = IdentityKeyPair::generate();
            let public_key = identity.public_key_bytes();

            match format.as_str() {
                "hex" => {
                    println!("Device ID: {}", device_id);
                    println!("Identity key: {}", hex::encode(public_key));
                }
                "base64" => {
                    println!("Device ID: {}", device_id);
                    println!("Identity key: {}", general_purpose::STANDARD.encode(public_key));
                }
                "json" => {
                    let device = serde_json::json!({
                        "device_id": device_id.value(),
                        "identity_key": hex::encode(public_key),
                        "created_at": chrono::Utc::now(),
                    });
                    println!("{}", serde_json::to_string_pretty(&device)?);
                }
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
    }
    Ok(())
}

fn handle_bundle_commands(action: BundleCommands, config: &EngineConfig) -> Result<()> {
    match action {
        BundleCommands::Generate {
            device_id,
            count,
            format,
            output,
        } => {
            let device_id = match device_id {
                Some(value) => DeviceId::new(value)?,
                None => DeviceId::random(),
            };
            let device = LocalDevice::generate(device_id, count)?;
            let bundle = device.bundle();

            if let Some(path) = &output {
                std::fs::write(path, bundle.to_json()?)?;
                info!("Bundle written to {}", path.display());
            }

            match format.as_str() {
                "json" => println!("{}", bundle.to_json()?),
                "summary" => print_bundle_summary(&bundle),
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
        }
        BundleCommands::Inspect { file } => {
            let bundle = Bundle::from_json(&std::fs::read_to_string(&file)?)?;
            bundle.validate(config.bundle.min_prekey_count)?;
            print_bundle_summary(&bundle);

            match bundle.verify_signature() {
                Ok(()) => println!("✓ Signed prekey signature is valid"),
                Err(e) if config.bundle.verify_signatures => return Err(e.into()),
                Err(e) => warn!("Signed prekey signature: {}", e),
            }
        }
    }
    Ok(())
}

fn print_bundle_summary(bundle: &Bundle) {
    println!("Bundle");
    println!("======");
    println!("Device ID: {}", bundle.device_id);
    println!("Fingerprint: {}", bundle.fingerprint());
    println!("Signed prekey: {}", bundle.signed_pre_key.id);
    println!("One-time prekeys: {}", bundle.pre_keys.len());
}

struct DemoClient {
    name: &'static str,
    engine: OmemoEngine,
    backend: Arc<StaticSessionBackend>,
    events: mpsc::UnboundedReceiver<OmemoEvent>,
}

impl DemoClient {
    fn start(
        network: &MemoryNetwork,
        name: &'static str,
        jid: &str,
        config: &EngineConfig,
    ) -> Result<Self> {
        let device_id = DeviceId::random();
        let mut client_config = config.clone();
        client_config.account.jid = jid.to_string();
        client_config.account.device_id = Some(device_id.value());
        let settings = EngineSettings::from_config(&client_config)?;

        let device = LocalDevice::generate(device_id, config.bundle.prekey_count)?;
        let bundle = device.bundle();
        println!("{} is device {} ({})", name, device_id, bundle.fingerprint());

        let (transport, inbound) = network.connect(&settings.account);
        let (delegate, events) = ChannelDelegate::new();
        let backend = Arc::new(StaticSessionBackend::new(device));

        let engine = OmemoEngine::start(
            settings,
            Collaborators {
                storage: Arc::new(MemoryStorage::new(bundle)),
                backend: backend.clone(),
                transport: Arc::new(transport),
                delegate: Arc::new(delegate),
            },
        )?;
        engine.spawn_inbound_pump(inbound);

        Ok(Self {
            name,
            engine,
            backend,
            events,
        })
    }

    async fn receive(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                .await
                .map_err(|_| anyhow::anyhow!("{} received nothing", self.name))?
                .ok_or_else(|| anyhow::anyhow!("{} stopped", self.name))?;

            match event {
                OmemoEvent::PayloadReceived {
                    from,
                    sender_device_id: Some(sender_device_id),
                    payload,
                    keys,
                    iv,
                    ..
                } => {
                    let plaintext = decrypt_payload(
                        self.backend.as_ref(),
                        self.engine.device_id(),
                        &from,
                        sender_device_id,
                        &keys,
                        &iv,
                        payload.as_deref(),
                    )?;
                    return Ok(plaintext);
                }
                OmemoEvent::Error(e) => warn!("{}: {}", self.name, e),
                _ => {}
            }
        }
    }
}

async fn wait_for_devices(engine: &OmemoEngine, identity: &Jid, count: usize) -> Result<()> {
    for _ in 0..500 {
        let known: BTreeSet<DeviceId> = engine.known_devices(identity).await?;
        if known.len() >= count {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow::anyhow!("device list for {} did not converge", identity))
}

async fn handle_demo_command(message: String, config: &EngineConfig) -> Result<()> {
    let network = MemoryNetwork::from_config(&config.transport);

    let mut phone = DemoClient::start(&network, "Alice (phone)", "alice@example.org/phone", config)?;
    let mut laptop = DemoClient::start(&network, "Alice (laptop)", "alice@example.org/laptop", config)?;
    let mut bob = DemoClient::start(&network, "Bob", "bob@example.org/desktop", config)?;

    for client in [&phone, &laptop, &bob] {
        client.engine.announce().await?;
    }

    let alice_jid = phone.engine.account().clone();
    let bob_jid = bob.engine.account().clone();
    wait_for_devices(&phone.engine, &alice_jid, 2).await?;
    wait_for_devices(&phone.engine, &bob_jid, 1).await?;

    let report = phone
        .engine
        .send_message(&bob_jid, message.as_bytes(), None)
        .await?;
    println!(
        "✓ Sent {} to {} device(s), {} excluded",
        report.element_id,
        report.recipients.len(),
        report.excluded.len()
    );

    for client in [&mut bob, &mut laptop] {
        match client.receive().await? {
            Some(plaintext) => println!(
                "✓ {} decrypted: {}",
                client.name,
                String::from_utf8_lossy(&plaintext)
            ),
            None => println!("✓ {} received a key transport", client.name),
        }
    }

    // Refresh Bob's sessions without content
    wait_for_devices(&bob.engine, &alice_jid, 2).await?;
    let report = bob.engine.send_key_transport_fresh(&alice_jid, None).await?;
    println!(
        "✓ Bob sent key transport {} to {} device(s)",
        report.element_id,
        report.recipients.len()
    );
    for client in [&mut laptop, &mut phone] {
        if client.receive().await?.is_none() {
            println!("✓ {} unwrapped a key transport", client.name);
        }
    }

    let stats = phone.engine.stats().await?;
    println!(
        "Bundle fetches: {} (in flight: {})",
        network.fetch_count(),
        stats.in_flight_fetches
    );

    for client in [&phone, &laptop, &bob] {
        client.engine.shutdown().await?;
    }
    Ok(())
}
