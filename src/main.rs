use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use diagram_bridge::{
    bridge::BridgeOptions,
    config::{BridgeConfig, ConfigManager, EnvConfigManager, get_setting, layout_settings, set_setting, unset_setting},
    host::render_once,
    loader::EngineLoader,
    logger::{LogConfig, LogLevel, init_tracing},
    message::Protocol,
    schema::write_schema,
    stdio::serve_stdio,
    watcher::EngineFileWatcher,
};
use std::{path::PathBuf, time::Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "diagram-bridge",
    about = "Lays out DOT graphs as SVG behind an asynchronous message bridge",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// `.env` file holding LAYOUT_* settings
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,

    /// Write a rolling text log and JSON job reports here instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry OTLP/HTTP endpoint (e.g. http://localhost:4318)
    #[arg(long, global = true)]
    otel_endpoint: Option<String>,

    /// Layout engine URL or path; overrides LAYOUT_ENGINE_URL
    #[arg(long, global = true)]
    engine_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the bridge over stdin/stdout, one JSON message per line
    Serve(ServeArgs),

    /// Render one DOT file to SVG
    Render(RenderArgs),

    /// Inspect or change LAYOUT_* settings in the env file
    Config(ConfigArgs),

    /// Emit JSON-Schema for the wire messages
    Schema {
        #[arg(long, default_value = "schemas")]
        out_dir: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// correlated (INITIALISE/RESULT) or single-use (LAYOUT/LAYOUT_RESULT)
    #[arg(long)]
    protocol: Option<Protocol>,

    /// Reload the engine when its local file changes
    #[arg(long, default_value_t = false)]
    watch_engine: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show every LAYOUT_* setting in effect
    List,
    Get { key: String },
    /// Validate and store a setting
    Set { key: String, value: String },
    Unset { key: String },
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// DOT input; `-` reads stdin
    file: PathBuf,

    /// Output file; stdout when omitted
    #[arg(long, short)]
    output: Option<PathBuf>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let global = cli.global;

    let telemetry = init_tracing(&LogConfig::new(
        global.log_level,
        global.log_dir.clone(),
        global.otel_endpoint.clone(),
    ))?;

    let config_mgr = ConfigManager(EnvConfigManager::new(global.env_file.clone()));

    let result = match cli.command {
        Commands::Serve(args) => match load_config(&config_mgr, global.engine_url).await {
            Ok(config) => serve(config, args).await,
            Err(e) => Err(e),
        },
        Commands::Render(args) => match load_config(&config_mgr, global.engine_url).await {
            Ok(config) => render(config, args).await,
            Err(e) => Err(e),
        },
        Commands::Config(args) => config(&config_mgr, args).await,
        Commands::Schema { out_dir } => {
            let written = write_schema(&out_dir)?;
            eprintln!("{} schemas written to {}", written.len(), out_dir.display());
            Ok(())
        }
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    telemetry.shutdown();
    result
}

async fn load_config(config_mgr: &ConfigManager, engine_url: Option<String>) -> anyhow::Result<BridgeConfig> {
    let mut config = BridgeConfig::from_manager(config_mgr).await?;
    if let Some(url) = engine_url {
        config.engine_url = Some(url);
    }
    Ok(config)
}

async fn config(config_mgr: &ConfigManager, args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::List => {
            for (key, value) in layout_settings(config_mgr).await {
                println!("{key}={value}");
            }
        }
        ConfigCommands::Get { key } => match get_setting(config_mgr, &key).await? {
            Some(value) => println!("{value}"),
            None => bail!("{key} is not set"),
        },
        ConfigCommands::Set { key, value } => {
            set_setting(config_mgr, &key, &value).await?;
            eprintln!("{key} updated");
        }
        ConfigCommands::Unset { key } => {
            unset_setting(config_mgr, &key).await?;
            eprintln!("{key} removed");
        }
    }
    Ok(())
}

async fn serve(mut config: BridgeConfig, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(protocol) = args.protocol {
        config.protocol = protocol;
    }
    let loader = EngineLoader::new(config.engine_url.clone(), config.fuel)?;

    let watcher = if args.watch_engine {
        if config.engine_url.is_none() {
            bail!("--watch-engine needs a local engine file (--engine-url or LAYOUT_ENGINE_URL)");
        }
        Some(EngineFileWatcher::watch(loader.clone(), Duration::from_secs(2)).await?)
    } else {
        None
    };

    info!(
        protocol = %config.protocol,
        engine = config.engine_url.as_deref().unwrap_or("built-in"),
        "diagram bridge serving on stdio"
    );
    let result = serve_stdio(loader, config.bridge_options()).await;

    if let Some(watcher) = watcher {
        watcher.shutdown();
    }
    info!("diagram bridge stopped");
    result
}

async fn render(config: BridgeConfig, args: RenderArgs) -> anyhow::Result<()> {
    let graph = if args.file.as_os_str() == "-" {
        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut text).await?;
        text
    } else {
        tokio::fs::read_to_string(&args.file)
            .await
            .with_context(|| format!("could not read {}", args.file.display()))?
    };

    let loader = EngineLoader::new(config.engine_url.clone(), config.fuel)?;
    let options = BridgeOptions {
        protocol: Protocol::SingleUse,
        ..config.bridge_options()
    };
    let svg = render_once(loader, options, graph).await?;

    match args.output {
        Some(path) => tokio::fs::write(&path, svg)
            .await
            .with_context(|| format!("could not write {}", path.display()))?,
        None => println!("{svg}"),
    }
    Ok(())
}
