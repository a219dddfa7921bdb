mod panels;
mod render;

use std::io::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use opal_core::config::Config;
use opal_core::error::OpalError;
use opal_gemini::GeminiClient;
use opal_live::{LiveController, LiveEvent, SessionPhase};
use tokio::sync::mpsc;

use panels::{ImagePanel, SearchPanel, VideoPanel};

#[derive(Parser)]
#[command(
    name = "opal",
    about = "Voice conversations, video generation, image editing, and grounded search from the terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a real-time voice conversation (Ctrl-C to hang up)
    Live,

    /// Animate a still image into a short video clip
    Animate {
        /// Source image file
        image: PathBuf,

        /// What should happen in the clip
        #[arg(short, long)]
        prompt: String,

        /// Where to write the resulting video
        #[arg(short, long, default_value = "opal-video.mp4")]
        output: PathBuf,
    },

    /// Edit an image with a natural-language instruction
    Edit {
        /// Source image file
        image: PathBuf,

        /// The edit to apply
        #[arg(short, long)]
        prompt: String,

        /// Where to write the edited image
        #[arg(short, long, default_value = "opal-edit.png")]
        output: PathBuf,
    },

    /// Ask a question answered with live web grounding
    Ask {
        /// The question
        question: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    // Load config
    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let mut config = Config::load(&config_path)?;

    match cli.command {
        Commands::Live => run_live(config).await?,
        Commands::Animate { image, prompt, output } => {
            let client = client_for(&config)?;
            let mut panel = VideoPanel::new();
            println!("Animating {}...", image.display());
            let path = panel.run(&client, &config, &image, &prompt, &output).await?;
            println!("Wrote {}", path.display());
        }
        Commands::Edit { image, prompt, output } => {
            let client = client_for(&config)?;
            let mut panel = ImagePanel::new();
            let path = panel.run(&client, &config, &image, &prompt, &output).await?;
            println!("Wrote {}", path.display());
        }
        Commands::Ask { question } => {
            let client = client_for(&config)?;
            let mut panel = SearchPanel::new();
            let answer = panel.run(&client, &config, &question).await?;
            println!("{}", render::markdown_to_text(&answer.markdown));
            if !answer.citations.is_empty() {
                println!("\nSources:");
                for chunk in &answer.citations {
                    println!("  - {} ({})", chunk.title, chunk.uri);
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{value}"),
                None => println!("(not set)"),
            },
            ConfigAction::Set { key, value } => {
                // Accept JSON literals, fall back to a plain string.
                let parsed = serde_json::from_str(&value)
                    .unwrap_or(serde_json::Value::String(value));
                config.set_path(&key, parsed)?;
                config.save(&config_path)?;
                println!("Updated {key}");
            }
        },
    }

    Ok(())
}

fn client_for(config: &Config) -> opal_core::error::Result<GeminiClient> {
    let api_key = config
        .gemini()
        .resolve_api_key()
        .ok_or_else(|| OpalError::Config("no API key configured (set GEMINI_API_KEY)".into()))?;
    Ok(GeminiClient::new(api_key, config.gemini().base_url.as_deref()))
}

/// Run a voice session: print transcripts and phase changes as they
/// arrive, draw the input level meter on stderr, stop on Ctrl-C.
async fn run_live(config: Config) -> anyhow::Result<()> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (mut controller, mut meter_rx) = LiveController::new(config, events_tx);

    let cancel = controller.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                LiveEvent::Phase(SessionPhase::Open) => println!("[connected — speak now]"),
                LiveEvent::Phase(SessionPhase::Closed) => println!("[session closed]"),
                LiveEvent::Phase(_) => {}
                LiveEvent::UserTranscript(text) => print_line("you", &text),
                LiveEvent::ModelTranscript(text) => print_line("opal", &text),
                LiveEvent::Interrupted => println!("\r[interrupted]"),
                LiveEvent::TurnComplete | LiveEvent::TranscriptsCleared => {}
                LiveEvent::Error { message, .. } => eprintln!("\rerror: {message}"),
            }
        }
    });

    let meter = tokio::spawn(async move {
        while meter_rx.changed().await.is_ok() {
            let frame = meter_rx.borrow_and_update().clone();
            let bar = opal_audio::meter::render_bar(&frame, 24);
            eprint!("\r{bar} ");
            let _ = std::io::stderr().flush();
        }
        eprint!("\r");
    });

    let result = controller.run().await;
    meter.abort();
    printer.abort();
    result?;
    Ok(())
}

fn print_line(who: &str, text: &str) {
    // Clear the meter bar before printing over it.
    print!("\r{:<28}\r", "");
    println!("{who}: {text}");
}
