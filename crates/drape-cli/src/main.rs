use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use drape_contracts::events::EventWriter;
use drape_contracts::{ClothingCategory, ClothingItem, QualityTier};
use drape_engine::config::EngineConfig;
use drape_engine::{
    Collaborators, GemLedger, JobJournal, JobOrchestrator, JobStore, JsonFileStore, TryOnRequest,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "drape", version, about = "Gem-metered virtual try-on pipeline")]
struct Cli {
    /// Directory holding the ledger document, stored objects and events.
    #[arg(long, global = true, default_value = ".drape")]
    data: PathBuf,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    OpenAccount(OpenAccountArgs),
    Submit(SubmitArgs),
    Balance(IdentityArgs),
    History(IdentityArgs),
    Transactions(IdentityArgs),
}

#[derive(Debug, Parser)]
struct OpenAccountArgs {
    #[arg(long)]
    identity: String,
    #[arg(long)]
    gems: u64,
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    #[arg(long)]
    token: String,
    /// Person photo, or the image to edit with `--edit`.
    #[arg(long)]
    model: String,
    /// `category=<path or url>`, repeatable.
    #[arg(long)]
    clothing: Vec<String>,
    #[arg(long, default_value = "standard")]
    tier: String,
    /// Edit instruction; switches to edit mode.
    #[arg(long)]
    edit: Option<String>,
}

#[derive(Debug, Parser)]
struct IdentityArgs {
    #[arg(long)]
    identity: String,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("drape error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.data)?;
    tracing::debug!(
        data = %cli.data.display(),
        provider = %config.inference.provider,
        "configuration loaded"
    );
    let store = Arc::new(JsonFileStore::new(cli.data.join("store.json")));
    let ledger = GemLedger::new(store.clone());

    match cli.command {
        Command::OpenAccount(args) => {
            let balance = ledger.open_account(&args.identity, args.gems).await?;
            print_json(&json!({"identity": args.identity, "balance": balance}))?;
            Ok(0)
        }
        Command::Balance(args) => {
            let balance = ledger.balance(&args.identity).await?;
            print_json(&json!({"identity": args.identity, "balance": balance}))?;
            Ok(0)
        }
        Command::History(args) => {
            let jobs = store.jobs_for(&args.identity).await?;
            print_json(&serde_json::to_value(jobs)?)?;
            Ok(0)
        }
        Command::Transactions(args) => {
            let rows = ledger.transactions(&args.identity).await?;
            print_json(&serde_json::to_value(rows)?)?;
            Ok(0)
        }
        Command::Submit(args) => run_submit(config, store, &cli.data, args).await,
    }
}

async fn run_submit(
    config: EngineConfig,
    store: Arc<JsonFileStore>,
    data_dir: &Path,
    args: SubmitArgs,
) -> Result<i32> {
    let journal = JobJournal::new(EventWriter::new(data_dir.join("events.jsonl")));
    let collaborators = Collaborators::local(&config, store, journal)?;
    let orchestrator = JobOrchestrator::new(config, collaborators)?;

    let request = build_request(&args)?;
    match orchestrator.run(&args.token, request).await {
        Ok(response) => {
            print_json(&serde_json::to_value(response)?)?;
            Ok(0)
        }
        Err(err) => {
            print_json(&json!({
                "errorKind": err.error_kind,
                "userMessage": err.user_message,
            }))?;
            Ok(1)
        }
    }
}

fn load_config(path: Option<&Path>, data_dir: &Path) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    config.apply_env();
    // relative locations live under the data directory
    if config.storage.root.is_relative() {
        config.storage.root = data_dir.join(&config.storage.root);
    }
    if config.inference.output_dir.is_relative() {
        config.inference.output_dir = data_dir.join(&config.inference.output_dir);
    }
    Ok(config)
}

fn build_request(args: &SubmitArgs) -> Result<TryOnRequest> {
    let model_image = Some(load_image(&args.model)?);
    let quality_tier = QualityTier::parse(&args.tier);
    if let Some(instruction) = &args.edit {
        return Ok(TryOnRequest {
            model_image,
            edit_prompt: Some(instruction.clone()),
            quality_tier,
            edit_mode: true,
            ..TryOnRequest::default()
        });
    }
    let clothing_images = args
        .clothing
        .iter()
        .map(|raw| parse_clothing(raw))
        .collect::<Result<Vec<ClothingItem>>>()?;
    Ok(TryOnRequest {
        model_image,
        clothing_images,
        quality_tier,
        ..TryOnRequest::default()
    })
}

fn parse_clothing(raw: &str) -> Result<ClothingItem> {
    let Some((category, image)) = raw.split_once('=') else {
        bail!("clothing must be `category=<path or url>`, got `{raw}`");
    };
    Ok(ClothingItem::new(
        ClothingCategory::parse(category),
        load_image(image)?,
    ))
}

/// Remote references pass through; local files are sent inline as base64.
fn load_image(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        return Ok(trimmed.to_string());
    }
    let bytes = fs::read(trimmed).with_context(|| format!("failed reading image {trimmed}"))?;
    Ok(BASE64.encode(bytes))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clothing_flags_parse_category_and_source() -> Result<()> {
        let item = parse_clothing("shoes=https://cdn.example/boots.png")?;
        assert_eq!(item.category, ClothingCategory::Shoes);
        assert_eq!(item.image, "https://cdn.example/boots.png");
        assert_eq!(
            parse_clothing("scarf=https://cdn.example/s.png")?.category,
            ClothingCategory::Other
        );
        assert!(parse_clothing("https://cdn.example/no-category.png").is_err());
        Ok(())
    }

    #[test]
    fn local_images_are_inlined() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("model.png");
        fs::write(&path, [0x89, 0x50, 0x4E, 0x47])?;
        let encoded = load_image(&path.display().to_string())?;
        assert_eq!(BASE64.decode(encoded)?, [0x89, 0x50, 0x4E, 0x47]);
        Ok(())
    }

    #[test]
    fn edit_flag_switches_mode() -> Result<()> {
        let args = SubmitArgs {
            token: "tok".to_string(),
            model: "https://cdn.example/look.png".to_string(),
            clothing: vec!["top=https://cdn.example/top.png".to_string()],
            tier: "hd".to_string(),
            edit: Some("add a belt".to_string()),
        };
        let request = build_request(&args)?;
        assert!(request.edit_mode);
        assert!(request.clothing_images.is_empty());
        assert_eq!(request.edit_prompt.as_deref(), Some("add a belt"));
        Ok(())
    }

    #[test]
    fn relative_locations_resolve_under_data_dir() -> Result<()> {
        let config = load_config(None, Path::new("/tmp/drape-data"))?;
        assert!(config.storage.root.starts_with("/tmp/drape-data"));
        assert!(config.inference.output_dir.starts_with("/tmp/drape-data"));
        Ok(())
    }
}
