use celerix_store::sdk;
use celerix_store::{
    AppEnumeration, BatchExporter, GlobalSearcher, KVReader, KVWriter, Orchestrator,
};
use clap::{Parser, Subcommand};
use serde_json::Value;

/// Celerix Store command-line client.
///
/// Talks to a remote daemon when `CELERIX_STORE_ADDR` is set, otherwise
/// operates on the embedded store under `--data-dir`.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long, env = "CELERIX_DATA_DIR", default_value = "data")]
    data_dir: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Read one value.
    Get { persona: String, app: String, key: String },
    /// Write one value (raw JSON, or a bare string).
    Set { persona: String, app: String, key: String, value: String },
    /// Delete one key.
    Del { persona: String, app: String, key: String },
    /// List all personas.
    ListPersonas,
    /// List the apps of one persona.
    ListApps { persona: String },
    /// Dump one app of one persona.
    Dump { persona: String, app: String },
    /// Dump one app across all personas.
    DumpApp { app: String },
    /// Find a key under an app in any persona.
    GetGlobal { app: String, key: String },
    /// Move a key from one persona to another.
    Move { src_persona: String, dst_persona: String, app: String, key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = sdk::new(&cli.data_dir).await?;

    match cli.command {
        Commands::Get { persona, app, key } => {
            let val = store.get(&persona, &app, &key).await?;
            println!("{}", serde_json::to_string_pretty(&val)?);
        }
        Commands::Set { persona, app, key, value } => {
            let val: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            store.set(&persona, &app, &key, val).await?;
            println!("OK");
        }
        Commands::Del { persona, app, key } => {
            store.delete(&persona, &app, &key).await?;
            println!("OK");
        }
        Commands::ListPersonas => {
            let list = store.get_personas().await?;
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        Commands::ListApps { persona } => {
            let list = store.get_apps(&persona).await?;
            println!("{}", serde_json::to_string_pretty(&list)?);
        }
        Commands::Dump { persona, app } => {
            let data = store.get_app_store(&persona, &app).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Commands::DumpApp { app } => {
            let data = store.dump_app(&app).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Commands::GetGlobal { app, key } => {
            let (val, persona) = store.get_global(&app, &key).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "persona": persona,
                    "value": val,
                }))?
            );
        }
        Commands::Move { src_persona, dst_persona, app, key } => {
            store.move_key(&src_persona, &dst_persona, &app, &key).await?;
            println!("OK");
        }
    }

    Ok(())
}
