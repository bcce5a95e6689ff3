use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use twin::client::Client;
use twin::daemon::DaemonConfig;
use twin::error::TwinError;
use twin::output::{self, OutputMode};
use twin::types::{AllocationStrategy, EntityKind};

#[derive(Parser)]
#[command(name = "tw", about = "Hospital digital twin record store with sequential identifiers")]
struct Cli {
    #[arg(long, env = "TW_ACTOR", global = true)]
    actor: Option<String>,

    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Daemon {
        #[arg(long, env = "TW_PORT", default_value_t = 7534)]
        port: u16,
        #[arg(long)]
        project_dir: Option<PathBuf>,
        #[arg(long, env = "TW_ALLOCATION", default_value = "counter")]
        strategy: AllocationStrategy,
        #[command(subcommand)]
        subcmd: Option<DaemonSubcommand>,
    },
    Where,
    Kinds,
    Create {
        kind: EntityKind,
        /// JSON object with the record's fields.
        #[arg(long)]
        data: Option<String>,
        /// Single field as key=value; the value is parsed as JSON when it can be.
        #[arg(long = "set")]
        sets: Vec<String>,
    },
    Show {
        kind: EntityKind,
        id: String,
    },
    List {
        kind: EntityKind,
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    Update {
        kind: EntityKind,
        id: String,
        #[arg(long)]
        data: Option<String>,
        #[arg(long = "set")]
        sets: Vec<String>,
    },
    Next {
        kind: EntityKind,
    },
    History {
        kind: EntityKind,
        id: String,
    },
    Status,
}

#[derive(Subcommand)]
enum DaemonSubcommand {
    Status,
}

fn resolve_actor(flag: Option<String>) -> String {
    if let Some(a) = flag {
        return a;
    }
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

fn build_fields(data: Option<String>, sets: Vec<String>) -> Result<Map<String, Value>, TwinError> {
    let mut fields = match data {
        Some(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(TwinError::Validation(
                    "--data must be a JSON object".into(),
                ));
            }
            Err(e) => return Err(TwinError::Validation(format!("--data is not JSON: {e}"))),
        },
        None => Map::new(),
    };

    for set in sets {
        let Some((key, raw)) = set.split_once('=') else {
            return Err(TwinError::Validation(format!(
                "--set expects key=value, got {set:?}"
            )));
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(key.trim().to_string(), value);
    }

    Ok(fields)
}

fn fail(err: TwinError, mode: OutputMode) -> ! {
    output::print_error(&err, mode);
    process::exit(1);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let actor = resolve_actor(cli.actor);

    match cli.command {
        Commands::Daemon {
            port,
            project_dir,
            strategy,
            subcmd,
        } => match subcmd {
            Some(DaemonSubcommand::Status) => {
                let client = Client::new();
                match client.check_reachable() {
                    Ok(()) => {
                        println!("daemon reachable at {}", client.base_url());
                        process::exit(0);
                    }
                    Err(e) => {
                        eprintln!("daemon unreachable: {e}");
                        process::exit(1);
                    }
                }
            }
            None => {
                let project_dir = match project_dir.map_or_else(std::env::current_dir, Ok) {
                    Ok(dir) => dir,
                    Err(e) => fail(TwinError::Internal(format!("no working directory: {e}")), mode),
                };
                let rt = match tokio::runtime::Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => fail(TwinError::Internal(format!("failed to start runtime: {e}")), mode),
                };
                let config = DaemonConfig {
                    port,
                    project_dir,
                    strategy,
                };
                if let Err(e) = rt.block_on(twin::daemon::start(config)) {
                    fail(e, mode);
                }
            }
        },

        Commands::Where => match std::env::current_dir() {
            Ok(dir) => println!("{}", dir.join(".twin").display()),
            Err(e) => fail(TwinError::Internal(format!("no working directory: {e}")), mode),
        },

        Commands::Kinds => {
            let client = Client::new();
            match client.kinds() {
                Ok(v) => output::print_kinds(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::Create { kind, data, sets } => {
            let fields = build_fields(data, sets).unwrap_or_else(|e| fail(e, mode));
            let client = Client::new();
            match client.create_record(kind, &fields, &actor) {
                Ok(v) => output::print_record(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::Show { kind, id } => {
            let client = Client::new();
            match client.get_record(kind, &id) {
                Ok(v) => output::print_record_detail(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::List { kind, limit } => {
            let client = Client::new();
            match client.list_records(kind, limit) {
                Ok(v) => output::print_record_list(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::Update {
            kind,
            id,
            data,
            sets,
        } => {
            let fields = build_fields(data, sets).unwrap_or_else(|e| fail(e, mode));
            let client = Client::new();
            match client.update_record(kind, &id, &fields, &actor) {
                Ok(v) => output::print_record(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::Next { kind } => {
            let client = Client::new();
            match client.next_id(kind) {
                Ok(v) => output::print_next_id(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::History { kind, id } => {
            let client = Client::new();
            match client.record_history(kind, &id) {
                Ok(v) => output::print_events(&v, mode),
                Err(e) => fail(e, mode),
            }
        }

        Commands::Status => {
            let client = Client::new();
            match client.status() {
                Ok(v) => output::print_status(&v, mode),
                Err(e) => fail(e, mode),
            }
        }
    }
}
