use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use grazer::commands::{AppState, Command, CommandRegistry};
use grazer::config::Config;
use grazer::db::Database;
use grazer::fetcher::Fetcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grazer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration (missing file means first run)
    let config = Config::load(Config::default_path())?;

    // Initialize database
    let db = Database::new(&config.db_url).await?;
    db.initialize().await?;

    let mut state = AppState {
        db,
        fetcher: Fetcher::new(),
        session: Box::new(config),
    };

    // Parse the invocation: command name plus positional arguments
    let mut args = std::env::args().skip(1);
    let name = match args.next() {
        Some(name) => name,
        None => {
            eprintln!("usage: grazer <command> [args] (try 'grazer help')");
            std::process::exit(1);
        }
    };
    let cmd = Command {
        name,
        args: args.collect(),
    };

    let registry = CommandRegistry::with_defaults();
    if let Err(err) = registry.run(&mut state, cmd).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    Ok(())
}
