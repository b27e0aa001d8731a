use std::collections::HashMap;
use std::future::Future;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::SessionStore;
use crate::db::{Database, StoreError, User};
use crate::fetcher::Fetcher;
use crate::scheduler::{self, SchedulerError};

const DEFAULT_BROWSE_LIMIT: i64 = 2;

/// A parsed invocation: the command name plus its positional arguments.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("authentication failed: {0}")]
    Authentication(&'static str),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Session(#[from] anyhow::Error),
}

/// Everything a command handler can touch.
pub struct AppState {
    pub db: Database,
    pub fetcher: Fetcher,
    pub session: Box<dyn SessionStore>,
}

/// Every command the binary knows, resolved at compile time. The registry
/// maps invocation names onto these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Register,
    Login,
    Reset,
    Users,
    Agg,
    AddFeed,
    Feeds,
    Follow,
    Following,
    Unfollow,
    Browse,
    Help,
}

pub struct CommandRegistry {
    handlers: HashMap<&'static str, CommandKind>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The full command table. Built once at startup; `register` is
    /// last-wins, so a later entry for the same name shadows the earlier
    /// one.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("register", CommandKind::Register);
        registry.register("login", CommandKind::Login);
        registry.register("reset", CommandKind::Reset);
        registry.register("users", CommandKind::Users);
        registry.register("agg", CommandKind::Agg);
        registry.register("addfeed", CommandKind::AddFeed);
        registry.register("feeds", CommandKind::Feeds);
        registry.register("follow", CommandKind::Follow);
        registry.register("following", CommandKind::Following);
        registry.register("unfollow", CommandKind::Unfollow);
        registry.register("browse", CommandKind::Browse);
        registry.register("help", CommandKind::Help);
        registry
    }

    pub fn register(&mut self, name: &'static str, kind: CommandKind) {
        self.handlers.insert(name, kind);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Look up and run `cmd`, propagating the handler's error unchanged.
    pub async fn run(&self, state: &mut AppState, cmd: Command) -> Result<(), CommandError> {
        let kind = self
            .handlers
            .get(cmd.name.as_str())
            .copied()
            .ok_or_else(|| CommandError::UnknownCommand(cmd.name.clone()))?;
        dispatch(kind, state, cmd).await
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(
    kind: CommandKind,
    state: &mut AppState,
    cmd: Command,
) -> Result<(), CommandError> {
    match kind {
        CommandKind::Register => register(state, cmd).await,
        CommandKind::Login => login(state, cmd).await,
        CommandKind::Reset => reset(state, cmd).await,
        CommandKind::Users => users(state, cmd).await,
        CommandKind::Agg => agg(state, cmd).await,
        CommandKind::AddFeed => logged_in(state, cmd, add_feed).await,
        CommandKind::Feeds => feeds(state, cmd).await,
        CommandKind::Follow => logged_in(state, cmd, follow).await,
        CommandKind::Following => logged_in(state, cmd, following).await,
        CommandKind::Unfollow => logged_in(state, cmd, unfollow).await,
        CommandKind::Browse => logged_in(state, cmd, browse).await,
        CommandKind::Help => help(state, cmd).await,
    }
}

/// Authorization middleware: resolve the session user, then hand it to the
/// wrapped handler. The handler is never invoked when no valid session
/// exists, so gated commands cannot leave partial state behind.
pub async fn logged_in<'a, F, Fut>(
    state: &'a mut AppState,
    cmd: Command,
    handler: F,
) -> Result<(), CommandError>
where
    F: FnOnce(&'a mut AppState, Command, User) -> Fut,
    Fut: Future<Output = Result<(), CommandError>>,
{
    let name = state
        .session
        .current_user()
        .ok_or(CommandError::Authentication("not logged in"))?;
    let user = state
        .db
        .get_user(&name)
        .await?
        .ok_or(CommandError::Authentication("session user no longer exists"))?;
    handler(state, cmd, user).await
}

// ===== Handlers =====

async fn register(state: &mut AppState, cmd: Command) -> Result<(), CommandError> {
    let name = cmd
        .args
        .first()
        .ok_or(CommandError::Usage("register <name>"))?;

    let user = state.db.create_user(name).await?;
    state.session.set_current_user(&user.name)?;

    println!("User '{}' created", user.name);
    Ok(())
}

async fn login(state: &mut AppState, cmd: Command) -> Result<(), CommandError> {
    let name = cmd.args.first().ok_or(CommandError::Usage("login <name>"))?;

    let user = state
        .db
        .get_user(name)
        .await?
        .ok_or_else(|| CommandError::NotFound(format!("user '{name}'")))?;
    state.session.set_current_user(&user.name)?;

    println!("User '{}' logged in", user.name);
    Ok(())
}

async fn reset(state: &mut AppState, cmd: Command) -> Result<(), CommandError> {
    if !cmd.args.is_empty() {
        return Err(CommandError::Usage("reset"));
    }

    state.db.reset_all().await?;
    println!("Database reset");
    Ok(())
}

async fn users(state: &mut AppState, cmd: Command) -> Result<(), CommandError> {
    if !cmd.args.is_empty() {
        return Err(CommandError::Usage("users"));
    }

    let current = state.session.current_user();
    for user in state.db.get_users().await? {
        if current.as_deref() == Some(user.name.as_str()) {
            println!("* {} (current)", user.name);
        } else {
            println!("* {}", user.name);
        }
    }
    Ok(())
}

async fn agg(state: &mut AppState, cmd: Command) -> Result<(), CommandError> {
    let raw = cmd.args.first().ok_or(CommandError::Usage("agg <interval>"))?;
    let every = scheduler::parse_interval(raw)?;

    println!("Collecting feeds every {raw}...");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping scheduler");
            let _ = shutdown_tx.send(());
        }
    });

    scheduler::run(&state.db, &state.fetcher, every, shutdown_rx).await;
    Ok(())
}

async fn add_feed(state: &mut AppState, cmd: Command, user: User) -> Result<(), CommandError> {
    let (name, url) = match cmd.args.as_slice() {
        [name, url] => (name, url),
        _ => return Err(CommandError::Usage("addfeed <name> <url>")),
    };

    let feed = state.db.create_feed(name, url, &user.id).await?;
    state.db.create_feed_follow(&user.id, &feed.id).await?;

    println!("Feed '{}' added ({})", feed.name, feed.url);
    Ok(())
}

async fn feeds(state: &mut AppState, cmd: Command) -> Result<(), CommandError> {
    if !cmd.args.is_empty() {
        return Err(CommandError::Usage("feeds"));
    }

    for feed in state.db.get_feeds().await? {
        let owner = state
            .db
            .get_user_by_id(&feed.user_id)
            .await?
            .map(|u| u.name)
            .unwrap_or_else(|| "(unknown)".to_string());
        println!("* {} ({}) added by {}", feed.name, feed.url, owner);
    }
    Ok(())
}

async fn follow(state: &mut AppState, cmd: Command, user: User) -> Result<(), CommandError> {
    let url = cmd.args.first().ok_or(CommandError::Usage("follow <url>"))?;

    let feed = state
        .db
        .get_feed_by_url(url)
        .await?
        .ok_or_else(|| CommandError::NotFound(format!("feed {url}")))?;
    state.db.create_feed_follow(&user.id, &feed.id).await?;

    println!("{} is now following '{}'", user.name, feed.name);
    Ok(())
}

async fn following(state: &mut AppState, cmd: Command, user: User) -> Result<(), CommandError> {
    if !cmd.args.is_empty() {
        return Err(CommandError::Usage("following"));
    }

    for name in state.db.get_feed_follows_for_user(&user.id).await? {
        println!("* {name}");
    }
    Ok(())
}

async fn unfollow(state: &mut AppState, cmd: Command, user: User) -> Result<(), CommandError> {
    let url = cmd
        .args
        .first()
        .ok_or(CommandError::Usage("unfollow <url>"))?;

    let feed = state
        .db
        .get_feed_by_url(url)
        .await?
        .ok_or_else(|| CommandError::NotFound(format!("feed {url}")))?;
    state.db.unfollow_feed(&user.id, &feed.id).await?;

    println!("Unfollowed '{}'", feed.name);
    Ok(())
}

async fn browse(state: &mut AppState, cmd: Command, user: User) -> Result<(), CommandError> {
    let limit = match cmd.args.first() {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| CommandError::Usage("browse [limit]"))?,
        None => DEFAULT_BROWSE_LIMIT,
    };

    let posts = state.db.get_posts_for_user(&user.id, limit).await?;
    println!("Found {} posts for {}:", posts.len(), user.name);
    for post in posts {
        match post.published_at {
            Some(at) => println!("{} from {}", at.format("%a %b %e"), post.feed_name),
            None => println!("(no date) from {}", post.feed_name),
        }
        println!("--- {} ---", post.title);
        if let Some(description) = &post.description {
            println!("    {description}");
        }
        println!("Link: {}", post.url);
    }
    Ok(())
}

async fn help(_state: &mut AppState, _cmd: Command) -> Result<(), CommandError> {
    println!("usage: grazer <command> [args]");
    println!();
    println!("Commands:");
    for (name, description) in [
        ("register <name>", "create a user and log in"),
        ("login <name>", "log in as an existing user"),
        ("reset", "wipe all stored data"),
        ("users", "list users"),
        ("agg <interval>", "poll feeds forever (e.g. agg 1m)"),
        ("addfeed <name> <url>", "add a feed and follow it (requires login)"),
        ("feeds", "list all feeds"),
        ("follow <url>", "follow an existing feed (requires login)"),
        ("following", "list followed feeds (requires login)"),
        ("unfollow <url>", "stop following a feed (requires login)"),
        ("browse [limit]", "show recent posts from followed feeds (requires login)"),
        ("help", "show this message"),
    ] {
        println!("  {name:<22} {description}");
    }
    Ok(())
}
