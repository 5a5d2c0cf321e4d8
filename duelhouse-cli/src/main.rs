mod commands;

use clap::{Parser, Subcommand};
use duelhouse_core::{
    Coordinator, CoordinatorConfig, HttpLedger, HttpRollup, SkirmishRules, SqliteStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "duelhouse")]
#[command(about = "Session coordinator CLI for ledger-anchored 2-player wagered matches")]
#[command(version)]
struct Cli {
    /// Data directory for coordinator storage
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Ledger RPC endpoint
    #[arg(long, global = true)]
    ledger_url: Option<String>,

    /// Rollup service endpoint
    #[arg(long, global = true)]
    rollup_url: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new wagered match session
    Create {
        /// Entry fee per player in base ledger units
        fee: u64,
        /// Per-move clock in seconds
        #[arg(long)]
        time_limit: Option<u64>,
        /// Rules variant
        #[arg(long)]
        variant: Option<String>,
        /// Restrict joining to this wallet address (repeatable)
        #[arg(long)]
        allow: Vec<String>,
    },
    /// Build an unsigned escrow deposit for joining a session
    Join {
        /// Wallet address of the joining player
        wallet: String,
        /// Session ID or join code
        session: String,
    },
    /// Confirm a broadcast deposit and claim the seat
    Confirm {
        /// Wallet address of the joining player
        wallet: String,
        /// Session ID or join code
        session: String,
        /// Signed transaction reference from the wallet broadcast
        tx_ref: String,
    },
    /// Activate a session whose countdown has elapsed
    Activate {
        /// Session ID or join code
        session: String,
    },
    /// Submit a move
    Move {
        /// Wallet address of the player
        wallet: String,
        /// Session ID or join code
        session: String,
        /// Source square as x,y
        from: String,
        /// Destination square as x,y
        to: String,
        /// Piece to move: scout, keep or crown
        piece: String,
    },
    /// Undo your own last move within the undo window
    Undo {
        /// Wallet address of the player
        wallet: String,
        /// Session ID or join code
        session: String,
    },
    /// Resign and forfeit the pot to the opponent
    Resign {
        /// Wallet address of the player
        wallet: String,
        /// Session ID or join code
        session: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// List legal moves for a player
    Moves {
        /// Wallet address of the player
        wallet: String,
        /// Session ID or join code
        session: String,
        /// Only moves from this square, as x,y
        #[arg(long)]
        from: Option<String>,
        /// Only moves for this piece kind
        #[arg(long)]
        piece: Option<String>,
    },
    /// Show session status, board and settlement
    Status {
        /// Session ID or join code
        session: String,
    },
    /// Show countdown state
    Countdown {
        /// Session ID or join code
        session: String,
    },
    /// Show the escrow deposit address
    Escrow {
        /// Session ID or join code
        session: String,
    },
    /// Place a spectator bet on the outcome
    Bet {
        /// Wallet address of the bettor
        wallet: String,
        /// Session ID or join code
        session: String,
        /// Predicted outcome: p1, p2 or draw
        outcome: String,
        /// Stake in base ledger units
        amount: u64,
    },
    /// Show the betting pool
    Pool {
        /// Session ID or join code
        session: String,
    },
    /// Show the settlement result
    Settlement {
        /// Session ID or join code
        session: String,
    },
    /// Retry a settlement that needs reconciliation
    Reconcile {
        /// Session ID or join code
        session: String,
    },
    /// Forfeit the on-turn player if the move clock ran out
    Timeout {
        /// Session ID or join code
        session: String,
    },
    /// Expire stale waiting sessions and process queued refunds
    Sweep,
    /// Abort a session and refund deposits and stakes
    Abort {
        /// Session ID or join code
        session: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Export the world state as JSON
    Export {
        /// Session ID or join code
        session: String,
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Import a world state snapshot from JSON
    Import {
        /// Path to the snapshot file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "duelhouse={},duelhouse_core={}",
            log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Get data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duelhouse")
    });

    // Ensure data directory exists
    tokio::fs::create_dir_all(&data_dir).await?;
    tracing::debug!("Using data directory {}", data_dir.display());

    // Initialize coordinator
    let mut config = CoordinatorConfig::default();
    if let Some(url) = cli.ledger_url {
        config.ledger_url = url;
    }
    if let Some(url) = cli.rollup_url {
        config.rollup_url = url;
    }

    let store = Arc::new(SqliteStore::new(&data_dir.join("duelhouse.db")).await?);
    let ledger = Arc::new(HttpLedger::new(&config.ledger_url));
    let rollup = Arc::new(HttpRollup::new(&config.rollup_url));
    let coordinator = Coordinator::new(config, store, ledger, rollup, Arc::new(SkirmishRules))?;

    // Execute command
    let result = match cli.command {
        Commands::Create {
            fee,
            time_limit,
            variant,
            allow,
        } => commands::create_session(&coordinator, fee, time_limit, variant, allow).await,
        Commands::Join { wallet, session } => {
            commands::build_join(&coordinator, &wallet, &session).await
        }
        Commands::Confirm {
            wallet,
            session,
            tx_ref,
        } => commands::confirm_join(&coordinator, &wallet, &session, &tx_ref).await,
        Commands::Activate { session } => commands::activate(&coordinator, &session).await,
        Commands::Move {
            wallet,
            session,
            from,
            to,
            piece,
        } => commands::submit_move(&coordinator, &wallet, &session, &from, &to, &piece).await,
        Commands::Undo { wallet, session } => {
            commands::undo_move(&coordinator, &wallet, &session).await
        }
        Commands::Resign {
            wallet,
            session,
            yes,
        } => commands::resign(&coordinator, &wallet, &session, yes).await,
        Commands::Moves {
            wallet,
            session,
            from,
            piece,
        } => {
            commands::list_moves(
                &coordinator,
                &wallet,
                &session,
                from.as_deref(),
                piece.as_deref(),
            )
            .await
        }
        Commands::Status { session } => commands::show_status(&coordinator, &session).await,
        Commands::Countdown { session } => commands::show_countdown(&coordinator, &session).await,
        Commands::Escrow { session } => commands::show_escrow(&coordinator, &session).await,
        Commands::Bet {
            wallet,
            session,
            outcome,
            amount,
        } => commands::place_bet(&coordinator, &wallet, &session, &outcome, amount).await,
        Commands::Pool { session } => commands::show_pool(&coordinator, &session).await,
        Commands::Settlement { session } => {
            commands::show_settlement(&coordinator, &session).await
        }
        Commands::Reconcile { session } => commands::reconcile(&coordinator, &session).await,
        Commands::Timeout { session } => commands::enforce_timeout(&coordinator, &session).await,
        Commands::Sweep => commands::sweep(&coordinator).await,
        Commands::Abort { session, yes } => commands::abort(&coordinator, &session, yes).await,
        Commands::Export { session, output } => {
            commands::export_world(&coordinator, &session, output).await
        }
        Commands::Import { file } => commands::import_world(&coordinator, &file).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
