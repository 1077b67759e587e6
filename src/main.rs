//! Nexa - referral investment ledger
//!
//! `nexa serve` runs the HTTP API with the daily settlement scheduler.
//! The remaining subcommands are operator tools against the same ledger.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use nexa_backend::{
    api::{create_router, AppState, UserRateLimiter},
    auth::JwtHandler,
    clock::{Clock, SystemClock},
    config::PlatformConfig,
    ledger::LedgerStore,
    models::{BalanceType, NewUser, Role},
    settlement::{SettlementEngine, SettlementOutcome, SettlementScheduler},
};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "nexa")]
#[command(about = "Referral investment ledger and daily ROI settlement")]
struct Args {
    /// Override the database path from config/env
    #[arg(long, env = "DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API and the daily settlement scheduler (default)
    Serve,

    /// Settle one day now (idempotent; defaults to today UTC)
    Settle {
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Register a user
    CreateUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        /// Referral code of the upstream referrer
        #[arg(long)]
        referral_code: Option<String>,
        #[arg(long)]
        admin: bool,
    },

    /// Credit a balance directly
    Airdrop {
        #[arg(long)]
        email: String,
        #[arg(long)]
        amount: f64,
        /// ROI or REFERRAL
        #[arg(long, default_value = "ROI")]
        balance: String,
    },

    /// Issue a JWT for an existing user
    Token {
        #[arg(long)]
        email: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();
    let mut config = PlatformConfig::from_env()?;
    if let Some(db) = args.db {
        config.database.path = db;
    }
    let config = Arc::new(config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let ledger = Arc::new(
        LedgerStore::open(&config.database.path, config.clone(), clock)
            .with_context(|| format!("open ledger at {}", config.database.path))?,
    );
    info!("📒 Ledger database: {}", config.database.path);

    match args.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, ledger).await,
        Commands::Settle { date } => settle(ledger, date).await,
        Commands::CreateUser {
            name,
            email,
            referral_code,
            admin,
        } => {
            let user = ledger
                .create_user(&NewUser {
                    name,
                    email,
                    referral_code,
                    role: if admin { Role::Admin } else { Role::User },
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&user)?);
            Ok(())
        }
        Commands::Airdrop {
            email,
            amount,
            balance,
        } => {
            let balance_type = BalanceType::from_str(&balance)
                .with_context(|| format!("unknown balance type '{}'", balance))?;
            let user = ledger.airdrop(&email, amount, balance_type).await?;
            println!(
                "{} {} balance is now {:.2}",
                user.email,
                balance_type.as_str(),
                user.balance(balance_type)
            );
            Ok(())
        }
        Commands::Token { email } => {
            let user = ledger
                .find_user_by_email(&email)
                .await?
                .with_context(|| format!("no user with email {}", email))?;
            let jwt = JwtHandler::new(config.server.jwt_secret.clone());
            let (token, expires_in) = jwt.generate_token(&user)?;
            println!("{}", token);
            info!("Token for {} expires in {}s", user.email, expires_in);
            Ok(())
        }
    }
}

async fn serve(config: Arc<PlatformConfig>, ledger: Arc<LedgerStore>) -> Result<()> {
    info!("🚀 Nexa backend starting ({})", config.environment);
    if !config.is_production() && config.server.jwt_secret.len() < 32 {
        warn!("JWT_SECRET is shorter than 32 characters");
    }

    let engine = Arc::new(SettlementEngine::new(ledger.clone()));
    SettlementScheduler::spawn(engine.clone(), &config)?;

    let limiter = UserRateLimiter::per_minute(config.server.rate_limit_per_minute);
    tokio::spawn({
        let limiter = limiter.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                limiter.cleanup();
            }
        }
    });

    let state = AppState {
        ledger,
        engine,
        jwt: Arc::new(JwtHandler::new(config.server.jwt_secret.clone())),
        limiter,
    };
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = config.server.bind_addr.as_str();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

async fn settle(ledger: Arc<LedgerStore>, date: Option<NaiveDate>) -> Result<()> {
    let engine = SettlementEngine::new(ledger);
    let outcome = match date {
        Some(date) => engine.run_for_date(date).await?,
        None => engine.run_for_today().await?,
    };
    match &outcome {
        SettlementOutcome::Settled(report) => println!(
            "{}: {} investments, {:.4} ROI, {} commissions ({:.4})",
            report.date,
            report.investments_processed,
            report.roi_distributed,
            report.commissions_paid,
            report.commission_total
        ),
        SettlementOutcome::AlreadyProcessed { date } => {
            println!("{}: already processed", date)
        }
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nexa_backend=info,nexa=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // cwd + parents first, then the crate directory
    let _ = dotenv();

    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
