//! Trigger Trader - trigger-based automated trading engine for Solana
//!
//! # WARNING
//! - Trading bots lose money as easily as they make it.
//! - Execution is simulated by the paper exchange; nothing is signed or sent.
//! - Copy-trading and sniping react to public data every other bot sees too.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use trigger_trader::cli::commands::{self, CopyArgs, LimitArgs, SniperArgs};
use trigger_trader::config::Config;
use trigger_trader::task::{OrderSide, TriggerMetric};

/// Trigger Trader - copy trading, sniping and limit orders
#[derive(Parser)]
#[command(name = "trigger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl-C
    Start,

    /// Manage watch tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Mirror a wallet's trades
    AddCopy {
        /// Owner of the task
        #[arg(long)]
        owner: String,

        /// Wallet to follow
        wallet: String,

        /// Follow buys only (combine with --sells for both; default both)
        #[arg(long)]
        buys: bool,

        /// Follow sells only
        #[arg(long)]
        sells: bool,

        /// Fixed SOL amount per mirrored buy
        #[arg(long, conflicts_with = "multiplier")]
        amount: Option<f64>,

        /// Scale the source trade by this factor
        #[arg(long)]
        multiplier: Option<f64>,

        /// Auto-sell take profit in percent
        #[arg(long)]
        take_profit: Option<f64>,

        /// Auto-sell stop loss in percent
        #[arg(long)]
        stop_loss: Option<f64>,

        #[arg(long)]
        slippage_bps: Option<u32>,
    },

    /// Buy new pools that pass a filter
    AddSniper {
        #[arg(long)]
        owner: String,

        /// SOL per snipe (default from config)
        #[arg(long)]
        amount: Option<f64>,

        /// Minimum pool liquidity in SOL
        #[arg(long)]
        min_liquidity: Option<f64>,

        /// Maximum buy tax in percent
        #[arg(long)]
        max_buy_tax: Option<f64>,

        /// Maximum sell tax in percent
        #[arg(long)]
        max_sell_tax: Option<f64>,

        /// Do not arm take-profit / stop-loss after buys
        #[arg(long)]
        no_auto_sell: bool,

        #[arg(long)]
        slippage_bps: Option<u32>,
    },

    /// Trade when a token's price or market cap crosses a level
    AddLimit {
        #[arg(long)]
        owner: String,

        /// Token mint address
        token: String,

        #[arg(long, value_enum)]
        side: Side,

        #[arg(long, value_enum, default_value = "price")]
        metric: Metric,

        /// Trigger level in SOL
        #[arg(long)]
        trigger: f64,

        /// SOL to spend (buys) or tokens to sell (sells)
        #[arg(long)]
        amount: f64,

        /// Stay active after filling
        #[arg(long)]
        rearm: bool,

        #[arg(long)]
        slippage_bps: Option<u32>,
    },

    /// List tasks
    List {
        /// Only this owner's tasks
        #[arg(long)]
        owner: Option<String>,
    },

    /// Cancel a task, or all of an owner's tasks
    Cancel {
        /// Task id
        #[arg(required_unless_present = "all")]
        id: Option<String>,

        /// Cancel every open task of this owner
        #[arg(long, value_name = "OWNER", conflicts_with = "id")]
        all: Option<String>,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Pause an active task
    Pause { id: String },

    /// Resume a paused task
    Resume { id: String },

    /// Change a limit order's trigger level
    SetTrigger { id: String, value: f64 },

    /// Change a sniper's pool filter
    SetFilter {
        id: String,

        #[arg(long)]
        min_liquidity: Option<f64>,

        #[arg(long)]
        max_buy_tax: Option<f64>,

        #[arg(long)]
        max_sell_tax: Option<f64>,
    },

    /// Show a task's execution history
    History {
        id: String,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Buy,
    Sell,
    StopLoss,
    TakeProfit,
}

impl From<Side> for OrderSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => OrderSide::Buy,
            Side::Sell => OrderSide::Sell,
            Side::StopLoss => OrderSide::StopLoss,
            Side::TakeProfit => OrderSide::TakeProfit,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Metric {
    Price,
    MarketCap,
}

impl From<Metric> for TriggerMetric {
    fn from(metric: Metric) -> Self {
        match metric {
            Metric::Price => TriggerMetric::Price,
            Metric::MarketCap => TriggerMetric::MarketCap,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trigger_trader=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.json_logs);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start => commands::start(&config).await,
        Commands::Config => commands::show_config(&config),
        Commands::Task { action } => match action {
            TaskAction::AddCopy {
                owner,
                wallet,
                buys,
                sells,
                amount,
                multiplier,
                take_profit,
                stop_loss,
                slippage_bps,
            } => {
                commands::add_copy(
                    &config,
                    CopyArgs {
                        owner,
                        wallet,
                        buys,
                        sells,
                        amount,
                        multiplier,
                        take_profit_pct: take_profit,
                        stop_loss_pct: stop_loss,
                        slippage_bps,
                    },
                )
                .await
            }
            TaskAction::AddSniper {
                owner,
                amount,
                min_liquidity,
                max_buy_tax,
                max_sell_tax,
                no_auto_sell,
                slippage_bps,
            } => {
                commands::add_sniper(
                    &config,
                    SniperArgs {
                        owner,
                        buy_amount: amount,
                        min_liquidity,
                        max_buy_tax,
                        max_sell_tax,
                        no_auto_sell,
                        slippage_bps,
                    },
                )
                .await
            }
            TaskAction::AddLimit {
                owner,
                token,
                side,
                metric,
                trigger,
                amount,
                rearm,
                slippage_bps,
            } => {
                commands::add_limit(
                    &config,
                    LimitArgs {
                        owner,
                        token,
                        side: side.into(),
                        metric: metric.into(),
                        trigger_value: trigger,
                        amount,
                        rearm,
                        slippage_bps,
                    },
                )
                .await
            }
            TaskAction::List { owner } => commands::list(&config, owner.as_deref()).await,
            TaskAction::Cancel { id, all, force } => match (id, all) {
                (_, Some(owner)) => commands::cancel_all(&config, &owner, force).await,
                (Some(id), None) => commands::cancel(&config, &id).await,
                (None, None) => Err(anyhow::anyhow!("Give a task id or --all <OWNER>")),
            },
            TaskAction::Pause { id } => commands::pause(&config, &id).await,
            TaskAction::Resume { id } => commands::resume(&config, &id).await,
            TaskAction::SetTrigger { id, value } => {
                commands::set_trigger(&config, &id, value).await
            }
            TaskAction::SetFilter {
                id,
                min_liquidity,
                max_buy_tax,
                max_sell_tax,
            } => commands::set_filter(&config, &id, min_liquidity, max_buy_tax, max_sell_tax).await,
            TaskAction::History { id, limit } => commands::history(&config, &id, limit).await,
        },
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
