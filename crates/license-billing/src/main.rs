use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, LogLevel, Verbosity};
use license_billing::config::BillingConfig;
use license_billing::domain::{
    BillingCycleCalculator, Clock, LicenseId, LicenseManager, OwnerId, PlanCatalog, SystemClock,
    UsageContext,
};
use license_billing::metrics::BillingMetrics;
use license_billing::storage::{
    DatabaseConnection, SqlBillingCycleRepository, SqlLicenseRepository, SqlUsageRepository,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "license-billing", version, author)]
#[command(about = "Billing cycles and metered usage for recurring licenses")]
struct Args {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Print the default configuration as TOML")]
    gen_config: bool,

    #[arg(long, help = "Validate configuration and database access, then exit")]
    dry_run: bool,

    #[arg(long, help = "Print this run's metrics in the Prometheus text format")]
    print_metrics: bool,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Resolve the billing cycle covering an instant
    Cycle {
        #[arg(long)]
        owner: String,
        /// RFC 3339 instant, defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// Do not persist a missing cycle
        #[arg(long)]
        no_save: bool,
    },

    /// Resolve the cycle following the one covering an instant
    NextCycle {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Print the chargeable usage of a license as JSON
    Chargeable {
        #[arg(long)]
        license: LicenseId,
        /// Any instant inside the cycle, defaults to now
        #[arg(long)]
        cycle: Option<DateTime<Utc>>,
    },
}

fn init_logging<L: LogLevel>(verbosity: &Verbosity<L>, default_filter: &str) -> Result<()> {
    let filter = match verbosity.log_level() {
        Some(level) if verbosity.is_present() => EnvFilter::try_new(level.to_string())?,
        _ => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .compact(),
        )
        .init();

    Ok(())
}

struct Services {
    database: DatabaseConnection,
    cycles: Arc<BillingCycleCalculator>,
    context: UsageContext,
    metrics: Arc<BillingMetrics>,
}

impl Services {
    async fn connect(config: &BillingConfig) -> Result<Self> {
        let database = DatabaseConnection::new(&config.database).await?;
        let pool = database.pool().clone();
        let metrics = Arc::new(BillingMetrics::new()?);
        let retries = config.usage.conflict_retries_enabled;

        let cycles = Arc::new(
            BillingCycleCalculator::new(
                Arc::new(SqlBillingCycleRepository::new(pool.clone())),
                config.cycle.clone(),
            )
            .with_metrics(metrics.clone())
            .with_conflict_retries(retries),
        );
        let context = UsageContext::new(
            Arc::new(SqlUsageRepository::new(
                pool.clone(),
                database.lock_timeout_ms(),
            )),
            Arc::new(SqlLicenseRepository::new(pool)),
            Arc::new(PlanCatalog::from_config(&config.plans)),
            cycles.clone(),
            Arc::new(SystemClock),
        )
        .with_metrics(metrics.clone())
        .with_conflict_retries(retries);

        Ok(Self {
            database,
            cycles,
            context,
            metrics,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.verbosity, "license_billing=info")?;

    if args.gen_config {
        let toml = toml::to_string_pretty(&BillingConfig::default())?;
        println!("{}", toml);
        return Ok(());
    }

    let config = BillingConfig::load(args.config)?;
    info!(
        "Loaded configuration for {} ({}), {} plans",
        config.service.service_id,
        config.service.environment,
        config.plans.len()
    );

    let services = Services::connect(&config).await?;

    if args.dry_run {
        services.database.health_check().await?;
        info!("Configuration validated successfully (dry-run mode)");
        return Ok(());
    }

    let Some(command) = args.command else {
        info!("No command given, nothing to do");
        return Ok(());
    };

    if let Err(e) = run(command, &services).await {
        error!("Command failed: {:#}", e);
        return Err(e);
    }
    if args.print_metrics {
        print!("{}", services.metrics.render()?);
    }
    Ok(())
}

async fn run(command: Command, services: &Services) -> Result<()> {
    let now = SystemClock.now();

    match command {
        Command::Migrate => {
            services.database.run_migrations().await?;
        }
        Command::Cycle { owner, at, no_save } => {
            let cycle = services
                .cycles
                .get_or_create_cycle(&OwnerId::new(owner), at.unwrap_or(now), !no_save)
                .await?;
            println!("{}", serde_json::to_string_pretty(&cycle)?);
            println!("{}", services.cycles.label(cycle.start, cycle.end));
        }
        Command::NextCycle { owner, at } => {
            let cycles = &services.cycles;
            let current = cycles
                .get_or_create_cycle(&OwnerId::new(owner), at.unwrap_or(now), true)
                .await?;
            let next = cycles.get_next_cycle(&current, true).await?;
            println!("{}", serde_json::to_string_pretty(&next)?);
            println!("{}", cycles.label(next.start, next.end));
        }
        Command::Chargeable { license, cycle } => {
            let manager = LicenseManager::new(services.context.clone());
            let items = manager
                .chargeable_usage_at(&license, cycle.unwrap_or(now))
                .await
                .with_context(|| format!("failed to compute chargeable usage of {}", license))?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }

    Ok(())
}
