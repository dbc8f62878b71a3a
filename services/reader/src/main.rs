use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, ValueEnum};
use flowlogs_reader::actions::{ActionError, Command, KNOWN_ACTIONS};
use flowlogs_reader::{
    CloudWatchLogsClient, Config, FlowLogsReader, S3FlowLogsReader, S3ObjectStore, TimeWindow,
};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LocationType {
    Cloudwatch,
    S3,
}

/// Read records from VPC Flow Logs
#[derive(Debug, Parser)]
#[command(name = "flowlogs-reader", version)]
struct Cli {
    /// CloudWatch Logs group name, or `bucket/prefix` for S3
    location: String,

    /// Action to take on log records, followed by its arguments
    #[arg(default_values_t = vec!["print".to_string()])]
    action: Vec<String>,

    /// Where the flow logs are stored
    #[arg(long, value_enum, default_value_t = LocationType::Cloudwatch)]
    location_type: LocationType,

    /// AWS region the logs are in
    #[arg(long)]
    region: Option<String>,

    /// Named AWS profile to use
    #[arg(long)]
    profile: Option<String>,

    /// Read records at or after this time
    #[arg(short, long)]
    start_time: Option<String>,

    /// Read records before this time
    #[arg(short, long)]
    end_time: Option<String>,

    /// Format of --start-time and --end-time
    #[arg(long)]
    time_format: Option<String>,

    /// CloudWatch Logs filter pattern
    #[arg(long)]
    filter_pattern: Option<String>,

    /// Comma separated account IDs to read (S3 only)
    #[arg(long, value_delimiter = ',')]
    include_accounts: Option<Vec<String>>,

    /// Comma separated regions to read (S3 only)
    #[arg(long, value_delimiter = ',')]
    include_regions: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    if cli.region.is_some() {
        config.aws.region = cli.region.clone();
    }
    if cli.profile.is_some() {
        config.aws.profile = cli.profile.clone();
    }

    init_tracing(&config.service.log_level);

    let (action, args) = cli
        .action
        .split_first()
        .context("No action given")?;
    let command = match Command::parse(action, args) {
        Ok(command) => command,
        Err(ActionError::Unknown(name)) => {
            eprintln!("unknown action: {}", name);
            eprintln!("known actions: {}", KNOWN_ACTIONS.join(", "));
            return Ok(());
        }
        Err(e) => return Err(e).context("Invalid action"),
    };

    let time_format = cli
        .time_format
        .as_deref()
        .unwrap_or(&config.reader.time_format);
    let window = TimeWindow::from_bounds(
        parse_time(cli.start_time.as_deref(), time_format).context("Invalid --start-time")?,
        parse_time(cli.end_time.as_deref(), time_format).context("Invalid --end-time")?,
    );

    info!(
        service = %config.service.name,
        location = %cli.location,
        location_type = ?cli.location_type,
        action = command.name(),
        start = %window.start,
        end = %window.end,
        "Reading flow logs"
    );

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match cli.location_type {
        LocationType::Cloudwatch => {
            let client = CloudWatchLogsClient::from_config(&config.aws).await;
            let reader = FlowLogsReader::new(client, &cli.location)
                .time_window(window)
                .filter_pattern(cli.filter_pattern.or(config.reader.filter_pattern));
            command.run(reader.records(), &mut out).await?;
        }
        LocationType::S3 => {
            let store = S3ObjectStore::from_config(&config.aws).await;
            let mut reader =
                S3FlowLogsReader::new(Arc::new(store), &cli.location).time_window(window);
            if let Some(accounts) = cli.include_accounts {
                reader = reader.include_accounts(accounts);
            }
            if let Some(regions) = cli.include_regions {
                reader = reader.include_regions(regions);
            }
            command.run(reader.records(), &mut out).await?;
        }
    }

    out.flush().context("Failed to flush output")?;
    Ok(())
}

/// Initialize tracing/logging. Logs go to stderr; stdout carries records.
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_writer(io::stderr))
        .init();
}

/// Parse a naive command line time as UTC
fn parse_time(value: Option<&str>, format: &str) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|v| {
            NaiveDateTime::parse_from_str(v, format)
                .map(|naive| naive.and_utc())
                .with_context(|| format!("{:?} does not match format {:?}", v, format))
        })
        .transpose()
}
