//! TSKV command line tool - runs one storage command against a data directory

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tskv_core::storage::{CleanupStats, EngineStats};
use tskv_core::{
    Aggregation, DeleteTsKvQuery, OrderBy, PartitionGranularity, ReadTsKvQuery, StorageConfig,
    TenantId, TimeseriesEngine, TsKvEntry, TsValue,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tskv")]
#[command(about = "TSKV - partitioned key/value telemetry store", long_about = None)]
struct Cli {
    /// Data directory
    #[arg(long, env = "TSKV_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Bucket width: MINUTES, HOURS, DAYS, MONTHS, YEARS or INDEFINITE
    #[arg(long, env = "TSKV_PARTITIONING", default_value = "MONTHS")]
    partitioning: PartitionGranularity,

    /// Concurrent storage operations
    #[arg(long, env = "TSKV_WORKERS")]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store one sample
    #[command(allow_negative_numbers = true)]
    Put {
        entity: Uuid,
        key: String,
        ts: i64,
        /// Integer, float, true/false or any string
        value: String,
        /// Seconds until the row expires, 0 keeps it forever
        #[arg(default_value_t = 0)]
        ttl_secs: i64,
    },

    /// Latest value of one key, or of every key of the entity
    Latest { entity: Uuid, key: Option<String> },

    /// Raw samples in [start, end)
    #[command(allow_negative_numbers = true)]
    Range {
        entity: Uuid,
        key: String,
        start: i64,
        end: i64,
        #[arg(default_value_t = 100)]
        limit: usize,
        /// asc or desc
        #[arg(default_value = "desc")]
        order: OrderBy,
    },

    /// Aggregate [start, end), optionally sliced by `interval` ms
    #[command(allow_negative_numbers = true)]
    Agg {
        entity: Uuid,
        key: String,
        start: i64,
        end: i64,
        /// count, sum, min, max or avg
        function: Aggregation,
        interval: Option<i64>,
    },

    /// Delete samples in [start, end)
    #[command(allow_negative_numbers = true)]
    Delete {
        entity: Uuid,
        key: String,
        start: i64,
        end: i64,
    },

    /// Purge expired rows and drop partitions older than the system TTL
    Cleanup {
        #[arg(default_value_t = 0)]
        system_ttl_secs: i64,
    },

    /// Compact the write-ahead log into a snapshot
    Checkpoint,

    /// Store and engine counters
    Stats,
}

impl Cli {
    fn storage_config(&self) -> anyhow::Result<StorageConfig> {
        let mut config =
            StorageConfig::persistent(self.data_dir.clone()).with_partitioning(self.partitioning);
        if let Some(workers) = self.workers {
            config = config.with_worker_threads(workers);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.storage_config()?;
    info!("Data directory: {:?}", config.data_dir);
    let engine = TimeseriesEngine::open(config)?;

    let output = run(&engine, cli.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(engine: &TimeseriesEngine, command: Command) -> anyhow::Result<Value> {
    let tenant = TenantId::sys();

    match command {
        Command::Put {
            entity,
            key,
            ts,
            value,
            ttl_secs,
        } => {
            let entry = TsKvEntry::new(key, ts, parse_value(&value));
            engine.save(tenant, entity, entry.clone(), ttl_secs).await?;
            Ok(entry_json(&entry))
        }
        Command::Latest { entity, key: Some(key) } => {
            let latest = engine.find_latest(tenant, entity, &key).await?;
            Ok(latest.as_ref().map_or(Value::Null, entry_json))
        }
        Command::Latest { entity, key: None } => {
            let latest = engine.find_all_latest(tenant, entity).await?;
            Ok(Value::Array(latest.iter().map(entry_json).collect()))
        }
        Command::Range {
            entity,
            key,
            start,
            end,
            limit,
            order,
        } => {
            let query = ReadTsKvQuery::raw(key, start, end, limit, order);
            let rows = engine.find_all(tenant, entity, vec![query]).await?;
            Ok(Value::Array(rows.iter().map(entry_json).collect()))
        }
        Command::Agg {
            entity,
            key,
            start,
            end,
            function,
            interval: Some(interval),
        } => {
            let query = ReadTsKvQuery::aggregated(key, start, end, interval, function);
            let rows = engine.find_all(tenant, entity, vec![query]).await?;
            Ok(Value::Array(rows.iter().map(entry_json).collect()))
        }
        Command::Agg {
            entity,
            key,
            start,
            end,
            function,
            interval: None,
        } => {
            let result = engine.aggregate(entity, &key, start, end, function).await?;
            Ok(result.as_ref().map_or(Value::Null, entry_json))
        }
        Command::Delete {
            entity,
            key,
            start,
            end,
        } => {
            let query = DeleteTsKvQuery::new(key.as_str(), start, end);
            engine.remove(tenant, entity, query).await?;
            Ok(json!({ "deleted": key }))
        }
        Command::Cleanup { system_ttl_secs } => {
            let stats = engine.cleanup(system_ttl_secs).await?;
            Ok(cleanup_json(&stats))
        }
        Command::Checkpoint => {
            engine.checkpoint().await?;
            Ok(json!({ "checkpoint": "ok" }))
        }
        Command::Stats => Ok(stats_json(&engine.stats())),
    }
}

/// Integers, then floats, then booleans; anything else is a string
fn parse_value(raw: &str) -> TsValue {
    if let Ok(v) = raw.parse::<i64>() {
        return TsValue::Long(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return TsValue::Double(v);
    }
    match raw {
        "true" => TsValue::Boolean(true),
        "false" => TsValue::Boolean(false),
        _ => TsValue::String(raw.to_string()),
    }
}

fn entry_json(entry: &TsKvEntry) -> Value {
    let value = match &entry.value {
        TsValue::String(v) => json!(v),
        TsValue::Long(v) => json!(v),
        TsValue::Double(v) => json!(v),
        TsValue::Boolean(v) => json!(v),
    };
    json!({
        "key": entry.key,
        "ts": entry.ts,
        "type": format!("{:?}", entry.data_type()),
        "value": value,
    })
}

fn cleanup_json(stats: &CleanupStats) -> Value {
    json!({
        "expired_rows": stats.expired_rows,
        "dropped_partitions": stats.dropped_partitions,
    })
}

fn stats_json(stats: &EngineStats) -> Value {
    json!({
        "keys": stats.store.keys,
        "partitions": stats.store.partitions,
        "rows": stats.store.rows,
        "latest": stats.store.latest,
        "cached_keys": stats.cached_keys,
        "known_partitions": stats.known_partitions,
        "workers": stats.workers,
    })
}
