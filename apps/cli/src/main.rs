//! Operator CLI for the job queue
//!
//! Read-only inspection of the job store plus a manual `enqueue` for
//! re-submitting work. Connection settings come from the same configuration
//! as the services (`QUIRE__*` variables, `DATABASE_URL`, config file).

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use quire::{
    config::{Config, QueueBackend},
    queue::{Job, JobStatus, JobStore, MAX_LIST_LIMIT},
    state::{AppStateOptions, JobStoreKind, QueueBackends},
};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "quire-cli", version, about = "Inspect and re-submit quire jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect jobs
    #[command(subcommand)]
    Jobs(JobsCommand),
    /// Submit a job through the configured enqueue path
    Enqueue(EnqueueArgs),
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    /// Most recent jobs, newest first
    List {
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(i64).range(1..=MAX_LIST_LIMIT))]
        limit: i64,
        #[arg(long)]
        json: bool,
    },
    /// A single job with its payload and result
    Show {
        id: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Job counts by status
    Stats {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct EnqueueArgs {
    /// Job type tag, e.g. `generate`
    #[arg(long = "type")]
    job_type: String,
    /// Payload as a JSON document
    #[arg(long)]
    payload: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    quire::logging::init_simple_logging("warn");

    let mut config = Config::load().context("Failed to load configuration")?;
    // An in-process broker would vanish with this process.
    if config.queue.backend == QueueBackend::Memory {
        config.queue.backend = QueueBackend::Postgres;
    }

    let options = AppStateOptions {
        run_migrations: false,
        job_store: JobStoreKind::Postgres,
    };
    let backends = QueueBackends::connect(&config, &options)
        .await
        .context("Failed to connect to the job store")?;

    match cli.command {
        Command::Jobs(JobsCommand::List { limit, json }) => list(&backends, limit, json).await,
        Command::Jobs(JobsCommand::Show { id, json }) => show(&backends, id, json).await,
        Command::Jobs(JobsCommand::Stats { json }) => stats(&backends, json).await,
        Command::Enqueue(args) => enqueue(&backends, args).await,
    }
}

async fn list(backends: &QueueBackends, limit: i64, as_json: bool) -> anyhow::Result<()> {
    let jobs = backends.store.list_recent(limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<10}  {:>8}  {:<20}  {:<20}",
        "ID", "TYPE", "STATUS", "ATTEMPTS", "CREATED", "UPDATED"
    );
    for job in &jobs {
        println!("{}", summary_row(job));
    }
    Ok(())
}

async fn show(backends: &QueueBackends, id: Uuid, as_json: bool) -> anyhow::Result<()> {
    let job = match backends.enqueuer().get(id).await? {
        Some(job) => job,
        None => bail!("job {} not found", id),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    println!("id:         {}", job.id);
    println!("type:       {}", job.job_type);
    println!("status:     {}", job.status);
    println!("attempts:   {}", job.attempts);
    println!("run after:  {}", format_time(&job.run_after));
    println!("created:    {}", format_time(&job.created_at));
    println!("updated:    {}", format_time(&job.updated_at));
    if let Some(error) = &job.last_error {
        println!("last error: {}", error);
    }
    println!("payload:\n{}", indent(&job.payload)?);
    if let Some(result) = &job.result {
        println!("result:\n{}", indent(result)?);
    }
    Ok(())
}

async fn stats(backends: &QueueBackends, as_json: bool) -> anyhow::Result<()> {
    let counts = backends.store.count_by_status().await?;

    if as_json {
        let mut body = serde_json::to_value(counts)?;
        body["total"] = json!(counts.total());
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    for status in [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ] {
        println!("{:<10}  {:>8}", status.as_str(), counts.get(status));
    }
    println!("{:<10}  {:>8}", "total", counts.total());
    Ok(())
}

async fn enqueue(backends: &QueueBackends, args: EnqueueArgs) -> anyhow::Result<()> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("--payload must be a JSON document")?;

    let job = backends
        .enqueuer()
        .enqueue_raw(&args.job_type, payload)
        .await?;

    tracing::info!(job.id = %job.id, "Job enqueued");
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

fn summary_row(job: &Job) -> String {
    format!(
        "{:<36}  {:<10}  {:<10}  {:>8}  {:<20}  {:<20}",
        job.id,
        job.job_type.as_str(),
        job.status.as_str(),
        job.attempts,
        format_time(&job.created_at),
        format_time(&job.updated_at),
    )
}

fn format_time(time: &chrono::DateTime<chrono::Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn indent(value: &Value) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?
        .lines()
        .map(|line| format!("  {}", line))
        .collect::<Vec<_>>()
        .join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use quire::queue::JobType;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_list_with_limit() {
        let cli = Cli::try_parse_from(["quire-cli", "jobs", "list", "--limit", "5", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Jobs(JobsCommand::List { limit: 5, json: true })
        ));
    }

    #[test]
    fn rejects_out_of_range_limit() {
        assert!(Cli::try_parse_from(["quire-cli", "jobs", "list", "--limit", "0"]).is_err());
        assert!(Cli::try_parse_from(["quire-cli", "jobs", "list", "--limit", "501"]).is_err());
    }

    #[test]
    fn parses_enqueue() {
        let cli = Cli::try_parse_from([
            "quire-cli",
            "enqueue",
            "--type",
            "generate",
            "--payload",
            r#"{"userId":"U1","batchId":"B1"}"#,
        ])
        .unwrap();
        let Command::Enqueue(args) = cli.command else {
            panic!("expected enqueue");
        };
        assert_eq!(args.job_type, "generate");
    }

    #[test]
    fn summary_row_has_fixed_columns() {
        let job = Job::new_pending(JobType::Generate, json!({"userId": "U1", "batchId": "B1"}));
        let row = summary_row(&job);
        assert!(row.starts_with(&job.id.to_string()));
        assert!(row.contains("generate"));
        assert!(row.contains("pending"));
    }
}
