use anyhow::Context;
use bson::oid::ObjectId;
use bson::Bson;
use clap::{Parser, Subcommand};
use tracing::Level;

use eduweb_backend::config::Config;
use eduweb_backend::engine::Engine;
use eduweb_backend::error::EngineError;
use eduweb_backend::problem::Problem;
use eduweb_backend::report::Report;
use eduweb_backend::schema::EntityKind;
use eduweb_backend::store::MongoStore;
use eduweb_backend::util::retry;

#[derive(Parser, Debug)]
#[command(name = "eduweb-admin")]
#[command(about = "Index, report and cascade tooling for the eduweb database")]
struct Args {
    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the indexes the engine relies on
    Indexes,
    /// Run a built-in report and print its rows as JSON
    Report {
        /// posts-by-user, popular-posts, average-comments, average-questions or comment-counts
        name: Report,
        /// User id for posts-by-user
        #[arg(long)]
        user: Option<ObjectId>,
    },
    /// Print what a cascade delete would remove, without deleting
    PlanCascade { kind: EntityKind, id: ObjectId },
}

impl Command {
    fn instance(&self) -> String {
        match self {
            Command::Indexes => "eduweb-admin/indexes".to_string(),
            Command::Report { name, .. } => format!("eduweb-admin/report/{}", name),
            Command::PlanCascade { kind, id } => format!("eduweb-admin/plan-cascade/{}/{}", kind, id),
        }
    }
}

fn problem_for(err: &EngineError, instance: String) -> Problem {
    let mut problem = Problem::from(err);
    problem.instance_uri(instance);
    problem
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    eduweb_backend::init_logging(Some(level));

    let config = eduweb_backend::load_config()?;
    let engine = eduweb_backend::connect(&config)
        .await
        .context("unable to open the database")?;

    let instance = args.command.instance();
    let result = run(&engine, &config, args.command).await;
    engine.shutdown().await?;

    if let Err(err) = &result {
        if let Some(e) = err.downcast_ref::<EngineError>() {
            let problem = problem_for(e, instance);
            eprintln!("{}", serde_json::to_string_pretty(&problem.to_json())?);
            std::process::exit(1);
        }
    }
    result
}

async fn run(engine: &Engine<MongoStore>, config: &Config, command: Command) -> anyhow::Result<()> {
    let (attempts, delay) = (config.retry_attempts, config.retry_base_delay());
    match command {
        Command::Indexes => {
            let count = retry(attempts, delay, || engine.apply_index_plan()).await?;
            println!("{} indexes ensured", count);
        }
        Command::Report { name, user } => {
            let rows = retry(attempts, delay, || engine.report(name, user)).await?;
            for row in rows {
                println!("{}", Bson::Document(row).into_relaxed_extjson());
            }
        }
        Command::PlanCascade { kind, id } => {
            let plan = engine.plan_cascade_delete(kind, id).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }
    Ok(())
}
