use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use eligibility_engine::{EligibilityEngine, EligibilityQuery, EngineSettings, VerificationStatus};

/// Verify insurance eligibility for a batch of queries
#[derive(Parser, Debug)]
#[command(name = "eligibility-verify")]
#[command(about = "Insurance eligibility verification and patient cost estimation")]
struct Args {
    /// Configuration file path (YAML or TOML)
    #[arg(short, long, env = "ELIGIBILITY_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file holding one eligibility query or an array of them
    #[arg(short, long)]
    queries: PathBuf,

    /// Clearinghouse used when a payer has no alternate protocol
    #[arg(long)]
    clearinghouse: Option<String>,

    /// Exit with a non-zero status if any verification failed
    #[arg(long)]
    strict: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryFile {
    Batch(Vec<EligibilityQuery>),
    Single(EligibilityQuery),
}

impl QueryFile {
    fn into_queries(self) -> Vec<EligibilityQuery> {
        match self {
            Self::Batch(queries) => queries,
            Self::Single(query) => vec![query],
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut settings = EngineSettings::load(args.config.as_deref()).context("loading configuration")?;
    if args.verbose {
        settings.logging.log_level = "debug".to_string();
    }
    if let Some(clearinghouse) = args.clearinghouse {
        settings.clearinghouse = Some(clearinghouse);
    }
    logger_redacted::init(&settings.logging)?;

    let raw = std::fs::read_to_string(&args.queries)
        .with_context(|| format!("reading queries from {}", args.queries.display()))?;
    let queries = serde_json::from_str::<QueryFile>(&raw)
        .context("parsing queries")?
        .into_queries();

    let engine = EligibilityEngine::builder(settings).build()?;
    engine.start_maintenance();

    info!(count = queries.len(), "Verifying eligibility");
    let outcomes = engine.verify_batch(&queries).await;
    engine.shutdown();

    println!("{}", serde_json::to_string_pretty(&outcomes)?);

    let failed = outcomes
        .iter()
        .filter(|o| o.status == VerificationStatus::Failed)
        .count();
    info!(total = outcomes.len(), failed, "Verification batch finished");
    if args.strict && failed > 0 {
        anyhow::bail!("{failed} of {} verifications failed", outcomes.len());
    }
    Ok(())
}
