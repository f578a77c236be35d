use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::ledger::{latest_run, open_ledger, totals};

pub fn run(args: StatusArgs) -> Result<()> {
    info!(db_path = %args.db_path.display(), "status requested");

    if !args.db_path.exists() {
        warn!(path = %args.db_path.display(), "ledger database missing");
        return Ok(());
    }

    let connection = open_ledger(&args.db_path)?;
    let totals = totals(&connection)?;
    info!(
        path = %args.db_path.display(),
        runs = totals.runs,
        decisions = totals.decisions,
        unavailable = totals.unavailable,
        "ledger status"
    );

    match latest_run(&connection)? {
        Some(run) => info!(
            run_id = %run.run_id,
            document = %run.document,
            strategy = %run.strategy,
            completed_at = %run.completed_at,
            pages = run.pages_total,
            unavailable = run.pages_unavailable,
            "latest combine run"
        ),
        None => warn!("ledger has no recorded runs"),
    }

    Ok(())
}
