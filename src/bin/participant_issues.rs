use std::path::PathBuf;

use clap::Parser;
use participant_issues::{
    billing_project_from_table, init_logging, log_app_start, log_window_selected,
    logging_config_from_env, resolve_access_token, run_audit, AuditConfig, BigQueryClient,
    ReportWindow, WarehouseConfig, WarehouseError, DEFAULT_TABLE_PATTERN,
};

/// Lists study participants whose app was reset or removed without a later sign-up.
#[derive(Debug, Parser)]
#[command(name = "participant_issues", version)]
struct Args {
    /// Source table in BigQuery. Supports a `*` suffix glob.
    #[arg(short, long, default_value = DEFAULT_TABLE_PATTERN)]
    table: String,
    /// Number of days to look back; the window ends today.
    #[arg(short, long, default_value_t = 60)]
    days: u64,
    /// Root directory for `{start}-{end}/{study}.csv` reports.
    #[arg(short, long, default_value = "output")]
    output: PathBuf,
    /// Project billed for the query (defaults to the table's project).
    #[arg(long)]
    billing_project: Option<String>,
    /// BigQuery job location, e.g. `EU`.
    #[arg(long)]
    location: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let window = ReportWindow::ending_today(args.days)?;
    log_window_selected(&args.table, args.days, &window);

    let billing_project = args
        .billing_project
        .or_else(|| billing_project_from_table(&args.table))
        .ok_or(WarehouseError::MissingBillingProject)?;
    let warehouse_cfg = WarehouseConfig {
        billing_project,
        location: args.location,
        ..WarehouseConfig::default()
    };
    let client = BigQueryClient::new(warehouse_cfg, resolve_access_token()?)?;

    let audit_cfg = AuditConfig {
        table_pattern: args.table,
        window,
        output_root: args.output,
    };
    let summary = run_audit(&audit_cfg, &client)?;

    for study in &summary.studies {
        println!(
            "{} | subjects={} issues={} -> {}",
            study.project_id,
            study.subjects_checked,
            study.issues,
            study.path.display()
        );
    }
    println!(
        "Start date {} | end date {} | {} issue(s) across {} study report(s).",
        audit_cfg.window.start_suffix(),
        audit_cfg.window.end_suffix(),
        summary.total_issues(),
        summary.studies.len()
    );

    Ok(())
}
