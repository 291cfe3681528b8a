//! labelq CLI: operator interface to the annotation pool.

use chrono::Duration;
use clap::{Parser, Subcommand};
use labelq::admin::Admin;
use labelq::clock::{Clock, SystemClock};
use labelq::commit::{CommitResult, LabelCommitter};
use labelq::config::Config;
use labelq::lease::{ClaimResult, LeaseManager};
use labelq::model::{Item, ItemId, LabelPayload, NewItem, QaStatus, Requester};
use labelq::reclaim::{Cutoff, Reclaimer, SweepFilter};
use labelq::stats::StatsUpdater;
use labelq::store::Store;
use labelq::telemetry::{TelemetryConfig, init_telemetry};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Parser)]
#[command(name = "labelq", about = "Task leasing and label commits for photo annotation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the periodic lease reclaimer until Ctrl-C
    ServeReclaimer,
    /// Add an unassigned item to the pool
    Ingest {
        item: String,
        /// Stored image reference
        image_ref: String,
        #[arg(long)]
        property: Option<String>,
    },
    /// Create or update a requester account
    Provision {
        requester: String,
        #[arg(long, default_value = "labeler")]
        role: String,
        #[arg(long)]
        disabled: bool,
    },
    /// Claim the next item for a requester
    Claim { requester: String },
    /// Return a held lease to the pool
    Release { item: String, requester: String },
    /// Commit a label payload from a JSON file
    Commit {
        item: String,
        requester: String,
        payload: PathBuf,
        /// Overrides TAXONOMY_VERSION
        #[arg(long)]
        taxonomy_version: Option<u32>,
    },
    /// Reclaim leases
    Sweep {
        /// Leases granted more than N minutes ago, expired or not
        #[arg(
            long,
            conflicts_with = "all",
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        older_than_minutes: Option<u32>,
        /// Every lease, expired or not
        #[arg(long)]
        all: bool,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        item: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        /// List what would be reclaimed without changing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Permanently remove an item from the pool
    Retire {
        item: String,
        /// Confirm
        #[arg(long)]
        yes: bool,
    },
    /// Set or clear an item's flag
    Flag {
        item: String,
        #[arg(long)]
        clear: bool,
    },
    /// QA review of done items
    Qa {
        #[command(subcommand)]
        action: QaAction,
    },
    /// Show an item with its label and history
    Show { item: String },
    /// Labels authored by a requester, newest first
    History {
        requester: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Requester counters
    Stats { requester: Option<String> },
    /// Repair lagging completion counters
    Recount { requester: Option<String> },
    /// List flagged items
    Flagged {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum QaAction {
    /// Accept the label
    Approve { item: String },
    /// Return the item to its labeler for revision
    SendBack {
        item: String,
        /// Defaults to the label's author
        #[arg(long)]
        labeler: Option<String>,
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Clear the verdict
    Reset { item: String },
    /// List done items by verdict
    List {
        #[arg(long, default_value = "pending")]
        status: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "labelq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store = labelq::open_store(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let admin = Admin::new(Arc::clone(&store), Arc::clone(&clock), config.lease.clone());

    match cli.command {
        Command::ServeReclaimer => cmd_serve_reclaimer(&config, store, clock).await,
        Command::Ingest {
            item,
            image_ref,
            property,
        } => {
            let mut new = NewItem::new(item, image_ref);
            if let Some(property) = property {
                new = new.property(property);
            }
            let item = admin.ingest(new).await?;
            println!("Ingested: {} ({})", item.id, item.image_ref);
            Ok(())
        }
        Command::Provision {
            requester,
            role,
            disabled,
        } => {
            let r = admin
                .provision(Requester::new(requester).role(role).enabled(!disabled))
                .await?;
            println!(
                "Provisioned: {} (role: {}, enabled: {})",
                r.id, r.role, r.enabled
            );
            Ok(())
        }
        Command::Claim { requester } => {
            let leases = LeaseManager::new(store, clock, config.lease.clone());
            match leases.claim(&requester.into()).await? {
                ClaimResult::Claimed(item) => print_lease("Claimed", &item),
                ClaimResult::Resumed(item) => print_lease("Resumed", &item),
                ClaimResult::NoWorkAvailable => println!("No work available."),
            }
            Ok(())
        }
        Command::Release { item, requester } => {
            let leases = LeaseManager::new(store, clock, config.lease.clone());
            if leases.release(&item.clone().into(), &requester.into()).await? {
                println!("Released: {item}");
            } else {
                println!("Not held: {item}");
            }
            Ok(())
        }
        Command::Commit {
            item,
            requester,
            payload,
            taxonomy_version,
        } => {
            let raw = std::fs::read_to_string(&payload)?;
            let payload: LabelPayload = serde_json::from_str(&raw)?;
            let committer = LabelCommitter::new(store, clock);
            let version = taxonomy_version.unwrap_or(config.taxonomy_version);
            match committer
                .commit(&item.into(), &requester.into(), payload, version)
                .await?
            {
                CommitResult::Committed(c) => {
                    println!("Committed: {} (schema v{})", c.item.id, c.label.schema_version);
                    if let Some(rev) = &c.revision {
                        println!("Revision:  #{} preserved", rev.seq);
                    }
                    match &c.requester {
                        Some(r) => println!("Completed: {} by {}", r.completed_count, r.id),
                        None => println!("Completed: counter update failed, run `labelq recount`"),
                    }
                }
                CommitResult::Rejected(reason) => anyhow::bail!("rejected: {reason}"),
            }
            Ok(())
        }
        Command::Sweep {
            older_than_minutes,
            all,
            user,
            item,
            limit,
            dry_run,
        } => {
            let cutoff = match (older_than_minutes, all) {
                (_, true) => Cutoff::Any,
                // Granted before now - N  <=>  deadline before now - N + lease.
                (Some(n), false) => {
                    Cutoff::At(
                        clock.now() - Duration::minutes(i64::from(n)) + config.lease.lease_duration,
                    )
                }
                (None, false) => Cutoff::Now,
            };
            let filter = SweepFilter {
                cutoff,
                holder: user.map(Into::into),
                item: item.map(Into::into),
                limit,
            };
            let reclaimer = Reclaimer::new(store, clock, config.sweep.clone());
            if dry_run {
                let candidates = reclaimer.candidates(&filter).await?;
                for item in &candidates {
                    print_lease("Would reclaim", item);
                }
                println!("{} lease(s) match", candidates.len());
            } else {
                let n = reclaimer.sweep_with(&filter).await?;
                println!("Reclaimed {n} lease(s)");
            }
            Ok(())
        }
        Command::Retire { item, yes } => {
            if !yes {
                anyhow::bail!("retiring is irreversible, pass --yes to confirm");
            }
            if admin.retire(&item.clone().into()).await? {
                println!("Retired: {item}");
            } else {
                println!("No such item: {item}");
            }
            Ok(())
        }
        Command::Flag { item, clear } => {
            if admin.set_flag(&item.clone().into(), !clear).await? {
                println!("{}: {item}", if clear { "Unflagged" } else { "Flagged" });
            } else {
                println!("No such item: {item}");
            }
            Ok(())
        }
        Command::Qa { action } => cmd_qa(&admin, action).await,
        Command::Show { item } => cmd_show(&admin, item).await,
        Command::History { requester, limit } => {
            let labels = admin.history(&requester.into(), limit).await?;
            if labels.is_empty() {
                println!("No labels found.");
                return Ok(());
            }
            println!("{:<30}  {:<6}  UPDATED", "ITEM", "SCHEMA");
            println!("{}", "-".repeat(60));
            for label in &labels {
                println!(
                    "{:<30}  {:<6}  {}",
                    label.item_id,
                    label.schema_version,
                    label.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} label(s)", labels.len());
            Ok(())
        }
        Command::Stats { requester } => {
            let requesters = match requester {
                Some(id) => admin.requester(&id.into()).await?.into_iter().collect(),
                None => admin.requesters().await?,
            };
            if requesters.is_empty() {
                println!("No requesters found.");
                return Ok(());
            }
            println!(
                "{:<20}  {:<10}  {:<7}  {:<9}  {:<30}  LAST",
                "REQUESTER", "ROLE", "ENABLED", "COMPLETED", "CURRENT"
            );
            println!("{}", "-".repeat(100));
            for r in &requesters {
                println!(
                    "{:<20}  {:<10}  {:<7}  {:<9}  {:<30}  {}",
                    r.id,
                    r.role,
                    r.enabled,
                    r.completed_count,
                    r.current_lease.as_ref().map_or("-", |i| i.as_str()),
                    r.last_completed_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string())
                );
            }
            Ok(())
        }
        Command::Recount { requester } => {
            let stats = StatsUpdater::new(store);
            let results = match requester {
                Some(id) => vec![stats.recount(&id.into()).await?],
                None => stats.recount_all().await?,
            };
            for r in &results {
                let mark = if r.repaired() { "repaired" } else { "ok" };
                println!("{:<20}  {} -> {}  {mark}", r.requester, r.before, r.after);
            }
            Ok(())
        }
        Command::Flagged { limit } => {
            let items = admin.flagged(limit).await?;
            print_items(&items);
            Ok(())
        }
    }
}

async fn cmd_serve_reclaimer(
    config: &Config,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<()> {
    let reclaimer = Reclaimer::new(store, clock, config.sweep.clone());
    let shutdown = Arc::new(Notify::new());

    let signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal.notify_one();
    });

    reclaimer.run(shutdown).await?;
    Ok(())
}

async fn cmd_qa(admin: &Admin, action: QaAction) -> anyhow::Result<()> {
    match action {
        QaAction::Approve { item } => {
            if admin.approve(&item.clone().into()).await? {
                println!("Approved: {item}");
            } else {
                println!("Not done: {item}");
            }
        }
        QaAction::SendBack {
            item,
            labeler,
            feedback,
        } => {
            let id: ItemId = item.clone().into();
            let labeler = match labeler {
                Some(l) => l.into(),
                None => admin
                    .label(&id)
                    .await?
                    .map(|l| l.author)
                    .ok_or_else(|| anyhow::anyhow!("{item} has no label, pass --labeler"))?,
            };
            if admin.send_back(&id, &labeler, feedback).await? {
                println!("Sent back: {item} -> {labeler}");
            } else {
                println!("Not done: {item}");
            }
        }
        QaAction::Reset { item } => {
            if admin.reset_qa(&item.clone().into()).await? {
                println!("Reset: {item}");
            } else {
                println!("No such item: {item}");
            }
        }
        QaAction::List { status, limit } => {
            let status: QaStatus = status.parse()?;
            let items = admin.by_qa(status, limit).await?;
            print_items(&items);
        }
    }
    Ok(())
}

async fn cmd_show(admin: &Admin, item: String) -> anyhow::Result<()> {
    let detail = admin.detail(&item.into()).await?;
    let item = &detail.item;

    println!("ID:         {}", item.id);
    println!("Image:      {}", item.image_ref);
    println!("Property:   {}", item.property_id.as_deref().unwrap_or("-"));
    println!("Status:     {}", item.status);
    if let Some((holder, deadline)) = item.lease() {
        println!("Holder:     {holder}");
        println!("Deadline:   {deadline}");
    }
    println!("Flagged:    {}", item.flagged);
    println!("QA:         {}", item.qa_status);
    if let Some(feedback) = &item.qa_feedback {
        println!("Feedback:   {feedback}");
    }
    println!("Ingested:   {}", item.ingested_at);
    println!("Updated:    {}", item.updated_at);
    if let Some(completed) = item.completed_at {
        println!("Completed:  {completed}");
    }

    if let Some(label) = &detail.label {
        println!("---");
        println!("Author:     {}", label.author);
        println!("Schema:     v{}", label.schema_version);
        println!("Created:    {}", label.created_at);
        println!("Updated:    {}", label.updated_at);
        println!("Payload:    {}", serde_json::to_string_pretty(&label.payload)?);
    }

    if !detail.revisions.is_empty() {
        println!("---");
        for rev in &detail.revisions {
            println!(
                "#{:<3} by {} (displaced by {} at {})",
                rev.seq, rev.label.author, rev.edited_by, rev.edited_at
            );
        }
    }

    Ok(())
}

fn print_lease(verb: &str, item: &Item) {
    match item.lease() {
        Some((holder, deadline)) => {
            println!("{verb}: {} (holder: {holder}, until {deadline})", item.id);
        }
        None => println!("{verb}: {}", item.id),
    }
}

fn print_items(items: &[Item]) {
    if items.is_empty() {
        println!("No items found.");
        return;
    }
    println!("{:<30}  {:<10}  {:<8}  {:<7}  UPDATED", "ID", "STATUS", "QA", "FLAGGED");
    println!("{}", "-".repeat(80));
    for item in items {
        println!(
            "{:<30}  {:<10}  {:<8}  {:<7}  {}",
            item.id,
            item.status,
            item.qa_status,
            item.flagged,
            item.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} item(s)", items.len());
}
