use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use converse_core::converse_staging::SharedStore;
use converse_core::{MessageDb, NotificationReconciler, ReconcileConfig, ReconcileOutcome};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let usage = "usage: staging_dump <shared_dir> [--drain <data_dir> <account>]";
    let mut args = std::env::args().skip(1);
    let shared_dir = args.next().ok_or_else(|| anyhow!(usage))?;
    let drain = match args.next().as_deref() {
        None => None,
        Some("--drain") => {
            let data_dir = args.next().ok_or_else(|| anyhow!(usage))?;
            let account = args.next().ok_or_else(|| anyhow!(usage))?;
            Some((data_dir, account))
        }
        Some(other) => bail!("unexpected argument {other:?}\n{usage}"),
    };

    let store = SharedStore::open(&shared_dir).context("open shared staging store")?;

    let conversations = store.load_conversations()?;
    println!(
        "conversations: {} staged (through seq {})",
        conversations.records.len(),
        conversations.high_water
    );
    for c in &conversations.records {
        println!(
            "  {} peer={} created_at={} context={}",
            c.topic,
            c.peer_address.as_deref().unwrap_or("-"),
            c.created_at,
            c.context.as_ref().is_some_and(|ctx| ctx.is_informative())
        );
    }
    for r in &conversations.rejected {
        println!("  rejected seq={} {}", r.seq, r.reason);
    }

    let messages = store.load_messages()?;
    println!(
        "messages: {} staged (through seq {})",
        messages.records.len(),
        messages.high_water
    );
    for m in &messages.records {
        println!(
            "  {} topic={} sent={} from={} type={}",
            m.id,
            m.topic,
            m.sent,
            m.sender_address,
            m.content_type_or_default()
        );
    }
    for r in &messages.rejected {
        println!("  rejected seq={} {}", r.seq, r.reason);
    }

    let Some((data_dir, account)) = drain else {
        return Ok(());
    };
    std::fs::create_dir_all(&data_dir).with_context(|| format!("create {data_dir}"))?;
    let db = Arc::new(MessageDb::open(&data_dir).context("open message database")?);
    let reconciler = NotificationReconciler::new(Arc::new(store), db, ReconcileConfig::default());

    let rt = tokio::runtime::Runtime::new()?;
    match rt.block_on(reconciler.reconcile(&account))? {
        ReconcileOutcome::Applied(report) => println!(
            "drained: {} conversations, {} messages, {} rejected",
            report.conversations, report.messages, report.rejected
        ),
        ReconcileOutcome::AwaitedInFlight => println!("another pass was running"),
    }
    Ok(())
}
