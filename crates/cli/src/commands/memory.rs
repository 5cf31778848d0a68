//! `esquire history|append|trim|stats|compact`: conversation store administration.

use esquire_config::AppConfig;
use esquire_core::memory::TurnRole;
use esquire_core::message::ConversationId;
use esquire_memory::{CompactionOutcome, MemoryHandles, open_from_config};

async fn open(config: &AppConfig) -> Result<MemoryHandles, Box<dyn std::error::Error>> {
    let handles = open_from_config(&config.memory).await?;
    if !handles.conversations.is_enabled() {
        eprintln!("⚠️  Server-side memory is disabled; nothing is stored.");
    }
    Ok(handles)
}

pub async fn history(
    config: &AppConfig,
    conversation_id: &str,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let handles = open(config).await?;
    let limit = limit.unwrap_or(config.memory.context_limit);
    let id = ConversationId::from(conversation_id);

    let records = handles.conversations.recent_context(&id, limit).await?;
    if records.is_empty() {
        println!("No turns stored for {id}.");
        return Ok(());
    }

    for record in &records {
        println!(
            "[{}] {}: {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.role,
            record.content
        );
    }
    Ok(())
}

pub async fn append(
    config: &AppConfig,
    conversation_id: &str,
    role: &str,
    content: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let role: TurnRole = role.parse()?;
    let handles = open(config).await?;
    let id = ConversationId::from(conversation_id);

    handles.conversations.append(&id, role, content).await?;
    let rows = handles.conversations.row_count(&id).await?;
    println!("✅ Stored {role} turn for {id} ({rows}/{} rows)", config.memory.max_rows);

    let outcome = handles
        .scheduler(config.memory.vacuum_interval_hours)
        .maybe_compact()
        .await;
    tracing::debug!(?outcome, "Post-append compaction check");
    Ok(())
}

pub async fn trim(
    config: &AppConfig,
    conversation_id: &str,
    keep: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let handles = open(config).await?;
    let id = ConversationId::from(conversation_id);
    let removed = handles.conversations.trim_oldest(&id, keep).await?;
    println!("🗑️  Removed {removed} turns from {id}; kept at most {keep}.");
    Ok(())
}

pub async fn stats(
    config: &AppConfig,
    conversation_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let handles = open(config).await?;
    let id = ConversationId::from(conversation_id);
    let rows = handles.conversations.row_count(&id).await?;
    let last = handles.retention.last_compaction_at().await?;

    println!("🧠 Conversation Memory");
    println!("======================");
    println!("  Backend:        {}", handles.conversations.name());
    println!("  Conversation:   {id}");
    println!("  Rows:           {rows}/{}", config.memory.max_rows);
    println!("  Context limit:  {}", config.memory.context_limit);
    println!(
        "  Compaction:     every {}h, last {}",
        config.memory.vacuum_interval_hours_effective(),
        last.map_or_else(|| "never".to_string(), |at| at.to_rfc3339())
    );

    if handles.conversations.is_enabled() {
        let path = &config.memory.path;
        match std::fs::metadata(path) {
            Ok(meta) => println!(
                "  DB file:        {} ({:.1} KB)",
                path.display(),
                meta.len() as f64 / 1024.0
            ),
            Err(_) => println!("  DB file:        {} (not created yet)", path.display()),
        }
    }
    Ok(())
}

pub async fn compact(config: &AppConfig, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let handles = open(config).await?;
    let scheduler = handles.scheduler(config.memory.vacuum_interval_hours);

    let outcome = if force {
        scheduler.force_compact().await
    } else {
        scheduler.maybe_compact().await
    };

    match outcome {
        CompactionOutcome::Compacted => println!("✅ Store compacted."),
        CompactionOutcome::NotDue => println!("Compaction not due (or claimed by another worker)."),
        CompactionOutcome::Failed => return Err("Compaction failed; see log for details".into()),
    }
    Ok(())
}
