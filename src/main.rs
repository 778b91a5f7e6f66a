use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use steward::agent::{ProcessOutcome, ProcessingProfile, Processor, ProfileRegistry, TrustLevel};
use steward::clock::SystemClock;
use steward::config::StewardConfig;
use steward::llm::{create_provider, LlmBackend, LlmConfig};
use steward::notify::{BroadcastNotifier, Notifier};
use steward::queue::{HandlerRegistry, LlmCallbackHandler, Worker};
use steward::store::{LibSqlStore, Store};
use steward::tools::{builtin_source, ConfirmationGate, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are Steward, a personal assistant. You can save notes, \
     schedule follow-up callbacks for yourself, and delegate research to other profiles. Be \
     concise.";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing. With STEWARD_LOG_DIR set, logs go to a daily
    // rolling file instead of stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _log_guard = match std::env::var("STEWARD_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "steward.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    };

    // Read API key from environment
    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    let model =
        std::env::var("STEWARD_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

    let config = StewardConfig::from_env();

    eprintln!("🕰  Steward v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model);
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Type a message and press Enter. /confirm <token> yes|no, /quit to exit.\n");

    // Create LLM provider
    let llm = create_provider(&LlmConfig {
        backend: LlmBackend::Anthropic,
        api_key: secrecy::SecretString::from(api_key),
        model,
        timeout: config.model_timeout,
    })?;

    // ── Database ────────────────────────────────────────────────────
    let clock = Arc::new(SystemClock);
    let store: Arc<dyn Store> = Arc::new(
        LibSqlStore::new_local(
            std::path::Path::new(&config.db_path),
            clock.clone(),
            config.backoff,
            config.lock_ttl,
        )
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
            std::process::exit(1);
        }),
    );

    // ── Profiles and tools ──────────────────────────────────────────
    let mut profiles = ProfileRegistry::new();
    profiles.register(
        ProcessingProfile::new("default", DEFAULT_SYSTEM_PROMPT)
            .with_tools([
                "current_time",
                "save_note",
                "delete_note",
                "list_notes",
                "schedule_callback",
                "delegate",
            ])
            .with_trust(TrustLevel::Standard)
            .with_max_rounds(config.max_rounds),
    )?;
    profiles.register(
        ProcessingProfile::new(
            "researcher",
            "You answer a single focused question from your own knowledge. Reply with the \
             answer only.",
        )
        .with_tools(["current_time", "list_notes"])
        .with_trust(TrustLevel::Untrusted),
    )?;
    let profiles = Arc::new(profiles);

    let wake = Arc::new(Notify::new());
    let (builtin, delegate) = builtin_source(
        store.clone(),
        clock.clone(),
        wake.clone(),
        profiles.clone(),
    )?;
    let mut tools = ToolRegistry::new();
    tools.add_source(builtin);
    let tools = Arc::new(tools);
    profiles.validate(&tools)?;

    // Extra names to gate, beyond tools that gate themselves.
    let sensitive: HashSet<String> = std::env::var("STEWARD_SENSITIVE_TOOLS")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    let gate = Arc::new(ConfirmationGate::new(
        sensitive,
        clock.clone(),
        config.confirmation_ttl,
    ));

    let notifier = Arc::new(BroadcastNotifier::new(64));
    let processor = Arc::new(Processor::new(
        store.clone(),
        llm,
        tools,
        gate,
        Vec::new(),
        profiles,
        notifier.clone() as Arc<dyn Notifier>,
        clock.clone(),
        config.max_rounds,
        config.max_tool_output,
    ));
    delegate.bind(&processor);

    // ── Worker ──────────────────────────────────────────────────────
    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(LlmCallbackHandler::new(
        store.clone(),
        processor.clone(),
        notifier.clone() as Arc<dyn Notifier>,
    )))?;

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        store.clone(),
        Arc::new(handlers),
        clock,
        wake,
        shutdown.clone(),
        config.poll_interval,
    )
    .spawn();

    // Print anything the engine pushes (callback replies, confirmation
    // previews) as it arrives.
    let mut push_rx = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = push_rx.recv().await {
            eprintln!("\n🔔 [{}] {}", notification.conversation_id, notification.text);
        }
    });

    // ── CLI loop ────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        if let Some(rest) = line.strip_prefix("/confirm ") {
            handle_confirm(&processor, rest).await;
            continue;
        }

        match processor.process_message("cli", "default", line).await {
            Ok(ProcessOutcome::Reply(text)) => println!("{text}"),
            Ok(ProcessOutcome::AwaitingConfirmation { token, preview }) => {
                println!("Waiting for confirmation {token}:\n{preview}");
                println!("Answer with /confirm {token} yes|no");
            }
            Err(e) => eprintln!("Error: {e}"),
        }
    }

    eprintln!("Shutting down...");
    shutdown.cancel();
    let _ = worker.await;
    Ok(())
}

async fn handle_confirm(processor: &Processor, args: &str) {
    let mut parts = args.split_whitespace();
    let (Some(token), Some(verdict)) = (parts.next(), parts.next()) else {
        eprintln!("Usage: /confirm <token> yes|no");
        return;
    };
    let Ok(token) = token.parse::<Uuid>() else {
        eprintln!("Error: {token:?} is not a valid confirmation token");
        return;
    };
    let approved = matches!(verdict, "yes" | "y");

    match processor.resume_confirmation(token, approved).await {
        Ok(ProcessOutcome::Reply(text)) => println!("{text}"),
        Ok(ProcessOutcome::AwaitingConfirmation { token, preview }) => {
            println!("Another confirmation is required ({token}):\n{preview}");
        }
        Err(e) => eprintln!("Error: {e}"),
    }
}
