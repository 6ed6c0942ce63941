use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tower_http::cors::CorsLayer;

use fleet_relay::agent::Agent;
use fleet_relay::config::{AgentConfig, FleetConfig, ModelConfig, ServerConfig};
use fleet_relay::fleet::{JsonFileStore, WorkerRegistry};
use fleet_relay::llm::create_provider;
use fleet_relay::relay::Relay;

/// Conversation id used by the terminal REPL.
const CLI_CONVERSATION: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let agent_config = AgentConfig::from_env().context("invalid agent configuration")?;
    let fleet_config = FleetConfig::from_env().context("invalid fleet configuration")?;
    let server_config = ServerConfig::from_env().context("invalid server configuration")?;
    let model_config = ModelConfig::from_env();

    eprintln!("Fleet Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model_config.model);
    eprintln!("   Workers: {}", fleet_config.workers_path.display());
    eprintln!("   Worker WS: ws://0.0.0.0:{}/ws/worker", server_config.port);
    eprintln!("   Chat API: http://0.0.0.0:{}/api/chat", server_config.port);

    // ── Relay ───────────────────────────────────────────────────────────
    let llm = create_provider(&model_config);
    if llm.is_none() {
        eprintln!("   Warning: ANTHROPIC_API_KEY not set, chat will report not configured");
    }
    let store = Arc::new(JsonFileStore::new(&fleet_config.workers_path));
    let relay = Relay::build(agent_config, &fleet_config, store, llm)
        .await
        .with_context(|| {
            format!(
                "failed to start relay with worker directory {}",
                fleet_config.workers_path.display()
            )
        })?;
    eprintln!("   Known workers: {}", relay.registry.count().await);
    eprintln!("   Tools: {} registered", relay.tools.count());

    // ── Server ──────────────────────────────────────────────────────────
    let app = relay.router().layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port))
        .await
        .with_context(|| format!("failed to bind port {}", server_config.port))?;
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });
    tracing::info!(port = server_config.port, "Relay server started");

    eprintln!("   Type a message and press Enter. /workers, /clear, /quit.\n");
    run_repl(&relay.agent, &relay.registry).await;

    relay.shutdown();
    server.abort();
    Ok(())
}

/// Terminal chat until `/quit` or Ctrl+C. With stdin closed, waits for Ctrl+C.
async fn run_repl(agent: &Agent, registry: &WorkerRegistry) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprint!("> ");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    match line {
                        "" => {}
                        "/quit" | "/exit" => break,
                        "/clear" => {
                            agent.clear(CLI_CONVERSATION).await;
                            eprintln!("Conversation cleared.");
                        }
                        "/workers" => {
                            for worker in registry.list().await {
                                eprintln!(
                                    "  {} ({}) {} tasks={} errors={} avg={:.0}ms",
                                    worker.name,
                                    worker.hostname(),
                                    worker.status,
                                    worker.task_count,
                                    worker.error_count,
                                    worker.avg_latency_ms,
                                );
                            }
                        }
                        input => {
                            let reply = agent.handle_turn(CLI_CONVERSATION, input).await;
                            println!("\n{reply}\n");
                        }
                    }
                    eprint!("> ");
                }
                Ok(None) => {
                    tracing::info!("stdin closed, serving until Ctrl+C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                    break;
                }
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    }
}
