mod config;
mod logging;

use std::{sync::Arc, time::Duration};

use sync_core::{
    ActivityKind, ConversationEvent, MessageKind, OutgoingPayload, RemoteActivity, UserRef,
};
use sync_runtime::{Clock, ConversationRegistry, SystemClock};
use sync_transport::InMemoryChatServer;
use tracing::{error, info};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() {
    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    logging::init(config.log_directives.as_deref());

    if let Err(err) = run(config).await {
        error!(error = %err, "smoke run failed");
        eprintln!("Smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run(config: SmokeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let local_user = UserRef::local(&config.local_user_id, &config.local_display_name);
    let remote_user = UserRef::remote("u-remote", "Remote");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let server = InMemoryChatServer::new(local_user.clone());
    server.set_latency(Duration::from_millis(config.latency_ms))?;
    server.set_echo_client_temp_id(!config.legacy_echo)?;

    let registry = ConversationRegistry::new(
        local_user,
        config.sync.clone(),
        Arc::new(server.clone()),
        Arc::clone(&clock),
    );
    let conversation_id = config.conversation_id.as_str();

    server.set_now_ms(clock.now_ms());
    let greeting = server.post_remote(conversation_id, &remote_user, "hello, anyone there?")?;

    let engine = registry.open(conversation_id).await?;
    let mut events = engine.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConversationEvent::SendFailed {
                    client_temp_id,
                    code,
                    ..
                } => error!(%client_temp_id, %code, "send failed"),
                ConversationEvent::SyncFailed { code, message, .. } => {
                    error!(%code, %message, "sync round failed")
                }
                other => info!(event = ?other, "conversation event"),
            }
        }
    });

    server.set_now_ms(clock.now_ms());
    server.set_typing(
        conversation_id,
        vec![RemoteActivity {
            user_id: remote_user.user_id.clone(),
            display_name: remote_user.display_name.clone(),
            kind: ActivityKind::Typing,
            started_at_ms: clock.now_ms(),
        }],
    )?;
    registry.on_push_hint(conversation_id).await;

    engine.publish_activity(ActivityKind::Typing)?;
    let text_id = engine.send_text("hi")?;
    info!(client_temp_id = %text_id, "queued text message");

    let media_id = engine.enqueue(OutgoingPayload::Media {
        kind: MessageKind::Image,
        media_ref: "https://media.example.invalid/smoke.png".to_owned(),
        caption: Some("screenshot".to_owned()),
    })?;
    info!(client_temp_id = %media_id, "queued media message");

    engine.pin(greeting).await?;

    tokio::time::sleep(Duration::from_millis(config.run_ms / 2)).await;
    server.set_now_ms(clock.now_ms());
    server.post_remote(conversation_id, &remote_user, "got it, thanks")?;
    registry.on_push_hint(conversation_id).await;
    tokio::time::sleep(Duration::from_millis(config.run_ms / 2)).await;

    let snapshot = engine.snapshot()?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    registry.close_all().await?;
    event_log.abort();
    Ok(())
}
