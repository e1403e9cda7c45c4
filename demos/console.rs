//! Runs a few scripts through the sandbox and prints the event stream.
//!
//! ```sh
//! cargo run --example console
//! ```

use jsbox::{Sandbox, SandboxEvent};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> jsbox::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (sandbox, mut events) = Sandbox::new();
    sandbox.start().await?;

    show(
        &sandbox,
        &mut events,
        "console.log('hello from the sandbox'); console.warn('careful:', { nested: [1, 2, 3] });",
    )
    .await?;
    show(
        &sandbox,
        &mut events,
        "console.time('work'); for (let i = 0; i < 1e6; i++) {} console.timeEnd('work');",
    )
    .await?;
    show(&sandbox, &mut events, "throw new Error('this is fine');").await?;
    println!("\nthe next run never yields; the deadline ends it");
    show(&sandbox, &mut events, "while (true) {}").await?;

    sandbox.dispose().await;
    Ok(())
}

async fn show(
    sandbox: &Sandbox,
    events: &mut mpsc::UnboundedReceiver<SandboxEvent>,
    code: &str,
) -> jsbox::Result<()> {
    println!("\n>>> {code}");
    if sandbox.run(code).await?.is_none() {
        println!("(dropped: a run is already active)");
        return Ok(());
    }
    while let Some(event) = events.recv().await {
        match event {
            SandboxEvent::Started => {}
            SandboxEvent::Log(entry) => {
                let parts: Vec<String> = entry.values.iter().map(render).collect();
                println!("[{:?}] {}", entry.kind, parts.join(" "));
            }
            SandboxEvent::Cleared => println!("--- cleared ---"),
            SandboxEvent::Finished(outcome) => {
                println!(
                    "finished in {} ms ({:?})",
                    outcome.duration_ms, outcome.terminated_by
                );
                break;
            }
        }
    }
    Ok(())
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
