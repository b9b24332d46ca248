use std::io::{self, BufRead, Write};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing_subscriber::EnvFilter;

use mosaic::session::{ChatSession, ExchangeHandle};
use mosaic::settings::SettingsStore;
use mosaic_llm::create_provider;

/// Terminal entry point.
///
/// Bootstraps the chat session with:
/// 1. Tracing with env-filter control (`RUST_LOG`), quiet by default so log
///    lines do not interleave with streamed output
/// 2. Settings loaded from `.mosaic/settings.conf` with environment
///    overrides (`GEMINI_API_KEY`, `GEMINI_MODEL`, `GEMINI_BASE_URL`)
/// 3. Provider construction, exiting with guidance when no key is configured
/// 4. A read-eval loop that renders each exchange incrementally
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let settings = SettingsStore::load()
        .settings()
        .clone()
        .overlaid_with(|key| std::env::var(key).ok());

    let Some(config) = settings.to_provider_config() else {
        eprintln!(
            "No API key configured. Set GEMINI_API_KEY or add `api_key=` to {:?}.",
            SettingsStore::default_config_path()
        );
        std::process::exit(1);
    };

    let provider = match create_provider(config) {
        Ok(provider) => provider,
        Err(error) => {
            eprintln!("Failed to initialize provider: {error}");
            std::process::exit(1);
        }
    };

    let model_id = provider.default_model().to_string();
    tracing::info!(provider = provider.name(), model = %model_id, "session ready");

    let session = ChatSession::new(provider, model_id);

    println!("mosaic — type a message, `/image <path>` to attach, `/quit` to exit.");

    let stdin = io::stdin();
    let mut staged_images: Vec<String> = Vec::new();

    loop {
        if staged_images.is_empty() {
            print!("> ");
        } else {
            print!("[{} image(s) staged] > ", staged_images.len());
        }
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(error) => {
                eprintln!("Failed to read input: {error}");
                break;
            }
        }
        let line = line.trim_end_matches(['\n', '\r']);

        if line == "/quit" || line == "/exit" {
            break;
        }

        if let Some(path) = line.strip_prefix("/image ") {
            stage_image(path.trim(), &mut staged_images);
            continue;
        }

        if line.trim().is_empty() && staged_images.is_empty() {
            continue;
        }

        match session.submit(line, std::mem::take(&mut staged_images)) {
            Ok(handle) => render_exchange(&session, handle).await,
            Err(error) => eprintln!("Submission rejected: {error}"),
        }
    }
}

/// Reads a file and stages its base64 payload for the next submission.
fn stage_image(path: &str, staged: &mut Vec<String>) {
    match std::fs::read(path) {
        Ok(bytes) => {
            let size = bytes.len();
            staged.push(BASE64.encode(bytes));
            println!("Staged {path} ({size} bytes).");
        }
        Err(error) => eprintln!("Could not read {path}: {error}"),
    }
}

/// Renders one exchange incrementally from the store's watch subscription.
///
/// Snapshots are prefix-consistent, so printing only the text suffix past
/// what was already written reproduces the stream in arrival order.
async fn render_exchange(session: &ChatSession, handle: ExchangeHandle) {
    let mut updates = session.subscribe();
    let model_message_id = handle.model_message_id;
    let mut printed = 0usize;

    loop {
        let finished = {
            let snapshot = updates.borrow_and_update().clone();
            let record = snapshot
                .iter()
                .find(|message| message.id == model_message_id)
                .cloned();

            match record {
                Some(message) => {
                    if message.text.len() > printed {
                        print!("{}", &message.text[printed..]);
                        let _ = io::stdout().flush();
                        printed = message.text.len();
                    }
                    !message.streaming
                }
                None => false,
            }
        };

        if finished || updates.changed().await.is_err() {
            break;
        }
    }

    handle.wait().await;

    let snapshot = session.store().messages();
    if let Some(message) = snapshot.iter().find(|message| message.id == model_message_id) {
        println!();
        if let Some(latency) = message.latency {
            println!("[first fragment after {} ms]", latency.as_millis());
        }
        for (index, image) in message.images.iter().enumerate() {
            println!(
                "[image {} received, {} base64 chars]",
                index + 1,
                image.len()
            );
        }
    }
}
