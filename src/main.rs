mod api;
mod confidence;
mod config;
mod decoder;
mod error;
mod lines;
mod render;
mod snapshot;

use anyhow::Result;
use std::io::{self, IsTerminal};
use std::process::exit;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use api::{ApiClient, CompletionRequest};
use config::Config;
use render::Console;
use snapshot::ScreenshotCapture;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        eprintln!("ERROR: {:#}", e);
        exit(1);
    }
}

/// Logs go to stderr so stdout only carries the rendered text and the HTML export.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
}

async fn run() -> Result<()> {
    let config = Config::from_cli()?;

    let screenshot = match config.image_file {
        Some(_) => {
            let capture = ScreenshotCapture::detect(config.chrome.as_deref());
            match &capture {
                Some(c) => debug!(browser = %c.browser().display(), "image export enabled"),
                None => warn!(
                    "could not find Chrome or Chromium: you will not be able to generate images"
                ),
            }
            capture
        }
        None => None,
    };

    // Read the prompt from stdin if the prompt wasn't supplied
    let prompt = match &config.prompt {
        Some(p) => p.clone(),
        None => io::read_to_string(io::stdin())?,
    };

    let request = CompletionRequest::new(prompt, config.temp, config.max_tokens, &config.model);

    let mut console = if config.no_color || !io::stdout().is_terminal() {
        Console::plain(io::stdout())
    } else {
        Console::stdout()
    };

    let api_client = ApiClient::from_config(&config)?;
    let summary = api_client.generate(&request, &mut console).await?;
    console.finish()?;
    debug!(
        tokens = console.token_count(),
        terminated = summary.terminated,
        "rendered completion"
    );

    let html = console.export_html();
    match &config.html {
        Some(path) => tokio::fs::write(path, &html).await?,
        None => println!("{}", html),
    }

    if let (Some(capture), Some(path)) = (&screenshot, &config.image_file) {
        capture.capture(&html, path).await?;
    }

    Ok(())
}
