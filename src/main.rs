//! OmniLink - Local LLM Session Host
//!
//! A thin terminal host around the streaming session bridge: loads a
//! model directory, streams responses to stdout as they are generated.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::{mpsc, Arc};

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use omnilink::session::{ChatObserver, ModelSession};

/// Streams fragments to stdout and unblocks the prompt loop on the
/// terminal notification.
struct StdoutObserver {
    done: mpsc::Sender<()>,
}

impl ChatObserver for StdoutObserver {
    fn on_fragment(&self, text: &str) {
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn on_finished(&self, _full_text: &str) {
        println!();
        let _ = self.done.send(());
    }
}

fn main() {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("omnilink=info".parse().unwrap()))
        .init();

    info!("Starting OmniLink v{}", env!("CARGO_PKG_VERSION"));

    let Some(model_dir) = std::env::args().nth(1) else {
        eprintln!("Usage: omnilink <model-dir>");
        std::process::exit(2);
    };

    let session = ModelSession::new();
    if let Err(e) = session.init(Path::new(&model_dir)) {
        eprintln!("Failed to load model: {e}");
        std::process::exit(1);
    }
    println!("Model loaded. Type a message, /reset to clear, /quit to exit.");

    let (done_tx, done_rx) = mpsc::channel();
    let observer: Arc<dyn ChatObserver> = Arc::new(StdoutObserver { done: done_tx });

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("Failed to read input: {e}");
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" => break,
            "/reset" => {
                session.reset();
                println!("Conversation cleared.");
            }
            _ => match session.chat_text(line, &observer) {
                // Block the prompt loop until the terminal notification
                Ok(()) => {
                    let _ = done_rx.recv();
                }
                Err(e) => eprintln!("Chat failed: {e}"),
            },
        }
    }

    session.release();
}
