//! Interactive multi-turn chat on one thread.

use crate::QueryArgs;
use crate::commands::{build_query, print_result};
use meka_core::Pipeline;
use meka_core::config::MekaConfig;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

fn is_exit(line: &str) -> bool {
    matches!(line, "exit" | "quit" | "/exit" | "/quit")
}

pub async fn run_chat(
    pipeline: Arc<Pipeline>,
    args: &QueryArgs,
    config: &MekaConfig,
) -> anyhow::Result<()> {
    let thread = args
        .thread
        .clone()
        .unwrap_or_else(|| config.pipeline.default_thread_id.clone());
    let history = pipeline.checkpoints().load(&thread).await?;
    println!(
        "\x1b[1mMEKA\x1b[0m chat on thread '{}' ({} prior messages). Type 'exit' to quit.",
        thread,
        history.len()
    );

    let stdin = io::stdin();
    loop {
        print!("\n\x1b[34m>\x1b[0m ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if is_exit(line) {
            break;
        }

        let query = build_query(line, args, config).on_thread(thread.clone());
        match pipeline.run(query).await {
            Ok(state) => print_result(&state),
            // A failed turn is not committed; the conversation continues.
            Err(e) => eprintln!("\x1b[31mError:\x1b[0m {}", e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_words() {
        assert!(is_exit("exit"));
        assert!(is_exit("/quit"));
        assert!(!is_exit("what is an exit code?"));
    }
}
