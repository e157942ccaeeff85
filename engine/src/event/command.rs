use std::{sync::Arc, time::Duration};

use log::{error, info};
use rustyline::error::ReadlineError;
use rustyline::Editor;
use tokio::{sync::watch, task};

use crate::context::AppContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Stop,
    Help,
}

const HELP: &str = "\
Commands:
  status    show the event backlog and unacknowledged events
  stop      close the market data stream and shut down
  help      show this message";

/// Reads operator commands until `stop`, Ctrl-C or the end of input. The caller keeps its own
/// handle on `stop`, so closing the console does not stop the stream.
pub async fn run_task(context: AppContext, stop: Arc<watch::Sender<bool>>, editor: Editor<()>) {
    let mut editor = Some(Box::new(editor));
    let mut error_count = 0;

    loop {
        let join_result = task::spawn_blocking({
            let mut editor = match editor.take() {
                Some(editor) => editor,
                None => return,
            };

            move || {
                let result = editor.readline("> ");
                (editor, result)
            }
        })
        .await;

        let (returned_editor, input) = match join_result {
            Ok(ret) => ret,
            Err(unhandled_error) => {
                error!("Terminal reader task panicked: {unhandled_error:?}. Aborting CLI.");
                return;
            }
        };

        editor = Some(returned_editor);

        match input {
            Ok(input) => {
                if let Some(command) = parse_command(&input) {
                    execute(command, &context, &stop);
                    if command == Command::Stop {
                        return;
                    }
                }

                println!();
            }
            Err(ReadlineError::Interrupted) => {
                execute(Command::Stop, &context, &stop);
                return;
            }
            Err(ReadlineError::Eof) => {
                info!("Console input closed, the bot keeps running");
                return;
            }
            Err(ReadlineError::WindowResized) => (),
            Err(error) => {
                error!("Unexpected error when reading CLI input: {error:?}");
                error_count += 1;

                if error_count > 3 {
                    error!("Maximum retries exceeded, aborting CLI");
                    return;
                }

                tokio::time::sleep(Duration::from_secs(3u64.pow(error_count))).await;
                continue;
            }
        }

        // We successfully processed some line input, so we reset the error count
        error_count = 0;
    }
}

fn execute(command: Command, context: &AppContext, stop: &watch::Sender<bool>) {
    match command {
        Command::Status => info!("{}", status_line(context)),
        Command::Stop => {
            info!("Stopping");
            // Nobody listening means the stream is already gone
            let _ = stop.send(true);
        }
        Command::Help => println!("{HELP}"),
    }
}

fn status_line(context: &AppContext) -> String {
    let queue = &context.queue;
    format!(
        "Trading {}: {} events waiting, {} unacknowledged{}",
        context.config.trading.symbol,
        queue.len(),
        queue.unfinished(),
        if queue.is_closed() { " (queue closed)" } else { "" }
    )
}

fn parse_command(input: &str) -> Option<Command> {
    let command = input.split_whitespace().next()?;

    match command {
        "status" | "st" => Some(Command::Status),
        "stop" | "quit" | "exit" => Some(Command::Stop),
        "help" | "?" => Some(Command::Help),
        _ => {
            println!("Unknown command \"{command}\", try \"help\"");
            None
        }
    }
}
