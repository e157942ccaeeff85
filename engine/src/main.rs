mod context;
mod engine;
mod event;
mod logging;
mod server;
#[cfg(test)]
mod testing;

use anyhow::{anyhow, Context};
use common::config::Config;
use context::AppContext;
use event::{stream::StreamTransport, subscriber::Subscriber};
use history::BarStore;
use log::{error, info, warn};
use rustyline::Editor;
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tokio::{runtime::Builder, sync::watch, task};

fn main() {
    if let Err(error) = setup_and_launch() {
        println!("{error:?}");
    }
}

fn setup_and_launch() -> Result<(), anyhow::Error> {
    let (editor, logger_printer) = Editor::<()>::new()
        .and_then(|mut editor| {
            let printer = editor.create_external_printer()?;
            Ok((editor, printer))
        })
        .context("Failed to setup CLI")?;

    let config = Config::load().context("Failed to load config")?;

    let log_files = logging::init_logger(logger_printer, config.log_level_filter, config.utc_offset)
        .context("Failed to initialize logger")?;

    let result = panic::catch_unwind(AssertUnwindSafe(|| launch(config, editor)));

    match result {
        // Success
        Ok(Ok(())) => (),
        // Regular error which was bubbled up to us
        Ok(Err(error)) => error!("Caught error: {error:?}"),
        // We caught a panic
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .map(|string| &**string)
                .or_else(|| panic.downcast_ref::<&'static str>().copied());

            match message {
                Some(message) => error!("Caught panic: {message}"),
                None => error!("Caught panic; unable to extract associated message"),
            }
        }
    }

    log_files.finish();
    Ok(())
}

fn launch(config: Config, editor: Editor<()>) -> anyhow::Result<()> {
    let context = AppContext::new(config);
    info!(
        "Starting {} for {} on {} bars",
        if context.config.trading.is_crypto() { "crypto bot" } else { "equity bot" },
        context.config.trading.symbol,
        context.config.trading.bar_size.timeframe()
    );

    let (dispatcher, ready) = engine::dispatcher::spawn(context.clone())?;
    match ready.blocking_recv() {
        Ok(Ok(())) => info!("Dispatcher ready"),
        Ok(Err(error)) => {
            let _ = dispatcher.join();
            return Err(error.context("Failed to start dispatcher"));
        }
        Err(_) => {
            let _ = dispatcher.join();
            return Err(anyhow!("Dispatcher exited before it was ready"));
        }
    }

    let runtime = Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .context("Failed to launch runtime")?;

    let result = runtime.block_on(stream(context.clone(), editor));
    // The console may still be blocked reading a line
    runtime.shutdown_background();

    info!("Draining {} queued events", context.queue.len());
    context.queue.close();
    if dispatcher.join().is_err() {
        warn!("Dispatcher thread panicked");
    }

    result
}

async fn stream(context: AppContext, editor: Editor<()>) -> anyhow::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);

    task::spawn(event::command::run_task(
        context.clone(),
        Arc::clone(&stop_tx),
        editor,
    ));

    if let Some(addr) = context.config.storage.http_addr.clone() {
        let store = BarStore::open(&context.config.storage.database_url)
            .await
            .context("Failed to open bar store for the HTTP server")?;
        let stop = stop_rx.clone();
        task::spawn(async move {
            if let Err(error) = server::serve(&addr, store, stop).await {
                error!("{error:?}");
            }
        });
    }

    let subscriber = Subscriber::new(context.clone());
    let transport = StreamTransport::new(&context.config, subscriber.market());

    let result = subscriber.run(transport, stop_rx).await;
    drop(stop_tx);
    result
}
