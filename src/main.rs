use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dispatch_core::args::CliArgs;
use dispatch_core::collaborators::{MockBlobStore, MockDocumentStore};
use dispatch_core::config::ConfigBuilder;
use dispatch_core::context::AppContext;
use dispatch_core::dispatcher_context::DispatcherContext;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let ctx = AppContext::new();

    ctx.rt.block_on(async move {
        let config = ConfigBuilder::new(args).build().await?;

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_target(false),
            )
            .with(config.build_tracing_filter()?)
            .try_init()?;

        tracing::info!("starting dispatch-core");

        // Collaborators (document store, blob store) are external to
        // the core per spec.md §1; the binary wires in-memory mocks so
        // the process can run standalone. A real deployment swaps these
        // for clients of the document/blob store services.
        let dispatcher_ctx = DispatcherContext::new(
            Arc::new(MockDocumentStore::new()),
            Arc::new(MockBlobStore::new()),
            Arc::new(config),
        );

        let handle = ctx.rt.handle().clone();
        dispatch_core::run(dispatcher_ctx, &handle, ctx.get_kill_receiver());

        ctrlc::set_handler({
            let ctx = ctx.clone();
            move || ctx.kill()
        })?;

        let mut shutdown = ctx.get_kill_receiver();
        shutdown.recv().await.ok();
        tracing::info!("dispatch-core shut down");

        Ok(())
    })
}
