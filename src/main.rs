extern crate structopt;
extern crate tracing;

use async_std::sync::Arc;
use futures::FutureExt;
use futures::future::join3;
use rand::Rng;
use std::collections::HashSet;
use std::error::Error;
use std::time::Duration;
use structopt::StructOpt;
use tokio::select;
use tokio::time::{Instant, sleep};
use tracing::{Instrument, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use keyraft::harness::Harness;
use keyraft::raft::FailureOptions;

// We deliberately inject some failures by default.
fn make_default_failure_options() -> FailureOptions {
    FailureOptions {
        failure_probability: 0.01,
        latency_probability: 0.05,
        latency_ms: 50,
        disconnected: HashSet::new(),
    }
}

// Writes spread over this many keys, so that deletes hit existing ones.
const KEY_SPACE: usize = 20;

#[derive(Debug, StructOpt, Clone)]
struct Arguments {
    #[structopt(short = "n", long = "nodes", default_value = "3")]
    nodes: usize,

    #[structopt(short = "p", long = "disable_put")]
    disable_put: bool,

    #[structopt(short = "d", long = "disable_delete")]
    disable_delete: bool,

    #[structopt(short = "s", long = "snapshot_directory")]
    snapshot_directory: Option<String>,
}

fn random_key() -> String {
    format!("key-{}", rand::thread_rng().gen_range(0..KEY_SPACE))
}

// Repeatedly writes a random key through whichever node currently leads.
async fn run_put_loop(
    args: Arc<Arguments>,
    harness: &Harness,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_put {
        info!("running without the put loop");
        return;
    }

    let mut i = 0;
    loop {
        let body = async {
            let Some(leader) = harness.leader().await else {
                info!(i, "no leader, skipping");
                sleep(Duration::from_millis(500)).await;
                return;
            };
            let key = random_key();
            let start = Instant::now();
            match leader.service().put(&key, &format!("value-{}", i)).await {
                Ok(index) => {
                    if i % 10 == 1 {
                        info!(i, index, latency_ms=%start.elapsed().as_millis(), "success")
                    }
                }
                Err(msg) => info!(i, latency_ms=%start.elapsed().as_millis(), "failure: {}", msg),
            }
            i += 1;
            sleep(Duration::from_millis(200)).await;
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished")
}

// Repeatedly deletes a random key, most of which have been written before.
async fn run_delete_loop(
    args: Arc<Arguments>,
    harness: &Harness,
    shutdown: impl Future<Output = ()> + Clone,
) {
    if args.disable_delete {
        info!("running without the delete loop");
        return;
    }

    let mut i = 0;
    loop {
        let body = async {
            sleep(Duration::from_secs(1)).await;
            let Some(leader) = harness.leader().await else {
                return;
            };
            let key = random_key();
            match leader.service().delete(&key).await {
                Ok(index) => info!(i, index, %key, "deleted"),
                Err(msg) => info!(i, %key, "failure: {}", msg),
            }
            i += 1;
        };

        select! {
          _ = shutdown.clone() => {break;}
          _ = body => {}
        }
    }
    info!("Finished")
}

fn names(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| match i {
            0..26 => ((b'A' + i as u8) as char).to_string(),
            _ => format!("N{}", i),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // This allows configuring the filters using the RUST_LOG env variable.
    // Example:
    // > RUST_LOG=info,keyraft::raft=debug cargo run
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::from("keyraft=info"));

    tracing_subscriber::FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
    let arguments = Arc::new(Arguments::from_args());

    let mut builder =
        Harness::builder(names(arguments.nodes)).with_failure(make_default_failure_options());
    if let Some(directory) = &arguments.snapshot_directory {
        builder = builder.with_snapshot_directory(directory);
    }
    let harness = builder.build().await.expect("harness");
    info!("Started {} nodes", harness.nodes().len());

    // Set up a shutdown broadcast by turning the channel receiver into a shared future.
    let (shutdown, rx) = async_std::channel::unbounded::<()>();
    let sx = async { rx.recv().await.unwrap_or(()) }.shared();

    let args = arguments.clone();
    let clients = join3(
        run_put_loop(args.clone(), &harness, sx.clone()).instrument(info_span!("put")),
        run_delete_loop(args.clone(), &harness, sx.clone()).instrument(info_span!("delete")),
        async {
            // Occasionally report how far the nodes have diverged.
            loop {
                select! {
                  _ = sx.clone() => {break;}
                  _ = sleep(Duration::from_secs(10)) => {
                    if !harness.wait_for_convergence(Duration::from_secs(1)).await {
                        warn!("nodes have not converged");
                    }
                  }
                }
            }
        }
        .instrument(info_span!("convergence")),
    )
    .shared();

    // Set up a signal handler that stops the clients.
    let signal_clients = clients.clone();
    let signal_handler = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {}", e);
        }
        info!("Got SIGINT, shutting down");

        // First tell all the client loops to shut down and wait for them.
        shutdown.send(()).await.expect("shutdown-send");
        signal_clients.await;
    };

    futures::future::join(signal_handler, clients).await;

    // Now shut down the nodes and wait for them to stop.
    harness.stop().await;
    info!("All done, exiting");
    Ok(())
}
