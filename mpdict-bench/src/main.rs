// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::{bail, Context};
use clap::Parser;
use mpdict::{ArenaOptions, SharedMap, TracingDiagnostics, UnlinkPolicy};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Worker ids of the background processes, in start order.
const WORKER_IDS: &str = "abcdefghijklnmo";

/// Arena bytes reserved per item; covers a 15-byte key with a 10-byte value.
const BYTES_PER_ITEM: f64 = 128.0;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Number of processes writing, the foreground one included.
    #[arg(default_value_t = 3)]
    processes: usize,

    /// Total number of items written, split evenly between processes.
    #[arg(default_value_t = 1e5)]
    worksize: f64,

    /// Arena to create.
    #[arg(long, default_value = "TestMPDict")]
    arena: String,

    /// Map inside the arena.
    #[arg(long, default_value = "bench")]
    map: String,
}

fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}

/// Marks every value a worker writes: its id repeated, cut to 10 characters.
fn mark(id: &str) -> String {
    id.repeat(10).chars().take(10).collect()
}

fn worker(map: &SharedMap, id: &str, items: usize) -> anyhow::Result<()> {
    let mark = mark(id);
    for i in 0..items {
        let key = format!("{id}{i}");
        map.set(key.as_bytes(), mark.as_bytes())
            .with_context(|| format!("worker {id} failed to store {key}"))?;
    }
    Ok(())
}

fn spawn_worker(map: &SharedMap, id: &str, items: usize) -> anyhow::Result<Pid> {
    // SAFETY: the bench is single-threaded.
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            let code = match worker(map, id, items) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("{e:#}");
                    1
                }
            };
            std::process::exit(code)
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging()?;
    if args.processes == 0 || args.processes > WORKER_IDS.len() + 1 {
        bail!("processes must be between 1 and {}", WORKER_IDS.len() + 1);
    }

    println!(
        "Testing mpdict on {} processes X {} items...",
        args.processes, args.worksize
    );

    let options = ArenaOptions::new((BYTES_PER_ITEM * args.worksize) as usize)
        .unlink_policy(UnlinkPolicy::OnDestroy)
        .clear_stale(true)
        .diagnostics(Arc::new(TracingDiagnostics));
    let map = SharedMap::open_or_create_with(&args.map, &args.arena, options)
        .context("failed to open the shared map")?;
    let items = (args.worksize / args.processes as f64) as usize;

    let start = Instant::now();
    worker(&map, "Foreground", items)?;
    let children = WORKER_IDS
        .chars()
        .take(args.processes - 1)
        .map(|id| spawn_worker(&map, &id.to_string(), items))
        .collect::<anyhow::Result<Vec<_>>>()?;
    for child in children {
        match waitpid(child, None).context("waitpid failed")? {
            WaitStatus::Exited(_, 0) => {}
            status => bail!("worker {child} ended with {status:?}"),
        }
    }
    let elapsed = start.elapsed();

    println!("Elapsed {} seconds", elapsed.as_secs_f64());
    let mut line = format!("d[{}]:", map.len());
    for key in map.iter().take(9) {
        let key = key?;
        let value = map.get(&key)?.unwrap_or_default();
        line.push_str(&format!(
            " ({:?}, {:?})",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        ));
    }
    println!("{line}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_are_ten_characters() {
        assert_eq!(mark("a"), "aaaaaaaaaa");
        assert_eq!(mark("Foreground"), "Foreground");
        assert_eq!(mark("xyz"), "xyzxyzxyzx");
    }

    #[test]
    fn defaults_match_the_classic_run() {
        let args = Args::parse_from(["mpdict-bench"]);
        assert_eq!(args.processes, 3);
        assert_eq!(args.worksize, 1e5);
        let args = Args::parse_from(["mpdict-bench", "5", "2000", "--arena", "x"]);
        assert_eq!((args.processes, args.worksize), (5, 2000.0));
        assert_eq!(args.arena, "x");
    }
}
