//! Paxoslog server replica executable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use paxoslog::{
    logger_init, pf_error, PaxosLogError, PaxosLogReplica, ReplicaId,
};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My replica ID, indexing into the replicas list.
    #[arg(short, long, default_value_t = 0)]
    id: ReplicaId,

    /// Comma-separated listening addresses of all replicas, in ID order.
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:3057,127.0.0.1:3058,127.0.0.1:3059"
    )]
    replicas: String,

    /// Protocol-specific server configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(roster)` on success or
    /// `Err(PaxosLogError)` on any error.
    fn sanitize(&self) -> Result<Vec<SocketAddr>, PaxosLogError> {
        let roster = parse_roster(&self.replicas)?;
        if roster.is_empty() || roster.len() > u8::MAX as usize {
            Err(PaxosLogError::msg(format!(
                "invalid number of replicas {}",
                roster.len()
            )))
        } else if roster.iter().collect::<HashSet<_>>().len() != roster.len()
        {
            Err(PaxosLogError::msg("duplicate replica addresses"))
        } else if self.id as usize >= roster.len() {
            Err(PaxosLogError::msg(format!(
                "invalid replica ID {} / {}",
                self.id,
                roster.len()
            )))
        } else if self.threads < 2 {
            Err(PaxosLogError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(roster)
        }
    }
}

/// Parses a comma-separated list of socket addresses.
fn parse_roster(list: &str) -> Result<Vec<SocketAddr>, PaxosLogError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<SocketAddr>().map_err(|e| {
                PaxosLogError::msg(format!("failed to parse '{}': {}", s, e))
            })
        })
        .collect()
}

/// Actual main function of a replica.
fn server_main() -> Result<(), PaxosLogError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let roster = args.sanitize()?;
    let id = args.id;
    let config = args.config.replace('+', "\n");

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!(id; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name(format!("tokio-worker-replica{}", id))
            .build()?;

        // enter tokio runtime, setup the replica, and start the main event
        // loop logic
        runtime.block_on(async move {
            let config_str = (!config.is_empty()).then_some(config.as_str());
            let mut replica =
                PaxosLogReplica::new_and_setup(id, roster, config_str).await?;

            replica.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), PaxosLogError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a replica.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args(id: ReplicaId, replicas: &str, threads: usize) -> CliArgs {
        CliArgs {
            id,
            replicas: replicas.into(),
            config: "".into(),
            threads,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), PaxosLogError> {
        let roster =
            args(2, "127.0.0.1:40000, 127.0.0.1:40001,127.0.0.1:40002", 2)
                .sanitize()?;
        assert_eq!(roster.len(), 3);
        assert_eq!(roster[2], "127.0.0.1:40002".parse::<SocketAddr>()?);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_id() {
        assert!(args(3, "127.0.0.1:40000,127.0.0.1:40001,127.0.0.1:40002", 2)
            .sanitize()
            .is_err());
    }

    #[test]
    fn sanitize_invalid_replicas() {
        assert!(args(0, "", 2).sanitize().is_err());
        assert!(args(0, "127.0.0.1", 2).sanitize().is_err());
        assert!(args(0, "127.0.0.1:40000,127.0.0.1:40000", 2)
            .sanitize()
            .is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        assert!(args(0, "127.0.0.1:40000", 1).sanitize().is_err());
    }
}
