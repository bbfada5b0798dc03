//! Paxoslog chat client executable.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use log::{self, LevelFilter};
use paxoslog::{
    logger_init, pf_error, pf_info, ClientId, PaxosLogClient, PaxosLogError,
};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My client ID; defaults to current UNIX time in millisecs.
    #[arg(short, long)]
    id: Option<ClientId>,

    /// Local address to listen on for replica replies.
    #[arg(short, long, default_value = "127.0.0.1:3100")]
    listen: SocketAddr,

    /// Comma-separated listening addresses of all replicas, in ID order.
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:3057,127.0.0.1:3058,127.0.0.1:3059"
    )]
    replicas: String,

    /// Client configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(short, long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok((id, roster))` on success
    /// or `Err(PaxosLogError)` on any error.
    fn sanitize(&self) -> Result<(ClientId, Vec<SocketAddr>), PaxosLogError> {
        let roster = self
            .replicas
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<SocketAddr>())
            .collect::<Result<Vec<_>, _>>()?;
        let id = match self.id {
            Some(id) => id,
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| PaxosLogError::msg(e.to_string()))?
                .as_millis() as ClientId,
        };

        if roster.is_empty() || roster.len() > u8::MAX as usize {
            Err(PaxosLogError::msg(format!(
                "invalid number of replicas {}",
                roster.len()
            )))
        } else if id == 0 {
            Err(PaxosLogError::msg("client ID 0 is reserved"))
        } else if self.threads < 2 {
            Err(PaxosLogError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok((id, roster))
        }
    }
}

/// Actual main function of a client.
fn client_main() -> Result<(), PaxosLogError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let (id, roster) = args.sanitize()?;
    let config = args.config.replace('+', "\n");

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("c"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name(format!("tokio-worker-c{}", id))
            .build()?;

        let result = runtime.block_on(async move {
            let config_str = (!config.is_empty()).then_some(config.as_str());
            let (mut client, tx_submit, mut rx_deliver) =
                PaxosLogClient::new_and_setup(
                    id,
                    args.listen,
                    roster,
                    config_str,
                )
                .await?;
            pf_info!("c"; "client {} started", client.id());

            // stdin reader, closing the submission channel at EOF
            let reader_handle = tokio::spawn(async move {
                let mut lines = BufReader::new(io::stdin()).lines();
                while let Some(line) = lines.next_line().await? {
                    if tx_submit.send(line).is_err() {
                        break;
                    }
                }
                Ok::<(), PaxosLogError>(())
            });

            // delivery printer
            let printer_handle = tokio::spawn(async move {
                while let Some((seq, payload)) = rx_deliver.recv().await {
                    println!("delivered seq {}: {}", seq, payload);
                }
            });

            let result = client.run(rx_term).await;
            drop(client);
            printer_handle.await?;
            reader_handle.abort();
            result?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), PaxosLogError>(()) // give type hint for this async closure
        });

        // a stdin read may still be parked on a blocking thread
        runtime.shutdown_background();
        result?;
    }

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
