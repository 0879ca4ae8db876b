use clap::Parser;
use flowgate::config::{BufferConfig, ChannelConfig, RateLimiterConfig, WriterConfig};
use flowgate::{BoxError, BufferedWriter, TokenBucket};
use log::{debug, error, info};
use std::io::{self, BufRead, Write};
use std::time::Duration;

/// Batch lines read from STDIN and print each batch as a single line joined with a separator
#[derive(Debug, Parser)]
struct Cli {
    /// String to join lines of single batch together
    #[arg(long = "join", default_value = " ")]
    join: String,

    /// Maximum number of lines in single batch
    #[arg(long = "max-size", default_value_t = 2000)]
    max_size: usize,

    /// Maximum time lines are collected for before a batch is printed, in milliseconds
    #[arg(long = "max-duration", default_value_t = 200)]
    max_duration_ms: u64,

    /// Number of lines buffered between reader and batcher (defaults to twice max-size)
    #[arg(long = "channel-size")]
    channel_size: Option<usize>,

    /// Maximum number of lines read per second
    #[arg(long = "rate")]
    rate: Option<u64>,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();

    let limiter = args.rate.map(|threshold| {
        let config = RateLimiterConfig {
            threshold,
            period: Duration::from_secs(1),
        };
        TokenBucket::with_config(&config).unwrap_or_else(|err| {
            error!("invalid options: {}", err);
            std::process::exit(2);
        })
    });

    let config = WriterConfig {
        channel: ChannelConfig {
            capacity: args.channel_size.unwrap_or(args.max_size.saturating_mul(2)),
            ..Default::default()
        },
        buffer: BufferConfig {
            limit: args.max_size,
            interval: Duration::from_millis(args.max_duration_ms),
        },
    };

    let join = args.join;
    let writer = match BufferedWriter::new(&config, move |lines: Vec<String>| -> Result<(), BoxError> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", lines.join(&join))?;
        stdout.flush()?;
        Ok(())
    }) {
        Ok(writer) => writer,
        Err(err) => {
            error!("invalid options: {}", err);
            std::process::exit(2);
        }
    };

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                writer.channel().report_error(err);
                break;
            }
        };

        if let Some(limiter) = limiter.as_ref() {
            limiter.acquire();
        }

        debug!("read: {}", line);
        if writer.write(line).is_err() {
            break;
        }
    }

    writer.close();
    let stats = writer.buffer().stats();
    info!(
        "printed {} lines in {} batches; {} lines in {} batches failed",
        stats.delivered_items, stats.delivered_batches, stats.failed_items, stats.failed_batches
    );

    let mut failed = stats.failed_batches > 0;
    while let Some(err) = writer.channel().poll_error() {
        error!("failed to read STDIN: {}", err);
        failed = true;
    }
    if failed {
        std::process::exit(1);
    }
}
