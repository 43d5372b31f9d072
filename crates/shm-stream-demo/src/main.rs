use anyhow::{bail, Context};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use pollster::block_on;
use shm_stream::config::DEFAULT_BYTE_LENGTH;
use shm_stream::{spawn_peer, ChannelConfig, PeerEvent, ShmReader, ShmRegion, ShmWriter};
use tracing_subscriber::EnvFilter;

/// Which producer runs on the writer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// One write, then end.
    Basic,
    /// Three corked writes published as one batch.
    Writev,
    /// Three writes, a synchronous flush, then end.
    FlushSync,
}

#[derive(Debug, Parser)]
#[command(
    name = "shm-stream-demo",
    version,
    about = "Stream chunks between two threads over a shared memory region."
)]
struct Args {
    #[arg(value_enum, default_value_t = Scenario::Basic)]
    scenario: Scenario,

    /// Initial region size in bytes, control words included.
    ///
    /// Environment variable: `SHM_STREAM_BYTE_LENGTH`.
    #[arg(long, env = "SHM_STREAM_BYTE_LENGTH", default_value_t = DEFAULT_BYTE_LENGTH)]
    byte_length: usize,

    /// Let the region grow up to this many bytes.
    ///
    /// Environment variable: `SHM_STREAM_MAX_BYTE_LENGTH`.
    #[arg(long, env = "SHM_STREAM_MAX_BYTE_LENGTH")]
    max_byte_length: Option<usize>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `SHM_STREAM_LOG_LEVEL`.
    #[arg(long, env = "SHM_STREAM_LOG_LEVEL")]
    log_level: Option<String>,
}

fn produce(scenario: Scenario, writer: ShmWriter) -> shm_stream::Result<()> {
    match scenario {
        Scenario::Basic => {
            block_on(writer.write("Hello, World!"))?;
        }
        Scenario::Writev => {
            writer.cork();
            let pending = ["Hello, A!", "Hello, B!", "Hello, C!"].map(|s| writer.write(s));
            block_on(writer.uncork())?;
            for fut in pending {
                block_on(fut)?;
            }
        }
        Scenario::FlushSync => {
            let pending = ["Hello, A!", "Hello, B!", "Hello, C!"].map(|s| writer.write(s));
            writer.flush_sync()?;
            drop(pending);
        }
    }
    block_on(writer.end())
}

fn consume(reader: ShmReader) -> anyhow::Result<Vec<Bytes>> {
    let mut chunks = Vec::new();
    for chunk in reader {
        let chunk = chunk.context("reading from shared region")?;
        tracing::debug!(len = chunk.len(), "received chunk");
        chunks.push(chunk);
    }
    Ok(chunks)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ChannelConfig::default().with_byte_length(args.byte_length);
    if let Some(max) = args.max_byte_length {
        config = config.with_max_byte_length(max);
    }
    let region = ShmRegion::from_config(&config).context("allocating shared region")?;
    let writer = ShmWriter::with_config(region.clone(), &config)?;
    let reader = ShmReader::with_config(region.clone(), &config)?;

    tracing::info!(scenario = ?args.scenario, byte_length = region.byte_length(), "starting");

    let scenario = args.scenario;
    let producer = spawn_peer("producer", &region, move || produce(scenario, writer))
        .context("spawning producer thread")?;
    let chunks = consume(reader)?;

    match producer.join() {
        PeerEvent::Exited => {}
        PeerEvent::Failed(reason) => bail!("producer failed: {reason}"),
    }

    for chunk in &chunks {
        println!("{}", String::from_utf8_lossy(chunk));
    }
    tracing::info!(chunks = chunks.len(), "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(scenario: Scenario) -> Vec<Bytes> {
        let config = ChannelConfig::default();
        let region = ShmRegion::from_config(&config).unwrap();
        let writer = ShmWriter::with_config(region.clone(), &config).unwrap();
        let reader = ShmReader::with_config(region.clone(), &config).unwrap();
        let producer = spawn_peer("producer", &region, move || produce(scenario, writer)).unwrap();
        let chunks = consume(reader).unwrap();
        assert_eq!(producer.join(), PeerEvent::Exited);
        chunks
    }

    #[test]
    fn basic_scenario() {
        assert_eq!(run(Scenario::Basic), vec![Bytes::from_static(b"Hello, World!")]);
    }

    #[test]
    fn batched_scenarios_deliver_all_three() {
        let want: Vec<Bytes> = ["Hello, A!", "Hello, B!", "Hello, C!"]
            .into_iter()
            .map(|s| Bytes::from_static(s.as_bytes()))
            .collect();
        assert_eq!(run(Scenario::Writev), want);
        assert_eq!(run(Scenario::FlushSync), want);
    }

    #[test]
    fn args_parse_scenario_names() {
        let argv = ["shm-stream-demo", "flush-sync", "--byte-length", "512"];
        let args = Args::try_parse_from(argv).unwrap();
        assert_eq!(args.scenario, Scenario::FlushSync);
        assert_eq!(args.byte_length, 512);
    }
}
