use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use relaybench_core::Settings;

pub(super) fn add_local_subcommand() -> Command {
    Command::new("local")
        .about("Runs Generator, Relays and Sinks inside this process")
        .arg(
            Arg::new("payload")
                .long("payload")
                .help("Filler bytes per record")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("delay")
                .long("delay")
                .help("Milliseconds the Generator sleeps every sleep-freq records, <= 0 disables")
                .allow_negative_numbers(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("sleep-freq")
                .long("sleep-freq")
                .help("Records between two Generator sleeps, <= 0 disables")
                .allow_negative_numbers(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("latency-freq")
                .long("latency-freq")
                .help("Latency sampling period, <= 0 disables")
                .allow_negative_numbers(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("log-freq")
                .long("log-freq")
                .help("Records per throughput window of a Sink, <= 0 disables")
                .allow_negative_numbers(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("ft")
                .long("ft")
                .help("Track every record until the Sink acks it and replay failures")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("relays")
                .long("relays")
                .help("Number of Relay stages between Generator and Sink")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("source-parallelism")
                .long("source-parallelism")
                .help("Generator instances")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("relay-parallelism")
                .long("relay-parallelism")
                .help("Instances per Relay stage")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("sink-parallelism")
                .long("sink-parallelism")
                .help("Sink instances")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("channel-capacity")
                .long("channel-capacity")
                .help("Bound of every channel between two stages")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-records")
                .long("max-records")
                .help("Fresh records per Generator instance, unbounded when absent")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("ack-timeout")
                .long("ack-timeout")
                .help("Milliseconds after which an unacknowledged record is failed")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("name")
                .long("name")
                .help("Name of the benchmark run")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .help(
                    "Host name stamped on records. Defaults to $HOSTNAME when exported, else \
                     localhost. Shells often do not export HOSTNAME, pass it explicitly when \
                     Generator and Sink must agree on the machine",
                )
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .help("Seconds after which the run is stopped")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .help("Serve /metrics and /livez on this port")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(u16)),
        )
}

/// Arguments of the `local` subcommand. Settings flags are only applied when given.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct LocalArgs {
    payload_size: Option<usize>,
    delay_millis: Option<i64>,
    sleep_every_n: Option<i64>,
    sample_every_n: Option<i64>,
    log_freq: Option<i64>,
    fault_tolerant: bool,
    relay_count: Option<usize>,
    source_parallelism: Option<usize>,
    relay_parallelism: Option<usize>,
    sink_parallelism: Option<usize>,
    channel_capacity: Option<usize>,
    max_records: Option<u64>,
    ack_timeout_millis: Option<u64>,
    name: Option<String>,
    host: Option<String>,
    pub(crate) duration: Option<Duration>,
    pub(crate) metrics_port: Option<u16>,
}

impl From<&ArgMatches> for LocalArgs {
    fn from(matches: &ArgMatches) -> Self {
        Self {
            payload_size: matches.get_one("payload").copied(),
            delay_millis: matches.get_one("delay").copied(),
            sleep_every_n: matches.get_one("sleep-freq").copied(),
            sample_every_n: matches.get_one("latency-freq").copied(),
            log_freq: matches.get_one("log-freq").copied(),
            fault_tolerant: matches.get_flag("ft"),
            relay_count: matches.get_one("relays").copied(),
            source_parallelism: matches.get_one("source-parallelism").copied(),
            relay_parallelism: matches.get_one("relay-parallelism").copied(),
            sink_parallelism: matches.get_one("sink-parallelism").copied(),
            channel_capacity: matches.get_one("channel-capacity").copied(),
            max_records: matches.get_one("max-records").copied(),
            ack_timeout_millis: matches.get_one("ack-timeout").copied(),
            name: matches.get_one::<String>("name").cloned(),
            host: matches.get_one::<String>("host").cloned(),
            duration: matches
                .get_one::<u64>("duration")
                .map(|secs| Duration::from_secs(*secs)),
            metrics_port: matches.get_one("metrics-port").copied(),
        }
    }
}

impl LocalArgs {
    /// Overrides the loaded settings with the flags given on the command line.
    pub(crate) fn apply(&self, mut settings: Settings) -> Settings {
        if let Some(payload_size) = self.payload_size {
            settings.payload_size = payload_size;
        }
        if let Some(delay_millis) = self.delay_millis {
            settings.delay_millis = delay_millis;
        }
        if let Some(sleep_every_n) = self.sleep_every_n {
            settings.sleep_every_n = sleep_every_n;
        }
        if let Some(sample_every_n) = self.sample_every_n {
            settings.sample_every_n = sample_every_n;
        }
        if let Some(log_freq) = self.log_freq {
            settings.log_freq = log_freq;
        }
        if self.fault_tolerant {
            settings.fault_tolerant = true;
        }
        if let Some(relay_count) = self.relay_count {
            settings.relay_count = relay_count;
        }
        if let Some(source_parallelism) = self.source_parallelism {
            settings.source_parallelism = source_parallelism;
        }
        if let Some(relay_parallelism) = self.relay_parallelism {
            settings.relay_parallelism = relay_parallelism;
        }
        if let Some(sink_parallelism) = self.sink_parallelism {
            settings.sink_parallelism = sink_parallelism;
        }
        if let Some(channel_capacity) = self.channel_capacity {
            settings.channel_capacity = channel_capacity;
        }
        if let Some(max_records) = self.max_records {
            settings.max_records = Some(max_records);
        }
        if let Some(ack_timeout_millis) = self.ack_timeout_millis {
            settings.ack_timeout_millis = ack_timeout_millis;
        }
        if let Some(name) = &self.name {
            settings.name.clone_from(name);
        }
        if let Some(host) = &self.host {
            settings.host = Some(host.clone());
        }
        settings
    }
}
