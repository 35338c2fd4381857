use clap::Command;

mod local;

pub(crate) use local::LocalArgs;

pub(super) fn root_cli() -> Command {
    Command::new("relaybench")
        .about("Latency and throughput benchmark of a partitioned at-least-once pipeline")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(local::add_local_subcommand())
}
