use clap::Parser;
use hydrocal_lsf_sim::{seeded_rng, submit_line, SimStore, DEFAULT_QUEUE};
use rand::Rng;
use std::process::exit;

/// Accepts the common bsub flags, queues the job as pending and prints the
/// confirmation line real clusters print.
#[derive(Parser, Debug)]
#[command(name = "bsub", about = "Simulated LSF submission command", long_about = None)]
struct Cli {
    /// Target queue, echoed back in the confirmation
    #[arg(short)]
    queue: Option<String>,

    /// Output path, accepted and ignored
    #[arg(short)]
    output: Option<String>,

    /// Memory limit in KB, accepted and ignored
    #[arg(short = 'M')]
    mem_limit: Option<u64>,

    /// Wall time in minutes, accepted and ignored
    #[arg(short = 'W')]
    wall_time: Option<u64>,

    /// Slot range, accepted and ignored
    #[arg(short = 'n')]
    slots: Option<String>,

    /// Resource requirements, accepted and ignored
    #[arg(short = 'R')]
    resources: Option<String>,

    /// Exclusive execution, accepted and ignored
    #[arg(short = 'x')]
    exclusive: bool,

    /// The command to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let mut rng = seeded_rng();
    let job_id = rng.random_range(1..100_000_000);

    let store = match SimStore::open() {
        Ok(store) => store,
        Err(error) => {
            eprintln!("bsub: cannot open the job table: {error}");
            exit(1);
        }
    };
    if let Err(error) = store.insert_job(job_id, &cli.command.join(" ")) {
        eprintln!("bsub: cannot queue the job: {error}");
        exit(1);
    }

    let queue = cli.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_owned());
    println!("{}", submit_line(job_id, &queue));
}
