use clap::Parser;
use hydrocal_lsf_sim::{header, job_line, promote, seeded_rng, SimStore};
use std::process::exit;

/// Lists the simulated jobs and drifts them towards completion.
#[derive(Parser, Debug)]
#[command(name = "bjobs", about = "Simulated LSF status command", long_about = None)]
struct Cli {
    /// Include finished jobs, accepted and ignored since nothing is dropped
    #[arg(short)]
    all: bool,
}

fn main() {
    let _cli = Cli::parse();

    let store = match SimStore::open() {
        Ok(store) => store,
        Err(error) => {
            eprintln!("bjobs: cannot open the job table: {error}");
            exit(1);
        }
    };
    let jobs = match store.jobs() {
        Ok(jobs) => jobs,
        Err(error) => {
            eprintln!("bjobs: cannot list the jobs: {error}");
            exit(1);
        }
    };

    if jobs.is_empty() {
        println!("No unfinished job found");
        return;
    }

    let mut rng = seeded_rng();
    println!("{}", header());
    for (job_id, status) in jobs {
        // each row shows the state before this listing's promotion
        println!("{}", job_line(job_id, &status));

        if let Some(next) = promote(&mut rng, &status) {
            if let Err(error) = store.update_status(job_id, next) {
                eprintln!("bjobs: cannot update job {job_id}: {error}");
                exit(1);
            }
        }
    }
}
