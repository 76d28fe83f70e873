use crate::scheduler::SubmitOptions;
use clap::{Parser, ValueEnum};
use nix::unistd::{getuid, User};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, warn};

pub const MAX_ITERATIONS: u32 = 5120;
pub const MAX_PROCESSORS: u32 = 512;

/// queues accepted by the LSF backend
pub const LSF_QUEUES: [&str; 5] = ["day", "debug", "hour", "week", "bigmem"];
pub const DEFAULT_QUEUE: &str = "day";

/// Command prototype written by `--create`, covering the common calibration
/// setup. Session-level variables are filled in once per session, parameter
/// and worldfile variables once per run.
pub const DEFAULT_CMD_PROTO: &str = "$rhessys -st 2003 10 1 1 -ed 2008 10 1 1 -b \
    -t $tecfile -w $worldfile -r $flowtable -pre $output_path \
    -s $s1 $s2 -sv $sv1 $sv2 -gw $gw1 $gw2";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Requested {requested} {what}, the limit is {limit}")]
    CapacityExceeded {
        what: &'static str,
        requested: u32,
        limit: u32,
    },
    #[error("File not found")]
    FileNotFound,
    #[error("IO operation failed")]
    Io(#[from] Error),
    #[error("Session defaults file was invalid")]
    InvalidDefaults(#[from] serde_yaml::Error),
    #[error("No worldfiles were found")]
    NoWorldfiles,
    #[error("Flow tables were missing")]
    MissingFlowTables,
    #[error("No readable tecfile was found")]
    NoTecfile,
    #[error("No executable model binary was found")]
    NoExecutable,
}

/// How submitted jobs reach their compute resources.
#[derive(Deserialize, Serialize, ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// submit through `bsub` and reconcile with `bjobs`
    Lsf,
    /// submit through `qsub` and reconcile with `qstat`
    Pbs,
    /// run jobs as local subprocesses
    Process,
}

/// Optional per-basedir defaults, read from `calibration.yaml` or the file
/// named with `--config`. Command line flags win over these.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct SessionDefaults {
    pub queue: Option<String>,
    pub parallel_mode: Option<ParallelMode>,
    pub polling_delay: Option<u32>,
    pub mem_limit_gb: Option<u32>,
    pub wall_time_minutes: Option<u32>,
    #[serde(default)]
    pub exclusive: bool,
    pub simulator_path: Option<PathBuf>,
}

impl SessionDefaults {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Dispatch and reconcile calibration runs over LSF, PBS or local subprocesses", long_about = None)]
pub struct Cli {
    /// Calibration base directory holding db/, rhessys/ and cmd.proto
    #[arg(short, long)]
    pub basedir: PathBuf,

    /// Create the expected directory structure and a template cmd.proto, then exit
    #[arg(short, long)]
    pub create: bool,

    /// User recorded with the session
    #[arg(short, long, default_value_t = default_user())]
    pub user: String,

    /// Project name recorded with the session
    #[arg(short, long, required_unless_present_any = ["create", "restart"])]
    pub project: Option<String>,

    /// Free-form notes recorded with the session
    #[arg(short, long)]
    pub notes: Option<String>,

    /// Number of parameter sets to dispatch per worldfile
    #[arg(short, long, required_unless_present_any = ["create", "restart"])]
    pub iterations: Option<u32>,

    /// Maximum number of simultaneously active jobs
    #[arg(short, long, required_unless_present_any = ["create", "restart"])]
    pub jobs: Option<u32>,

    /// Scheduler queue to submit into
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Scheduler backend
    #[arg(long, value_enum)]
    pub parallel_mode: Option<ParallelMode>,

    /// Multiplier on the delay between status polls
    #[arg(long)]
    pub polling_delay: Option<u32>,

    /// Per-job memory limit in gigabytes
    #[arg(long)]
    pub mem_limit: Option<u32>,

    /// Per-job wall time limit in minutes
    #[arg(long)]
    pub wall_time: Option<u32>,

    /// Request exclusive execution hosts
    #[arg(long)]
    pub exclusive: bool,

    /// Directory with stand-in scheduler commands, for dry runs
    #[arg(long)]
    pub simulator_path: Option<PathBuf>,

    /// Resubmit the unfinished runs of an aborted session
    #[arg(long, conflicts_with_all = ["create", "project", "iterations", "jobs"])]
    pub restart: Option<i64>,

    /// Session defaults file, instead of <basedir>/calibration.yaml
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Reuse the horizontal decay parameters for the vertical ones
    #[arg(long)]
    pub use_horizontal_for_vertical: bool,
}

/// Fully merged runtime configuration for one dispatch invocation.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub basedir: PathBuf,
    pub user: String,
    pub project: String,
    pub notes: Option<String>,
    pub iterations: u32,
    pub processes: u32,
    pub queue: String,
    pub parallel_mode: ParallelMode,
    pub polling_delay: u32,
    pub mem_limit_gb: Option<u32>,
    pub wall_time_minutes: Option<u32>,
    pub exclusive: bool,
    pub simulator_path: Option<PathBuf>,
    pub restart_session: Option<i64>,
    pub sv_mirrors_s: bool,
}

impl DispatchConfig {
    /// Merge the command line with the optional defaults file.
    pub fn assemble(cli: Cli) -> Result<Self, ConfigErrors> {
        let defaults = match &cli.config {
            Some(path) => SessionDefaults::load(path)?,
            None => {
                let implicit = cli.basedir.join("calibration.yaml");

                if implicit.is_file() {
                    info!(
                        "Using session defaults from {}",
                        implicit.to_string_lossy()
                    );
                    SessionDefaults::load(&implicit)?
                } else {
                    SessionDefaults::default()
                }
            }
        };

        Ok(Self {
            user: cli.user,
            project: cli.project.unwrap_or_default(),
            notes: cli.notes,
            // both are taken from the session record when restarting
            iterations: cli.iterations.unwrap_or(0),
            processes: cli.jobs.unwrap_or(0),
            queue: cli
                .queue
                .or(defaults.queue)
                .unwrap_or_else(|| DEFAULT_QUEUE.to_owned()),
            parallel_mode: cli
                .parallel_mode
                .or(defaults.parallel_mode)
                .unwrap_or(ParallelMode::Lsf),
            polling_delay: cli.polling_delay.or(defaults.polling_delay).unwrap_or(1),
            mem_limit_gb: cli.mem_limit.or(defaults.mem_limit_gb),
            wall_time_minutes: cli.wall_time.or(defaults.wall_time_minutes),
            exclusive: cli.exclusive || defaults.exclusive,
            simulator_path: cli.simulator_path.or(defaults.simulator_path),
            restart_session: cli.restart,
            sv_mirrors_s: cli.use_horizontal_for_vertical,
            basedir: cli.basedir,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.basedir.join("db").join("calibration.db")
    }

    pub fn rhessys_path(&self) -> PathBuf {
        self.basedir.join("rhessys")
    }

    pub fn cmd_proto_path(&self) -> PathBuf {
        self.basedir.join("cmd.proto")
    }

    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions {
            queue: Some(self.queue.clone()),
            mem_limit_gb: self.mem_limit_gb,
            wall_time_minutes: self.wall_time_minutes,
            exclusive: self.exclusive,
        }
    }

    /// Reject sessions larger than the engine is sized for.
    pub fn validate_capacity(&self) -> Result<(), ConfigErrors> {
        if self.iterations > MAX_ITERATIONS {
            return Err(ConfigErrors::CapacityExceeded {
                what: "iterations",
                requested: self.iterations,
                limit: MAX_ITERATIONS,
            });
        }
        if self.processes > MAX_PROCESSORS {
            return Err(ConfigErrors::CapacityExceeded {
                what: "simultaneous jobs",
                requested: self.processes,
                limit: MAX_PROCESSORS,
            });
        }

        Ok(())
    }

    /// Catch setup problems in one pass instead of piece-by-piece, to make
    /// debugging easier for users. Returns whether an error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if !self.basedir.is_dir() {
            error!(
                "Base directory {} does not exist, run --create first",
                self.basedir.to_string_lossy()
            );
            contains_error = true;
        } else if !self.basedir.join("db").is_dir() {
            error!(
                "{} has no db/ directory, run --create first",
                self.basedir.to_string_lossy()
            );
            contains_error = true;
        }

        if self.restart_session.is_none() {
            if self.iterations == 0 {
                error!("At least one iteration is required");
                contains_error = true;
            }
            if self.processes == 0 {
                error!("At least one simultaneous job is required");
                contains_error = true;
            }
            if !self.cmd_proto_path().is_file() {
                error!(
                    "Missing command prototype at {}",
                    self.cmd_proto_path().to_string_lossy()
                );
                contains_error = true;
            }
        }

        if self.parallel_mode == ParallelMode::Lsf
            && !LSF_QUEUES.contains(&self.queue.as_str())
        {
            error!(
                "Queue {} is not served by LSF, pick one of {:?}",
                self.queue, LSF_QUEUES
            );
            contains_error = true;
        }

        if let Some(simulator) = &self.simulator_path {
            let commands: &[&str] = match self.parallel_mode {
                ParallelMode::Lsf => &["bsub", "bjobs"],
                ParallelMode::Pbs => &["qsub", "qstat"],
                ParallelMode::Process => &[],
            };

            for command in commands {
                match check_executable(&simulator.join(command)) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "Simulator command {} is not executable",
                            simulator.join(command).to_string_lossy()
                        );
                        contains_error = true;
                    }
                    Err(error) => {
                        error!(
                            "Simulator command {} is unusable: {error}",
                            simulator.join(command).to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
            }
        }

        if self.polling_delay == 0 {
            warn!("A polling delay of 0 is treated as 1");
        }
        if self.mem_limit_gb == Some(0) {
            error!("A memory limit of 0 GB would reject every job");
            contains_error = true;
        }

        contains_error
    }
}

/// Create the expected basedir skeleton and a template command prototype.
pub fn scaffold(basedir: &Path) -> Result<(), ConfigErrors> {
    const DIRECTORIES: [&str; 10] = [
        "db",
        "obs",
        "rhessys/src",
        "rhessys/bin",
        "rhessys/worldfiles/active",
        "rhessys/flow",
        "rhessys/tecfiles/active",
        "rhessys/defs",
        "rhessys/clim",
        "rhessys/output",
    ];

    for directory in DIRECTORIES {
        fs::create_dir_all(basedir.join(directory))?;
    }

    // sessions create run output below this point, probe for writability now
    let probe = basedir.join(".write_probe");
    fs::write(&probe, b"")?;
    fs::remove_file(&probe)?;

    let proto = basedir.join("cmd.proto");
    if proto.is_file() {
        info!(
            "Keeping existing command prototype at {}",
            proto.to_string_lossy()
        );
    } else {
        fs::write(&proto, format!("{DEFAULT_CMD_PROTO}\n"))?;
        info!(
            "Wrote template command prototype to {}",
            proto.to_string_lossy()
        );
    }

    info!(
        "Directory structure ready under {}",
        basedir.to_string_lossy()
    );

    Ok(())
}

/// Resolve the invoking user for the session record.
pub fn default_user() -> String {
    match User::from_uid(getuid()) {
        Ok(Some(user)) => user.name,
        _ => {
            warn!("Failed to resolve the invoking user");

            "unknown".to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(arguments: &[&str]) -> Cli {
        Cli::parse_from(
            std::iter::once("hydrocal-runner").chain(arguments.iter().copied()),
        )
    }

    #[test]
    fn scaffold_creates_the_expected_tree() {
        let dir = tempfile::tempdir().unwrap();

        scaffold(dir.path()).unwrap();

        assert!(dir.path().join("db").is_dir());
        assert!(dir.path().join("obs").is_dir());
        assert!(dir.path().join("rhessys/worldfiles/active").is_dir());
        assert!(dir.path().join("rhessys/tecfiles/active").is_dir());
        assert!(dir.path().join("rhessys/output").is_dir());
        assert!(dir.path().join("cmd.proto").is_file());
    }

    #[test]
    fn scaffold_keeps_an_edited_prototype() {
        let dir = tempfile::tempdir().unwrap();

        scaffold(dir.path()).unwrap();
        fs::write(dir.path().join("cmd.proto"), "custom").unwrap();
        scaffold(dir.path()).unwrap();

        let proto = fs::read_to_string(dir.path().join("cmd.proto")).unwrap();
        assert_eq!(proto, "custom");
    }

    #[test]
    fn cli_values_win_over_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("calibration.yaml"),
            "queue: week\nparallel_mode: pbs\npolling_delay: 3\nexclusive: true\n",
        )
        .unwrap();

        let basedir = dir.path().to_string_lossy().into_owned();
        let cli = parse(&[
            "-b", &basedir, "-p", "merge", "-i", "4", "-j", "2", "-q", "hour",
        ]);
        let config = DispatchConfig::assemble(cli).unwrap();

        assert_eq!(config.queue, "hour");
        assert_eq!(config.parallel_mode, ParallelMode::Pbs);
        assert_eq!(config.polling_delay, 3);
        assert!(config.exclusive);
    }

    #[test]
    fn builtin_defaults_apply_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let basedir = dir.path().to_string_lossy().into_owned();

        let cli = parse(&["-b", &basedir, "-p", "plain", "-i", "1", "-j", "1"]);
        let config = DispatchConfig::assemble(cli).unwrap();

        assert_eq!(config.queue, DEFAULT_QUEUE);
        assert_eq!(config.parallel_mode, ParallelMode::Lsf);
        assert_eq!(config.polling_delay, 1);
        assert!(!config.exclusive);
        assert!(config.mem_limit_gb.is_none());
    }

    #[test]
    fn unknown_defaults_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = dir.path().join("calibration.yaml");
        fs::write(&defaults, "bogus: 1\n").unwrap();

        assert!(matches!(
            SessionDefaults::load(&defaults),
            Err(ConfigErrors::InvalidDefaults(_))
        ));
    }

    #[test]
    fn capacity_limits_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let basedir = dir.path().to_string_lossy().into_owned();

        let cli = parse(&["-b", &basedir, "-p", "big", "-i", "9999", "-j", "2"]);
        let config = DispatchConfig::assemble(cli).unwrap();
        assert!(matches!(
            config.validate_capacity(),
            Err(ConfigErrors::CapacityExceeded {
                what: "iterations",
                ..
            })
        ));

        let cli = parse(&["-b", &basedir, "-p", "big", "-i", "10", "-j", "513"]);
        let config = DispatchConfig::assemble(cli).unwrap();
        assert!(matches!(
            config.validate_capacity(),
            Err(ConfigErrors::CapacityExceeded {
                what: "simultaneous jobs",
                ..
            })
        ));

        let cli = parse(&["-b", &basedir, "-p", "ok", "-i", "10", "-j", "2"]);
        let config = DispatchConfig::assemble(cli).unwrap();
        config.validate_capacity().unwrap();
    }

    #[test]
    fn preflight_rejects_unknown_lsf_queues() {
        let dir = tempfile::tempdir().unwrap();
        scaffold(dir.path()).unwrap();
        let basedir = dir.path().to_string_lossy().into_owned();

        let cli = parse(&[
            "-b", &basedir, "-p", "q", "-i", "1", "-j", "1", "-q", "nosuchqueue",
        ]);
        let config = DispatchConfig::assemble(cli).unwrap();
        assert!(config.preflight_checks());

        let cli = parse(&["-b", &basedir, "-p", "q", "-i", "1", "-j", "1", "-q", "week"]);
        let config = DispatchConfig::assemble(cli).unwrap();
        assert!(!config.preflight_checks());
    }

    #[test]
    fn preflight_requires_the_scaffolded_tree() {
        let dir = tempfile::tempdir().unwrap();
        let basedir = dir.path().join("missing");
        let basedir = basedir.to_string_lossy().into_owned();

        let cli = parse(&["-b", &basedir, "-p", "q", "-i", "1", "-j", "1"]);
        let config = DispatchConfig::assemble(cli).unwrap();

        assert!(config.preflight_checks());
    }

    #[test]
    fn restart_conflicts_with_new_session_flags() {
        let result = Cli::try_parse_from([
            "hydrocal-runner",
            "-b",
            "/tmp/base",
            "--restart",
            "3",
            "-i",
            "5",
        ]);

        assert!(result.is_err());
    }
}
