use crate::config::{check_executable, ConfigErrors, DispatchConfig};
use ignore::WalkBuilder;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{collections::BTreeMap, fs, fs::File};
use tracing::{debug, error, warn};

/// Climate redefine worldfiles live next to the real ones and are picked up
/// by the model itself, they must never be dispatched as runs.
static REDEFINE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^.*\.Y[0-9]{4}M[1-9][1-2]{0,1}D[1-9][0-9]{0,1}H[0-9][1-4]{0,1}$")
        .expect("hardcoded pattern")
});

/// Collect the active worldfiles as a map of file name to model-relative path.
pub fn worldfiles(config: &DispatchConfig) -> Result<BTreeMap<String, String>, ConfigErrors> {
    let active = config.rhessys_path().join("worldfiles").join("active");
    let mut worldfiles = BTreeMap::new();

    for entry in WalkBuilder::new(&active).max_depth(Some(1)).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!("Failed to search for worldfiles: {error}");
                continue;
            }
        };

        if entry.depth() == 0 || !entry.file_type().map_or(false, |kind| kind.is_file()) {
            continue;
        }
        let name = match entry.file_name().to_str() {
            Some(name) => name.to_owned(),
            None => {
                warn!(path = ?entry.path(), "Skipping worldfile with non-utf8 name");
                continue;
            }
        };

        if REDEFINE_PATTERN.is_match(&name) {
            debug!(worldfile = name, "Skipping climate redefine file");
            continue;
        }

        worldfiles.insert(name.clone(), format!("worldfiles/active/{name}"));
    }

    if worldfiles.is_empty() {
        error!(
            "No worldfiles found under {}",
            active.to_string_lossy()
        );

        return Err(ConfigErrors::NoWorldfiles);
    }

    debug!(count = worldfiles.len(), "Collected worldfiles");

    Ok(worldfiles)
}

/// Model-relative flow table path for one worldfile.
pub fn flow_table_path(worldfile: &str) -> String {
    format!("flow/{worldfile}_flow_table.dat")
}

/// Every worldfile needs its own flow table when the prototype routes water.
pub fn verify_flow_tables(
    config: &DispatchConfig,
    worldfiles: &BTreeMap<String, String>,
) -> Result<(), ConfigErrors> {
    let rhessys = config.rhessys_path();
    let mut missing = false;

    for worldfile in worldfiles.keys() {
        let flow_table = rhessys.join(flow_table_path(worldfile));

        if !flow_table.is_file() {
            error!(
                worldfile = worldfile,
                "Missing flow table {}",
                flow_table.to_string_lossy()
            );
            missing = true;
        }
    }

    if missing {
        Err(ConfigErrors::MissingFlowTables)
    } else {
        Ok(())
    }
}

fn sorted_files(directory: &std::path::Path) -> Result<Vec<String>, ConfigErrors> {
    Ok(fs::read_dir(directory)?
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_type()
                .map_or(false, |kind| kind.is_file())
        })
        .filter_map(|entry| entry.file_name().into_string().ok())
        .sorted()
        .collect_vec())
}

/// Pick the first readable tecfile, in lexicographic order.
pub fn tecfile(config: &DispatchConfig) -> Result<String, ConfigErrors> {
    let directory = config.rhessys_path().join("tecfiles").join("active");

    for name in sorted_files(&directory)? {
        match File::open(directory.join(&name)) {
            Ok(_) => {
                debug!(tecfile = name, "Selected tecfile");

                return Ok(format!("tecfiles/active/{name}"));
            }
            Err(error) => warn!(tecfile = name, "Skipping unreadable tecfile: {error}"),
        }
    }

    error!(
        "No readable tecfile under {}",
        directory.to_string_lossy()
    );

    Err(ConfigErrors::NoTecfile)
}

/// Pick the first executable model binary, in lexicographic order.
pub fn rhessys_binary(config: &DispatchConfig) -> Result<String, ConfigErrors> {
    let directory = config.rhessys_path().join("bin");

    for name in sorted_files(&directory)? {
        match check_executable(&directory.join(&name)) {
            Ok(true) => {
                debug!(binary = name, "Selected model binary");

                return Ok(format!("bin/{name}"));
            }
            Ok(false) => debug!(binary = name, "Skipping non-executable file"),
            Err(error) => warn!(binary = name, "Skipping unreadable file: {error}"),
        }
    }

    error!(
        "No executable model binary under {}",
        directory.to_string_lossy()
    );

    Err(ConfigErrors::NoExecutable)
}
