use std::env;
#[cfg(windows)]
use std::path::Path;
use std::path::PathBuf;
use std::process::Command as ProcessCommand;

/// Search directories relative to the current executable for helper binaries
/// (ffprobe, nvidia-smi).
///
/// Probes these locations in order:
///   1. `<exe_dir>/`
///   2. `<exe_dir>/bin/`
///   3. `<exe_dir>/../bin/`
///   4. `<cwd>/`
///   5. `<cwd>/bin/`
fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        if !dirs.contains(&cwd) {
            dirs.push(cwd.clone());
        }
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

#[cfg(unix)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    vec![binary.to_string()]
}

#[cfg(windows)]
fn candidate_binary_names(binary: &str) -> Vec<String> {
    if Path::new(binary).components().count() > 1 {
        return vec![binary.to_string()];
    }

    let lower = binary.to_ascii_lowercase();
    if lower.ends_with(".exe") || lower.ends_with(".cmd") || lower.ends_with(".bat") {
        return vec![binary.to_string()];
    }

    vec![
        format!("{binary}.exe"),
        format!("{binary}.cmd"),
        format!("{binary}.bat"),
        binary.to_string(),
    ]
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let names = candidate_binary_names(binary);
    for dir in dirs {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Build a `Command` for `binary`, preferring a copy shipped next to the
/// executable over whatever is on `PATH`.
pub fn command_for(binary: &str) -> ProcessCommand {
    if let Some(path) = find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        return ProcessCommand::new(path);
    }
    ProcessCommand::new(binary)
}
