//! Where sink output goes.
//!
//! User-supplied sink paths may start with a placeholder token naming a
//! well-known directory or a standard stream; generated file names embed
//! the program name and pid so concurrent processes never collide.

use std::env;
use std::path::{Component, Path, PathBuf};

use rand::Rng;

/// A resolved output location: a concrete file path or a standard stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
    /// Write to a file at this path.
    File(PathBuf),
    /// Write to standard output.
    Stdout,
    /// Write to standard error.
    Stderr,
}

/// Expand the leading token of a user-provided sink path.
///
/// `<temp>`, `<home>`, and `<current>` expand to the corresponding
/// directory with the remainder of the path appended; `<cout>` selects
/// standard output and `<clog>`/`<cerr>` standard error. Anything else is
/// taken as a literal path. The remainder is cleaned of `.` components.
pub fn resolve_sink_path(path: &str) -> OutputTarget {
    let (token, rest) = match path.find('>') {
        Some(end) if path.starts_with('<') => (&path[..=end], &path[end + 1..]),
        _ => ("", path),
    };
    let rest = rest.trim_start_matches('/');

    let base = match token {
        "<cout>" => return OutputTarget::Stdout,
        "<clog>" | "<cerr>" => return OutputTarget::Stderr,
        "<temp>" => env::temp_dir(),
        "<home>" => env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir),
        "<current>" => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        _ => return OutputTarget::File(clean(Path::new(path))),
    };
    OutputTarget::File(clean(&base.join(rest)))
}

fn clean(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// The program's invocation name.
///
/// On glibc hosts this reads the program-invocation global the runtime
/// fills in before `main`; elsewhere it falls back to the base name of
/// `argv[0]`.
pub fn process_name() -> String {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        extern "C" {
            #[link_name = "program_invocation_short_name"]
            static PROGRAM_INVOCATION_SHORT_NAME: *const std::os::raw::c_char;
        }
        let name = unsafe { PROGRAM_INVOCATION_SHORT_NAME };
        if !name.is_null() {
            let name = unsafe { std::ffi::CStr::from_ptr(name) };
            return name.to_string_lossy().into_owned();
        }
    }
    env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_owned())
}

/// A per-process output file name: `<program>-<pid>-<4-digit-random>.<ext>`.
pub fn generated_file_name(extension: &str) -> String {
    format!(
        "{}-{}-{:04}.{}",
        process_name(),
        std::process::id(),
        rand::thread_rng().gen_range(0..10_000),
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_tokens_resolve_to_streams() {
        assert_eq!(resolve_sink_path("<cout>"), OutputTarget::Stdout);
        assert_eq!(resolve_sink_path("<cerr>"), OutputTarget::Stderr);
        assert_eq!(resolve_sink_path("<clog>"), OutputTarget::Stderr);
    }

    #[test]
    fn temp_token_expands() {
        match resolve_sink_path("<temp>/traces/./out.json") {
            OutputTarget::File(path) => {
                assert!(path.starts_with(env::temp_dir()));
                assert!(path.ends_with("traces/out.json"));
            }
            other => panic!("expected a file path, got {other:?}"),
        }
    }

    #[test]
    fn bare_paths_pass_through() {
        assert_eq!(
            resolve_sink_path("/var/log/out.json"),
            OutputTarget::File(PathBuf::from("/var/log/out.json"))
        );
    }

    #[test]
    fn generated_names_have_four_digit_suffix() {
        let name = generated_file_name("json");
        assert!(name.ends_with(".json"));
        let stem = name.trim_end_matches(".json");
        let digits: String = stem.rsplit('-').next().unwrap().to_owned();
        assert_eq!(digits.len(), 4);
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }
}
