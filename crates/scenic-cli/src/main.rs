use std::{env, fs, path::PathBuf, process::ExitCode, time::Instant};

use scenic::{Environment, FsResolver, FsStreams, ParserOptions, StdMessages, parse_scene};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { &args[1] } else { "scene.pov" };
    let text = match read_file(file_path) {
        Ok(text) => text,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut options = ParserOptions::default();
    for arg in &args[2..] {
        if let Some(clock) = arg.strip_prefix("--clock=") {
            match clock.parse::<f64>() {
                Ok(value) => options.clock = value,
                Err(_) => {
                    eprintln!("error: invalid clock value '{clock}'");
                    return ExitCode::FAILURE;
                }
            }
        } else {
            eprintln!("error: unknown option '{arg}'");
            return ExitCode::FAILURE;
        }
    }

    // includes resolve relative to the scene file's directory
    let mut resolver = FsResolver::default();
    if let Some(dir) = PathBuf::from(file_path).parent() {
        resolver.push_path(dir.to_path_buf());
    }
    let mut env = Environment {
        resolver,
        streams: FsStreams,
    };
    let mut messages = StdMessages;

    let start = Instant::now();
    match parse_scene(file_path, &text, &mut env, &mut messages, options) {
        Ok(scene) => {
            let elapsed = start.elapsed();
            eprintln!("parsed in {elapsed:?}: {}", scene.summary());
            ExitCode::SUCCESS
        }
        Err(err) => {
            let elapsed = start.elapsed();
            eprintln!("failed after {elapsed:?}\n{err}");
            ExitCode::FAILURE
        }
    }
}

fn read_file(file_path: &str) -> Result<String, String> {
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("{file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("cannot read {file_path}: {err}"));
        }
    }
    fs::read_to_string(file_path).map_err(|err| format!("cannot read {file_path}: {err}"))
}
