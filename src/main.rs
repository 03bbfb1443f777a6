//! Command-line front end for the log analyzer.
//!
//! Reads one or more firmware debug logs, extracts their artifacts, and
//! writes each artifact to the current directory. Multiple logs are
//! processed in parallel; a failure on one log does not stop the others.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;

use motionlog::{analyze, Extraction};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: motionlog <logfile>...");
        std::process::exit(1);
    }

    let outcomes: Vec<(String, Result<Extraction>)> = args
        .par_iter()
        .map(|path| (path.clone(), process(path)))
        .collect();

    let mut failed = false;
    for (path, outcome) in outcomes {
        match outcome {
            Ok(extraction) => {
                println!(
                    "{}: {} shutdown report(s), {} config(s), {} g-code file(s)",
                    path,
                    extraction.shutdowns.len(),
                    extraction.configs.len(),
                    extraction.gcode_files.len()
                );
                for artifact in extraction.iter() {
                    println!("  wrote {}", artifact.filename);
                }
            }
            Err(err) => {
                eprintln!("{}: {:#}", path, err);
                failed = true;
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn process(path: &str) -> Result<Extraction> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path))?;
    let metadata = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path))?;

    // Zero-length files cannot be mapped.
    let contents = if metadata.len() == 0 {
        String::new()
    } else {
        let mmap =
            unsafe { Mmap::map(&file) }.with_context(|| format!("failed to map {}", path))?;
        String::from_utf8_lossy(&mmap).into_owned()
    };

    let logname = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let extraction = analyze(&contents, &logname)?;
    for artifact in extraction.iter() {
        fs::write(&artifact.filename, &artifact.content)
            .with_context(|| format!("failed to write {}", artifact.filename))?;
    }
    Ok(extraction)
}
