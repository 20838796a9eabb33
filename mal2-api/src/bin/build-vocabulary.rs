//! Build a versioned vocabulary artifact from extracted feature files.
//!
//! Reads every `*.data` file in a directory (one token per line) in sorted
//! file-name order, assigns ids by first occurrence and writes the JSON
//! artifact the server loads at startup.

use std::path::{Path, PathBuf};

use clap::Parser;
use mal2_classifier::parse_token_lines;
use mal2_core::{FeatureEncoder, IoFailure, Mal2Result};

const FEATURE_EXTENSION: &str = "data";

/// Build the token vocabulary served to the classifier.
#[derive(Parser, Debug)]
#[command(name = "build-vocabulary", version)]
struct Args {
    /// Directory holding one `.data` feature file per artifact.
    #[arg(long, env = "MAL2_FEATURE_DIR")]
    features: PathBuf,

    /// Where to write the vocabulary artifact.
    #[arg(long, env = "MAL2_VOCABULARY_PATH", default_value = "files/word.dict.json")]
    output: PathBuf,

    /// Version recorded in the artifact; the classifier must expect the same.
    #[arg(long, env = "MAL2_VOCABULARY_VERSION")]
    version: String,

    /// Row width of the feature matrix.
    #[arg(long, env = "MAL2_MAX_FEATURE_COUNT", default_value_t = 500)]
    width: usize,
}

fn feature_files(dir: &Path) -> Mal2Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| IoFailure::new("read feature directory", dir, &e))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| IoFailure::new("read feature directory", dir, &e))?
            .path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == FEATURE_EXTENSION) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn run(args: &Args) -> Mal2Result<()> {
    let files = feature_files(&args.features)?;
    let mut corpus = Vec::with_capacity(files.len());
    for path in &files {
        let bytes = std::fs::read(path).map_err(|e| IoFailure::new("read feature file", path, &e))?;
        corpus.push(parse_token_lines(&bytes));
    }

    let encoder = FeatureEncoder::new(args.width)?;
    let (vocabulary, matrix) = encoder.build(&corpus, args.version.clone())?;

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| IoFailure::new("create output directory", parent, &e))?;
    }
    vocabulary.save(&args.output)?;

    println!(
        "Wrote {} ({} tokens, {} artifacts, width {}, embedding rows {})",
        args.output.display(),
        vocabulary.len(),
        matrix.row_count(),
        vocabulary.max_width(),
        vocabulary.embedding_rows(),
    );
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("build-vocabulary: {}", e);
        std::process::exit(1);
    }
}
